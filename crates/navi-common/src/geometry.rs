//! Geometry operations on the XZ plane
//!
//! Navigation polygons are stored as `[f32; 3]` points in a Y-up coordinate
//! system. Almost every test in the engine is two dimensional, so most helpers
//! ignore the Y component.

/// Epsilon used when comparing points for equality.
pub const VEQUAL_EPS: f32 = 1.0 / 16384.0;

/// Calculate twice the signed area of a 2D triangle on the XZ plane.
///
/// Navigation polygons are wound so that this value is positive for every
/// fan triangle `(v0, vi, vi+1)`.
#[inline]
pub fn tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Twice the signed area of a polygon on the XZ plane.
pub fn poly_area_2d(verts: &[[f32; 3]]) -> f32 {
    if verts.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 2..verts.len() {
        area += tri_area_2d(&verts[0], &verts[i - 1], &verts[i]);
    }
    area
}

/// Returns true if the two points are practically the same.
#[inline]
pub fn vequal(a: &[f32; 3], b: &[f32; 3]) -> bool {
    dist_sqr(a, b) < VEQUAL_EPS * VEQUAL_EPS
}

/// Squared 3D distance.
#[inline]
pub fn dist_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    dx * dx + dy * dy + dz * dz
}

/// 3D distance.
#[inline]
pub fn dist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    dist_sqr(a, b).sqrt()
}

/// Squared distance on the XZ plane.
#[inline]
pub fn dist_sqr_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    dx * dx + dz * dz
}

/// Linear interpolation between two points.
#[inline]
pub fn lerp3(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

/// Check if two axis-aligned bounding boxes overlap (inclusive).
#[inline]
pub fn overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    amin[0] <= bmax[0]
        && amax[0] >= bmin[0]
        && amin[1] <= bmax[1]
        && amax[1] >= bmin[1]
        && amin[2] <= bmax[2]
        && amax[2] >= bmin[2]
}

/// Bounds of a point set.
pub fn bounds_of(verts: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    let mut bmin = [f32::MAX; 3];
    let mut bmax = [f32::MIN; 3];
    for v in verts {
        for k in 0..3 {
            bmin[k] = bmin[k].min(v[k]);
            bmax[k] = bmax[k].max(v[k]);
        }
    }
    (bmin, bmax)
}

/// Squared distance from point to segment on the XZ plane, together with the
/// parameter `t` of the closest point along `a -> b`.
pub fn dist_point_segment_sqr_2d(p: &[f32; 3], a: &[f32; 3], b: &[f32; 3]) -> (f32, f32) {
    let pqx = b[0] - a[0];
    let pqz = b[2] - a[2];
    let dx = p[0] - a[0];
    let dz = p[2] - a[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = a[0] + t * pqx - p[0];
    let dz = a[2] + t * pqz - p[2];
    (dx * dx + dz * dz, t)
}

/// Crossing-number point in polygon test on the XZ plane.
///
/// Works for any simple polygon regardless of winding.
pub fn point_in_polygon_2d(p: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let n = verts.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > p[2]) != (vj[2] > p[2]))
            && (p[0] < (vj[0] - vi[0]) * (p[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Height of `p` on triangle `abc` when `p` lies inside its XZ footprint.
pub fn closest_height_on_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    let v0 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let v1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v2 = [p[0] - a[0], 0.0, p[2] - a[2]];

    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < 1e-6 {
        return None;
    }
    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    // Tolerance keeps points on shared edges inside one of the triangles.
    let eps = 1e-4 * denom;
    if u >= -eps && v >= -eps && (u + v) <= denom + eps {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Projects a polygon onto a 2D axis, returning the covered interval.
fn project_poly_2d(axis: [f32; 2], verts: &[[f32; 3]]) -> (f32, f32) {
    let mut rmin = f32::MAX;
    let mut rmax = f32::MIN;
    for v in verts {
        let d = axis[0] * v[0] + axis[1] * v[2];
        rmin = rmin.min(d);
        rmax = rmax.max(d);
    }
    (rmin, rmax)
}

/// Separating axis test between two convex polygons on the XZ plane.
///
/// Touching polygons (overlap below `eps`) are reported as separate.
pub fn overlap_poly_poly_2d(a: &[[f32; 3]], b: &[[f32; 3]], eps: f32) -> bool {
    for poly in [a, b] {
        let n = poly.len();
        let mut j = n.saturating_sub(1);
        for i in 0..n {
            let va = &poly[j];
            let vb = &poly[i];
            let axis = [vb[2] - va[2], -(vb[0] - va[0])];
            let len = (axis[0] * axis[0] + axis[1] * axis[1]).sqrt();
            j = i;
            if len < 1e-6 {
                continue;
            }
            let axis = [axis[0] / len, axis[1] / len];
            let (amin, amax) = project_poly_2d(axis, a);
            let (bmin, bmax) = project_poly_2d(axis, b);
            if amax.min(bmax) - amin.max(bmin) <= eps {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f32, z0: f32, x1: f32, z1: f32) -> Vec<[f32; 3]> {
        vec![[x0, 0.0, z0], [x0, 0.0, z1], [x1, 0.0, z1], [x1, 0.0, z0]]
    }

    #[test]
    fn test_winding_is_positive() {
        assert!(poly_area_2d(&square(0.0, 0.0, 2.0, 2.0)) > 0.0);
        let mut reversed = square(0.0, 0.0, 2.0, 2.0);
        reversed.reverse();
        assert!(poly_area_2d(&reversed) < 0.0);
        assert!((poly_area_2d(&square(0.0, 0.0, 2.0, 3.0)) - 12.0).abs() < 1e-5);
    }

    #[test]
    fn test_point_in_polygon() {
        let poly = square(0.0, 0.0, 4.0, 4.0);
        assert!(point_in_polygon_2d(&[1.0, 10.0, 1.0], &poly));
        assert!(!point_in_polygon_2d(&[5.0, 0.0, 1.0], &poly));
        assert!(!point_in_polygon_2d(&[1.0, 0.0, -0.1], &poly));
    }

    #[test]
    fn test_segment_distance() {
        let (d, t) = dist_point_segment_sqr_2d(&[1.0, 0.0, 1.0], &[0.0, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);

        let (d, t) = dist_point_segment_sqr_2d(&[-1.0, 0.0, 0.0], &[0.0, 0.0, 0.0], &[2.0, 0.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn test_height_on_triangle() {
        let a = [0.0, 0.0, 0.0];
        let b = [0.0, 2.0, 2.0];
        let c = [2.0, 0.0, 0.0];
        let h = closest_height_on_triangle(&[0.5, 0.0, 1.0], &a, &b, &c).unwrap();
        assert!((h - 1.0).abs() < 1e-5);
        assert!(closest_height_on_triangle(&[3.0, 0.0, 3.0], &a, &b, &c).is_none());
    }

    #[test]
    fn test_poly_overlap() {
        let a = square(0.0, 0.0, 2.0, 2.0);
        let b = square(1.0, 1.0, 3.0, 3.0);
        let c = square(2.0, 0.0, 4.0, 2.0);
        let d = square(5.0, 5.0, 6.0, 6.0);
        assert!(overlap_poly_poly_2d(&a, &b, 1e-4));
        // Sharing an edge is not an overlap.
        assert!(!overlap_poly_poly_2d(&a, &c, 1e-4));
        assert!(!overlap_poly_poly_2d(&a, &d, 1e-4));
    }
}
