//! Tile rebuilding with obstacles carved out
//!
//! A tile is rebuilt from its pristine polygons. Every polygon touched by an
//! obstacle footprint is split by the footprint's edge lines and only the
//! pieces outside the footprint are kept. Cut edges become geometric portals
//! so the pieces link back up with each other when the tile is installed.

use std::collections::HashMap;
use std::f32::consts::PI;

use super::tile_cache::{Obstacle, ObstacleState};
use navi_common::{
    Error, Result, bounds_of, lerp3, overlap_poly_poly_2d, poly_area_2d, tri_area_2d, vequal,
};
use navi_detour::nav_mesh::{MeshTile, Poly};
use navi_detour::{EXT_LINK, MAX_VERTS_PER_POLY, NEI_PORTAL, PolyFlags};

/// Distance under which a vertex counts as lying on a cut line
const CUT_EPS: f32 = 1e-4;

/// Polygons thinner than this are dropped
const MIN_PIECE_AREA: f32 = 1e-5;

/// Grid used to weld the vertices of a rebuilt tile
const WELD_QUANT: f32 = 1000.0;

/// Footprint of an obstacle as a convex polygon with a vertical extent
#[derive(Debug, Clone, PartialEq)]
pub struct ObstacleShape {
    /// Footprint ring, wound like navigation polygons
    pub ring: Vec<[f32; 3]>,
    pub ymin: f32,
    pub ymax: f32,
}

impl ObstacleShape {
    /// Regular polygon circumscribing the cylinder's circle
    pub fn cylinder(pos: [f32; 3], radius: f32, height: f32, segments: usize) -> Self {
        let n = segments.max(3);
        let r = radius / (PI / n as f32).cos();
        let ring = (0..n)
            .map(|i| {
                // Decreasing angle gives the positive winding of the mesh.
                let a = -2.0 * PI * i as f32 / n as f32;
                [pos[0] + r * a.cos(), pos[1], pos[2] + r * a.sin()]
            })
            .collect();
        Self {
            ring,
            ymin: pos[1],
            ymax: pos[1] + height,
        }
    }

    pub fn from_obstacle(obstacle: &Obstacle, segments: usize) -> Self {
        Self::cylinder(obstacle.pos, obstacle.radius, obstacle.height, segments)
    }

    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let (mut bmin, mut bmax) = bounds_of(&self.ring);
        bmin[1] = self.ymin;
        bmax[1] = self.ymax;
        (bmin, bmax)
    }
}

/// What lies across a polygon edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Wall,
    Portal,
    External(u8),
}

impl EdgeKind {
    fn from_nei(nei: u16) -> Self {
        if nei == 0 {
            EdgeKind::Wall
        } else if nei & EXT_LINK != 0 {
            EdgeKind::External((nei & 0xff) as u8)
        } else {
            EdgeKind::Portal
        }
    }

    fn to_nei(self) -> u16 {
        match self {
            EdgeKind::Wall => 0,
            EdgeKind::Portal => NEI_PORTAL,
            EdgeKind::External(side) => EXT_LINK | side as u16,
        }
    }
}

/// Convex polygon under construction; `kinds[i]` is the edge from vertex `i`
#[derive(Debug, Clone)]
struct Piece {
    verts: Vec<[f32; 3]>,
    kinds: Vec<EdgeKind>,
    area: u8,
    flags: PolyFlags,
}

impl Piece {
    fn from_poly(tile: &MeshTile, poly: &Poly) -> Self {
        let nv = poly.vert_count();
        Self {
            verts: tile.poly_verts(poly),
            kinds: poly.neis[..nv].iter().map(|&n| EdgeKind::from_nei(n)).collect(),
            area: poly.area,
            flags: poly.flags,
        }
    }

    fn with_ring(&self, verts: Vec<[f32; 3]>, kinds: Vec<EdgeKind>) -> Self {
        Self {
            verts,
            kinds,
            area: self.area,
            flags: self.flags,
        }
    }

    fn height_range(&self) -> (f32, f32) {
        self.verts
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v[1]), hi.max(v[1])))
    }

    fn touches(&self, shape: &ObstacleShape) -> bool {
        let (lo, hi) = self.height_range();
        hi >= shape.ymin && lo <= shape.ymax && overlap_poly_poly_2d(&self.verts, &shape.ring, CUT_EPS)
    }

    /// Drops repeated vertices; `None` if nothing with area is left
    fn cleaned(mut self) -> Option<Self> {
        let mut verts = Vec::with_capacity(self.verts.len());
        let mut kinds = Vec::with_capacity(self.kinds.len());
        let n = self.verts.len();
        for i in 0..n {
            // A zero-length edge disappears with its start vertex.
            if vequal(&self.verts[i], &self.verts[(i + 1) % n]) {
                continue;
            }
            verts.push(self.verts[i]);
            kinds.push(self.kinds[i]);
        }
        if verts.len() < 3 || poly_area_2d(&verts) <= MIN_PIECE_AREA {
            return None;
        }
        self.verts = verts;
        self.kinds = kinds;
        Some(self)
    }

    /// Splits along the line through `a -> b` into `(inside, outside)`
    ///
    /// Inside is the left of the line as seen by the polygon winding, so a
    /// piece is inside a footprint when it is inside every footprint edge.
    fn split(&self, a: &[f32; 3], b: &[f32; 3]) -> (Option<Piece>, Option<Piece>) {
        let len = ((b[0] - a[0]).powi(2) + (b[2] - a[2]).powi(2)).sqrt();
        if len <= CUT_EPS {
            return (Some(self.clone()), None);
        }
        let side = |v: &[f32; 3]| {
            let d = tri_area_2d(a, b, v) / len;
            if d > CUT_EPS {
                (1, d)
            } else if d < -CUT_EPS {
                (-1, d)
            } else {
                (0, d)
            }
        };

        let n = self.verts.len();
        let mut inside = (Vec::new(), Vec::new());
        let mut outside = (Vec::new(), Vec::new());
        for i in 0..n {
            let j = (i + 1) % n;
            let (vi, vj) = (&self.verts[i], &self.verts[j]);
            let ((si, di), (sj, dj)) = (side(vi), side(vj));
            let kind = self.kinds[i];

            if si >= 0 {
                let k = if si == 0 && sj < 0 { EdgeKind::Portal } else { kind };
                inside.0.push(*vi);
                inside.1.push(k);
            }
            if si <= 0 {
                let k = if si == 0 && sj > 0 { EdgeKind::Portal } else { kind };
                outside.0.push(*vi);
                outside.1.push(k);
            }
            if si * sj < 0 {
                let p = lerp3(vi, vj, di / (di - dj));
                if si > 0 {
                    inside.0.push(p);
                    inside.1.push(EdgeKind::Portal);
                    outside.0.push(p);
                    outside.1.push(kind);
                } else {
                    outside.0.push(p);
                    outside.1.push(EdgeKind::Portal);
                    inside.0.push(p);
                    inside.1.push(kind);
                }
            }
        }

        (
            self.with_ring(inside.0, inside.1).cleaned(),
            self.with_ring(outside.0, outside.1).cleaned(),
        )
    }

    /// Keeps the parts of the piece outside the footprint
    fn subtract(self, shape: &ObstacleShape, out: &mut Vec<Piece>) {
        if !self.touches(shape) {
            out.push(self);
            return;
        }
        let n = shape.ring.len();
        let mut remaining = self;
        for i in 0..n {
            let (inside, outside) = remaining.split(&shape.ring[i], &shape.ring[(i + 1) % n]);
            if let Some(piece) = outside {
                out.push(piece);
            }
            match inside {
                Some(piece) => remaining = piece,
                None => return,
            }
        }
        // What is left lies inside the footprint.
    }

    /// Fans pieces with too many vertices into convex polygons that fit
    fn fan_split(self, out: &mut Vec<Piece>) {
        let n = self.verts.len();
        if n <= MAX_VERTS_PER_POLY {
            out.push(self);
            return;
        }
        let mut start = 1;
        while start < n - 1 {
            let end = (start + MAX_VERTS_PER_POLY - 2).min(n - 1);
            let mut verts = vec![self.verts[0]];
            let mut kinds = vec![if start == 1 { self.kinds[0] } else { EdgeKind::Portal }];
            for k in start..=end {
                verts.push(self.verts[k]);
                kinds.push(if k < end {
                    self.kinds[k]
                } else if end == n - 1 {
                    self.kinds[n - 1]
                } else {
                    EdgeKind::Portal
                });
            }
            if let Some(piece) = self.with_ring(verts, kinds).cleaned() {
                out.push(piece);
            }
            start = end;
        }
    }
}

/// Rebuilds tiles from pristine data and the active obstacles
#[derive(Debug, Clone)]
pub struct TileCacheBuilder {
    /// Sides of the polygon approximating an obstacle cylinder
    segments: usize,
    max_polys: u32,
}

impl TileCacheBuilder {
    pub fn new(segments: usize, max_polys: u32) -> Self {
        Self {
            segments: segments.max(3),
            max_polys,
        }
    }

    /// Carves every active obstacle out of a pristine tile
    pub fn build_tile(&self, pristine: &MeshTile, obstacles: &[&Obstacle]) -> Result<MeshTile> {
        let shapes: Vec<ObstacleShape> = obstacles
            .iter()
            .filter(|o| o.state == ObstacleState::Processed)
            .map(|o| ObstacleShape::from_obstacle(o, self.segments))
            .collect();
        carve_tile(pristine, &shapes, self.max_polys)
    }
}

/// Returns a copy of `tile` with the obstacle footprints removed
pub fn carve_tile(tile: &MeshTile, shapes: &[ObstacleShape], max_polys: u32) -> Result<MeshTile> {
    let mut finished = Vec::with_capacity(tile.polys.len());
    let mut pieces = Vec::new();
    let mut next = Vec::new();
    for poly in &tile.polys {
        pieces.clear();
        pieces.push(Piece::from_poly(tile, poly));
        for shape in shapes {
            next.clear();
            for piece in pieces.drain(..) {
                piece.subtract(shape, &mut next);
            }
            std::mem::swap(&mut pieces, &mut next);
        }
        for piece in pieces.drain(..) {
            piece.fan_split(&mut finished);
        }
    }

    if finished.len() > max_polys as usize {
        return Err(Error::Capacity(format!(
            "tile ({}, {}) would have {} polygons, capacity is {}",
            tile.header.x,
            tile.header.y,
            finished.len(),
            max_polys
        )));
    }
    assemble(tile, finished)
}

/// Welds the pieces into a tile with the header of `source`
fn assemble(source: &MeshTile, pieces: Vec<Piece>) -> Result<MeshTile> {
    let mut verts: Vec<[f32; 3]> = Vec::new();
    let mut weld: HashMap<[i64; 3], u16> = HashMap::new();
    let mut polys = Vec::with_capacity(pieces.len());

    for piece in pieces {
        let mut idx = Vec::with_capacity(piece.verts.len());
        for v in &piece.verts {
            let key = v.map(|c| (c * WELD_QUANT).round() as i64);
            let i = match weld.get(&key) {
                Some(&i) => i,
                None => {
                    let i = u16::try_from(verts.len()).map_err(|_| {
                        Error::Capacity(format!(
                            "tile ({}, {}) has too many vertices",
                            source.header.x, source.header.y
                        ))
                    })?;
                    verts.push(*v);
                    weld.insert(key, i);
                    i
                }
            };
            idx.push(i);
        }

        let n = idx.len();
        let mut poly = Poly::new(piece.area, piece.flags);
        let mut count = 0;
        for k in 0..n {
            // Welding can merge neighbouring vertices.
            if idx[k] == idx[(k + 1) % n] {
                continue;
            }
            poly.verts[count] = idx[k];
            poly.neis[count] = piece.kinds[k].to_nei();
            count += 1;
        }
        if count < 3 {
            continue;
        }
        poly.vert_count = count as u8;
        let ring: Vec<[f32; 3]> = poly.verts[..count].iter().map(|&i| verts[i as usize]).collect();
        if poly_area_2d(&ring) <= MIN_PIECE_AREA {
            continue;
        }
        polys.push(poly);
    }

    let mut header = source.header;
    if !verts.is_empty() {
        let (bmin, bmax) = bounds_of(&verts);
        header.bmin = bmin;
        header.bmax = bmax;
    }
    Ok(MeshTile::new(header, verts, polys))
}
