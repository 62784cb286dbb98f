//! Navigation mesh query implementation
//!
//! This module contains the NavMeshQuery structure, which is used to find
//! polygons near a point, search the polygon graph and string-pull the
//! resulting corridor into waypoints.

use super::nav_mesh::Link;
use super::node_pool::{NULL_IDX, NodeFlags, NodePool, NodeQueue};
use super::{NavMesh, PolyRef, QueryFilter, Status, StatusDetail};
use navi_common::{dist, dist_point_segment_sqr_2d, dist_sqr, lerp3, tri_area_2d, vequal};

/// Scale applied to the A* heuristic so it never overestimates
const H_SCALE: f32 = 0.999;

/// Portal distance under which the funnel skips the first portal
const PORTAL_EPS: f32 = 0.001;

/// Reusable query state: the node pool and open list of the polygon search
///
/// The mesh is passed per call so that it can be edited between queries.
#[derive(Debug)]
pub struct NavMeshQuery {
    node_pool: NodePool,
    open_list: NodeQueue,
}

impl NavMeshQuery {
    /// Creates a query whose searches visit at most `max_nodes` polygons
    pub fn new(max_nodes: usize) -> Self {
        Self {
            node_pool: NodePool::new(max_nodes.max(1)),
            open_list: NodeQueue::new(),
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.node_pool.max_nodes()
    }

    /// Number of nodes the last search touched
    pub fn last_node_count(&self) -> usize {
        self.node_pool.node_count()
    }

    /// Finds the polygon nearest to a point within a search box
    ///
    /// A point directly above or below a polygon is measured vertically,
    /// and counts as on the surface when within the tile's walkable climb.
    pub fn find_nearest_poly(
        &self,
        nav_mesh: &NavMesh,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Option<(PolyRef, [f32; 3])> {
        let mut nearest = None;
        let mut nearest_distance_sqr = f32::MAX;

        for poly_ref in nav_mesh.query_polygons(center, half_extents, filter) {
            let Ok((closest, over_poly)) = nav_mesh.closest_point_on_poly(poly_ref, center) else {
                continue;
            };
            let d = if over_poly {
                let climb = nav_mesh
                    .get_tile_and_poly_by_ref(poly_ref)
                    .map(|(tile, _)| tile.header.walkable_climb)
                    .unwrap_or(0.0);
                let height_diff = (center[1] - closest[1]).abs() - climb;
                if height_diff > 0.0 {
                    height_diff * height_diff
                } else {
                    0.0
                }
            } else {
                dist_sqr(center, &closest)
            };

            if d < nearest_distance_sqr {
                nearest_distance_sqr = d;
                nearest = Some((poly_ref, closest));
            }
        }
        nearest
    }

    /// Finds a polygon path from the start polygon to the end polygon
    ///
    /// The path is written into `path` and its length returned with the
    /// status. When the end is unreachable the path leads to the explored
    /// polygon closest to the end and `PARTIAL_RESULT` is set. A path longer
    /// than the buffer keeps its start and sets `BUFFER_TOO_SMALL`.
    #[allow(clippy::too_many_arguments)]
    pub fn find_path(
        &mut self,
        nav_mesh: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        path: &mut [PolyRef],
    ) -> (Status, usize) {
        let invalid = Status::failure().with(StatusDetail::INVALID_PARAM);
        if path.is_empty()
            || !nav_mesh.is_valid_poly_ref(start_ref)
            || !nav_mesh.is_valid_poly_ref(end_ref)
            || !start_pos.iter().chain(end_pos).all(|c| c.is_finite())
        {
            return (invalid, 0);
        }
        match nav_mesh.get_tile_and_poly_by_ref(start_ref) {
            Ok((_, poly)) if filter.pass_filter(poly) => {}
            _ => return (invalid, 0),
        }

        if start_ref == end_ref {
            path[0] = start_ref;
            return (Status::success(), 1);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let Some(start_idx) = self.node_pool.get_node(start_ref) else {
            return (Status::failure().with(StatusDetail::OUT_OF_NODES), 0);
        };
        {
            let start = self.node_pool.node_mut(start_idx);
            start.pos = *start_pos;
            start.cost = 0.0;
            start.total = dist(start_pos, end_pos) * H_SCALE;
            start.flags.insert(NodeFlags::OPEN);
        }
        self.open_list.push(&self.node_pool, start_idx);

        let mut last_best = start_idx;
        let mut last_best_cost = self.node_pool.node(start_idx).total;
        let mut out_of_nodes = false;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            let (best_ref, best_pos, best_cost, parent_idx) = {
                let best = self.node_pool.node_mut(best_idx);
                best.flags.remove(NodeFlags::OPEN);
                best.flags.insert(NodeFlags::CLOSED);
                (best.poly, best.pos, best.cost, best.parent)
            };

            if best_ref == end_ref {
                last_best = best_idx;
                break;
            }

            let Ok((best_tile, best_poly)) = nav_mesh.get_tile_and_poly_by_ref(best_ref) else {
                continue;
            };
            let parent_ref = if parent_idx != NULL_IDX {
                self.node_pool.node(parent_idx).poly
            } else {
                PolyRef::NULL
            };

            for link in &best_poly.links {
                let nei_ref = link.reference;
                if nei_ref == parent_ref {
                    continue;
                }
                let Ok((_, nei_poly)) = nav_mesh.get_tile_and_poly_by_ref(nei_ref) else {
                    continue;
                };
                if !filter.pass_filter(nei_poly) {
                    continue;
                }

                let Some(nei_idx) = self.node_pool.get_node(nei_ref) else {
                    out_of_nodes = true;
                    continue;
                };

                if self.node_pool.node(nei_idx).flags == NodeFlags::default() {
                    let (va, vb) = best_tile.edge(best_poly, link.edge as usize);
                    self.node_pool.node_mut(nei_idx).pos = portal_mid_point(&va, &vb, link);
                }
                let nei_pos = self.node_pool.node(nei_idx).pos;

                let (cost, heuristic) = if nei_ref == end_ref {
                    let cur_cost = filter.get_cost(&best_pos, &nei_pos, best_poly);
                    let end_cost = filter.get_cost(&nei_pos, end_pos, nei_poly);
                    (best_cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = filter.get_cost(&best_pos, &nei_pos, best_poly);
                    (best_cost + cur_cost, dist(&nei_pos, end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                let node = self.node_pool.node_mut(nei_idx);
                let was_open = node.flags.contains(NodeFlags::OPEN);
                if (was_open || node.flags.contains(NodeFlags::CLOSED)) && total >= node.total {
                    continue;
                }

                node.parent = best_idx;
                node.cost = cost;
                node.total = total;
                node.flags.remove(NodeFlags::CLOSED);
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(&self.node_pool, nei_idx);

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = nei_idx;
                }
            }
        }

        let mut status = Status::success();
        if self.node_pool.node(last_best).poly != end_ref {
            status.add(StatusDetail::PARTIAL_RESULT);
        }
        if out_of_nodes {
            status.add(StatusDetail::OUT_OF_NODES);
        }

        let full = self.node_pool.path_to(last_best);
        let count = full.len().min(path.len());
        path[..count].copy_from_slice(&full[..count]);
        if full.len() > path.len() {
            status.add(StatusDetail::BUFFER_TOO_SMALL);
        }

        log::debug!(
            "Polygon search visited {} nodes, path of {} polygons{}",
            self.node_pool.node_count(),
            full.len(),
            if status.has(StatusDetail::PARTIAL_RESULT) { " (partial)" } else { "" }
        );
        (status, count)
    }

    /// Finds the straight path through a polygon corridor
    ///
    /// Start and end are clamped onto the first and last polygons. Waypoints
    /// are written into `straight_path`; the count is returned with the
    /// status.
    pub fn find_straight_path(
        &self,
        nav_mesh: &NavMesh,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        straight_path: &mut [[f32; 3]],
    ) -> (Status, usize) {
        let invalid = Status::failure().with(StatusDetail::INVALID_PARAM);
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return (invalid, 0);
        };
        if straight_path.is_empty() {
            return (invalid, 0);
        }
        let Ok(closest_start) = nav_mesh.closest_point_on_poly_boundary(first, start_pos) else {
            return (invalid, 0);
        };
        let Ok(closest_end) = nav_mesh.closest_point_on_poly_boundary(last, end_pos) else {
            return (invalid, 0);
        };

        let mut out = StraightPathWriter::new(straight_path);
        if !out.append(&closest_start) {
            return out.finish(Status::success());
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut left_index = 0;
            let mut right_index = 0;

            let mut i = 0;
            while i < path.len() {
                let (left, right) = if i + 1 < path.len() {
                    match nav_mesh.portal_points(path[i], path[i + 1]) {
                        Ok(portal) => portal,
                        Err(_) => {
                            // The corridor is broken here; end on the last good polygon.
                            let status = Status::success().with(StatusDetail::PARTIAL_RESULT);
                            if let Ok(end) = nav_mesh.closest_point_on_poly_boundary(path[i], end_pos) {
                                out.append(&end);
                            }
                            return out.finish(status);
                        }
                    }
                } else {
                    (closest_end, closest_end)
                };

                // Starting right on the first portal.
                if i == 0 {
                    let (d, _) = dist_point_segment_sqr_2d(&portal_apex, &left, &right);
                    if d < PORTAL_EPS * PORTAL_EPS {
                        i += 1;
                        continue;
                    }
                }

                // Right vertex
                if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                    if vequal(&portal_apex, &portal_right)
                        || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0
                    {
                        portal_right = right;
                        right_index = i;
                    } else {
                        portal_apex = portal_left;
                        let apex_index = left_index;
                        if !out.append(&portal_apex) {
                            return out.finish(Status::success());
                        }
                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                    if vequal(&portal_apex, &portal_left)
                        || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0
                    {
                        portal_left = left;
                        left_index = i;
                    } else {
                        portal_apex = portal_right;
                        let apex_index = right_index;
                        if !out.append(&portal_apex) {
                            return out.finish(Status::success());
                        }
                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        out.append(&closest_end);
        out.finish(Status::success())
    }
}

/// Midpoint of the part of an edge a link covers
fn portal_mid_point(va: &[f32; 3], vb: &[f32; 3], link: &Link) -> [f32; 3] {
    let left = lerp3(va, vb, link.tmin);
    let right = lerp3(va, vb, link.tmax);
    lerp3(&left, &right, 0.5)
}

/// Appends waypoints to a fixed buffer, collapsing repeats
struct StraightPathWriter<'a> {
    buffer: &'a mut [[f32; 3]],
    count: usize,
    overflow: bool,
}

impl<'a> StraightPathWriter<'a> {
    fn new(buffer: &'a mut [[f32; 3]]) -> Self {
        Self {
            buffer,
            count: 0,
            overflow: false,
        }
    }

    /// Returns false once a waypoint did not fit
    fn append(&mut self, pos: &[f32; 3]) -> bool {
        if self.count > 0 && vequal(&self.buffer[self.count - 1], pos) {
            return true;
        }
        if self.count == self.buffer.len() {
            self.overflow = true;
            return false;
        }
        self.buffer[self.count] = *pos;
        self.count += 1;
        true
    }

    fn finish(self, mut status: Status) -> (Status, usize) {
        if self.overflow {
            status.add(StatusDetail::BUFFER_TOO_SMALL);
        }
        (status, self.count)
    }
}
