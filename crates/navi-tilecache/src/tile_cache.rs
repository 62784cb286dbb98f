//! Obstacle pool, request queue and tile rebuilds
//!
//! Obstacle changes are queued and applied in one pass by [`TileCache::update`],
//! which rebuilds every touched tile once from its pristine data.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::tile_cache_builder::{ObstacleShape, TileCacheBuilder};
use super::tile_cache_data::CompressedTile;
use navi_common::{Error, Result};
use navi_detour::{NavMesh, Status, StatusDetail};

/// Reference to an obstacle; zero is never issued
pub type ObstacleRef = u32;

/// Tile cache parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCacheParams {
    /// Maximum number of obstacles
    pub max_obstacles: usize,
    /// Capacity of the request queue
    pub max_requests: usize,
    /// Sides of the polygon approximating an obstacle cylinder
    pub segments: usize,
}

impl Default for TileCacheParams {
    fn default() -> Self {
        Self {
            max_obstacles: 128,
            max_requests: 64,
            segments: 12,
        }
    }
}

/// Obstacle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleState {
    /// Free slot
    Empty,
    /// Added, waiting for the next update
    Processing,
    /// Carved into the mesh
    Processed,
    /// Removal queued
    Removing,
}

/// Cylinder obstacle
#[derive(Debug, Clone)]
pub struct Obstacle {
    /// Base centre
    pub pos: [f32; 3],
    pub radius: f32,
    pub height: f32,
    pub state: ObstacleState,
    /// Salt value for reference generation
    pub salt: u16,
    /// Tiles the footprint overlaps
    pub touched: Vec<(i32, i32)>,
    next: Option<usize>,
}

impl Obstacle {
    fn empty(next: Option<usize>) -> Self {
        Self {
            pos: [0.0; 3],
            radius: 0.0,
            height: 0.0,
            state: ObstacleState::Empty,
            salt: 0,
            touched: Vec::new(),
            next,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct ObstacleRequest {
    action: RequestAction,
    reference: ObstacleRef,
}

/// Obstacle carver for one navigation mesh
#[derive(Debug)]
pub struct TileCache {
    params: TileCacheParams,
    builder: TileCacheBuilder,
    /// Pristine tiles by grid coordinates
    tiles: HashMap<(i32, i32), CompressedTile>,
    obstacles: Vec<Obstacle>,
    next_free_obstacle: Option<usize>,
    requests: VecDeque<ObstacleRequest>,
}

fn status_error(detail: StatusDetail, what: String) -> Error {
    Error::TileCache(format!("{}: {what}", Status::failure().with(detail)))
}

impl TileCache {
    /// Creates an empty tile cache
    pub fn new(params: TileCacheParams) -> Result<Self> {
        if params.max_obstacles == 0 || params.max_obstacles > 0xffff {
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                format!("obstacle capacity {} out of range", params.max_obstacles),
            ));
        }
        if params.max_requests == 0 {
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                "request queue capacity is zero".to_string(),
            ));
        }
        if params.segments < 3 {
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                format!("{} segments cannot approximate a cylinder", params.segments),
            ));
        }

        let mut cache = Self {
            params,
            builder: TileCacheBuilder::new(params.segments, navi_detour::nav_mesh::MAX_POLYS_PER_TILE),
            tiles: HashMap::new(),
            obstacles: Vec::with_capacity(params.max_obstacles),
            next_free_obstacle: None,
            requests: VecDeque::with_capacity(params.max_requests),
        };
        cache.reset_obstacles();
        Ok(cache)
    }

    fn reset_obstacles(&mut self) {
        let n = self.params.max_obstacles;
        self.obstacles = (0..n)
            .map(|i| Obstacle::empty((i + 1 < n).then_some(i + 1)))
            .collect();
        self.next_free_obstacle = Some(0);
        self.requests.clear();
    }

    /// Captures the mesh's current tiles as the pristine state
    ///
    /// Any obstacles and queued requests are dropped.
    pub fn init_from_nav_mesh(&mut self, nav_mesh: &NavMesh) -> Result<()> {
        let mut tiles = HashMap::with_capacity(nav_mesh.tile_count());
        for (_, tile) in nav_mesh.tiles() {
            let compressed = CompressedTile::from_tile(tile)?;
            tiles.insert((compressed.x, compressed.y), compressed);
        }
        log::debug!("Tile cache holds {} pristine tiles", tiles.len());

        self.tiles = tiles;
        self.builder = TileCacheBuilder::new(self.params.segments, nav_mesh.params().max_polys_per_tile);
        self.reset_obstacles();
        Ok(())
    }

    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Queues a cylinder obstacle
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        if !pos.iter().all(|c| c.is_finite())
            || !(radius.is_finite() && radius > 0.0)
            || !(height.is_finite() && height >= 0.0)
        {
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                format!("bad obstacle at {pos:?} radius {radius} height {height}"),
            ));
        }
        if self.requests.len() >= self.params.max_requests {
            log::warn!("Obstacle request queue is full ({} requests)", self.requests.len());
            return Err(Error::Capacity(format!(
                "{}: request queue full",
                Status::failure().with(StatusDetail::BUFFER_TOO_SMALL)
            )));
        }
        let Some(idx) = self.next_free_obstacle else {
            log::warn!("All {} obstacle slots in use", self.params.max_obstacles);
            return Err(Error::Capacity(format!(
                "{}: obstacle pool exhausted",
                Status::failure().with(StatusDetail::OUT_OF_MEMORY)
            )));
        };

        let obstacle = &mut self.obstacles[idx];
        self.next_free_obstacle = obstacle.next.take();
        obstacle.pos = pos;
        obstacle.radius = radius;
        obstacle.height = height;
        obstacle.state = ObstacleState::Processing;
        obstacle.salt = obstacle.salt.wrapping_add(1).max(1);
        obstacle.touched.clear();

        let reference = encode_obstacle_ref(obstacle.salt, idx);
        self.requests.push_back(ObstacleRequest {
            action: RequestAction::Add,
            reference,
        });
        Ok(reference)
    }

    /// Queues removal of an obstacle
    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Result<()> {
        let Some(idx) = self.live_index(reference) else {
            log::warn!("Unknown obstacle reference {reference:#x}");
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                format!("unknown obstacle {reference:#x}"),
            ));
        };
        if self.obstacles[idx].state == ObstacleState::Removing {
            return Err(status_error(
                StatusDetail::INVALID_PARAM,
                format!("obstacle {reference:#x} is already being removed"),
            ));
        }
        if self.requests.len() >= self.params.max_requests {
            log::warn!("Obstacle request queue is full ({} requests)", self.requests.len());
            return Err(Error::Capacity(format!(
                "{}: request queue full",
                Status::failure().with(StatusDetail::BUFFER_TOO_SMALL)
            )));
        }

        self.obstacles[idx].state = ObstacleState::Removing;
        self.requests.push_back(ObstacleRequest {
            action: RequestAction::Remove,
            reference,
        });
        Ok(())
    }

    fn live_index(&self, reference: ObstacleRef) -> Option<usize> {
        let idx = decode_obstacle_ref_idx(reference);
        let obstacle = self.obstacles.get(idx)?;
        (reference != 0
            && obstacle.state != ObstacleState::Empty
            && obstacle.salt == decode_obstacle_ref_salt(reference))
        .then_some(idx)
    }

    /// Gets an obstacle by its reference
    pub fn get_obstacle_by_ref(&self, reference: ObstacleRef) -> Option<&Obstacle> {
        self.live_index(reference).map(|idx| &self.obstacles[idx])
    }

    /// Number of occupied obstacle slots
    pub fn obstacle_count(&self) -> usize {
        self.obstacles
            .iter()
            .filter(|o| o.state != ObstacleState::Empty)
            .count()
    }

    /// Capacity of the request queue
    pub fn max_request_count(&self) -> usize {
        self.params.max_requests
    }

    /// Requests waiting for the next update
    pub fn added_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Requests that can still be queued
    pub fn remain_request_count(&self) -> usize {
        self.params.max_requests - self.requests.len()
    }

    /// Tiles whose pristine data overlaps an obstacle footprint
    ///
    /// Only cached tiles are visited, so the cost does not grow with the
    /// obstacle radius.
    fn touched_tiles(&self, shape: &ObstacleShape) -> Vec<(i32, i32)> {
        let (bmin, bmax) = shape.bounds();
        let mut touched: Vec<(i32, i32)> = self
            .tiles
            .iter()
            .filter(|(_, tile)| {
                bmin[0] <= tile.bmax[0]
                    && bmax[0] >= tile.bmin[0]
                    && bmin[2] <= tile.bmax[2]
                    && bmax[2] >= tile.bmin[2]
            })
            .map(|(&coords, _)| coords)
            .collect();
        touched.sort_unstable_by_key(|&(tx, ty)| (ty, tx));
        touched
    }

    /// Applies all queued requests in order and rebuilds the touched tiles
    ///
    /// Returns the number of rebuilt tiles. A tile that fails to rebuild
    /// keeps its current polygons; the first such failure is returned after
    /// every other tile has been processed.
    pub fn update(&mut self, nav_mesh: &mut NavMesh) -> Result<usize> {
        let mut dirty = BTreeSet::new();

        while let Some(request) = self.requests.pop_front() {
            let Some(idx) = self.live_index(request.reference) else {
                continue;
            };
            match request.action {
                RequestAction::Add => {
                    let shape = ObstacleShape::from_obstacle(&self.obstacles[idx], self.params.segments);
                    let touched = self.touched_tiles(&shape);
                    dirty.extend(touched.iter().copied());
                    let obstacle = &mut self.obstacles[idx];
                    obstacle.touched = touched;
                    if obstacle.state == ObstacleState::Processing {
                        obstacle.state = ObstacleState::Processed;
                    }
                }
                RequestAction::Remove => {
                    let obstacle = &mut self.obstacles[idx];
                    dirty.extend(obstacle.touched.drain(..));
                    obstacle.state = ObstacleState::Empty;
                    obstacle.next = self.next_free_obstacle;
                    self.next_free_obstacle = Some(idx);
                }
            }
        }

        let mut rebuilt = 0;
        let mut first_error = None;
        for (tx, ty) in dirty {
            match self.rebuild_tile(nav_mesh, tx, ty) {
                Ok(()) => rebuilt += 1,
                Err(e) => {
                    log::error!("Failed to rebuild tile ({tx}, {ty}): {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    fn rebuild_tile(&self, nav_mesh: &mut NavMesh, tx: i32, ty: i32) -> Result<()> {
        let compressed = self
            .tiles
            .get(&(tx, ty))
            .ok_or_else(|| Error::TileCache(format!("no pristine data for tile ({tx}, {ty})")))?;
        let pristine = compressed.decompress()?;
        let active: Vec<&Obstacle> = self
            .obstacles
            .iter()
            .filter(|o| o.state == ObstacleState::Processed && o.touched.contains(&(tx, ty)))
            .collect();

        let before = nav_mesh.tile_at(tx, ty).map_or(0, |t| t.polys.len());
        let tile = self.builder.build_tile(&pristine, &active)?;
        let after = tile.polys.len();
        nav_mesh.replace_tile(tile)?;
        log::debug!(
            "Rebuilt tile ({tx}, {ty}) with {} obstacles: {before} -> {after} polygons",
            active.len()
        );
        Ok(())
    }
}

/// Encodes an obstacle reference from salt and index
pub fn encode_obstacle_ref(salt: u16, idx: usize) -> ObstacleRef {
    ((salt as u32) << 16) | (idx as u32 & 0xffff)
}

/// Decodes the salt from an obstacle reference
pub fn decode_obstacle_ref_salt(reference: ObstacleRef) -> u16 {
    ((reference >> 16) & 0xffff) as u16
}

/// Decodes the index from an obstacle reference
pub fn decode_obstacle_ref_idx(reference: ObstacleRef) -> usize {
    (reference & 0xffff) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_detour::test_mesh_helpers::TestMeshBuilder;
    use navi_detour::{NavMeshQuery, PolyArea, PolyRef, QueryFilter};
    use proptest::prelude::*;

    fn params(max_obstacles: usize, max_requests: usize) -> TileCacheParams {
        TileCacheParams {
            max_obstacles,
            max_requests,
            segments: 12,
        }
    }

    /// A corridor x in [5, 7] joining two rooms across two tiles
    fn corridor_mesh() -> NavMesh {
        TestMeshBuilder::new(12.0)
            .rect(0.0, 0.0, 12.0, 4.0, PolyArea::Ground)
            .rect(5.0, 4.0, 7.0, 12.0, PolyArea::Ground)
            .rect(5.0, 12.0, 7.0, 20.0, PolyArea::Ground)
            .rect(0.0, 20.0, 12.0, 24.0, PolyArea::Ground)
            .build()
            .unwrap()
    }

    fn route_exists(mesh: &NavMesh) -> bool {
        let mut query = NavMeshQuery::new(1024);
        let filter = QueryFilter::default();
        let start = [6.0, 0.0, 1.0];
        let end = [6.0, 0.0, 23.0];
        let nearest = |p: &[f32; 3]| query.find_nearest_poly(mesh, p, &[1.0, 2.0, 1.0], &filter);
        let (Some((s, _)), Some((e, _))) = (nearest(&start), nearest(&end)) else {
            return false;
        };
        let mut path = [PolyRef::NULL; 256];
        let (status, _) = query.find_path(mesh, s, e, &start, &end, &filter, &mut path);
        status.is_success() && !status.has(StatusDetail::PARTIAL_RESULT)
    }

    #[test]
    fn test_invalid_params() {
        assert!(TileCache::new(params(0, 4)).is_err());
        assert!(TileCache::new(params(4, 0)).is_err());
        assert!(TileCache::new(TileCacheParams { segments: 2, ..Default::default() }).is_err());
        assert!(TileCache::new(TileCacheParams::default()).is_ok());
    }

    #[test]
    fn test_obstacle_refs() {
        let mut cache = TileCache::new(params(2, 8)).unwrap();
        let a = cache.add_obstacle([1.0, 0.0, 1.0], 0.5, 2.0).unwrap();
        let b = cache.add_obstacle([3.0, 0.0, 1.0], 0.5, 2.0).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(cache.get_obstacle_by_ref(a).unwrap().state, ObstacleState::Processing);

        // Pool exhausted
        assert!(matches!(
            cache.add_obstacle([5.0, 0.0, 1.0], 0.5, 2.0),
            Err(Error::Capacity(_))
        ));

        assert!(cache.remove_obstacle(0).is_err());
        assert!(cache.remove_obstacle(a ^ 0x10000).is_err());
        cache.remove_obstacle(a).unwrap();
        assert!(cache.remove_obstacle(a).is_err());
        assert_eq!(cache.obstacle_count(), 2);
    }

    #[test]
    fn test_queue_accounting() {
        let mut cache = TileCache::new(params(8, 2)).unwrap();
        let mut mesh = corridor_mesh();
        cache.init_from_nav_mesh(&mesh).unwrap();
        assert_eq!(cache.max_request_count(), 2);
        assert_eq!(cache.remain_request_count(), 2);

        let a = cache.add_obstacle([1.0, 0.0, 1.0], 0.5, 2.0).unwrap();
        cache.add_obstacle([3.0, 0.0, 1.0], 0.5, 2.0).unwrap();
        assert_eq!(cache.added_request_count(), 2);
        assert_eq!(cache.remain_request_count(), 0);

        // The queue is full: both adds and removes are rejected.
        assert!(cache.add_obstacle([9.0, 0.0, 1.0], 0.5, 2.0).is_err());
        assert!(cache.remove_obstacle(a).is_err());
        assert_eq!(cache.added_request_count(), 2);

        cache.update(&mut mesh).unwrap();
        assert_eq!(cache.added_request_count(), 0);
        assert_eq!(cache.remain_request_count(), 2);
        assert_eq!(cache.get_obstacle_by_ref(a).unwrap().state, ObstacleState::Processed);
    }

    #[test]
    fn test_obstacle_blocks_corridor_until_update() {
        let mut mesh = corridor_mesh();
        let mut cache = TileCache::new(TileCacheParams::default()).unwrap();
        cache.init_from_nav_mesh(&mesh).unwrap();
        assert!(route_exists(&mesh));

        let r = cache.add_obstacle([6.0, -1.0, 8.0], 1.5, 3.0).unwrap();
        assert!(route_exists(&mesh));

        assert_eq!(cache.update(&mut mesh).unwrap(), 1);
        assert!(!route_exists(&mesh));
        assert_eq!(cache.get_obstacle_by_ref(r).unwrap().touched, vec![(0, 0)]);

        cache.remove_obstacle(r).unwrap();
        cache.update(&mut mesh).unwrap();
        assert!(route_exists(&mesh));
        assert!(cache.get_obstacle_by_ref(r).is_none());
        assert_eq!(cache.obstacle_count(), 0);
    }

    #[test]
    fn test_obstacle_on_tile_border_rebuilds_both_tiles() {
        let mut mesh = corridor_mesh();
        let mut cache = TileCache::new(TileCacheParams::default()).unwrap();
        cache.init_from_nav_mesh(&mesh).unwrap();

        let r = cache.add_obstacle([6.0, -1.0, 12.0], 1.5, 3.0).unwrap();
        assert_eq!(cache.update(&mut mesh).unwrap(), 2);
        assert_eq!(cache.get_obstacle_by_ref(r).unwrap().touched.len(), 2);
        assert!(!route_exists(&mesh));
    }

    #[test]
    fn test_small_obstacle_leaves_route() {
        let mut mesh = corridor_mesh();
        let mut cache = TileCache::new(TileCacheParams::default()).unwrap();
        cache.init_from_nav_mesh(&mesh).unwrap();

        cache.add_obstacle([5.5, -1.0, 8.0], 0.3, 3.0).unwrap();
        cache.update(&mut mesh).unwrap();
        assert!(route_exists(&mesh));
    }

    #[test]
    fn test_obstacle_outside_mesh_touches_nothing() {
        let mut mesh = corridor_mesh();
        let mut cache = TileCache::new(TileCacheParams::default()).unwrap();
        cache.init_from_nav_mesh(&mesh).unwrap();

        let r = cache.add_obstacle([100.0, 0.0, 100.0], 1.0, 2.0).unwrap();
        assert_eq!(cache.update(&mut mesh).unwrap(), 0);
        assert!(cache.get_obstacle_by_ref(r).unwrap().touched.is_empty());
    }

    #[test]
    fn test_huge_obstacle_visits_only_cached_tiles() {
        let mut mesh = corridor_mesh();
        let mut cache = TileCache::new(TileCacheParams::default()).unwrap();
        cache.init_from_nav_mesh(&mesh).unwrap();

        let r = cache.add_obstacle([6.0, 0.0, 8.0], 2.0e5, 2.0).unwrap();
        assert_eq!(cache.update(&mut mesh).unwrap(), 2);
        assert_eq!(cache.get_obstacle_by_ref(r).unwrap().touched, vec![(0, 0), (0, 1)]);
        assert!(mesh.tile_at(0, 0).unwrap().polys.is_empty());
        assert!(mesh.tile_at(0, 1).unwrap().polys.is_empty());
        assert!(!route_exists(&mesh));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(f32, f32),
        Remove(usize),
        Refresh,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0f32..12.0, 0.0f32..24.0).prop_map(|(x, z)| Op::Add(x, z)),
            (0usize..16).prop_map(Op::Remove),
            Just(Op::Refresh),
        ]
    }

    proptest! {
        #[test]
        fn prop_added_plus_remain_is_max(ops in proptest::collection::vec(op(), 0..40)) {
            let mut mesh = corridor_mesh();
            let mut cache = TileCache::new(params(6, 4)).unwrap();
            cache.init_from_nav_mesh(&mesh).unwrap();
            let mut refs = Vec::new();

            for op in ops {
                match op {
                    Op::Add(x, z) => {
                        if let Ok(r) = cache.add_obstacle([x, -1.0, z], 0.5, 2.0) {
                            refs.push(r);
                        }
                    }
                    Op::Remove(i) => {
                        if !refs.is_empty() {
                            let r = refs[i % refs.len()];
                            let _ = cache.remove_obstacle(r);
                        }
                    }
                    Op::Refresh => {
                        let _ = cache.update(&mut mesh);
                    }
                }
                prop_assert_eq!(
                    cache.added_request_count() + cache.remain_request_count(),
                    cache.max_request_count()
                );
                prop_assert!(cache.added_request_count() <= cache.max_request_count());
            }
        }
    }
}
