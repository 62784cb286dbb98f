//! The engine instance
//!
//! [`Navi`] owns one navigation mesh with its door table, region index,
//! obstacle carver and reusable search buffers. It applies no locking; the
//! caller serialises access to one instance.

use std::path::Path;

use navi_common::{Error, Result, Vec3};
use navi_detour::binary_format::{load_nav_mesh, load_nav_mesh_from_binary};
use navi_detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, Status, StatusDetail};
use navi_tilecache::{Obstacle, ObstacleRef, TileCache, TileCacheParams};

use crate::config::NaviConfig;
use crate::doors::DoorTable;
use crate::volumes::{RegionIndex, load_volumes};

/// Navigation engine instance
#[derive(Debug)]
pub struct Navi {
    config: NaviConfig,
    nav_mesh: Option<NavMesh>,
    query: NavMeshQuery,
    tile_cache: TileCache,
    filter: QueryFilter,
    doors: DoorTable,
    regions: RegionIndex,
    default_extents: [f32; 3],
    search_polys: Vec<PolyRef>,
    searched_poly_count: usize,
    path: Vec<[f32; 3]>,
    path_count: usize,
}

fn tile_cache_params(config: &NaviConfig) -> TileCacheParams {
    TileCacheParams {
        max_obstacles: config.max_obstacles,
        max_requests: config.max_obstacle_requests,
        segments: config.obstacle_segments,
    }
}

impl Navi {
    /// Creates an instance with no mesh loaded
    pub fn new(config: NaviConfig) -> Result<Self> {
        config.validate()?;
        let tile_cache = TileCache::new(tile_cache_params(&config))?;
        Ok(Self {
            query: NavMeshQuery::new(config.max_search_nodes),
            tile_cache,
            filter: QueryFilter::default(),
            doors: DoorTable::default(),
            regions: RegionIndex::default(),
            default_extents: config.default_extents,
            search_polys: vec![PolyRef::NULL; config.max_polys],
            searched_poly_count: 0,
            path: vec![[0.0; 3]; config.max_polys],
            path_count: 0,
            nav_mesh: None,
            config,
        })
    }

    pub fn config(&self) -> &NaviConfig {
        &self.config
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.nav_mesh.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.nav_mesh.is_some()
    }

    pub fn doors(&self) -> &DoorTable {
        &self.doors
    }

    /// Polygon filter used by path queries
    pub fn filter_mut(&mut self) -> &mut QueryFilter {
        &mut self.filter
    }

    /// Loads a mesh artifact, replacing the current mesh
    ///
    /// On failure the current mesh, doors and obstacles are left untouched.
    pub fn load_mesh<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let loaded = load_nav_mesh(path.as_ref()).and_then(|mesh| self.install(mesh, None));
        if let Err(e) = &loaded {
            log::error!("Failed to load mesh {}: {e}", path.as_ref().display());
        }
        loaded
    }

    /// Loads a mesh artifact with an explicit search node budget
    pub fn load_mesh_with_nodes<P: AsRef<Path>>(
        &mut self,
        path: P,
        max_search_nodes: usize,
    ) -> Result<()> {
        if max_search_nodes == 0 {
            return Err(Error::Load("search node budget must be positive".to_string()));
        }
        let loaded = load_nav_mesh(path.as_ref())
            .and_then(|mesh| self.install(mesh, Some(max_search_nodes)));
        if let Err(e) = &loaded {
            log::error!("Failed to load mesh {}: {e}", path.as_ref().display());
        }
        loaded
    }

    pub fn load_mesh_from_bytes(&mut self, data: &[u8]) -> Result<()> {
        let loaded = load_nav_mesh_from_binary(data).and_then(|mesh| self.install(mesh, None));
        if let Err(e) = &loaded {
            log::error!("Failed to load mesh from memory: {e}");
        }
        loaded
    }

    fn install(&mut self, mut mesh: NavMesh, max_search_nodes: Option<usize>) -> Result<()> {
        let budget = max_search_nodes
            .or(mesh.search_node_hint())
            .unwrap_or(self.config.max_search_nodes);

        let mut tile_cache = TileCache::new(tile_cache_params(&self.config)).map_err(Error::into_load)?;
        tile_cache.init_from_nav_mesh(&mesh).map_err(Error::into_load)?;

        self.doors.attach(&mut mesh);
        log::info!(
            "Installed navigation mesh: {} tiles, node budget {budget}, {} doors",
            mesh.tile_count(),
            self.doors.len()
        );
        self.nav_mesh = Some(mesh);
        self.tile_cache = tile_cache;
        self.query = NavMeshQuery::new(budget);
        self.searched_poly_count = 0;
        self.path_count = 0;
        Ok(())
    }

    pub fn set_default_poly_size(&mut self, x: f32, y: f32, z: f32) {
        self.default_extents = [x, y, z];
    }

    pub fn default_poly_size(&self) -> Vec3 {
        Vec3::from_array(self.default_extents)
    }

    /// Finds a path into the instance's path buffer
    pub fn find_path(&mut self, start: Vec3, end: Vec3, extents: Vec3) -> Status {
        let mut path = std::mem::take(&mut self.path);
        let (status, count) = self.find_path_into(start, end, extents, &mut path);
        self.path = path;
        self.path_count = count;
        status
    }

    /// Finds a path using the default search extents
    pub fn find_path_default(&mut self, start: Vec3, end: Vec3) -> Status {
        self.find_path(start, end, self.default_poly_size())
    }

    /// Finds a path and writes its waypoints into `out`
    ///
    /// Start and end are snapped to the nearest polygons within `extents`.
    /// A path that stops short of the goal is reported with
    /// `PARTIAL_RESULT`, as a failure unless partial paths are accepted.
    pub fn find_path_into(
        &mut self,
        start: Vec3,
        end: Vec3,
        extents: Vec3,
        out: &mut [[f32; 3]],
    ) -> (Status, usize) {
        self.searched_poly_count = 0;
        let invalid = Status::failure().with(StatusDetail::INVALID_PARAM);
        let Some(nav_mesh) = self.nav_mesh.as_ref() else {
            log::error!("find_path called before a mesh was loaded");
            return (invalid, 0);
        };
        if !extents.is_finite() || extents.min_element() <= 0.0 || out.is_empty() {
            return (invalid, 0);
        }

        let (start, end, extents) = (start.to_array(), end.to_array(), extents.to_array());
        let Some((start_ref, _)) = self.query.find_nearest_poly(nav_mesh, &start, &extents, &self.filter) else {
            log::debug!("No start polygon near {start:?}");
            return (invalid, 0);
        };
        let Some((end_ref, _)) = self.query.find_nearest_poly(nav_mesh, &end, &extents, &self.filter) else {
            log::debug!("No end polygon near {end:?}");
            return (invalid, 0);
        };

        let (search, n) = self.query.find_path(
            nav_mesh,
            start_ref,
            end_ref,
            &start,
            &end,
            &self.filter,
            &mut self.search_polys,
        );
        if search.is_failure() || n == 0 {
            return (Status::failure().with(search.detail()), 0);
        }
        self.searched_poly_count = n;

        let corridor = &self.search_polys[..n];
        // A truncated corridor is usable; only an unreached goal is partial.
        let partial = search.has(StatusDetail::PARTIAL_RESULT);
        let mut end_pos = end;
        if corridor[n - 1] != end_ref {
            // Clamp the end onto the last polygon reached.
            if let Ok((p, _)) = nav_mesh.closest_point_on_poly(corridor[n - 1], &end) {
                end_pos = p;
            }
        }

        let (straight, count) = self.query.find_straight_path(nav_mesh, &start, &end_pos, corridor, out);
        let detail = search.detail() | straight.detail();
        if straight.is_failure() || count < 2 {
            return (Status::failure().with(detail), count);
        }
        if partial {
            let detail = detail | StatusDetail::PARTIAL_RESULT;
            let status = if self.config.accept_partial_paths {
                Status::success().with(detail)
            } else {
                Status::failure().with(detail)
            };
            return (status, count);
        }
        (Status::success().with(detail), count)
    }

    /// Waypoints of the last [`find_path`](Self::find_path)
    pub fn path(&self) -> &[[f32; 3]] {
        &self.path[..self.path_count]
    }

    pub fn path_count(&self) -> usize {
        self.path_count
    }

    /// Polygon corridor of the last search
    pub fn searched_polys(&self) -> &[PolyRef] {
        &self.search_polys[..self.searched_poly_count]
    }

    /// Queues a cylinder obstacle, returning 0 when it is rejected
    pub fn add_obstacle(&mut self, pos: Vec3, radius: f32, height: f32) -> ObstacleRef {
        if self.nav_mesh.is_none() {
            log::warn!("add_obstacle called before a mesh was loaded");
            return 0;
        }
        match self.tile_cache.add_obstacle(pos.to_array(), radius, height) {
            Ok(reference) => reference,
            Err(e) => {
                log::warn!("Rejected obstacle at {pos}: {e}");
                0
            }
        }
    }

    /// Queues an obstacle whose base sits one unit below `pos`
    pub fn add_obstacle_offset(&mut self, pos: Vec3, radius: f32, height: f32) -> ObstacleRef {
        self.add_obstacle(pos - Vec3::Y, radius, height + 1.0)
    }

    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Status {
        if self.nav_mesh.is_none() {
            return Status::failure().with(StatusDetail::INVALID_PARAM);
        }
        match self.tile_cache.remove_obstacle(reference) {
            Ok(()) => Status::success(),
            Err(Error::Capacity(_)) => Status::failure().with(StatusDetail::BUFFER_TOO_SMALL),
            Err(_) => Status::failure().with(StatusDetail::INVALID_PARAM),
        }
    }

    /// Applies the queued obstacle requests to the mesh
    ///
    /// Polygon references of rebuilt tiles change; run
    /// [`init_doors_poly`](Self::init_doors_poly) afterwards.
    pub fn refresh_obstacle(&mut self) -> Status {
        let Some(nav_mesh) = self.nav_mesh.as_mut() else {
            return Status::failure().with(StatusDetail::INVALID_PARAM);
        };
        match self.tile_cache.update(nav_mesh) {
            Ok(rebuilt) => {
                log::debug!("Obstacle refresh rebuilt {rebuilt} tiles");
                Status::success()
            }
            Err(_) => Status::failure(),
        }
    }

    pub fn max_obstacle_req_count(&self) -> usize {
        self.tile_cache.max_request_count()
    }

    pub fn added_obstacle_req_count(&self) -> usize {
        self.tile_cache.added_request_count()
    }

    pub fn obstacle_req_remain_count(&self) -> usize {
        self.tile_cache.remain_request_count()
    }

    pub fn obstacle(&self, reference: ObstacleRef) -> Option<&Obstacle> {
        self.tile_cache.get_obstacle_by_ref(reference)
    }

    pub fn obstacle_count(&self) -> usize {
        self.tile_cache.obstacle_count()
    }

    /// Loads the door table, replacing the current one
    pub fn load_doors<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let Some(nav_mesh) = self.nav_mesh.as_mut() else {
            return Err(Error::Load("doors need a loaded mesh".to_string()));
        };
        let volumes = load_volumes(path.as_ref()).map_err(|e| {
            log::error!("Failed to load doors {}: {e}", path.as_ref().display());
            e
        })?;

        let mut doors = DoorTable::from_volumes(volumes);
        self.doors.detach(nav_mesh);
        doors.attach(nav_mesh);
        self.doors = doors;
        Ok(())
    }

    /// Loads the region volumes, replacing the current ones
    pub fn load_regions<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let volumes = load_volumes(path.as_ref()).map_err(|e| {
            log::error!("Failed to load regions {}: {e}", path.as_ref().display());
            e
        })?;
        self.regions = RegionIndex::new(volumes);
        Ok(())
    }

    /// Region containing `(x, z)`, or 0
    pub fn get_region_id(&self, x: f32, z: f32) -> i32 {
        self.regions.region_id(x, z)
    }

    pub fn is_door_exist(&self, id: i32) -> bool {
        self.doors.is_door_exist(id)
    }

    pub fn is_door_open(&self, id: i32) -> bool {
        self.doors.is_door_open(id)
    }

    pub fn open_door(&mut self, id: i32, open: bool) -> Status {
        match self.nav_mesh.as_mut() {
            Some(nav_mesh) => self.doors.open_door(nav_mesh, id, open),
            None => Status::failure().with(StatusDetail::INVALID_PARAM),
        }
    }

    pub fn open_all_doors(&mut self, open: bool) {
        if let Some(nav_mesh) = self.nav_mesh.as_mut() {
            self.doors.open_all_doors(nav_mesh, open);
        }
    }

    pub fn close_all_doors_poly(&mut self) {
        if let Some(nav_mesh) = self.nav_mesh.as_mut() {
            self.doors.close_all_doors_poly(nav_mesh);
        }
    }

    pub fn init_doors_poly(&mut self) {
        if let Some(nav_mesh) = self.nav_mesh.as_mut() {
            self.doors.init_doors_poly(nav_mesh);
        }
    }

    pub fn recover_all_doors_poly(&mut self) {
        if let Some(nav_mesh) = self.nav_mesh.as_mut() {
            self.doors.recover_all_doors_poly(nav_mesh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_detour::PolyArea;
    use navi_detour::test_mesh_helpers::TestMeshBuilder;

    fn two_rooms() -> Vec<u8> {
        TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 8.0, 4.0, PolyArea::Ground)
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_queries_without_mesh() {
        let mut navi = Navi::new(NaviConfig::default()).unwrap();
        let status = navi.find_path_default(Vec3::ZERO, Vec3::ONE);
        assert!(status.is_failure());
        assert_eq!(navi.path_count(), 0);
        assert_eq!(navi.add_obstacle(Vec3::ZERO, 1.0, 1.0), 0);
        assert!(navi.refresh_obstacle().is_failure());
        assert!(navi.open_door(1, true).is_failure());
        assert!(navi.load_doors("missing.txt").is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Navi::new(NaviConfig::new().with_max_polys(0)).is_err());
    }

    #[test]
    fn test_straight_path_in_room() {
        let mut navi = Navi::new(NaviConfig::default()).unwrap();
        navi.load_mesh_from_bytes(&two_rooms()).unwrap();
        let status = navi.find_path_default(Vec3::new(1.0, 0.0, 1.0), Vec3::new(7.0, 0.0, 3.0));
        assert!(status.is_success());
        assert_eq!(navi.path(), &[[1.0, 0.0, 1.0], [7.0, 0.0, 3.0]]);
        assert_eq!(navi.searched_polys().len(), 2);
    }

    #[test]
    fn test_far_point_has_no_polygon() {
        let mut navi = Navi::new(NaviConfig::default()).unwrap();
        navi.load_mesh_from_bytes(&two_rooms()).unwrap();
        let status = navi.find_path_default(Vec3::new(1.0, 0.0, 1.0), Vec3::new(40.0, 0.0, 40.0));
        assert!(status.is_failure());
        assert!(status.has(StatusDetail::INVALID_PARAM));

        // A wider search box reaches the mesh.
        let status = navi.find_path(
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(9.0, 0.0, 2.0),
            Vec3::new(2.0, 4.0, 2.0),
        );
        assert!(status.is_success());
        assert_eq!(navi.path().last(), Some(&[8.0, 0.0, 2.0]));
    }

    #[test]
    fn test_failed_load_keeps_previous_mesh() {
        let mut navi = Navi::new(NaviConfig::default()).unwrap();
        navi.load_mesh_from_bytes(&two_rooms()).unwrap();

        let mut bad = two_rooms();
        bad.truncate(bad.len() / 2);
        assert!(matches!(navi.load_mesh_from_bytes(&bad), Err(Error::Load(_))));
        assert!(navi.load_mesh("does/not/exist.bin").is_err());

        let status = navi.find_path_default(Vec3::new(1.0, 0.0, 1.0), Vec3::new(7.0, 0.0, 3.0));
        assert!(status.is_success());
    }

    #[test]
    fn test_caller_buffer_overflow() {
        let bytes = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(0.0, 4.0, 4.0, 8.0, PolyArea::Ground)
            .rect(4.0, 4.0, 8.0, 8.0, PolyArea::Ground)
            .to_bytes()
            .unwrap();
        let mut navi = Navi::new(NaviConfig::default()).unwrap();
        navi.load_mesh_from_bytes(&bytes).unwrap();

        let mut out = [[0.0f32; 3]; 2];
        let (status, count) = navi.find_path_into(
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(7.0, 0.0, 5.0),
            Vec3::new(1.0, 2.0, 1.0),
            &mut out,
        );
        assert_eq!(count, 2);
        assert!(status.has(StatusDetail::BUFFER_TOO_SMALL));
        assert_eq!(out, [[1.0, 0.0, 1.0], [4.0, 0.0, 4.0]]);

        let mut out = [[0.0f32; 3]; 8];
        let (status, count) = navi.find_path_into(
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(7.0, 0.0, 5.0),
            Vec3::new(1.0, 2.0, 1.0),
            &mut out,
        );
        assert!(status.is_success());
        assert_eq!(count, 3);
    }

    #[test]
    fn test_node_budget_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.bin");
        std::fs::write(&path, two_rooms()).unwrap();

        let mut navi = Navi::new(NaviConfig::new().with_max_search_nodes(4096)).unwrap();
        navi.load_mesh(&path).unwrap();
        assert_eq!(navi.query.max_nodes(), 4096);
        navi.load_mesh_with_nodes(&path, 128).unwrap();
        assert_eq!(navi.query.max_nodes(), 128);
        assert!(navi.load_mesh_with_nodes(&path, 0).is_err());
    }
}
