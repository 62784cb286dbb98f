//! Handle table of live engine instances
//!
//! Handles encode `slot << 32 | generation`. Generations start at 1, so 0 is
//! never a valid handle, and a destroyed handle fails every later lookup.
//! Operations on an unknown handle are logged and return a sentinel.

use std::path::Path;

use navi_common::{Error, Result, Vec3};
use navi_detour::{Status, StatusDetail};
use navi_tilecache::ObstacleRef;

use crate::config::NaviConfig;
use crate::navi::Navi;

/// Opaque instance handle
pub type NaviHandle = u64;

fn encode(slot: u32, generation: u32) -> NaviHandle {
    ((slot as u64) << 32) | generation as u64
}

fn decode(handle: NaviHandle) -> (u32, u32) {
    ((handle >> 32) as u32, handle as u32)
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    navi: Option<Navi>,
}

/// Owner of engine instances, addressed by handle
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

fn handle_failure() -> Status {
    Status::failure().with(StatusDetail::INVALID_PARAM)
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.navi.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates an instance and returns its handle
    pub fn create(&mut self, config: NaviConfig) -> Result<NaviHandle> {
        let navi = Navi::new(config)?;
        if let Some(slot_idx) = self.free_list.pop() {
            let slot = &mut self.slots[slot_idx as usize];
            slot.navi = Some(navi);
            return Ok(encode(slot_idx, slot.generation));
        }
        let slot_idx = u32::try_from(self.slots.len())
            .map_err(|_| Error::Capacity("instance table is full".to_string()))?;
        self.slots.push(Slot {
            generation: 1,
            navi: Some(navi),
        });
        Ok(encode(slot_idx, 1))
    }

    /// Destroys an instance; false when the handle is not live
    pub fn destroy(&mut self, handle: NaviHandle) -> bool {
        let (slot_idx, generation) = decode(handle);
        let Some(slot) = self
            .slots
            .get_mut(slot_idx as usize)
            .filter(|slot| slot.generation == generation && slot.navi.is_some())
        else {
            log::error!("destroy: {}", Error::InvalidHandle(handle));
            return false;
        };
        slot.navi = None;
        slot.generation = slot.generation.wrapping_add(1);
        // A wrapped generation would revive old handles.
        if slot.generation != 0 {
            self.free_list.push(slot_idx);
        }
        true
    }

    pub fn get(&self, handle: NaviHandle) -> Option<&Navi> {
        let (slot_idx, generation) = decode(handle);
        let slot = self.slots.get(slot_idx as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.navi.as_ref()
    }

    pub fn get_mut(&mut self, handle: NaviHandle) -> Option<&mut Navi> {
        let (slot_idx, generation) = decode(handle);
        let slot = self.slots.get_mut(slot_idx as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.navi.as_mut()
    }

    /// Like [`Registry::get`], with the failure as an error value
    pub fn try_get(&self, handle: NaviHandle) -> Result<&Navi> {
        self.get(handle).ok_or(Error::InvalidHandle(handle))
    }

    pub fn try_get_mut(&mut self, handle: NaviHandle) -> Result<&mut Navi> {
        self.get_mut(handle).ok_or(Error::InvalidHandle(handle))
    }

    fn live(&self, handle: NaviHandle, op: &str) -> Option<&Navi> {
        self.try_get(handle)
            .map_err(|e| log::error!("{op}: {e}"))
            .ok()
    }

    fn live_mut(&mut self, handle: NaviHandle, op: &str) -> Option<&mut Navi> {
        self.try_get_mut(handle)
            .map_err(|e| log::error!("{op}: {e}"))
            .ok()
    }

    pub fn load_mesh<P: AsRef<Path>>(&mut self, handle: NaviHandle, path: P) -> bool {
        self.live_mut(handle, "load_mesh")
            .is_some_and(|navi| navi.load_mesh(path).is_ok())
    }

    pub fn load_mesh_with_nodes<P: AsRef<Path>>(
        &mut self,
        handle: NaviHandle,
        path: P,
        max_search_nodes: usize,
    ) -> bool {
        self.live_mut(handle, "load_mesh_with_nodes")
            .is_some_and(|navi| navi.load_mesh_with_nodes(path, max_search_nodes).is_ok())
    }

    pub fn load_doors<P: AsRef<Path>>(&mut self, handle: NaviHandle, path: P) -> bool {
        self.live_mut(handle, "load_doors")
            .is_some_and(|navi| navi.load_doors(path).is_ok())
    }

    pub fn load_regions<P: AsRef<Path>>(&mut self, handle: NaviHandle, path: P) -> bool {
        self.live_mut(handle, "load_regions")
            .is_some_and(|navi| navi.load_regions(path).is_ok())
    }

    pub fn get_region_id(&self, handle: NaviHandle, x: f32, z: f32) -> i32 {
        self.live(handle, "get_region_id")
            .map_or(0, |navi| navi.get_region_id(x, z))
    }

    pub fn set_default_poly_size(&mut self, handle: NaviHandle, x: f32, y: f32, z: f32) {
        if let Some(navi) = self.live_mut(handle, "set_default_poly_size") {
            navi.set_default_poly_size(x, y, z);
        }
    }

    pub fn find_path(&mut self, handle: NaviHandle, start: Vec3, end: Vec3, extents: Vec3) -> Status {
        self.live_mut(handle, "find_path")
            .map_or_else(handle_failure, |navi| navi.find_path(start, end, extents))
    }

    pub fn find_path_default(&mut self, handle: NaviHandle, start: Vec3, end: Vec3) -> Status {
        self.live_mut(handle, "find_path_default")
            .map_or_else(handle_failure, |navi| navi.find_path_default(start, end))
    }

    /// Copies the last path into `out`, returning the number written
    pub fn get_path(&self, handle: NaviHandle, out: &mut [[f32; 3]]) -> usize {
        let Some(navi) = self.live(handle, "get_path") else {
            return 0;
        };
        let n = navi.path_count().min(out.len());
        out[..n].copy_from_slice(&navi.path()[..n]);
        n
    }

    pub fn get_path_count(&self, handle: NaviHandle) -> usize {
        self.live(handle, "get_path_count")
            .map_or(0, Navi::path_count)
    }

    pub fn add_obstacle(&mut self, handle: NaviHandle, pos: Vec3, radius: f32, height: f32) -> ObstacleRef {
        self.live_mut(handle, "add_obstacle")
            .map_or(0, |navi| navi.add_obstacle(pos, radius, height))
    }

    pub fn add_obstacle_offset(
        &mut self,
        handle: NaviHandle,
        pos: Vec3,
        radius: f32,
        height: f32,
    ) -> ObstacleRef {
        self.live_mut(handle, "add_obstacle_offset")
            .map_or(0, |navi| navi.add_obstacle_offset(pos, radius, height))
    }

    pub fn remove_obstacle(&mut self, handle: NaviHandle, reference: ObstacleRef) -> Status {
        self.live_mut(handle, "remove_obstacle")
            .map_or_else(handle_failure, |navi| navi.remove_obstacle(reference))
    }

    pub fn refresh_obstacle(&mut self, handle: NaviHandle) -> Status {
        self.live_mut(handle, "refresh_obstacle")
            .map_or_else(handle_failure, Navi::refresh_obstacle)
    }

    pub fn max_obstacle_req_count(&self, handle: NaviHandle) -> usize {
        self.live(handle, "max_obstacle_req_count")
            .map_or(0, Navi::max_obstacle_req_count)
    }

    pub fn added_obstacle_req_count(&self, handle: NaviHandle) -> usize {
        self.live(handle, "added_obstacle_req_count")
            .map_or(0, Navi::added_obstacle_req_count)
    }

    pub fn obstacle_req_remain_count(&self, handle: NaviHandle) -> usize {
        self.live(handle, "obstacle_req_remain_count")
            .map_or(0, Navi::obstacle_req_remain_count)
    }

    pub fn is_door_exist(&self, handle: NaviHandle, id: i32) -> bool {
        self.live(handle, "is_door_exist")
            .is_some_and(|navi| navi.is_door_exist(id))
    }

    pub fn is_door_open(&self, handle: NaviHandle, id: i32) -> bool {
        self.live(handle, "is_door_open")
            .is_some_and(|navi| navi.is_door_open(id))
    }

    pub fn open_door(&mut self, handle: NaviHandle, id: i32, open: bool) -> Status {
        self.live_mut(handle, "open_door")
            .map_or_else(handle_failure, |navi| navi.open_door(id, open))
    }

    pub fn open_all_doors(&mut self, handle: NaviHandle, open: bool) {
        if let Some(navi) = self.live_mut(handle, "open_all_doors") {
            navi.open_all_doors(open);
        }
    }

    pub fn close_all_doors_poly(&mut self, handle: NaviHandle) {
        if let Some(navi) = self.live_mut(handle, "close_all_doors_poly") {
            navi.close_all_doors_poly();
        }
    }

    pub fn init_doors_poly(&mut self, handle: NaviHandle) {
        if let Some(navi) = self.live_mut(handle, "init_doors_poly") {
            navi.init_doors_poly();
        }
    }

    pub fn recover_all_doors_poly(&mut self, handle: NaviHandle) {
        if let Some(navi) = self.live_mut(handle, "recover_all_doors_poly") {
            navi.recover_all_doors_poly();
        }
    }
}
