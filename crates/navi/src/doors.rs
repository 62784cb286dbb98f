//! Door gates over polygon adjacency
//!
//! A closed door has every link touching its polygons removed from the mesh.
//! The removed links are kept in an undo log so that opening the door
//! restores exactly the adjacency that closing it took away.

use navi_detour::{Link, NavMesh, PolyFlags, PolyRef, QueryFilter, Status, StatusDetail};

use crate::volumes::Volume;

/// Maximum number of polygons a door can gate
pub const MAX_DOOR_POLYS: usize = 64;

/// Vertical half extent of the box used to find door polygons
const DOOR_HALF_HEIGHT: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct Door {
    pub id: i32,
    /// Ring the door polygons are found under
    pub anchor: Vec<[f32; 3]>,
    polys: Vec<PolyRef>,
    /// Logical state
    open: bool,
    /// Whether the door's adjacency is currently removed from the mesh
    gated: bool,
    undo: Vec<(PolyRef, Link)>,
}

impl Door {
    fn from_volume(volume: Volume) -> Self {
        Self {
            id: volume.id,
            anchor: volume.verts,
            polys: Vec::new(),
            open: volume.open,
            gated: false,
            undo: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_gated(&self) -> bool {
        self.gated
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys
    }

    /// Finds the door polygons under the anchor ring
    fn resolve(&mut self, mesh: &NavMesh) {
        self.polys.clear();
        if self.anchor.is_empty() {
            return;
        }
        let mut center = [0.0f32; 3];
        let mut bmin = self.anchor[0];
        let mut bmax = self.anchor[0];
        for v in &self.anchor {
            for k in 0..3 {
                center[k] += v[k];
                bmin[k] = bmin[k].min(v[k]);
                bmax[k] = bmax[k].max(v[k]);
            }
        }
        let inv = 1.0 / self.anchor.len() as f32;
        center.iter_mut().for_each(|c| *c *= inv);
        let half_extents = [
            (bmax[0] - bmin[0]) * 0.5,
            DOOR_HALF_HEIGHT,
            (bmax[2] - bmin[2]) * 0.5,
        ];

        let filter = QueryFilter::new(PolyFlags::DOOR, PolyFlags::empty());
        let mut found = mesh.query_polygons(&center, &half_extents, &filter);
        found.truncate(MAX_DOOR_POLYS);
        self.polys = found;
    }

    fn sever(&mut self, mesh: &mut NavMesh) {
        for &poly in &self.polys {
            self.undo.extend(mesh.sever_poly_links(poly));
        }
        self.gated = true;
    }

    fn restore(&mut self, mesh: &mut NavMesh) {
        for (owner, link) in self.undo.drain(..) {
            mesh.restore_link(owner, link);
        }
        self.gated = false;
    }

    /// Drops undo entries that point into a previous mesh generation
    fn discard_stale(&mut self, mesh: &NavMesh) {
        self.undo.retain(|(owner, link)| {
            mesh.is_valid_poly_ref(*owner) && mesh.is_valid_poly_ref(link.reference)
        });
    }
}

/// Door table of one engine instance
#[derive(Debug, Clone, Default)]
pub struct DoorTable {
    doors: Vec<Door>,
}

impl DoorTable {
    pub fn from_volumes(volumes: Vec<Volume>) -> Self {
        Self {
            doors: volumes.into_iter().map(Door::from_volume).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.doors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doors.is_empty()
    }

    pub fn door(&self, id: i32) -> Option<&Door> {
        self.doors.iter().find(|d| d.id == id)
    }

    pub fn is_door_exist(&self, id: i32) -> bool {
        self.door(id).is_some()
    }

    pub fn is_door_open(&self, id: i32) -> bool {
        self.door(id).is_some_and(|d| d.open)
    }

    /// Resolves every door against a freshly installed mesh and applies
    /// its logical state
    pub fn attach(&mut self, mesh: &mut NavMesh) {
        for door in &mut self.doors {
            door.undo.clear();
            door.gated = false;
            door.resolve(mesh);
            if !door.open {
                door.sever(mesh);
            }
        }
        log::debug!("Attached {} doors", self.doors.len());
    }

    /// Gives back every removed link, leaving the mesh ungated
    pub fn detach(&mut self, mesh: &mut NavMesh) {
        for door in self.doors.iter_mut().filter(|d| d.gated) {
            door.discard_stale(mesh);
            door.restore(mesh);
        }
    }

    /// Sets a door's state, updating the mesh adjacency
    pub fn open_door(&mut self, mesh: &mut NavMesh, id: i32, open: bool) -> Status {
        let Some(door) = self.doors.iter_mut().find(|d| d.id == id) else {
            log::warn!("Unknown door {id}");
            return Status::failure().with(StatusDetail::INVALID_PARAM);
        };
        if door.open == open {
            return Status::success();
        }
        door.open = open;
        if open && door.gated {
            door.restore(mesh);
        } else if !open && !door.gated {
            door.sever(mesh);
        }
        log::debug!(
            "Door {id} {} ({} polygons)",
            if open { "opened" } else { "closed" },
            door.polys.len()
        );
        Status::success()
    }

    pub fn open_all_doors(&mut self, mesh: &mut NavMesh, open: bool) {
        let ids: Vec<i32> = self.doors.iter().map(|d| d.id).collect();
        for id in ids {
            self.open_door(mesh, id, open);
        }
    }

    /// Removes the adjacency of every door, keeping their logical state
    pub fn close_all_doors_poly(&mut self, mesh: &mut NavMesh) {
        for door in self.doors.iter_mut().filter(|d| !d.gated) {
            door.sever(mesh);
        }
    }

    /// Re-finds door polygons in the current mesh generation
    ///
    /// Undo entries that refer to replaced polygons are dropped, and gated
    /// doors sever the links their rebuilt polygons gained.
    pub fn init_doors_poly(&mut self, mesh: &mut NavMesh) {
        for door in &mut self.doors {
            door.discard_stale(mesh);
            door.resolve(mesh);
            if door.gated {
                door.sever(mesh);
            }
        }
    }

    /// Restores the adjacency of every logically open door
    pub fn recover_all_doors_poly(&mut self, mesh: &mut NavMesh) {
        for door in self.doors.iter_mut().filter(|d| d.open && d.gated) {
            door.restore(mesh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_detour::PolyArea;
    use navi_detour::test_mesh_helpers::TestMeshBuilder;

    /// Room A, door polygon, room B along x
    fn door_mesh() -> NavMesh {
        TestMeshBuilder::new(32.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 5.0, 4.0, PolyArea::Door)
            .rect(5.0, 0.0, 9.0, 4.0, PolyArea::Ground)
            .build()
            .unwrap()
    }

    fn door_volume(id: i32, open: bool) -> Volume {
        Volume {
            id,
            area: PolyArea::Door as i32,
            hmin: -1.0,
            hmax: 1.0,
            open,
            verts: vec![
                [4.2, 0.0, 1.0],
                [4.2, 0.0, 3.0],
                [4.8, 0.0, 3.0],
                [4.8, 0.0, 1.0],
            ],
        }
    }

    fn link_snapshot(mesh: &NavMesh) -> Vec<Vec<Link>> {
        (0..3)
            .map(|i| mesh.links(mesh.poly_ref_at(0, 0, i).unwrap()).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_door_resolves_door_polygons_only() {
        let mut mesh = door_mesh();
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, true)]);
        doors.attach(&mut mesh);
        let door = doors.door(1).unwrap();
        assert_eq!(door.polys(), &[mesh.poly_ref_at(0, 0, 1).unwrap()]);
        assert!(!door.is_gated());
    }

    #[test]
    fn test_close_then_open_restores_links() {
        let mut mesh = door_mesh();
        let before = link_snapshot(&mesh);
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, true)]);
        doors.attach(&mut mesh);

        assert!(doors.open_door(&mut mesh, 1, false).is_success());
        assert!(!doors.is_door_open(1));
        let closed = link_snapshot(&mesh);
        assert!(closed.iter().all(|links| links.is_empty()));

        // Closing twice is a no-op.
        assert!(doors.open_door(&mut mesh, 1, false).is_success());

        assert!(doors.open_door(&mut mesh, 1, true).is_success());
        assert_eq!(link_snapshot(&mesh), before);
    }

    #[test]
    fn test_initially_closed_door() {
        let mut mesh = door_mesh();
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, false)]);
        doors.attach(&mut mesh);
        assert!(doors.door(1).unwrap().is_gated());
        assert!(mesh.links(mesh.poly_ref_at(0, 0, 0).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_door() {
        let mut mesh = door_mesh();
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, true)]);
        let status = doors.open_door(&mut mesh, 2, false);
        assert!(status.is_failure());
        assert!(status.has(StatusDetail::INVALID_PARAM));
        assert!(!doors.is_door_exist(2));
        assert!(!doors.is_door_open(2));
    }

    #[test]
    fn test_close_all_and_recover() {
        let mut mesh = door_mesh();
        let before = link_snapshot(&mesh);
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, true)]);
        doors.attach(&mut mesh);

        doors.close_all_doors_poly(&mut mesh);
        assert!(doors.is_door_open(1));
        assert!(doors.door(1).unwrap().is_gated());

        doors.init_doors_poly(&mut mesh);
        doors.recover_all_doors_poly(&mut mesh);
        assert_eq!(link_snapshot(&mesh), before);
    }

    #[test]
    fn test_toggle_between_close_all_and_recover() {
        let mut mesh = door_mesh();
        let before = link_snapshot(&mesh);
        let mut doors = DoorTable::from_volumes(vec![door_volume(1, true)]);
        doors.attach(&mut mesh);

        doors.close_all_doors_poly(&mut mesh);
        doors.open_door(&mut mesh, 1, false);
        doors.recover_all_doors_poly(&mut mesh);
        assert!(link_snapshot(&mesh).iter().all(|links| links.is_empty()));

        doors.close_all_doors_poly(&mut mesh);
        doors.open_door(&mut mesh, 1, true);
        // Opening applies immediately.
        assert_eq!(link_snapshot(&mesh), before);
        doors.recover_all_doors_poly(&mut mesh);
        assert_eq!(link_snapshot(&mesh), before);
    }
}
