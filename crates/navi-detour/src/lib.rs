//! Tiled polygon navigation mesh with A* search and funnel path smoothing
//!
//! This crate holds the static side of the engine: the mesh store loaded from
//! a binary artifact, the polygon graph search and the string-pulling pass
//! that turns a polygon corridor into waypoints.
//!
//! # Architecture
//!
//! - [`NavMesh`]: tiles, polygons and links, addressed by [`PolyRef`]
//! - [`NavMeshQuery`]: nearest polygon lookup, A* and straight path
//! - [`Status`]: tagged query status convertible to the classic bitmask
//! - [`binary_format`]: reader and writer for the mesh artifact

pub mod binary_format;
pub mod bvh_tree;
pub mod nav_mesh;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod status;
pub mod test_mesh_helpers;

pub use nav_mesh::{Link, MeshTile, NavMesh, Poly, TileHeader};
pub use nav_mesh_query::NavMeshQuery;
pub use status::{Status, StatusDetail, StatusKind};

use bitflags::bitflags;

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of area classes a filter can price
pub const MAX_AREAS: usize = 64;

/// Neighbour code flag marking a portal into an adjacent tile
pub const EXT_LINK: u16 = 0x8000;

/// Neighbour code for an internal portal whose partner is found geometrically
pub const NEI_PORTAL: u16 = 0x3fff;

/// Link side value for links inside a tile
pub const SIDE_INTERNAL: u8 = 0xff;

/// Default capacity of a polygon path
pub const MAX_SEARCH_POLYS: usize = 1024;

/// Default search node budget
pub const DEFAULT_MAX_SEARCH_NODES: usize = 65535;

/// Reference to a polygon in the navigation mesh
///
/// Encodes `salt:32 | tile:16 | poly:16`. Zero is never a valid reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u64);

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a new polygon reference from its raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id
    pub const fn id(&self) -> u64 {
        self.0
    }

    /// Returns true unless this is the null reference
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for PolyRef {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

bitflags! {
    /// Polygon ability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ground walkable
        const WALK = 0x01;
        /// Water swimmable
        const SWIM = 0x02;
        /// Passable door
        const DOOR = 0x04;
        /// Jump link
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
        /// All abilities
        const ALL = 0xffff;
    }
}

/// Area classes used by the mesh artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PolyArea {
    Ground = 0,
    Water = 1,
    Road = 2,
    Door = 3,
    Grass = 4,
    Jump = 5,
}

impl PolyArea {
    /// Flags the mesh generator assigns to polygons of this area
    pub fn default_flags(self) -> PolyFlags {
        match self {
            PolyArea::Ground | PolyArea::Grass | PolyArea::Road => PolyFlags::WALK,
            PolyArea::Water => PolyFlags::SWIM,
            PolyArea::Door => PolyFlags::WALK | PolyFlags::DOOR,
            PolyArea::Jump => PolyFlags::JUMP,
        }
    }
}

/// Navigation mesh parameters
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// Origin of the tile grid
    pub origin: [f32; 3],
    /// Tile extent along x
    pub tile_width: f32,
    /// Tile extent along z
    pub tile_height: f32,
    /// Maximum number of tiles
    pub max_tiles: u32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: u32,
}

/// Polygon filter and traversal cost model
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Flags a polygon needs at least one of
    pub include_flags: PolyFlags,
    /// Flags that exclude a polygon
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area class
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::WALK,
            exclude_flags: PolyFlags::DISABLED,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    /// Creates a filter with the given flags and unit costs
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            area_cost: [1.0; MAX_AREAS],
        }
    }

    /// Returns true if the polygon can be visited
    #[inline]
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across `poly`
    #[inline]
    pub fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], poly: &Poly) -> f32 {
        navi_common::dist(pa, pb) * self.area_cost(poly.area)
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost
            .get(area as usize)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }
}
