//! Dynamic cylinder obstacles for tiled navigation meshes
//!
//! Each tile of a loaded mesh is kept as compressed pristine data. Obstacle
//! additions and removals are queued and applied in one pass; every tile an
//! obstacle touches is rebuilt from its pristine data with all active
//! obstacle footprints carved out, then swapped back into the mesh.
//!
//! # Example
//!
//! ```rust,ignore
//! use navi_tilecache::{TileCache, TileCacheParams};
//!
//! let mut cache = TileCache::new(TileCacheParams::default())?;
//! cache.init_from_nav_mesh(&nav_mesh)?;
//!
//! let obstacle = cache.add_obstacle([10.0, 0.0, 10.0], 2.0, 4.0)?;
//! cache.update(&mut nav_mesh)?;
//!
//! cache.remove_obstacle(obstacle)?;
//! cache.update(&mut nav_mesh)?;
//! ```
//!
//! # Architecture
//!
//! - [`TileCache`]: obstacle pool, request queue and tile rebuilds
//! - [`TileCacheBuilder`]: carves obstacle footprints out of a tile
//! - [`CompressedTile`]: LZ4-compressed pristine tile

pub mod tile_cache;
pub mod tile_cache_builder;
pub mod tile_cache_data;

pub use tile_cache::{Obstacle, ObstacleRef, ObstacleState, TileCache, TileCacheParams};
pub use tile_cache_builder::{ObstacleShape, TileCacheBuilder, carve_tile};
pub use tile_cache_data::CompressedTile;
