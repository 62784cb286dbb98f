//! Navigation-mesh query engine
//!
//! Loads a precomputed tiled polygon mesh and answers shortest-path queries
//! over it, while the walkable graph changes at runtime through doors that
//! gate polygon adjacency and cylinder obstacles carved into mesh tiles.
//!
//! # Example
//!
//! ```rust,ignore
//! use navi::{Navi, NaviConfig, Vec3};
//!
//! let mut navi = Navi::new(NaviConfig::default())?;
//! navi.load_mesh("level.navmesh")?;
//! navi.load_doors("level.doors")?;
//!
//! navi.open_door(1, true);
//! let status = navi.find_path_default(Vec3::new(54.97, -2.38, 4.96), Vec3::new(49.16, -2.33, 18.97));
//! if status.is_success() {
//!     for waypoint in navi.path() {
//!         println!("{waypoint:?}");
//!     }
//! }
//!
//! // Obstacles rebuild tiles, so door polygons are re-resolved around it.
//! navi.close_all_doors_poly();
//! let obstacle = navi.add_obstacle(Vec3::new(50.0, -2.4, 10.0), 1.0, 2.0);
//! navi.refresh_obstacle();
//! navi.init_doors_poly();
//! navi.recover_all_doors_poly();
//! ```
//!
//! # Architecture
//!
//! - [`Navi`]: one engine instance
//! - [`Registry`]: instances addressed by generational handles
//! - [`DoorTable`]: door gates with per-door undo logs
//! - [`RegionIndex`]: point to region classification
//! - [`NaviConfig`]: construction parameters

pub mod config;
pub mod doors;
pub mod navi;
pub mod registry;
pub mod volumes;


pub use config::NaviConfig;
pub use doors::{Door, DoorTable};
pub use navi::Navi;
pub use registry::{NaviHandle, Registry};
pub use volumes::{RegionIndex, Volume};

pub use navi_common::{Error, Result, Vec3};
pub use navi_detour::{Status, StatusDetail};
pub use navi_tilecache::ObstacleRef;
