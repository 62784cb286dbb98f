use std::path::Path;

use navi_common::{Error, Result};
use navi_detour::{DEFAULT_MAX_SEARCH_NODES, MAX_SEARCH_POLYS};
use serde::{Deserialize, Serialize};

/// Construction parameters of a [`Navi`](crate::Navi) instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NaviConfig {
    /// Polygon path capacity per search
    pub max_polys: usize,
    /// Obstacle pool size
    pub max_obstacles: usize,
    /// Obstacle request queue capacity
    pub max_obstacle_requests: usize,
    /// Search extents used when a query gives none
    pub default_extents: [f32; 3],
    /// Node budget when the mesh artifact carries no hint
    pub max_search_nodes: usize,
    /// Sides of the polygon approximating an obstacle cylinder
    pub obstacle_segments: usize,
    /// Report paths that stop short of the goal as successful
    pub accept_partial_paths: bool,
}

impl NaviConfig {
    pub fn new() -> Self {
        NaviConfig {
            max_polys: MAX_SEARCH_POLYS,
            max_obstacles: 128,
            max_obstacle_requests: 64,
            default_extents: [2.0, 4.0, 2.0],
            max_search_nodes: DEFAULT_MAX_SEARCH_NODES,
            obstacle_segments: 12,
            accept_partial_paths: false,
        }
    }

    pub fn with_max_polys(mut self, max_polys: usize) -> Self {
        self.max_polys = max_polys;
        self
    }

    pub fn with_max_obstacles(mut self, max_obstacles: usize) -> Self {
        self.max_obstacles = max_obstacles;
        self
    }

    pub fn with_max_obstacle_requests(mut self, max_obstacle_requests: usize) -> Self {
        self.max_obstacle_requests = max_obstacle_requests;
        self
    }

    pub fn with_default_extents(mut self, default_extents: [f32; 3]) -> Self {
        self.default_extents = default_extents;
        self
    }

    pub fn with_max_search_nodes(mut self, max_search_nodes: usize) -> Self {
        self.max_search_nodes = max_search_nodes;
        self
    }

    pub fn with_obstacle_segments(mut self, obstacle_segments: usize) -> Self {
        self.obstacle_segments = obstacle_segments;
        self
    }

    pub fn with_accept_partial_paths(mut self, accept_partial_paths: bool) -> Self {
        self.accept_partial_paths = accept_partial_paths;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_polys == 0 {
            return Err(Error::Load("max_polys must be positive".to_string()));
        }
        if self.max_obstacles == 0 || self.max_obstacles > 0xffff {
            return Err(Error::Load(format!(
                "max_obstacles must be in 1..=65535, got {}",
                self.max_obstacles
            )));
        }
        if self.max_obstacle_requests == 0 {
            return Err(Error::Load("max_obstacle_requests must be positive".to_string()));
        }
        if self
            .default_extents
            .iter()
            .any(|e| !(e.is_finite() && *e > 0.0))
        {
            return Err(Error::Load(format!(
                "default extents must be positive, got {:?}",
                self.default_extents
            )));
        }
        if self.max_search_nodes == 0 {
            return Err(Error::Load("max_search_nodes must be positive".to_string()));
        }
        if self.obstacle_segments < 3 {
            return Err(Error::Load(format!(
                "obstacle_segments must be at least 3, got {}",
                self.obstacle_segments
            )));
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NaviConfig = serde_json::from_str(json)
            .map_err(|e| Error::Load(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Load(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&json)
    }
}

impl Default for NaviConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NaviConfig::default();
        assert_eq!(config.max_polys, 1024);
        assert_eq!(config.max_obstacles, 128);
        assert_eq!(config.max_obstacle_requests, 64);
        assert_eq!(config.default_extents, [2.0, 4.0, 2.0]);
        assert_eq!(config.max_search_nodes, 65535);
        assert_eq!(config.obstacle_segments, 12);
        assert!(!config.accept_partial_paths);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NaviConfig::from_json_str(r#"{ "max_obstacles": 16, "accept_partial_paths": true }"#)
            .unwrap();
        assert_eq!(config.max_obstacles, 16);
        assert!(config.accept_partial_paths);
        assert_eq!(config.max_obstacle_requests, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(NaviConfig::new().with_max_polys(0).validate().is_err());
        assert!(NaviConfig::new().with_max_obstacle_requests(0).validate().is_err());
        assert!(NaviConfig::new().with_obstacle_segments(2).validate().is_err());
        assert!(NaviConfig::new()
            .with_default_extents([2.0, 0.0, 2.0])
            .validate()
            .is_err());
        assert!(matches!(
            NaviConfig::from_json_str(r#"{ "max_obstacles": 0 }"#),
            Err(Error::Load(_))
        ));
        assert!(NaviConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let config = NaviConfig::new().with_max_search_nodes(2048).with_obstacle_segments(8);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = NaviConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(NaviConfig::from_json_file(file.path().with_extension("missing")).is_err());
    }
}
