//! Common error type and geometry helpers shared by the navi crates

mod geometry;

pub use geometry::*;

/// Position type of the public engine API
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("invalid instance handle: {0:#x}")]
    InvalidHandle(u64),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("detour error: {0}")]
    Detour(String),

    #[error("tile cache error: {0}")]
    TileCache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Re-labels any error as a load failure, keeping its message.
    pub fn into_load(self) -> Self {
        match self {
            Error::Load(_) => self,
            other => Error::Load(other.to_string()),
        }
    }
}

/// Result type for navi operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_load_wraps_message() {
        let err = Error::InvalidMesh("bad vertex".to_string()).into_load();
        match err {
            Error::Load(msg) => assert!(msg.contains("bad vertex")),
            other => panic!("unexpected error {other:?}"),
        }

        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err = Error::from(io).into_load();
        assert!(matches!(err, Error::Load(_)));
    }
}
