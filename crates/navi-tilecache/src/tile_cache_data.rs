//! Compressed pristine tiles
//!
//! Tiles are kept as LZ4-compressed blobs of the binary tile format so that
//! every rebuild can start again from the unmodified mesh.

use navi_common::{Error, Result};
use navi_detour::binary_format::{load_tile_from_binary, save_tile_to_binary};
use navi_detour::nav_mesh::MeshTile;

/// A tile as loaded from the mesh artifact, compressed
#[derive(Debug, Clone)]
pub struct CompressedTile {
    /// Tile x coordinate in the grid
    pub x: i32,
    /// Tile y coordinate in the grid
    pub y: i32,
    /// Bounds of the uncompressed tile
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    data: Vec<u8>,
}

impl CompressedTile {
    /// Serialises and compresses a tile
    pub fn from_tile(tile: &MeshTile) -> Result<Self> {
        let raw = save_tile_to_binary(tile)?;
        Ok(Self {
            x: tile.header.x,
            y: tile.header.y,
            bmin: tile.header.bmin,
            bmax: tile.header.bmax,
            data: lz4_flex::compress_prepend_size(&raw),
        })
    }

    /// Decompresses and parses the tile
    pub fn decompress(&self) -> Result<MeshTile> {
        let raw = lz4_flex::decompress_size_prepended(&self.data).map_err(|e| {
            log::error!("LZ4 decompression of tile ({}, {}) failed: {e:?}", self.x, self.y);
            Error::TileCache(format!("tile ({}, {}) data is corrupt", self.x, self.y))
        })?;
        load_tile_from_binary(&raw)
    }

    /// Size of the compressed blob
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_detour::PolyArea;
    use navi_detour::test_mesh_helpers::TestMeshBuilder;

    #[test]
    fn test_compressed_tile_restores_polygons() {
        let tile = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 8.0, 4.0, PolyArea::Road)
            .build_tiles()
            .unwrap()
            .remove(0);
        let compressed = CompressedTile::from_tile(&tile).unwrap();
        assert!(compressed.compressed_size() > 0);

        let restored = compressed.decompress().unwrap();
        assert_eq!(restored.verts, tile.verts);
        assert_eq!(restored.polys.len(), 2);
        assert_eq!(restored.polys[1].area, PolyArea::Road as u8);
        assert_eq!((restored.header.x, restored.header.y), (0, 0));
    }

    #[test]
    fn test_corrupt_data_is_an_error() {
        let tile = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .build_tiles()
            .unwrap()
            .remove(0);
        let mut compressed = CompressedTile::from_tile(&tile).unwrap();
        compressed.data.truncate(6);
        assert!(compressed.decompress().is_err());
    }
}
