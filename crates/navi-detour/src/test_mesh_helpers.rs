//! Test mesh creation helpers
//!
//! Builds small tiled meshes out of axis-aligned rectangles, the way a mesh
//! generator would emit them: every rectangle becomes one quad in the tile
//! containing its centre, shared vertices are welded, edges on the tile
//! border become external portals and all other edges are matched
//! geometrically when the tile is linked.

use std::collections::{BTreeMap, HashMap};

use super::binary_format::save_tiles_to_binary;
use super::nav_mesh::{MeshTile, Poly, TileHeader};
use super::{EXT_LINK, NEI_PORTAL, NavMesh, NavMeshParams, PolyArea};
use navi_common::{Error, Result, bounds_of};

const BORDER_EPS: f32 = 1e-4;

#[derive(Debug, Clone, Copy)]
struct Rect {
    x0: f32,
    z0: f32,
    x1: f32,
    z1: f32,
    y: f32,
    area: PolyArea,
}

/// Builder for rectangle meshes on a square tile grid
#[derive(Debug, Clone)]
pub struct TestMeshBuilder {
    tile_size: f32,
    origin: [f32; 3],
    max_search_nodes: u32,
    rects: Vec<Rect>,
}

impl TestMeshBuilder {
    pub fn new(tile_size: f32) -> Self {
        Self {
            tile_size,
            origin: [0.0; 3],
            max_search_nodes: 0,
            rects: Vec::new(),
        }
    }

    pub fn with_origin(mut self, origin: [f32; 3]) -> Self {
        self.origin = origin;
        self
    }

    /// Node budget hint written into the artifact
    pub fn with_max_search_nodes(mut self, max_search_nodes: u32) -> Self {
        self.max_search_nodes = max_search_nodes;
        self
    }

    /// Adds a floor rectangle at height 0
    pub fn rect(self, x0: f32, z0: f32, x1: f32, z1: f32, area: PolyArea) -> Self {
        self.rect_at_height(x0, z0, x1, z1, 0.0, area)
    }

    pub fn rect_at_height(
        mut self,
        x0: f32,
        z0: f32,
        x1: f32,
        z1: f32,
        y: f32,
        area: PolyArea,
    ) -> Self {
        self.rects.push(Rect {
            x0: x0.min(x1),
            z0: z0.min(z1),
            x1: x0.max(x1),
            z1: z0.max(z1),
            y,
            area,
        });
        self
    }

    pub fn params(&self) -> NavMeshParams {
        NavMeshParams {
            origin: self.origin,
            tile_width: self.tile_size,
            tile_height: self.tile_size,
            max_tiles: 256,
            max_polys_per_tile: 1024,
        }
    }

    /// Builds the tiles, ordered by tile coordinates
    pub fn build_tiles(&self) -> Result<Vec<MeshTile>> {
        let mut by_tile: BTreeMap<(i32, i32), Vec<Rect>> = BTreeMap::new();
        for rect in &self.rects {
            let cx = (rect.x0 + rect.x1) * 0.5;
            let cz = (rect.z0 + rect.z1) * 0.5;
            let tx = ((cx - self.origin[0]) / self.tile_size).floor() as i32;
            let ty = ((cz - self.origin[2]) / self.tile_size).floor() as i32;
            let (min_x, min_z, max_x, max_z) = self.tile_rect(tx, ty);
            if rect.x0 < min_x - BORDER_EPS
                || rect.x1 > max_x + BORDER_EPS
                || rect.z0 < min_z - BORDER_EPS
                || rect.z1 > max_z + BORDER_EPS
            {
                return Err(Error::InvalidMesh(format!(
                    "rectangle ({}, {})-({}, {}) spans more than one tile",
                    rect.x0, rect.z0, rect.x1, rect.z1
                )));
            }
            by_tile.entry((tx, ty)).or_default().push(*rect);
        }

        by_tile
            .into_iter()
            .map(|((tx, ty), rects)| self.build_tile(tx, ty, &rects))
            .collect()
    }

    fn tile_rect(&self, tx: i32, ty: i32) -> (f32, f32, f32, f32) {
        let min_x = self.origin[0] + tx as f32 * self.tile_size;
        let min_z = self.origin[2] + ty as f32 * self.tile_size;
        (min_x, min_z, min_x + self.tile_size, min_z + self.tile_size)
    }

    fn build_tile(&self, tx: i32, ty: i32, rects: &[Rect]) -> Result<MeshTile> {
        let (min_x, min_z, max_x, max_z) = self.tile_rect(tx, ty);
        let on = |a: f32, b: f32| (a - b).abs() <= BORDER_EPS;

        let mut verts: Vec<[f32; 3]> = Vec::new();
        let mut weld: HashMap<[u32; 3], u16> = HashMap::new();
        let mut polys = Vec::with_capacity(rects.len());

        for rect in rects {
            let corners = [
                [rect.x0, rect.y, rect.z0],
                [rect.x0, rect.y, rect.z1],
                [rect.x1, rect.y, rect.z1],
                [rect.x1, rect.y, rect.z0],
            ];
            let borders = [
                on(rect.x0, min_x).then_some(4u16),
                on(rect.z1, max_z).then_some(2u16),
                on(rect.x1, max_x).then_some(0u16),
                on(rect.z0, min_z).then_some(6u16),
            ];

            let mut poly = Poly::new(rect.area as u8, rect.area.default_flags());
            poly.vert_count = 4;
            for (i, corner) in corners.iter().enumerate() {
                let key = corner.map(f32::to_bits);
                let idx = match weld.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        let idx = u16::try_from(verts.len())
                            .map_err(|_| Error::InvalidMesh("too many vertices".to_string()))?;
                        verts.push(*corner);
                        weld.insert(key, idx);
                        idx
                    }
                };
                poly.verts[i] = idx;
                poly.neis[i] = match borders[i] {
                    Some(side) => EXT_LINK | side,
                    None => NEI_PORTAL,
                };
            }
            polys.push(poly);
        }

        let mut header = TileHeader::new(tx, ty);
        let (bmin, bmax) = bounds_of(&verts);
        header.bmin = bmin;
        header.bmax = bmax;
        Ok(MeshTile::new(header, verts, polys))
    }

    /// Builds and links a complete mesh
    pub fn build(&self) -> Result<NavMesh> {
        let mut mesh = NavMesh::new(self.params())?;
        if self.max_search_nodes > 0 {
            mesh.set_search_node_budget(self.max_search_nodes as usize);
        }
        for tile in self.build_tiles()? {
            mesh.add_tile(tile)?;
        }
        Ok(mesh)
    }

    /// Serialises the mesh into the binary artifact format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tiles = self.build_tiles()?;
        save_tiles_to_binary(&self.params(), self.max_search_nodes, &tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rects_share_welded_vertices() -> Result<()> {
        let tiles = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 8.0, 4.0, PolyArea::Ground)
            .build_tiles()?;
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].verts.len(), 6);
        assert_eq!(tiles[0].polys.len(), 2);
        // Outer edges at x = 0 and z = 0 lie on the tile border.
        assert_eq!(tiles[0].polys[0].neis[0], EXT_LINK | 4);
        assert_eq!(tiles[0].polys[0].neis[3], EXT_LINK | 6);
        assert_eq!(tiles[0].polys[0].neis[2], NEI_PORTAL);
        Ok(())
    }

    #[test]
    fn test_rects_are_placed_by_centre() -> Result<()> {
        let tiles = TestMeshBuilder::new(10.0)
            .with_origin([-10.0, 0.0, 0.0])
            .rect(-5.0, 0.0, 0.0, 5.0, PolyArea::Ground)
            .rect(0.0, 12.0, 5.0, 18.0, PolyArea::Ground)
            .build_tiles()?;
        let coords: Vec<(i32, i32)> = tiles.iter().map(|t| (t.header.x, t.header.y)).collect();
        assert_eq!(coords, vec![(0, 0), (1, 1)]);
        Ok(())
    }

    #[test]
    fn test_spanning_rect_rejected() {
        let result = TestMeshBuilder::new(10.0)
            .rect(5.0, 0.0, 15.0, 5.0, PolyArea::Ground)
            .build_tiles();
        assert!(matches!(result, Err(Error::InvalidMesh(_))));
    }

    #[test]
    fn test_built_mesh_is_linked() -> Result<()> {
        let mesh = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 8.0, 4.0, PolyArea::Door)
            .build()?;
        let a = mesh.poly_ref_at(0, 0, 0).unwrap();
        let door = mesh.poly_ref_at(0, 0, 1).unwrap();
        assert_eq!(mesh.links(a)?.len(), 1);
        assert_eq!(mesh.links(a)?[0].reference, door);
        assert!(mesh.get_poly_flags(door)?.contains(crate::PolyFlags::DOOR));
        Ok(())
    }
}
