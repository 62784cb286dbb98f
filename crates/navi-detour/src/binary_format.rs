//! Binary mesh artifact
//!
//! A mesh set is a header followed by size-prefixed tiles. All values are
//! little-endian. Every reader validates what it reads and reports problems
//! as [`Error::Load`]; a failed load never yields a partially built mesh.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::path::Path;

use super::nav_mesh::{MAX_POLYS_PER_TILE, MeshTile, Poly, TileHeader};
use super::{MAX_VERTS_PER_POLY, NavMesh, NavMeshParams, PolyFlags};
use navi_common::{Error, Result};

/// Magic number for mesh set files ('NAVS')
pub const NAVMESH_SET_MAGIC: u32 =
    (b'N' as u32) << 24 | (b'A' as u32) << 16 | (b'V' as u32) << 8 | b'S' as u32;

/// Current mesh set version
pub const NAVMESH_SET_VERSION: u32 = 1;

/// Magic number for tile data ('NAVT')
pub const NAVMESH_TILE_MAGIC: u32 =
    (b'N' as u32) << 24 | (b'A' as u32) << 16 | (b'V' as u32) << 8 | b'T' as u32;

/// Current tile data version
pub const NAVMESH_TILE_VERSION: u32 = 1;

const TILE_HEADER_SIZE: usize = 4 * 6 + 4 * 3 + 4 * 6;
const VERT_SIZE: usize = 12;
const POLY_SIZE: usize = 2 * MAX_VERTS_PER_POLY * 2 + 2 + 1 + 1;

/// Tile header as stored on disk
#[derive(Debug, Clone)]
struct MeshHeader {
    magic: u32,
    version: u32,
    x: i32,
    y: i32,
    poly_count: u32,
    vert_count: u32,
    walkable_height: f32,
    walkable_radius: f32,
    walkable_climb: f32,
    bmin: [f32; 3],
    bmax: [f32; 3],
}

impl MeshHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            magic: reader.read_u32::<LittleEndian>()?,
            version: reader.read_u32::<LittleEndian>()?,
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            poly_count: reader.read_u32::<LittleEndian>()?,
            vert_count: reader.read_u32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_vec3(reader)?,
            bmax: read_vec3(reader)?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_i32::<LittleEndian>(self.x)?;
        writer.write_i32::<LittleEndian>(self.y)?;
        writer.write_u32::<LittleEndian>(self.poly_count)?;
        writer.write_u32::<LittleEndian>(self.vert_count)?;
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        write_vec3(writer, &self.bmin)?;
        write_vec3(writer, &self.bmax)?;
        Ok(())
    }
}

/// Polygon as stored on disk
#[derive(Debug, Clone)]
struct PolyData {
    verts: [u16; MAX_VERTS_PER_POLY],
    neis: [u16; MAX_VERTS_PER_POLY],
    flags: u16,
    vert_count: u8,
    area: u8,
}

impl PolyData {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut verts = [0u16; MAX_VERTS_PER_POLY];
        for v in &mut verts {
            *v = reader.read_u16::<LittleEndian>()?;
        }
        let mut neis = [0u16; MAX_VERTS_PER_POLY];
        for n in &mut neis {
            *n = reader.read_u16::<LittleEndian>()?;
        }
        Ok(Self {
            verts,
            neis,
            flags: reader.read_u16::<LittleEndian>()?,
            vert_count: reader.read_u8()?,
            area: reader.read_u8()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for &v in &self.verts {
            writer.write_u16::<LittleEndian>(v)?;
        }
        for &n in &self.neis {
            writer.write_u16::<LittleEndian>(n)?;
        }
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u8(self.vert_count)?;
        writer.write_u8(self.area)?;
        Ok(())
    }

    fn to_poly(&self) -> Poly {
        let mut poly = Poly::new(self.area, PolyFlags::from_bits_retain(self.flags));
        poly.verts = self.verts;
        poly.neis = self.neis;
        poly.vert_count = self.vert_count;
        poly
    }

    fn from_poly(poly: &Poly) -> Self {
        Self {
            verts: poly.verts,
            neis: poly.neis,
            flags: poly.flags.bits(),
            vert_count: poly.vert_count,
            area: poly.area,
        }
    }
}

/// Mesh set header as stored on disk
#[derive(Debug, Clone)]
struct NavMeshSetHeader {
    magic: u32,
    version: u32,
    tile_count: u32,
    params: NavMeshParams,
    /// Search node budget hint, 0 when unspecified
    max_search_nodes: u32,
}

impl NavMeshSetHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            magic: reader.read_u32::<LittleEndian>()?,
            version: reader.read_u32::<LittleEndian>()?,
            tile_count: reader.read_u32::<LittleEndian>()?,
            params: NavMeshParams {
                origin: read_vec3(reader)?,
                tile_width: reader.read_f32::<LittleEndian>()?,
                tile_height: reader.read_f32::<LittleEndian>()?,
                max_tiles: reader.read_u32::<LittleEndian>()?,
                max_polys_per_tile: reader.read_u32::<LittleEndian>()?,
            },
            max_search_nodes: reader.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.tile_count)?;
        write_vec3(writer, &self.params.origin)?;
        writer.write_f32::<LittleEndian>(self.params.tile_width)?;
        writer.write_f32::<LittleEndian>(self.params.tile_height)?;
        writer.write_u32::<LittleEndian>(self.params.max_tiles)?;
        writer.write_u32::<LittleEndian>(self.params.max_polys_per_tile)?;
        writer.write_u32::<LittleEndian>(self.max_search_nodes)?;
        Ok(())
    }
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<[f32; 3]> {
    Ok([
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ])
}

fn write_vec3<W: Write>(writer: &mut W, v: &[f32; 3]) -> Result<()> {
    for &c in v {
        writer.write_f32::<LittleEndian>(c)?;
    }
    Ok(())
}

/// Reads one tile, validating its structure
///
/// Links are not stored; they are rebuilt when the tile joins a mesh.
pub fn load_tile_from_binary(data: &[u8]) -> Result<MeshTile> {
    let mut cursor = Cursor::new(data);
    let header = MeshHeader::read_from(&mut cursor).map_err(Error::into_load)?;

    if header.magic != NAVMESH_TILE_MAGIC {
        return Err(Error::Load(format!("wrong tile magic {:#010x}", header.magic)));
    }
    if header.version != NAVMESH_TILE_VERSION {
        return Err(Error::Load(format!("unsupported tile version {}", header.version)));
    }

    let needed = header.vert_count as u64 * VERT_SIZE as u64
        + header.poly_count as u64 * POLY_SIZE as u64;
    let remaining = (data.len() - TILE_HEADER_SIZE) as u64;
    if needed > remaining {
        return Err(Error::Load(format!(
            "tile ({}, {}) is truncated: needs {} bytes, has {}",
            header.x, header.y, needed, remaining
        )));
    }

    let mut verts = Vec::with_capacity(header.vert_count as usize);
    for _ in 0..header.vert_count {
        verts.push(read_vec3(&mut cursor).map_err(Error::into_load)?);
    }
    let mut polys = Vec::with_capacity(header.poly_count as usize);
    for _ in 0..header.poly_count {
        let data = PolyData::read_from(&mut cursor).map_err(Error::into_load)?;
        polys.push(data.to_poly());
    }

    let tile_header = TileHeader {
        x: header.x,
        y: header.y,
        salt: 0,
        walkable_height: header.walkable_height,
        walkable_radius: header.walkable_radius,
        walkable_climb: header.walkable_climb,
        bmin: header.bmin,
        bmax: header.bmax,
    };
    MeshTile::try_new(tile_header, verts, polys, MAX_POLYS_PER_TILE).map_err(Error::into_load)
}

/// Writes one tile without its links
pub fn save_tile_to_binary(tile: &MeshTile) -> Result<Vec<u8>> {
    let header = MeshHeader {
        magic: NAVMESH_TILE_MAGIC,
        version: NAVMESH_TILE_VERSION,
        x: tile.header.x,
        y: tile.header.y,
        poly_count: tile.polys.len() as u32,
        vert_count: tile.verts.len() as u32,
        walkable_height: tile.header.walkable_height,
        walkable_radius: tile.header.walkable_radius,
        walkable_climb: tile.header.walkable_climb,
        bmin: tile.header.bmin,
        bmax: tile.header.bmax,
    };

    let mut buffer = Vec::with_capacity(
        TILE_HEADER_SIZE + tile.verts.len() * VERT_SIZE + tile.polys.len() * POLY_SIZE,
    );
    header.write_to(&mut buffer)?;
    for v in &tile.verts {
        write_vec3(&mut buffer, v)?;
    }
    for poly in &tile.polys {
        PolyData::from_poly(poly).write_to(&mut buffer)?;
    }
    Ok(buffer)
}

/// Writes a mesh set from loose tiles
pub fn save_tiles_to_binary(
    params: &NavMeshParams,
    max_search_nodes: u32,
    tiles: &[MeshTile],
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let header = NavMeshSetHeader {
        magic: NAVMESH_SET_MAGIC,
        version: NAVMESH_SET_VERSION,
        tile_count: tiles.len() as u32,
        params: *params,
        max_search_nodes,
    };
    header.write_to(&mut buffer)?;

    for tile in tiles {
        let tile_data = save_tile_to_binary(tile)?;
        buffer.write_u32::<LittleEndian>(tile_data.len() as u32)?;
        buffer.extend_from_slice(&tile_data);
    }
    Ok(buffer)
}

/// Saves the current tiles of a navigation mesh
pub fn save_nav_mesh_to_binary(nav_mesh: &NavMesh) -> Result<Vec<u8>> {
    let tiles: Vec<MeshTile> = nav_mesh.tiles().map(|(_, tile)| tile.clone()).collect();
    save_tiles_to_binary(
        nav_mesh.params(),
        nav_mesh
            .search_node_hint()
            .map_or(0, |n| n.min(u32::MAX as usize) as u32),
        &tiles,
    )
}

/// Loads a complete navigation mesh from a mesh set
pub fn load_nav_mesh_from_binary(data: &[u8]) -> Result<NavMesh> {
    let mut cursor = Cursor::new(data);
    let header = NavMeshSetHeader::read_from(&mut cursor).map_err(Error::into_load)?;

    if header.magic != NAVMESH_SET_MAGIC {
        return Err(Error::Load(format!("wrong mesh set magic {:#010x}", header.magic)));
    }
    if header.version != NAVMESH_SET_VERSION {
        return Err(Error::Load(format!("unsupported mesh set version {}", header.version)));
    }
    if header.tile_count > header.params.max_tiles {
        return Err(Error::Load(format!(
            "{} tiles exceed the declared capacity of {}",
            header.tile_count, header.params.max_tiles
        )));
    }

    let mut nav_mesh = NavMesh::new(header.params).map_err(Error::into_load)?;
    if header.max_search_nodes > 0 {
        nav_mesh.set_search_node_budget(header.max_search_nodes as usize);
    }

    for i in 0..header.tile_count {
        let tile_size = cursor.read_u32::<LittleEndian>().map_err(|e| Error::from(e).into_load())? as usize;
        let pos = cursor.position() as usize;
        let end = pos
            .checked_add(tile_size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| Error::Load(format!("tile {i} is truncated")))?;

        let tile = load_tile_from_binary(&data[pos..end])?;
        nav_mesh.add_tile(tile).map_err(Error::into_load)?;
        cursor.set_position(end as u64);
    }

    log::debug!(
        "Loaded navigation mesh with {} tiles, node budget {}",
        nav_mesh.tile_count(),
        nav_mesh.search_node_budget()
    );
    Ok(nav_mesh)
}

/// Loads a mesh set from a file
pub fn load_nav_mesh<P: AsRef<Path>>(path: P) -> Result<NavMesh> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .map_err(|e| Error::Load(format!("cannot read {}: {e}", path.display())))?;
    load_nav_mesh_from_binary(&data)
}

/// Saves a navigation mesh to a file
pub fn save_nav_mesh<P: AsRef<Path>>(nav_mesh: &NavMesh, path: P) -> Result<()> {
    let data = save_nav_mesh_to_binary(nav_mesh)?;
    std::fs::write(path, data)?;
    Ok(())
}
