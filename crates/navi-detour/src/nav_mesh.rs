//! Navigation mesh implementation
//!
//! The navigation mesh is an arena of tiles addressed by grid coordinates.
//! Each tile owns its vertices and convex polygons, and each polygon owns the
//! links to its neighbours. Polygons are addressed by [`PolyRef`]s that carry
//! the tile salt, so replacing a tile invalidates every reference into it.

use std::collections::HashMap;

use super::bvh_tree::{Aabb, BVHItem, BVHTree};
use super::{
    EXT_LINK, MAX_AREAS, MAX_VERTS_PER_POLY, NEI_PORTAL, NavMeshParams, PolyFlags, PolyRef,
    QueryFilter, SIDE_INTERNAL, Status, StatusDetail,
};
use navi_common::{
    Error, Result, bounds_of, closest_height_on_triangle, dist_point_segment_sqr_2d, lerp3,
    point_in_polygon_2d, poly_area_2d, tri_area_2d,
};

/// Number of bits for polygon id
const POLY_BITS: u32 = 16;
/// Number of bits for tile id
const TILE_BITS: u32 = 16;

const POLY_MASK: u64 = (1 << POLY_BITS) - 1;
const TILE_MASK: u64 = (1 << TILE_BITS) - 1;
const SALT_MASK: u64 = 0xffff_ffff;

/// Largest polygon count a tile may declare
pub const MAX_POLYS_PER_TILE: u32 = (NEI_PORTAL - 1) as u32;

/// Distance tolerance when matching portal edges
const LINK_EPS: f32 = 0.01;

/// Creates a PolyRef from salt, tile and polygon ids
///
/// Tile ids are 1-based so that no valid reference is zero.
#[inline]
pub fn encode_poly_ref(salt: u32, tile_id: u32, poly_id: u32) -> PolyRef {
    PolyRef::new(
        ((salt as u64 & SALT_MASK) << (POLY_BITS + TILE_BITS))
            | ((tile_id as u64 & TILE_MASK) << POLY_BITS)
            | (poly_id as u64 & POLY_MASK),
    )
}

/// Decodes a PolyRef into salt, tile and polygon ids
#[inline]
pub fn decode_poly_ref(reference: PolyRef) -> (u32, u32, u32) {
    let id = reference.id();
    let salt = ((id >> (POLY_BITS + TILE_BITS)) & SALT_MASK) as u32;
    let tile_id = ((id >> POLY_BITS) & TILE_MASK) as u32;
    let poly_id = (id & POLY_MASK) as u32;
    (salt, tile_id, poly_id)
}

/// Grid offset of the neighbouring tile on `side`
#[inline]
pub fn neighbour_offset(side: u8) -> (i32, i32) {
    match side & 7 {
        0 => (1, 0),
        1 => (1, 1),
        2 => (0, 1),
        3 => (-1, 1),
        4 => (-1, 0),
        5 => (-1, -1),
        6 => (0, -1),
        _ => (1, -1),
    }
}

#[inline]
pub fn opposite_side(side: u8) -> u8 {
    (side + 4) & 7
}

/// Link between two polygons
///
/// `tmin..tmax` is the part of the owning edge shared with the neighbour.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Edge of the owning polygon
    pub edge: u8,
    /// Tile side for external links, [`SIDE_INTERNAL`] otherwise
    pub side: u8,
    pub tmin: f32,
    pub tmax: f32,
}

impl Link {
    fn sorts_before(&self, other: &Link) -> bool {
        (self.edge, self.tmin, self.reference) < (other.edge, other.tmin, other.reference)
    }
}

/// Navigation polygon
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// Vertex indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Neighbour code per edge: 0 wall, index + 1, [`NEI_PORTAL`] or `EXT_LINK | side`
    pub neis: [u16; MAX_VERTS_PER_POLY],
    /// Ability flags
    pub flags: PolyFlags,
    /// Number of vertices in use
    pub vert_count: u8,
    /// Area class
    pub area: u8,
    /// Links ordered by edge then position along the edge
    pub links: Vec<Link>,
}

impl Poly {
    /// Creates an empty polygon
    pub fn new(area: u8, flags: PolyFlags) -> Self {
        Self {
            verts: [0; MAX_VERTS_PER_POLY],
            neis: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            links: Vec::new(),
        }
    }

    #[inline]
    pub fn vert_count(&self) -> usize {
        self.vert_count as usize
    }

    /// Inserts a link keeping the canonical order
    pub fn insert_link(&mut self, link: Link) {
        let pos = self
            .links
            .iter()
            .position(|l| link.sorts_before(l))
            .unwrap_or(self.links.len());
        self.links.insert(pos, link);
    }
}

/// Tile header
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    /// Tile x coordinate in the grid
    pub x: i32,
    /// Tile y coordinate in the grid (along world z)
    pub y: i32,
    /// Salt assigned when the tile was installed
    pub salt: u32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    /// Largest height step between linked edges
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
}

impl TileHeader {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            salt: 0,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
        }
    }
}

/// One tile of the navigation mesh
#[derive(Debug, Clone)]
pub struct MeshTile {
    pub header: TileHeader,
    pub verts: Vec<[f32; 3]>,
    pub polys: Vec<Poly>,
    bvh: BVHTree,
}

impl MeshTile {
    /// Creates a tile and builds its spatial index
    pub fn new(header: TileHeader, verts: Vec<[f32; 3]>, polys: Vec<Poly>) -> Self {
        let mut tile = Self {
            header,
            verts,
            polys,
            bvh: BVHTree::default(),
        };
        tile.rebuild_bvh();
        tile
    }

    /// Creates a tile from untrusted data, validating before indexing
    pub fn try_new(
        header: TileHeader,
        verts: Vec<[f32; 3]>,
        polys: Vec<Poly>,
        max_polys: u32,
    ) -> Result<Self> {
        let mut tile = Self {
            header,
            verts,
            polys,
            bvh: BVHTree::default(),
        };
        tile.validate(max_polys)?;
        tile.rebuild_bvh();
        Ok(tile)
    }

    fn rebuild_bvh(&mut self) {
        let items = (0..self.polys.len())
            .map(|i| BVHItem {
                poly: i,
                bounds: self.poly_bounds(&self.polys[i]),
            })
            .collect();
        self.bvh = BVHTree::build(items);
    }

    /// Checks indices, counts and winding of every polygon
    pub fn validate(&self, max_polys: u32) -> Result<()> {
        if self.polys.len() > max_polys as usize {
            return Err(Error::InvalidMesh(format!(
                "tile ({}, {}) has {} polygons, capacity is {}",
                self.header.x,
                self.header.y,
                self.polys.len(),
                max_polys
            )));
        }
        if self.verts.len() > u16::MAX as usize {
            return Err(Error::InvalidMesh(format!(
                "tile ({}, {}) has too many vertices",
                self.header.x, self.header.y
            )));
        }
        if self.verts.iter().flatten().any(|c| !c.is_finite()) {
            return Err(Error::InvalidMesh("non-finite vertex".to_string()));
        }

        for (i, poly) in self.polys.iter().enumerate() {
            let nv = poly.vert_count();
            if !(3..=MAX_VERTS_PER_POLY).contains(&nv) {
                return Err(Error::InvalidMesh(format!("polygon {i} has {nv} vertices")));
            }
            if poly.area as usize >= MAX_AREAS {
                return Err(Error::InvalidMesh(format!("polygon {i} has area {}", poly.area)));
            }
            for e in 0..nv {
                if poly.verts[e] as usize >= self.verts.len() {
                    return Err(Error::InvalidMesh(format!(
                        "polygon {i} references vertex {}",
                        poly.verts[e]
                    )));
                }
                let nei = poly.neis[e];
                let ok = nei == 0
                    || nei == NEI_PORTAL
                    || (nei & EXT_LINK != 0 && (nei & 0xff) < 8)
                    || ((nei as usize) <= self.polys.len() && nei & EXT_LINK == 0);
                if !ok {
                    return Err(Error::InvalidMesh(format!(
                        "polygon {i} edge {e} has neighbour code {nei:#x}"
                    )));
                }
            }
            if poly_area_2d(&self.poly_verts(poly)) <= 0.0 {
                return Err(Error::InvalidMesh(format!(
                    "polygon {i} is degenerate or wound the wrong way"
                )));
            }
        }
        Ok(())
    }

    /// Vertex positions of a polygon
    pub fn poly_verts(&self, poly: &Poly) -> Vec<[f32; 3]> {
        poly.verts[..poly.vert_count()]
            .iter()
            .map(|&v| self.verts[v as usize])
            .collect()
    }

    /// End points of edge `e`
    #[inline]
    pub fn edge(&self, poly: &Poly, e: usize) -> ([f32; 3], [f32; 3]) {
        let nv = poly.vert_count();
        (
            self.verts[poly.verts[e] as usize],
            self.verts[poly.verts[(e + 1) % nv] as usize],
        )
    }

    pub fn poly_bounds(&self, poly: &Poly) -> Aabb {
        let (min, max) = bounds_of(&self.poly_verts(poly));
        Aabb::new(min, max)
    }

    /// Indices of polygons whose bounds overlap the box
    pub fn query_polys(&self, bounds: &Aabb, out: &mut Vec<usize>) {
        self.bvh.query_into(bounds, out);
    }
}

/// Returns the shared sub-range `tmin..tmax` of edge `a` when edge `b`
/// lies on it in the opposite direction.
fn edge_overlap(
    a0: &[f32; 3],
    a1: &[f32; 3],
    b0: &[f32; 3],
    b1: &[f32; 3],
    climb: f32,
) -> Option<(f32, f32)> {
    let ax = a1[0] - a0[0];
    let az = a1[2] - a0[2];
    let len_sqr = ax * ax + az * az;
    if len_sqr < LINK_EPS * LINK_EPS {
        return None;
    }
    let len = len_sqr.sqrt();
    if tri_area_2d(a0, a1, b0).abs() / len > LINK_EPS || tri_area_2d(a0, a1, b1).abs() / len > LINK_EPS
    {
        return None;
    }

    let bx = b1[0] - b0[0];
    let bz = b1[2] - b0[2];
    if ax * bx + az * bz >= 0.0 {
        return None;
    }

    let t0 = ((b0[0] - a0[0]) * ax + (b0[2] - a0[2]) * az) / len_sqr;
    let t1 = ((b1[0] - a0[0]) * ax + (b1[2] - a0[2]) * az) / len_sqr;
    let mut tmin = t0.min(t1).max(0.0);
    let mut tmax = t0.max(t1).min(1.0);
    if (tmax - tmin) * len <= LINK_EPS {
        return None;
    }

    let b_len_sqr = bx * bx + bz * bz;
    for t in [tmin, tmax] {
        let pa = lerp3(a0, a1, t);
        let s = (((pa[0] - b0[0]) * bx + (pa[2] - b0[2]) * bz) / b_len_sqr).clamp(0.0, 1.0);
        let pb = lerp3(b0, b1, s);
        if (pa[1] - pb[1]).abs() > climb {
            return None;
        }
    }

    let snap = LINK_EPS / len;
    if tmin < snap {
        tmin = 0.0;
    }
    if tmax > 1.0 - snap {
        tmax = 1.0;
    }
    Some((tmin, tmax))
}

fn edge_query_bounds(a0: &[f32; 3], a1: &[f32; 3], climb: f32) -> Aabb {
    let pad = [LINK_EPS, climb + LINK_EPS, LINK_EPS];
    let mut min = [0.0; 3];
    let mut max = [0.0; 3];
    for k in 0..3 {
        min[k] = a0[k].min(a1[k]) - pad[k];
        max[k] = a0[k].max(a1[k]) + pad[k];
    }
    Aabb::new(min, max)
}

/// Navigation mesh
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<Option<MeshTile>>,
    /// Salt per tile slot, survives tile removal
    salts: Vec<u32>,
    pos_lookup: HashMap<(i32, i32), usize>,
    max_search_nodes: Option<usize>,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if params.origin.iter().any(|c| !c.is_finite()) {
            return Err(Error::Detour(Status::failure().with(StatusDetail::INVALID_PARAM).to_string()));
        }
        if !(params.tile_width.is_finite() && params.tile_width > 0.0)
            || !(params.tile_height.is_finite() && params.tile_height > 0.0)
        {
            return Err(Error::Detour(Status::failure().with(StatusDetail::INVALID_PARAM).to_string()));
        }
        if params.max_tiles == 0 || params.max_tiles as u64 > TILE_MASK {
            return Err(Error::Detour(Status::failure().with(StatusDetail::INVALID_PARAM).to_string()));
        }
        if params.max_polys_per_tile == 0 || params.max_polys_per_tile > MAX_POLYS_PER_TILE {
            return Err(Error::Detour(Status::failure().with(StatusDetail::INVALID_PARAM).to_string()));
        }

        let max_tiles = params.max_tiles as usize;
        Ok(Self {
            params,
            tiles: (0..max_tiles).map(|_| None).collect(),
            salts: vec![1; max_tiles],
            pos_lookup: HashMap::new(),
            max_search_nodes: None,
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Node budget for searches over this mesh
    pub fn search_node_budget(&self) -> usize {
        self.max_search_nodes
            .unwrap_or(super::DEFAULT_MAX_SEARCH_NODES)
    }

    /// Node budget hint carried by the mesh artifact, if any
    pub fn search_node_hint(&self) -> Option<usize> {
        self.max_search_nodes
    }

    pub fn set_search_node_budget(&mut self, max_search_nodes: usize) {
        self.max_search_nodes = (max_search_nodes > 0).then_some(max_search_nodes);
    }

    /// Tile grid location containing a world position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    pub fn tile_count(&self) -> usize {
        self.pos_lookup.len()
    }

    /// Iterates installed tiles as `(tile_id, tile)` in slot order
    pub fn tiles(&self) -> impl Iterator<Item = (u32, &MeshTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter_map(|(slot, tile)| tile.as_ref().map(|t| (slot as u32 + 1, t)))
    }

    pub fn tile_at(&self, x: i32, y: i32) -> Option<&MeshTile> {
        self.pos_lookup
            .get(&(x, y))
            .and_then(|&slot| self.tiles[slot].as_ref())
    }

    /// Reference of polygon `poly_idx` in the tile at `(x, y)`
    pub fn poly_ref_at(&self, x: i32, y: i32, poly_idx: usize) -> Option<PolyRef> {
        let slot = *self.pos_lookup.get(&(x, y))?;
        let tile = self.tiles[slot].as_ref()?;
        (poly_idx < tile.polys.len())
            .then(|| encode_poly_ref(tile.header.salt, slot as u32 + 1, poly_idx as u32))
    }

    /// Adds a tile to a free slot and links it to its neighbours
    pub fn add_tile(&mut self, tile: MeshTile) -> Result<u32> {
        if self.pos_lookup.contains_key(&(tile.header.x, tile.header.y)) {
            return Err(Error::Detour(
                Status::failure().with(StatusDetail::ALREADY_OCCUPIED).to_string(),
            ));
        }
        tile.validate(self.params.max_polys_per_tile)?;

        let slot = self
            .tiles
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::Capacity(format!("all {} tile slots in use", self.params.max_tiles)))?;
        self.install(slot, tile);
        Ok(slot as u32 + 1)
    }

    /// Removes the tile at `(x, y)`, unlinking it from its neighbours
    pub fn remove_tile(&mut self, x: i32, y: i32) -> Result<MeshTile> {
        let slot = self
            .pos_lookup
            .remove(&(x, y))
            .ok_or_else(|| Error::Detour(format!("no tile at ({x}, {y})")))?;

        for side in 0..8u8 {
            if let Some(nei_slot) = self.neighbour_slot(x, y, side) {
                self.unconnect_links(nei_slot, slot as u32 + 1);
            }
        }

        let tile = self.tiles[slot]
            .take()
            .ok_or_else(|| Error::Detour(format!("tile slot {slot} is empty")))?;

        // Zero is reserved so that no reference ever encodes to PolyRef::NULL.
        let salt = &mut self.salts[slot];
        *salt = salt.wrapping_add(1).max(1);
        Ok(tile)
    }

    /// Replaces the tile at the new tile's coordinates, keeping its slot
    ///
    /// Every reference into the old tile becomes stale.
    pub fn replace_tile(&mut self, tile: MeshTile) -> Result<u32> {
        let (x, y) = (tile.header.x, tile.header.y);
        let Some(&slot) = self.pos_lookup.get(&(x, y)) else {
            return self.add_tile(tile);
        };
        tile.validate(self.params.max_polys_per_tile)?;
        self.remove_tile(x, y)?;
        self.install(slot, tile);
        Ok(slot as u32 + 1)
    }

    fn install(&mut self, slot: usize, mut tile: MeshTile) {
        tile.header.salt = self.salts[slot];
        for poly in &mut tile.polys {
            poly.links.clear();
        }
        let (x, y) = (tile.header.x, tile.header.y);
        self.tiles[slot] = Some(tile);
        self.pos_lookup.insert((x, y), slot);

        self.connect_int_links(slot);
        for side in 0..8u8 {
            if let Some(nei_slot) = self.neighbour_slot(x, y, side) {
                self.connect_ext_links(slot, nei_slot, side);
                self.connect_ext_links(nei_slot, slot, opposite_side(side));
            }
        }
    }

    fn neighbour_slot(&self, x: i32, y: i32, side: u8) -> Option<usize> {
        let (dx, dy) = neighbour_offset(side);
        self.pos_lookup.get(&(x + dx, y + dy)).copied()
    }

    fn connect_int_links(&mut self, slot: usize) {
        let Some(tile) = self.tiles[slot].as_ref() else {
            return;
        };
        let tile_id = slot as u32 + 1;
        let salt = tile.header.salt;
        let climb = tile.header.walkable_climb;

        let mut pending = Vec::new();
        let mut candidates = Vec::new();
        for (i, poly) in tile.polys.iter().enumerate() {
            for e in 0..poly.vert_count() {
                let nei = poly.neis[e];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let (a0, a1) = tile.edge(poly, e);
                candidates.clear();
                if nei == NEI_PORTAL {
                    tile.query_polys(&edge_query_bounds(&a0, &a1, climb), &mut candidates);
                } else {
                    candidates.push((nei - 1) as usize);
                }

                for &j in &candidates {
                    if j == i {
                        continue;
                    }
                    let other = &tile.polys[j];
                    for f in 0..other.vert_count() {
                        let other_nei = other.neis[f];
                        if other_nei == 0 || other_nei & EXT_LINK != 0 {
                            continue;
                        }
                        let (b0, b1) = tile.edge(other, f);
                        if let Some((tmin, tmax)) = edge_overlap(&a0, &a1, &b0, &b1, climb) {
                            pending.push((
                                i,
                                Link {
                                    reference: encode_poly_ref(salt, tile_id, j as u32),
                                    edge: e as u8,
                                    side: SIDE_INTERNAL,
                                    tmin,
                                    tmax,
                                },
                            ));
                        }
                    }
                }
            }
        }

        if let Some(tile) = self.tiles[slot].as_mut() {
            for poly in &mut tile.polys {
                poly.links.retain(|l| l.side != SIDE_INTERNAL);
            }
            for (i, link) in pending {
                tile.polys[i].insert_link(link);
            }
        }
    }

    /// Links the edges of `slot` facing `side` to the polygons of `nei_slot`
    fn connect_ext_links(&mut self, slot: usize, nei_slot: usize, side: u8) {
        let (Some(tile), Some(nei)) = (self.tiles[slot].as_ref(), self.tiles[nei_slot].as_ref())
        else {
            return;
        };
        let nei_id = nei_slot as u32 + 1;
        let climb = tile.header.walkable_climb.max(nei.header.walkable_climb);
        let code = EXT_LINK | side as u16;
        let opposite = EXT_LINK | opposite_side(side) as u16;

        let mut pending = Vec::new();
        let mut candidates = Vec::new();
        for (i, poly) in tile.polys.iter().enumerate() {
            for e in 0..poly.vert_count() {
                if poly.neis[e] != code {
                    continue;
                }
                let (a0, a1) = tile.edge(poly, e);
                candidates.clear();
                nei.query_polys(&edge_query_bounds(&a0, &a1, climb), &mut candidates);
                for &j in &candidates {
                    let other = &nei.polys[j];
                    for f in 0..other.vert_count() {
                        if other.neis[f] != opposite {
                            continue;
                        }
                        let (b0, b1) = nei.edge(other, f);
                        if let Some((tmin, tmax)) = edge_overlap(&a0, &a1, &b0, &b1, climb) {
                            pending.push((
                                i,
                                Link {
                                    reference: encode_poly_ref(nei.header.salt, nei_id, j as u32),
                                    edge: e as u8,
                                    side,
                                    tmin,
                                    tmax,
                                },
                            ));
                        }
                    }
                }
            }
        }

        if let Some(tile) = self.tiles[slot].as_mut() {
            for (i, link) in pending {
                tile.polys[i].insert_link(link);
            }
        }
    }

    fn unconnect_links(&mut self, slot: usize, target_tile_id: u32) {
        if let Some(tile) = self.tiles[slot].as_mut() {
            for poly in &mut tile.polys {
                poly.links
                    .retain(|l| decode_poly_ref(l.reference).1 != target_tile_id);
            }
        }
    }

    fn slot_of(&self, reference: PolyRef) -> Option<(usize, usize)> {
        let (salt, tile_id, poly_id) = decode_poly_ref(reference);
        let slot = (tile_id as usize).checked_sub(1)?;
        let tile = self.tiles.get(slot)?.as_ref()?;
        (tile.header.salt == salt && (poly_id as usize) < tile.polys.len())
            .then_some((slot, poly_id as usize))
    }

    /// Error for a reference that does not resolve
    ///
    /// A reference into a live tile slot whose salt has moved on is stale;
    /// anything else is an invalid parameter.
    fn ref_error(&self, reference: PolyRef) -> Error {
        let (salt, tile_id, _) = decode_poly_ref(reference);
        let current = (tile_id as usize)
            .checked_sub(1)
            .and_then(|slot| self.tiles.get(slot)?.as_ref())
            .map(|tile| tile.header.salt);
        match current {
            Some(current) if current != salt => Error::StaleReference(format!(
                "polygon {:#x} has salt {salt}, tile is at {current}",
                reference.id()
            )),
            _ => Error::Detour(format!(
                "{} for polygon {:#x}",
                Status::failure().with(StatusDetail::INVALID_PARAM),
                reference.id()
            )),
        }
    }

    /// Returns true if the reference points at a polygon of the current mesh
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        reference.is_valid() && self.slot_of(reference).is_some()
    }

    /// Gets the tile and polygon for a reference
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (slot, poly) = self.slot_of(reference).ok_or_else(|| self.ref_error(reference))?;
        let tile = self.tiles[slot].as_ref().ok_or_else(|| self.ref_error(reference))?;
        Ok((tile, &tile.polys[poly]))
    }

    fn poly_mut(&mut self, reference: PolyRef) -> Option<&mut Poly> {
        let (slot, poly) = self.slot_of(reference)?;
        self.tiles[slot].as_mut().map(|t| &mut t.polys[poly])
    }

    pub fn poly_verts(&self, reference: PolyRef) -> Result<Vec<[f32; 3]>> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        Ok(tile.poly_verts(poly))
    }

    pub fn links(&self, reference: PolyRef) -> Result<&[Link]> {
        let (_, poly) = self.get_tile_and_poly_by_ref(reference)?;
        Ok(&poly.links)
    }

    pub fn get_poly_flags(&self, reference: PolyRef) -> Result<PolyFlags> {
        Ok(self.get_tile_and_poly_by_ref(reference)?.1.flags)
    }

    pub fn set_poly_flags(&mut self, reference: PolyRef, flags: PolyFlags) -> Result<()> {
        let Some(poly) = self.poly_mut(reference) else {
            return Err(self.ref_error(reference));
        };
        poly.flags = flags;
        Ok(())
    }

    /// Finds polygons whose bounds overlap the query box and pass the filter
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Vec<PolyRef> {
        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];
        let bounds = Aabb::new(bmin, bmax);
        let (tx0, ty0) = self.calc_tile_loc(&bmin);
        let (tx1, ty1) = self.calc_tile_loc(&bmax);
        let span = (tx1 as i64 - tx0 as i64 + 1) * (ty1 as i64 - ty0 as i64 + 1);

        let mut result = Vec::new();
        let mut hits = Vec::new();
        for (slot, tile) in self.tiles.iter().enumerate() {
            let Some(tile) = tile else { continue };
            let (x, y) = (tile.header.x, tile.header.y);
            // Small boxes only visit the grid cells they cover.
            if span <= self.pos_lookup.len() as i64 && (x < tx0 || x > tx1 || y < ty0 || y > ty1) {
                continue;
            }
            hits.clear();
            tile.query_polys(&bounds, &mut hits);
            hits.sort_unstable();
            for &i in &hits {
                if filter.pass_filter(&tile.polys[i]) {
                    result.push(encode_poly_ref(tile.header.salt, slot as u32 + 1, i as u32));
                }
            }
        }
        result
    }

    /// Closest point on a polygon; the flag is true when `pos` is above or
    /// below the polygon's surface.
    pub fn closest_point_on_poly(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<([f32; 3], bool)> {
        let verts = self.poly_verts(reference)?;
        if point_in_polygon_2d(pos, &verts) {
            return Ok(([pos[0], poly_height(&verts, pos), pos[2]], true));
        }
        Ok((closest_on_edges(&verts, pos), false))
    }

    /// Closest point on the polygon boundary, or `pos` itself when inside
    pub fn closest_point_on_poly_boundary(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<[f32; 3]> {
        let verts = self.poly_verts(reference)?;
        if point_in_polygon_2d(pos, &verts) {
            return Ok(*pos);
        }
        Ok(closest_on_edges(&verts, pos))
    }

    /// Shared segment between two linked polygons, as `(left, right)` when
    /// walking from `from` into `to`.
    pub fn portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(from)?;
        let link = poly
            .links
            .iter()
            .find(|l| l.reference == to)
            .ok_or_else(|| Error::Detour(format!("polygon {:#x} is not linked to {:#x}", from.id(), to.id())))?;
        let (va, vb) = tile.edge(poly, link.edge as usize);
        if link.tmin > 0.0 || link.tmax < 1.0 {
            return Ok((lerp3(&va, &vb, link.tmin), lerp3(&va, &vb, link.tmax)));
        }
        Ok((va, vb))
    }

    /// Removes every link between `reference` and its neighbours, in both
    /// directions, returning the removed `(owner, link)` pairs.
    pub fn sever_poly_links(&mut self, reference: PolyRef) -> Vec<(PolyRef, Link)> {
        let Some(poly) = self.poly_mut(reference) else {
            return Vec::new();
        };
        let outgoing = std::mem::take(&mut poly.links);

        let mut removed = Vec::with_capacity(outgoing.len() * 2);
        for link in outgoing {
            removed.push((reference, link));
            if let Some(nei) = self.poly_mut(link.reference) {
                let mut kept = Vec::with_capacity(nei.links.len());
                for back in nei.links.drain(..) {
                    if back.reference == reference {
                        removed.push((link.reference, back));
                    } else {
                        kept.push(back);
                    }
                }
                nei.links = kept;
            }
        }
        removed
    }

    /// Re-inserts a previously removed link
    ///
    /// Returns false when either end is stale or the link already exists.
    pub fn restore_link(&mut self, owner: PolyRef, link: Link) -> bool {
        if !self.is_valid_poly_ref(link.reference) {
            return false;
        }
        let Some(poly) = self.poly_mut(owner) else {
            return false;
        };
        if poly.links.iter().any(|l| *l == link) {
            return false;
        }
        poly.insert_link(link);
        true
    }
}

fn poly_height(verts: &[[f32; 3]], pos: &[f32; 3]) -> f32 {
    for i in 2..verts.len() {
        if let Some(h) = closest_height_on_triangle(pos, &verts[0], &verts[i - 1], &verts[i]) {
            return h;
        }
    }
    verts.iter().map(|v| v[1]).sum::<f32>() / verts.len() as f32
}

fn closest_on_edges(verts: &[[f32; 3]], pos: &[f32; 3]) -> [f32; 3] {
    let n = verts.len();
    let mut best = (f32::MAX, 0, 0.0);
    for i in 0..n {
        let (d, t) = dist_point_segment_sqr_2d(pos, &verts[i], &verts[(i + 1) % n]);
        if d < best.0 {
            best = (d, i, t);
        }
    }
    lerp3(&verts[best.1], &verts[(best.1 + 1) % n], best.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolyArea;
    use crate::test_mesh_helpers::TestMeshBuilder;

    fn links_to(mesh: &NavMesh, from: PolyRef) -> Vec<PolyRef> {
        mesh.links(from).unwrap().iter().map(|l| l.reference).collect()
    }

    #[test]
    fn test_poly_ref_encoding() {
        let reference = encode_poly_ref(7, 3, 42);
        assert_eq!(decode_poly_ref(reference), (7, 3, 42));
        let reference = encode_poly_ref(u32::MAX, 0xffff, 0xffff);
        assert_eq!(decode_poly_ref(reference), (u32::MAX, 0xffff, 0xffff));
        assert!(encode_poly_ref(1, 1, 0).is_valid());
    }

    #[test]
    fn test_invalid_params() {
        let mut params = NavMeshParams {
            origin: [0.0; 3],
            tile_width: 10.0,
            tile_height: 10.0,
            max_tiles: 4,
            max_polys_per_tile: 16,
        };
        assert!(NavMesh::new(params).is_ok());

        params.tile_width = 0.0;
        assert!(NavMesh::new(params).is_err());
        params.tile_width = 10.0;
        params.origin[1] = f32::NAN;
        assert!(NavMesh::new(params).is_err());
        params.origin[1] = 0.0;
        params.max_tiles = 0;
        assert!(NavMesh::new(params).is_err());
    }

    #[test]
    fn test_internal_links_with_t_junction() {
        // One wide room meeting two narrow ones along z = 4.
        let mesh = TestMeshBuilder::new(16.0)
            .rect(0.0, 0.0, 8.0, 4.0, PolyArea::Ground)
            .rect(0.0, 4.0, 3.0, 8.0, PolyArea::Ground)
            .rect(5.0, 4.0, 8.0, 8.0, PolyArea::Ground)
            .build()
            .unwrap();

        let wide = mesh.poly_ref_at(0, 0, 0).unwrap();
        let left = mesh.poly_ref_at(0, 0, 1).unwrap();
        let right = mesh.poly_ref_at(0, 0, 2).unwrap();

        assert_eq!(links_to(&mesh, wide), vec![left, right]);
        assert_eq!(links_to(&mesh, left), vec![wide]);
        assert_eq!(links_to(&mesh, right), vec![wide]);

        // The portal into the right room covers x in [5, 8] only.
        let (l, r) = mesh.portal_points(wide, right).unwrap();
        let xs = [l[0].min(r[0]), l[0].max(r[0])];
        assert!((xs[0] - 5.0).abs() < 1e-4 && (xs[1] - 8.0).abs() < 1e-4);
        assert!((l[2] - 4.0).abs() < 1e-4 && (r[2] - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_external_links_between_tiles() {
        let mesh = TestMeshBuilder::new(10.0)
            .rect(0.0, 0.0, 10.0, 10.0, PolyArea::Ground)
            .rect(2.0, 10.0, 6.0, 20.0, PolyArea::Ground)
            .build()
            .unwrap();
        assert_eq!(mesh.tile_count(), 2);

        let a = mesh.poly_ref_at(0, 0, 0).unwrap();
        let b = mesh.poly_ref_at(0, 1, 0).unwrap();
        assert_eq!(links_to(&mesh, a), vec![b]);
        assert_eq!(links_to(&mesh, b), vec![a]);
        assert_eq!(mesh.links(a).unwrap()[0].side, 2);
        assert_eq!(mesh.links(b).unwrap()[0].side, 6);
    }

    #[test]
    fn test_replace_tile_invalidates_refs() {
        let builder = TestMeshBuilder::new(10.0)
            .rect(0.0, 0.0, 10.0, 10.0, PolyArea::Ground)
            .rect(0.0, 10.0, 10.0, 20.0, PolyArea::Ground);
        let mut mesh = builder.build().unwrap();
        let old = mesh.poly_ref_at(0, 1, 0).unwrap();
        let below = mesh.poly_ref_at(0, 0, 0).unwrap();
        assert!(mesh.is_valid_poly_ref(old));

        let tiles = builder.build_tiles().unwrap();
        let replacement = tiles
            .into_iter()
            .find(|t| t.header.y == 1)
            .unwrap();
        mesh.replace_tile(replacement).unwrap();

        let new = mesh.poly_ref_at(0, 1, 0).unwrap();
        assert_ne!(old, new);
        assert!(!mesh.is_valid_poly_ref(old));
        assert!(matches!(
            mesh.get_tile_and_poly_by_ref(old),
            Err(Error::StaleReference(_))
        ));
        assert!(matches!(
            mesh.get_tile_and_poly_by_ref(PolyRef::NULL),
            Err(Error::Detour(_))
        ));
        // The untouched neighbour now links to the new polygon.
        assert_eq!(links_to(&mesh, below), vec![new]);
    }

    #[test]
    fn test_duplicate_tile_rejected() {
        let builder = TestMeshBuilder::new(10.0).rect(0.0, 0.0, 10.0, 10.0, PolyArea::Ground);
        let mut mesh = builder.build().unwrap();
        let tile = builder.build_tiles().unwrap().remove(0);
        assert!(mesh.add_tile(tile).is_err());
    }

    #[test]
    fn test_sever_and_restore_links() {
        let mut mesh = TestMeshBuilder::new(30.0)
            .rect(0.0, 0.0, 4.0, 4.0, PolyArea::Ground)
            .rect(4.0, 0.0, 6.0, 4.0, PolyArea::Door)
            .rect(6.0, 0.0, 10.0, 4.0, PolyArea::Ground)
            .build()
            .unwrap();
        let a = mesh.poly_ref_at(0, 0, 0).unwrap();
        let door = mesh.poly_ref_at(0, 0, 1).unwrap();
        let c = mesh.poly_ref_at(0, 0, 2).unwrap();
        let before: Vec<Vec<Link>> = [a, door, c]
            .iter()
            .map(|&r| mesh.links(r).unwrap().to_vec())
            .collect();

        let removed = mesh.sever_poly_links(door);
        assert_eq!(removed.len(), 4);
        assert!(mesh.links(a).unwrap().is_empty());
        assert!(mesh.links(door).unwrap().is_empty());
        assert!(mesh.links(c).unwrap().is_empty());

        // Restore in reverse order; the canonical ordering hides the difference.
        for (owner, link) in removed.into_iter().rev() {
            assert!(mesh.restore_link(owner, link));
        }
        let after: Vec<Vec<Link>> = [a, door, c]
            .iter()
            .map(|&r| mesh.links(r).unwrap().to_vec())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_query_and_closest_point() {
        let mesh = TestMeshBuilder::new(10.0)
            .rect(0.0, 0.0, 10.0, 10.0, PolyArea::Ground)
            .rect(0.0, 10.0, 10.0, 20.0, PolyArea::Water)
            .build()
            .unwrap();
        let filter = QueryFilter::default();

        let found = mesh.query_polygons(&[5.0, 0.0, 9.0], &[2.0, 2.0, 2.0], &filter);
        assert_eq!(found, vec![mesh.poly_ref_at(0, 0, 0).unwrap()]);

        let swim = QueryFilter::new(PolyFlags::WALK | PolyFlags::SWIM, PolyFlags::empty());
        let found = mesh.query_polygons(&[5.0, 0.0, 9.0], &[2.0, 2.0, 2.0], &swim);
        assert_eq!(found.len(), 2);

        let ground = mesh.poly_ref_at(0, 0, 0).unwrap();
        let (p, over) = mesh.closest_point_on_poly(ground, &[3.0, 5.0, 4.0]).unwrap();
        assert!(over);
        assert_eq!(p, [3.0, 0.0, 4.0]);

        let (p, over) = mesh.closest_point_on_poly(ground, &[-2.0, 0.0, 4.0]).unwrap();
        assert!(!over);
        assert!((p[0] - 0.0).abs() < 1e-5 && (p[2] - 4.0).abs() < 1e-5);
    }
}
