//! Doors and regions volume files
//!
//! A volume file lists closed volumes, one tag per line:
//!
//! ```text
//! Volume:3
//! 	area:0
//! 	hmin:-1.5
//! 	hmax:2.0
//! 	open:1
//! 	nverts:4
//! 		vert:x:1.0,y:0.0,z:1.0
//! 		...
//! ```
//!
//! `open` is only meaningful for doors and defaults to closed.

use std::path::Path;

use navi_common::{Error, Result, point_in_polygon_2d};

const VOLUME_TAG: &str = "Volume:";
const AREA_TAG: &str = "area:";
const HMIN_TAG: &str = "hmin:";
const HMAX_TAG: &str = "hmax:";
const OPEN_TAG: &str = "open:";
const NVERTS_TAG: &str = "nverts:";
const VERT_TAG: &str = "vert:";

/// A closed volume with an XZ ring and a height range
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub id: i32,
    pub area: i32,
    pub hmin: f32,
    pub hmax: f32,
    /// Initial door state
    pub open: bool,
    pub verts: Vec<[f32; 3]>,
}

impl Volume {
    fn new(id: i32) -> Self {
        Self {
            id,
            area: 0,
            hmin: 0.0,
            hmax: 0.0,
            open: false,
            verts: Vec::new(),
        }
    }

    /// Crossing-number test of `(x, z)` against the ring
    pub fn contains_xz(&self, x: f32, z: f32) -> bool {
        point_in_polygon_2d(&[x, 0.0, z], &self.verts)
    }
}

struct VolumeParser {
    volumes: Vec<Volume>,
    current: Option<Volume>,
    expected_verts: Option<usize>,
}

impl VolumeParser {
    fn new() -> Self {
        Self {
            volumes: Vec::new(),
            current: None,
            expected_verts: None,
        }
    }

    fn finish_current(&mut self, line_no: usize) -> Result<()> {
        let Some(volume) = self.current.take() else {
            return Ok(());
        };
        let expected = self.expected_verts.take().unwrap_or(0);
        if volume.verts.len() != expected {
            return Err(Error::Load(format!(
                "line {line_no}: volume {} declares {expected} vertices but lists {}",
                volume.id,
                volume.verts.len()
            )));
        }
        if expected < 3 {
            return Err(Error::Load(format!(
                "line {line_no}: volume {} has {expected} vertices, need at least 3",
                volume.id
            )));
        }
        self.volumes.push(volume);
        Ok(())
    }

    fn line(&mut self, line_no: usize, line: &str) -> Result<()> {
        if let Some(rest) = line.strip_prefix(VOLUME_TAG) {
            self.finish_current(line_no)?;
            self.current = Some(Volume::new(parse_num(line_no, rest)?));
            return Ok(());
        }

        let Some(volume) = self.current.as_mut() else {
            return Err(Error::Load(format!(
                "line {line_no}: property before the first volume"
            )));
        };
        if let Some(rest) = line.strip_prefix(AREA_TAG) {
            volume.area = parse_num(line_no, rest)?;
        } else if let Some(rest) = line.strip_prefix(HMIN_TAG) {
            volume.hmin = parse_num(line_no, rest)?;
        } else if let Some(rest) = line.strip_prefix(HMAX_TAG) {
            volume.hmax = parse_num(line_no, rest)?;
        } else if let Some(rest) = line.strip_prefix(OPEN_TAG) {
            volume.open = parse_num::<i32>(line_no, rest)? != 0;
        } else if let Some(rest) = line.strip_prefix(NVERTS_TAG) {
            let n: usize = parse_num(line_no, rest)?;
            if n < 3 {
                return Err(Error::Load(format!(
                    "line {line_no}: volume {} has {n} vertices, need at least 3",
                    volume.id
                )));
            }
            volume.verts.clear();
            volume.verts.reserve(n);
            self.expected_verts = Some(n);
        } else if let Some(rest) = line.strip_prefix(VERT_TAG) {
            let expected = self.expected_verts.unwrap_or(0);
            if volume.verts.len() >= expected {
                return Err(Error::Load(format!(
                    "line {line_no}: volume {} lists more than {expected} vertices",
                    volume.id
                )));
            }
            volume.verts.push(parse_vert(line_no, rest)?);
        } else {
            return Err(Error::Load(format!("line {line_no}: unknown tag in {line:?}")));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(line_no: usize, s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| Error::Load(format!("line {line_no}: cannot parse {:?}", s.trim())))
}

/// Parses `x:<f>,y:<f>,z:<f>`
fn parse_vert(line_no: usize, s: &str) -> Result<[f32; 3]> {
    let mut vert = [0.0; 3];
    let mut parts = s.split(',');
    for (axis, slot) in ["x:", "y:", "z:"].iter().zip(vert.iter_mut()) {
        let part = parts
            .next()
            .map(str::trim)
            .and_then(|p| p.strip_prefix(axis))
            .ok_or_else(|| Error::Load(format!("line {line_no}: malformed vertex {s:?}")))?;
        *slot = parse_num(line_no, part)?;
    }
    if parts.next().is_some() {
        return Err(Error::Load(format!("line {line_no}: malformed vertex {s:?}")));
    }
    Ok(vert)
}

/// Parses a volume file
pub fn parse_volumes(text: &str) -> Result<Vec<Volume>> {
    let mut parser = VolumeParser::new();
    let mut last_line = 0;
    for (i, raw) in text.lines().enumerate() {
        last_line = i + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        parser.line(last_line, line)?;
    }
    parser.finish_current(last_line)?;
    Ok(parser.volumes)
}

/// Reads and parses a volume file
pub fn load_volumes<P: AsRef<Path>>(path: P) -> Result<Vec<Volume>> {
    let text = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::Load(format!("cannot read {}: {e}", path.as_ref().display())))?;
    parse_volumes(&text)
}

/// Point to region classification
#[derive(Debug, Clone, Default)]
pub struct RegionIndex {
    regions: Vec<Volume>,
}

impl RegionIndex {
    pub fn new(regions: Vec<Volume>) -> Self {
        Self { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Id of the first region containing `(x, z)`, or 0
    pub fn region_id(&self, x: f32, z: f32) -> i32 {
        self.regions
            .iter()
            .find(|r| r.contains_xz(x, z))
            .map_or(0, |r| r.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_VOLUMES: &str = "Volume:7
\tarea:3
\thmin:-1.5
\thmax:2.5
\topen:1
\tnverts:4
\t\tvert:x:0.0,y:0.0,z:0.0
\t\tvert:x:0.0,y:0.0,z:4.0
\t\tvert:x:4.0,y:0.0,z:4.0
\t\tvert:x:4.0,y:0.0,z:0.0

Volume:9
\tnverts:3
\t\tvert:x:2.0,y:0.0,z:2.0
\t\tvert:x:10.0,y:0.0,z:2.0
\t\tvert:x:2.0,y:0.0,z:10.0
";

    #[test]
    fn test_parse_volumes() {
        let volumes = parse_volumes(TWO_VOLUMES).unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].id, 7);
        assert_eq!(volumes[0].area, 3);
        assert_eq!(volumes[0].hmin, -1.5);
        assert_eq!(volumes[0].hmax, 2.5);
        assert!(volumes[0].open);
        assert_eq!(volumes[0].verts[2], [4.0, 0.0, 4.0]);
        assert!(!volumes[1].open);
        assert_eq!(volumes[1].verts.len(), 3);
    }

    #[test]
    fn test_malformed_volumes() {
        let cases = [
            "\tarea:1\n",
            "Volume:1\n\tcolour:red\n",
            "Volume:x\n",
            "Volume:1\n\tnverts:2\n",
            "Volume:1\n\tnverts:3\n\t\tvert:x:0,y:0,z:0\n",
            "Volume:1\n\tnverts:3\n\t\tvert:x:0,y:0,z:0\n\t\tvert:x:1,y:0,z:0\n\t\tvert:x:1,y:0,z:1\n\t\tvert:x:0,y:0,z:1\n",
            "Volume:1\n\tnverts:3\n\t\tvert:x:0,y:0\n\t\tvert:x:1,y:0,z:0\n\t\tvert:x:1,y:0,z:1\n",
            "Volume:1\n",
        ];
        for text in cases {
            assert!(
                matches!(parse_volumes(text), Err(Error::Load(_))),
                "accepted {text:?}"
            );
        }
        assert!(parse_volumes("").unwrap().is_empty());
    }

    #[test]
    fn test_region_lookup_first_match_wins() {
        let index = RegionIndex::new(parse_volumes(TWO_VOLUMES).unwrap());
        assert_eq!(index.region_id(1.0, 1.0), 7);
        // Inside both; the first loaded wins.
        assert_eq!(index.region_id(3.0, 3.0), 7);
        assert_eq!(index.region_id(5.0, 3.0), 9);
        assert_eq!(index.region_id(20.0, 20.0), 0);
        assert_eq!(RegionIndex::default().region_id(1.0, 1.0), 0);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_volumes(dir.path().join("none.txt")),
            Err(Error::Load(_))
        ));
    }
}
