// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The media byte-range parser (C11): scans a cached MP4/WebM file on disk
//! for the byte ranges a synthesized adaptive manifest needs (`initRange`,
//! `indexRange`), the way a container prober reads just enough of a file's
//! structure without decoding payload. Results are cached by
//! `(path, mtime, size)` since the underlying file never changes once a
//! download completes.

use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRanges {
    pub init_start: u64,
    pub init_end: u64,
    pub index_start: u64,
    pub index_end: u64,
}

impl ByteRanges {
    pub fn init_range(&self) -> String {
        format!("{}-{}", self.init_start, self.init_end)
    }

    pub fn index_range(&self) -> String {
        format!("{}-{}", self.index_start, self.index_end)
    }

    /// The tolerated fallback when the real container can't be parsed; the
    /// synthesized manifest still renders with this, per `## 4.11`.
    pub fn zero() -> Self {
        ByteRanges {
            init_start: 0,
            init_end: 0,
            index_start: 0,
            index_end: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ByteRangeError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no moov atom found in {0}")]
    NoMoov(String),
    #[error("no Tracks element found in {0}")]
    NoTracks(String),
    #[error("unrecognized container: {0}")]
    UnrecognizedContainer(String),
}

impl From<ByteRangeError> for base::Error {
    fn from(e: ByteRangeError) -> base::Error {
        base::Error::wrap(base::ErrorKind::Internal, e)
    }
}

/// Caches parsed byte ranges by `(path, mtime, size)`, safe to share across
/// concurrent router handlers (see `## 5`'s resource model).
#[derive(Default)]
pub struct ByteRangeCache {
    entries: base::Mutex<HashMap<(PathBuf, i128, u64), ByteRanges>>,
}

impl ByteRangeCache {
    pub fn new() -> Self {
        ByteRangeCache::default()
    }

    pub fn get(&self, path: &Path) -> Result<ByteRanges, ByteRangeError> {
        let meta = std::fs::metadata(path).map_err(|e| ByteRangeError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        let key = (path.to_path_buf(), mtime_nanos, meta.len());

        if let Some(cached) = self.entries.lock().get(&key) {
            return Ok(*cached);
        }

        let ranges = parse(path)?;
        self.entries.lock().insert(key, ranges);
        Ok(ranges)
    }
}

fn parse(path: &Path) -> Result<ByteRanges, ByteRangeError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4a" | "m4v" => parse_mp4(path),
        "webm" => parse_webm(path),
        _ => parse_mp4(path).or_else(|_| parse_webm(path)),
    }
}

struct Atom {
    kind: [u8; 4],
    start: u64,
    end: u64,
}

fn read_top_level_atoms(file: &mut File) -> std::io::Result<Vec<Atom>> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    let mut atoms = Vec::new();
    let mut pos = 0u64;
    while pos + 8 <= len {
        file.seek(SeekFrom::Start(pos))?;
        let size32 = file.read_u32::<BigEndian>()?;
        let mut kind = [0u8; 4];
        file.read_exact(&mut kind)?;
        let (header_len, size) = if size32 == 1 {
            let size64 = file.read_u64::<BigEndian>()?;
            (16u64, size64)
        } else if size32 == 0 {
            (8u64, len - pos)
        } else {
            (8u64, size32 as u64)
        };
        if size < header_len {
            break;
        }
        let end = pos + size;
        atoms.push(Atom {
            kind,
            start: pos,
            end: end.min(len),
        });
        pos = end;
    }
    Ok(atoms)
}

/// For MP4/M4A: `initRange` covers byte 0 through the end of `moov`. If a
/// sibling `sidx` atom immediately follows, it becomes `indexRange`;
/// otherwise `indexRange` spans from the end of `ftyp` through the end of
/// `moov` (the whole header region, a permissive fallback).
fn parse_mp4(path: &Path) -> Result<ByteRanges, ByteRangeError> {
    let mut file = File::open(path).map_err(|e| ByteRangeError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let atoms = read_top_level_atoms(&mut file).map_err(|e| ByteRangeError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let moov = atoms
        .iter()
        .find(|a| &a.kind == b"moov")
        .ok_or_else(|| ByteRangeError::NoMoov(path.display().to_string()))?;
    let ftyp_end = atoms.iter().find(|a| &a.kind == b"ftyp").map(|a| a.end).unwrap_or(0);

    let init_end = moov.end.saturating_sub(1);
    let sidx = atoms.iter().find(|a| a.start >= moov.end && &a.kind == b"sidx");
    let (index_start, index_end) = match sidx {
        Some(s) => (s.start, s.end.saturating_sub(1)),
        None => (ftyp_end, init_end),
    };

    Ok(ByteRanges {
        init_start: 0,
        init_end,
        index_start,
        index_end,
    })
}

/// For WebM: EBML element IDs used here are the well-known top-level ones
/// (`Segment` 0x18538067, `Tracks` 0x1654AE6B, `Cues` 0x1C53BB6B). `initRange`
/// covers the EBML header through the end of `Tracks`; `indexRange` covers
/// `Cues`.
fn parse_webm(path: &Path) -> Result<ByteRanges, ByteRangeError> {
    let mut file = File::open(path).map_err(|e| ByteRangeError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let len = file.seek(SeekFrom::End(0)).map_err(|e| ByteRangeError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    file.seek(SeekFrom::Start(0)).map_err(|e| ByteRangeError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut tracks_end = None;
    let mut cues_range = None;
    let mut pos = 0u64;
    while pos + 2 <= len {
        file.seek(SeekFrom::Start(pos)).map_err(|e| ByteRangeError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let (id, id_len) = match read_ebml_id(&mut file) {
            Ok(v) => v,
            Err(_) => break,
        };
        let (size, size_len) = match read_ebml_size(&mut file) {
            Ok(v) => v,
            Err(_) => break,
        };
        let header_len = id_len + size_len;
        let body_start = pos + header_len;
        let body_end = body_start + size;

        match id {
            0x1654_AE6B => tracks_end = Some(body_end),
            0x1C53_BB6B => cues_range = Some((pos, body_end.saturating_sub(1))),
            _ => {}
        }

        // Descend into the Segment container; everything else is a
        // sibling at this level and we skip over its body.
        if id == 0x1853_8067 {
            pos = body_start;
        } else {
            pos = body_end;
        }
        if tracks_end.is_some() && cues_range.is_some() {
            break;
        }
    }

    let tracks_end = tracks_end.ok_or_else(|| ByteRangeError::NoTracks(path.display().to_string()))?;
    let (index_start, index_end) = cues_range.unwrap_or((0, tracks_end.saturating_sub(1)));

    Ok(ByteRanges {
        init_start: 0,
        init_end: tracks_end.saturating_sub(1),
        index_start,
        index_end,
    })
}

fn read_ebml_id(r: &mut impl Read) -> std::io::Result<(u32, u64)> {
    let first = r.read_u8()?;
    let len = (first.leading_zeros() + 1) as u64;
    let mut value = first as u32;
    for _ in 1..len {
        value = (value << 8) | r.read_u8()? as u32;
    }
    Ok((value, len))
}

fn read_ebml_size(r: &mut impl Read) -> std::io::Result<(u64, u64)> {
    let first = r.read_u8()?;
    let len = (first.leading_zeros() + 1) as u64;
    let mask = 0xFFu8 >> len;
    let mut value = (first & mask) as u64;
    for _ in 1..len {
        value = (value << 8) | r.read_u8()? as u64;
    }
    Ok((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_atom(buf: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
        let size = (8 + body.len()) as u32;
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(kind);
        buf.extend_from_slice(body);
    }

    #[test]
    fn parses_mp4_with_sidx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut buf = Vec::new();
        write_atom(&mut buf, b"ftyp", &[0u8; 16]);
        write_atom(&mut buf, b"moov", &[0u8; 40]);
        write_atom(&mut buf, b"sidx", &[0u8; 20]);
        write_atom(&mut buf, b"mdat", &[0u8; 100]);
        std::fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        let ranges = parse_mp4(&path).unwrap();
        assert_eq!(ranges.init_start, 0);
        assert_eq!(ranges.init_end, 24 + 48 - 1);
        let sidx_start = 24 + 48;
        assert_eq!(ranges.index_start, sidx_start as u64);
        assert_eq!(ranges.index_end, (sidx_start + 28 - 1) as u64);
    }

    #[test]
    fn parses_mp4_without_sidx_falls_back_to_header_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut buf = Vec::new();
        write_atom(&mut buf, b"ftyp", &[0u8; 16]);
        write_atom(&mut buf, b"moov", &[0u8; 40]);
        write_atom(&mut buf, b"mdat", &[0u8; 100]);
        std::fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        let ranges = parse_mp4(&path).unwrap();
        assert_eq!(ranges.index_start, 24);
        assert_eq!(ranges.index_end, ranges.init_end);
    }

    #[test]
    fn missing_moov_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut buf = Vec::new();
        write_atom(&mut buf, b"ftyp", &[0u8; 16]);
        write_atom(&mut buf, b"mdat", &[0u8; 100]);
        std::fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        assert!(matches!(parse_mp4(&path), Err(ByteRangeError::NoMoov(_))));
    }

    #[test]
    fn cache_reuses_entry_for_same_mtime_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut buf = Vec::new();
        write_atom(&mut buf, b"ftyp", &[0u8; 16]);
        write_atom(&mut buf, b"moov", &[0u8; 40]);
        write_atom(&mut buf, b"mdat", &[0u8; 100]);
        std::fs::File::create(&path).unwrap().write_all(&buf).unwrap();

        let cache = ByteRangeCache::new();
        let first = cache.get(&path).unwrap();
        let second = cache.get(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_fallback_is_well_formed() {
        let z = ByteRanges::zero();
        assert_eq!(z.init_range(), "0-0");
        assert_eq!(z.index_range(), "0-0");
    }
}
