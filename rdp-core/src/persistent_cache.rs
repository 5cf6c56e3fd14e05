//! File-backed append log of long-lived bitmap cache entries, flushed
//! only at cache teardown (spec §3/§4.4/§6).
//!
//! Binary layout: header `{version: u32, entry_count: u32}`, then a
//! sequence of records `{key64: u64, width: u16, height: u16, size: u32,
//! flags: u16, bytes[size]}`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::warn;

use crate::bitmap_cache::BitmapCache;
use crate::errors::RdpError;

/// Cache protocol version the persistent store is valid for. Persistence
/// is only meaningful when the session negotiated this version (spec
/// §4.4): "graphics-effects channel owns persistence for other
/// versions."
pub const PERSISTABLE_CACHE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEntry {
    pub key64: u64,
    pub width: u16,
    pub height: u16,
    pub flags: u16,
    pub bytes: Vec<u8>,
}

/// Whether the session is configured to persist its bitmap cache at
/// teardown: requires persistence enabled, cache version 2, and a
/// configured file path (spec §4.4).
pub struct PersistenceConfig {
    pub enabled: bool,
    pub cache_version: u32,
    pub path: Option<std::path::PathBuf>,
}

impl PersistenceConfig {
    pub fn should_flush(&self) -> bool {
        self.enabled && self.cache_version == PERSISTABLE_CACHE_VERSION && self.path.is_some()
    }
}

/// Writes every non-empty, keyed cell entry in `cache` to `path`. Entries
/// whose pixel size does not fit in 32 bits, or whose key is zero, are
/// skipped rather than failing the whole flush (spec §4.4).
pub fn flush(cache: &BitmapCache, path: &Path) -> Result<usize, RdpError> {
    let entries: Vec<PersistedEntry> = cache
        .keyed_entries()
        .filter_map(|(_, _, bmp)| {
            if bmp.pixels.len() > u32::MAX as usize {
                warn!("persistent cache: skipping entry {:#x}, pixel buffer exceeds u32", bmp.key64);
                return None;
            }
            Some(PersistedEntry {
                key64: bmp.key64,
                width: bmp.width,
                height: bmp.height,
                flags: 0,
                bytes: bmp.pixels.clone(),
            })
        })
        .collect();

    let file = File::create(path).map_err(RdpError::from)?;
    let mut writer = BufWriter::new(file);
    write_records(&mut writer, &entries).map_err(RdpError::from)?;
    Ok(entries.len())
}

fn write_records<W: Write>(writer: &mut W, entries: &[PersistedEntry]) -> io::Result<()> {
    writer.write_all(&PERSISTABLE_CACHE_VERSION.to_le_bytes())?;
    writer.write_all(&(entries.len() as u32).to_le_bytes())?;
    for entry in entries {
        writer.write_all(&entry.key64.to_le_bytes())?;
        writer.write_all(&entry.width.to_le_bytes())?;
        writer.write_all(&entry.height.to_le_bytes())?;
        writer.write_all(&(entry.bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&entry.flags.to_le_bytes())?;
        writer.write_all(&entry.bytes)?;
    }
    Ok(())
}

/// Reads back a persistent cache file. Records with `size > u32::MAX`
/// cannot occur on read (the size field is itself a `u32`), but
/// `key64 == 0` records are skipped per spec §6, matching what `flush`
/// never writes in the first place.
pub fn load(path: &Path) -> Result<Vec<PersistedEntry>, RdpError> {
    let file = File::open(path).map_err(RdpError::from)?;
    let mut reader = BufReader::new(file);
    read_records(&mut reader).map_err(RdpError::from)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_records<R: Read>(reader: &mut R) -> io::Result<Vec<PersistedEntry>> {
    let _version = read_u32(reader)?;
    let count = read_u32(reader)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key64 = read_u64(reader)?;
        let width = read_u16(reader)?;
        let height = read_u16(reader)?;
        let size = read_u32(reader)?;
        let flags = read_u16(reader)?;
        let mut bytes = vec![0u8; size as usize];
        reader.read_exact(&mut bytes)?;
        if key64 == 0 {
            continue;
        }
        entries.push(PersistedEntry {
            key64,
            width,
            height,
            flags,
            bytes,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap_cache::Bitmap;

    fn bmp(key64: u64) -> Bitmap {
        Bitmap {
            width: 4,
            height: 4,
            bpp: 16,
            key64,
            pixels: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn should_flush_requires_version_2_and_path() {
        let config = PersistenceConfig {
            enabled: true,
            cache_version: 1,
            path: Some("/tmp/whatever".into()),
        };
        assert!(!config.should_flush());
    }

    #[test]
    fn should_flush_requires_enabled() {
        let config = PersistenceConfig {
            enabled: false,
            cache_version: 2,
            path: Some("/tmp/whatever".into()),
        };
        assert!(!config.should_flush());
    }

    #[test]
    fn should_flush_true_when_all_conditions_met() {
        let config = PersistenceConfig {
            enabled: true,
            cache_version: 2,
            path: Some("/tmp/whatever".into()),
        };
        assert!(config.should_flush());
    }

    #[test]
    fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let mut cache = BitmapCache::new(&[4], 16);
        cache.put(0, 0, bmp(42)).unwrap();

        let written = flush(&cache, &path).unwrap();
        assert_eq!(written, 1);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key64, 42);
        assert_eq!(loaded[0].bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn flush_skips_zero_key_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let mut cache = BitmapCache::new(&[4], 16);
        cache.put(0, 0, bmp(0)).unwrap();
        cache.put(0, 1, bmp(7)).unwrap();

        let written = flush(&cache, &path).unwrap();
        assert_eq!(written, 1);
    }

    #[test]
    fn flush_of_empty_cache_writes_zero_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let cache = BitmapCache::new(&[4], 16);
        let written = flush(&cache, &path).unwrap();
        assert_eq!(written, 0);
        let loaded = load(&path).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn load_of_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(&dir.path().join("nonexistent.bin"));
        assert!(result.is_err());
    }
}
