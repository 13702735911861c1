//! Compact bundle format v1: separate `.bundlx` index file

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;

use super::{
    corrupt, open_optional, path_with_suffix, pread, pwrite, Bundle, BUNDLE_GRID_HEIGHT,
    BUNDLE_GRID_WIDTH,
};
use crate::error::CacheResult;
use crate::fs::{ensure_directory, write_atomic};

const TILES: u64 = (BUNDLE_GRID_WIDTH * BUNDLE_GRID_HEIGHT) as u64;

const BUNDLEX_HEADER_SIZE: u64 = 16;
const BUNDLEX_HEADER: [u8; 16] = [
    0x03, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x05, 0x00, 0x00,
    0x00,
];
const BUNDLEX_FOOTER: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

const BUNDLE_HEADER_SIZE: u64 = 60;
/// Byte offsets of the header fields updated on store
const MAX_RECORD_SIZE_OFFSET: u64 = 8;
const TILE_COUNT_OFFSET: u64 = 16;
const BUNDLE_SIZE_OFFSET: u64 = 24;

/// A v1 bundle pair: the `.bundle` data file (60-byte header, a zero
/// region of four bytes per tile, then appended records) and the
/// `.bundlx` index of 16384 5-byte offsets pointing at the records'
/// length prefixes.
pub struct BundleV1 {
    bundle: PathBuf,
    index: PathBuf,
    base: PathBuf,
    offset: (u32, u32),
}

impl BundleV1 {
    /// Column-major position of the 5-byte index entry
    fn index_entry_offset(xy: (u32, u32)) -> u64 {
        BUNDLEX_HEADER_SIZE + (xy.0 as u64 * BUNDLE_GRID_HEIGHT as u64 + xy.1 as u64) * 5
    }

    fn init_index(&self) -> CacheResult<()> {
        if self.index.exists() {
            return Ok(());
        }
        ensure_directory(&self.index, None)?;
        let mut buf = Vec::with_capacity((BUNDLEX_HEADER_SIZE + TILES * 5 + 16) as usize);
        buf.extend_from_slice(&BUNDLEX_HEADER);
        // fresh entries point into the bundle's zero region
        for i in 0..TILES {
            let offset = i * 4 + BUNDLE_HEADER_SIZE;
            buf.extend_from_slice(&offset.to_le_bytes()[..5]);
        }
        buf.extend_from_slice(&BUNDLEX_FOOTER);
        write_atomic(&self.index, &buf, None)?;
        Ok(())
    }

    fn init_bundle(&self) -> CacheResult<()> {
        if self.bundle.exists() {
            return Ok(());
        }
        ensure_directory(&self.bundle, None)?;
        let (c, r) = self.offset;
        let mut buf = Vec::with_capacity((BUNDLE_HEADER_SIZE + TILES * 4) as usize);
        for v in [3u32, TILES as u32, 16, 5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0u64, BUNDLE_HEADER_SIZE + TILES * 4, 40] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [16u32, r, r + 127, c, c + 127] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.resize((BUNDLE_HEADER_SIZE + TILES * 4) as usize, 0);
        write_atomic(&self.bundle, &buf, None)?;
        Ok(())
    }

    /// Record offset of the tile, 0 when the bundle pair does not exist
    fn record_offset(&self, xy: (u32, u32)) -> CacheResult<u64> {
        let Some(mut file) = open_optional(&self.index)? else {
            return Ok(0);
        };
        let mut entry = [0u8; 8];
        pread(&mut file, &mut entry[..5], Self::index_entry_offset(xy))
            .map_err(|_| corrupt(&self.index, "truncated index"))?;
        Ok(u64::from_le_bytes(entry))
    }

    /// Record size stored at `offset` in the bundle file
    fn record_size(&self, file: &mut std::fs::File, offset: u64) -> CacheResult<u32> {
        let mut size = [0u8; 4];
        pread(file, &mut size, offset)
            .map_err(|_| corrupt(&self.bundle, "record offset past end of file"))?;
        Ok(u32::from_le_bytes(size))
    }

    fn patch_header_u64(
        &self,
        file: &mut std::fs::File,
        offset: u64,
        update: impl Fn(u64) -> u64,
    ) -> CacheResult<()> {
        let mut buf = [0u8; 8];
        pread(file, &mut buf, offset)?;
        pwrite(file, &update(u64::from_le_bytes(buf)).to_le_bytes(), offset)?;
        Ok(())
    }
}

impl Bundle for BundleV1 {
    fn open(base: PathBuf, offset: (u32, u32)) -> Self {
        Self {
            bundle: path_with_suffix(&base, ".bundle"),
            index: path_with_suffix(&base, ".bundlx"),
            base,
            offset,
        }
    }

    fn lock_path(&self) -> PathBuf {
        path_with_suffix(&self.base, ".lck")
    }

    fn file_paths(&self) -> Vec<PathBuf> {
        vec![self.bundle.clone(), self.index.clone()]
    }

    fn is_cached(&self, xy: (u32, u32)) -> CacheResult<bool> {
        let offset = self.record_offset(xy)?;
        if offset == 0 {
            return Ok(false);
        }
        let Some(mut file) = open_optional(&self.bundle)? else {
            return Ok(false);
        };
        Ok(self.record_size(&mut file, offset)? > 0)
    }

    fn load_tile(&self, xy: (u32, u32)) -> CacheResult<Option<Bytes>> {
        let offset = self.record_offset(xy)?;
        if offset == 0 {
            return Ok(None);
        }
        let Some(mut file) = open_optional(&self.bundle)? else {
            return Ok(None);
        };
        let size = self.record_size(&mut file, offset)?;
        if size == 0 {
            return Ok(None);
        }
        let mut data = vec![0u8; size as usize];
        pread(&mut file, &mut data, offset + 4)
            .map_err(|_| corrupt(&self.bundle, "tile record past end of file"))?;
        Ok(Some(Bytes::from(data)))
    }

    fn store_tile(&self, xy: (u32, u32), data: &[u8]) -> CacheResult<()> {
        self.init_bundle()?;
        self.init_index()?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.bundle)?;

        // an overwrite keeps the tile count; a fresh slot raises it
        let prev_offset = self.record_offset(xy)?;
        let is_new_tile = prev_offset == 0 || self.record_size(&mut file, prev_offset)? == 0;

        file.seek(SeekFrom::End(0))?;
        let offset = file.stream_position()?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(data)?;

        let mut max_size = [0u8; 4];
        pread(&mut file, &mut max_size, MAX_RECORD_SIZE_OFFSET)?;
        if (data.len() as u32) > u32::from_le_bytes(max_size) {
            pwrite(
                &mut file,
                &(data.len() as u32).to_le_bytes(),
                MAX_RECORD_SIZE_OFFSET,
            )?;
        }
        self.patch_header_u64(&mut file, BUNDLE_SIZE_OFFSET, |v| {
            v + data.len() as u64 + 4
        })?;
        if is_new_tile {
            self.patch_header_u64(&mut file, TILE_COUNT_OFFSET, |v| v + 4)?;
        }

        // data must be durable before the index points at it
        file.sync_data()?;
        let mut index = OpenOptions::new().write(true).open(&self.index)?;
        pwrite(&mut index, &offset.to_le_bytes()[..5], Self::index_entry_offset(xy))?;
        index.sync_data()?;
        Ok(())
    }

    fn remove_tile(&self, xy: (u32, u32)) -> CacheResult<()> {
        self.init_index()?;
        let mut index = OpenOptions::new().write(true).open(&self.index)?;
        pwrite(&mut index, &[0u8; 5], Self::index_entry_offset(xy))?;
        index.sync_data()?;
        Ok(())
    }

    fn size(&self) -> CacheResult<(u64, u64)> {
        let Some(mut file) = open_optional(&self.bundle)? else {
            return Ok((0, 0));
        };
        let file_size = file.metadata()?.len();
        let mut used = BUNDLE_HEADER_SIZE + TILES * 4;
        for x in 0..BUNDLE_GRID_WIDTH {
            for y in 0..BUNDLE_GRID_HEIGHT {
                let offset = self.record_offset((x, y))?;
                if offset == 0 {
                    continue;
                }
                let size = self.record_size(&mut file, offset)?;
                if size > 0 {
                    used += size as u64 + 4;
                }
            }
        }
        Ok((used, file_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(dir: &TempDir) -> BundleV1 {
        BundleV1::open(dir.path().join("L12").join("R0380C1380"), (4992, 896))
    }

    fn read_u64(path: &std::path::Path, offset: u64, width: usize) -> u64 {
        let mut file = std::fs::File::open(path).unwrap();
        let mut buf = [0u8; 8];
        pread(&mut file, &mut buf[..width], offset).unwrap();
        u64::from_le_bytes(buf)
    }

    #[test]
    fn test_creates_bundle_and_index() {
        let dir = TempDir::new().unwrap();
        let b = bundle(&dir);
        assert!(!b.bundle.exists());
        b.store_tile((0, 0), &[1, 2, 3]).unwrap();
        assert!(b.bundle.exists());
        assert!(b.index.exists());
        assert_eq!(
            std::fs::metadata(&b.index).unwrap().len(),
            BUNDLEX_HEADER_SIZE + TILES * 5 + 16
        );
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let b = bundle(&dir);
        b.store_tile((8, 104), &[0x61; 4000]).unwrap();

        assert!(b.is_cached((8, 104)).unwrap());
        let data = b.load_tile((8, 104)).unwrap().unwrap();
        assert_eq!(data.len(), 4000);

        // every other slot in the block is absent
        assert!(!b.is_cached((8, 105)).unwrap());
        assert_eq!(b.load_tile((7, 104)).unwrap(), None);
    }

    #[test]
    fn test_header_accounting() {
        let dir = TempDir::new().unwrap();
        let b = bundle(&dir);
        b.store_tile((8, 104), &[0x61; 4000]).unwrap();

        // grid extent of the block
        assert_eq!(read_u64(&b.bundle, 44, 4), 896); // y0
        assert_eq!(read_u64(&b.bundle, 48, 4), 1023); // y1
        assert_eq!(read_u64(&b.bundle, 52, 4), 4992); // x0
        assert_eq!(read_u64(&b.bundle, 56, 4), 5119); // x1

        let base = BUNDLE_HEADER_SIZE + TILES * 4;
        assert_eq!(read_u64(&b.bundle, BUNDLE_SIZE_OFFSET, 8), base + 4004);
        assert_eq!(read_u64(&b.bundle, MAX_RECORD_SIZE_OFFSET, 4), 4000);
        assert_eq!(read_u64(&b.bundle, TILE_COUNT_OFFSET, 8), 4);

        // overwrite: size grows, tile count does not
        b.store_tile((8, 104), &[0x62; 6000]).unwrap();
        assert_eq!(
            read_u64(&b.bundle, BUNDLE_SIZE_OFFSET, 8),
            base + 4004 + 6004
        );
        assert_eq!(read_u64(&b.bundle, MAX_RECORD_SIZE_OFFSET, 4), 6000);
        assert_eq!(read_u64(&b.bundle, TILE_COUNT_OFFSET, 8), 4);

        // a second tile raises the count
        b.store_tile((0, 0), &[0x63; 1000]).unwrap();
        assert_eq!(read_u64(&b.bundle, TILE_COUNT_OFFSET, 8), 8);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let b = bundle(&dir);
        b.store_tile((3, 4), &[9; 50]).unwrap();
        b.remove_tile((3, 4)).unwrap();
        assert!(!b.is_cached((3, 4)).unwrap());
        assert_eq!(b.load_tile((3, 4)).unwrap(), None);
    }

    #[test]
    fn test_size_accounting() {
        let dir = TempDir::new().unwrap();
        let b = bundle(&dir);
        b.store_tile((0, 0), &[1; 100]).unwrap();
        b.store_tile((0, 0), &[2; 100]).unwrap();
        let (used, file_size) = b.size().unwrap();
        assert_eq!(file_size - used, 104);
    }
}
