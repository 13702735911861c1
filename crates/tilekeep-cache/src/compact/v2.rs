//! Compact bundle format v2: embedded index, 64-byte header

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
const INDEX_SIZE: u64 = TILES * 8;
const HEADER_SIZE: u64 = 64;

/// Byte offset of the max-record-size header field
const MAX_RECORD_SIZE_OFFSET: u64 = 8;
/// Byte offset of the file-size header field
const FILE_SIZE_OFFSET: u64 = 24;

/// Offsets are stored in the low 40 bits of an index word
const OFFSET_MASK: u64 = (1 << 40) - 1;

/// A v2 bundle: 64-byte header, 128*128 8-byte index words, then records
/// of `len(u32 LE) || payload`. The index word packs `size << 40 | offset`
/// where `offset` points at the first payload byte.
pub struct BundleV2 {
    filename: PathBuf,
    base: PathBuf,
}

impl BundleV2 {
    fn header() -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        // version, numRecords, maxRecordSize, offsetSize
        for v in [3u32, TILES as u32, 0, 5] {
            cursor.write_all(&v.to_le_bytes()).expect("fixed buffer");
        }
        // slack, fileSize, userHeaderOffset
        for v in [0u64, HEADER_SIZE + INDEX_SIZE, 40] {
            cursor.write_all(&v.to_le_bytes()).expect("fixed buffer");
        }
        // userHeaderSize + legacy constants + indexSize
        for v in [
            20 + INDEX_SIZE as u32,
            3,
            16,
            TILES as u32,
            5,
            INDEX_SIZE as u32,
        ] {
            cursor.write_all(&v.to_le_bytes()).expect("fixed buffer");
        }
        buf
    }

    /// Create the bundle file with an empty index if it does not exist.
    /// Deferred to write paths so read-only caches never grow new files.
    fn init(&self) -> CacheResult<()> {
        if self.filename.exists() {
            return Ok(());
        }
        ensure_directory(&self.filename, None)?;
        let mut buf = Vec::with_capacity((HEADER_SIZE + INDEX_SIZE) as usize);
        buf.extend_from_slice(&Self::header());
        // absent tiles carry an offset of 4 and a size of 0
        for _ in 0..TILES {
            buf.extend_from_slice(&4u64.to_le_bytes());
        }
        write_atomic(&self.filename, &buf, None)?;
        Ok(())
    }

    fn index_offset(xy: (u32, u32)) -> u64 {
        HEADER_SIZE + (xy.0 as u64 + BUNDLE_GRID_WIDTH as u64 * xy.1 as u64) * 8
    }

    /// `(offset, size)` of the tile record; size 0 marks an absent tile
    fn offset_size(&self, file: &mut std::fs::File, xy: (u32, u32)) -> CacheResult<(u64, u64)> {
        let mut word = [0u8; 8];
        pread(file, &mut word, Self::index_offset(xy))
            .map_err(|_| corrupt(&self.filename, "truncated index"))?;
        let val = u64::from_le_bytes(word);
        let size = val >> 40;
        if size == 0 {
            return Ok((0, 0));
        }
        Ok((val & OFFSET_MASK, size))
    }
}

impl Bundle for BundleV2 {
    fn open(base: PathBuf, _offset: (u32, u32)) -> Self {
        Self {
            filename: path_with_suffix(&base, ".bundle"),
            base,
        }
    }

    fn lock_path(&self) -> PathBuf {
        path_with_suffix(&self.base, ".lck")
    }

    fn file_paths(&self) -> Vec<PathBuf> {
        vec![self.filename.clone()]
    }

    fn is_cached(&self, xy: (u32, u32)) -> CacheResult<bool> {
        let Some(mut file) = open_optional(&self.filename)? else {
            return Ok(false);
        };
        Ok(self.offset_size(&mut file, xy)?.1 != 0)
    }

    fn load_tile(&self, xy: (u32, u32)) -> CacheResult<Option<Bytes>> {
        let Some(mut file) = open_optional(&self.filename)? else {
            return Ok(None);
        };
        let (offset, size) = self.offset_size(&mut file, xy)?;
        if size == 0 {
            return Ok(None);
        }
        let mut data = vec![0u8; size as usize];
        pread(&mut file, &mut data, offset)
            .map_err(|_| corrupt(&self.filename, "tile record past end of file"))?;
        Ok(Some(Bytes::from(data)))
    }

    fn store_tile(&self, xy: (u32, u32), data: &[u8]) -> CacheResult<()> {
        self.init()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.filename)?;

        // append record: length prefix, then payload
        file.seek(SeekFrom::End(0))?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        let offset = file.stream_position()?;
        file.write_all(data)?;

        // header bookkeeping
        let file_size = offset + data.len() as u64;
        pwrite(&mut file, &file_size.to_le_bytes(), FILE_SIZE_OFFSET)?;
        let mut max_size = [0u8; 4];
        pread(&mut file, &mut max_size, MAX_RECORD_SIZE_OFFSET)?;
        if (data.len() as u32) > u32::from_le_bytes(max_size) {
            pwrite(
                &mut file,
                &(data.len() as u32).to_le_bytes(),
                MAX_RECORD_SIZE_OFFSET,
            )?;
        }

        // data must be durable before the index points at it
        file.sync_data()?;
        let word = offset | ((data.len() as u64) << 40);
        pwrite(&mut file, &word.to_le_bytes(), Self::index_offset(xy))?;
        file.sync_data()?;
        Ok(())
    }

    fn remove_tile(&self, xy: (u32, u32)) -> CacheResult<()> {
        self.init()?;
        let mut file = OpenOptions::new().write(true).open(&self.filename)?;
        pwrite(&mut file, &0u64.to_le_bytes(), Self::index_offset(xy))?;
        file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> CacheResult<(u64, u64)> {
        let Some(mut file) = open_optional(&self.filename)? else {
            return Ok((0, 0));
        };
        let file_size = file.metadata()?.len();
        let mut used = HEADER_SIZE + INDEX_SIZE;
        let mut index = vec![0u8; INDEX_SIZE as usize];
        pread(&mut file, &mut index, HEADER_SIZE)
            .map_err(|_| corrupt(&self.filename, "truncated index"))?;
        for word in index.chunks_exact(8) {
            let val = u64::from_le_bytes(word.try_into().expect("8-byte chunks"));
            let size = val >> 40;
            if size > 0 {
                used += size + 4;
            }
        }
        Ok((used, file_size))
    }
}
