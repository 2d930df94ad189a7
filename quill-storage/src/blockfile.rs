//! Append-only numbered block files. Each record is framed as
//! `MAGIC | size:u32 LE | block bytes`; historical files are never
//! rewritten.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use quill_core::{CodecError, Decodable, Encodable, Reader};

use crate::db::StoreError;

/// Files roll over once they pass this size.
pub const MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

const NULL_FILE: u32 = u32::MAX;

/// Position of a serialized block (or transaction) on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockFilePos {
    pub file: u32,
    /// Offset of the block bytes, past the record framing.
    pub offset: u64,
    pub size: u32,
}

impl BlockFilePos {
    pub fn null() -> Self {
        BlockFilePos {
            file: NULL_FILE,
            offset: 0,
            size: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.file == NULL_FILE
    }
}

impl Default for BlockFilePos {
    fn default() -> Self {
        Self::null()
    }
}

impl Encodable for BlockFilePos {
    fn encode(&self, out: &mut Vec<u8>) {
        self.file.encode(out);
        self.offset.encode(out);
        self.size.encode(out);
    }
}

impl Decodable for BlockFilePos {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(BlockFilePos {
            file: u32::decode(r)?,
            offset: u64::decode(r)?,
            size: u32::decode(r)?,
        })
    }
}

/// The `blkNNNN.dat` store under one directory.
pub struct BlockFileStore {
    dir: PathBuf,
    magic: [u8; 4],
    current_file: u32,
}

impl BlockFileStore {
    pub fn open(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut current_file = 0;
        while dir.join(Self::file_name(current_file + 1)).exists() {
            current_file += 1;
        }
        Ok(BlockFileStore {
            dir,
            magic,
            current_file,
        })
    }

    fn file_name(file: u32) -> String {
        format!("blk{file:04}.dat")
    }

    fn path(&self, file: u32) -> PathBuf {
        self.dir.join(Self::file_name(file))
    }

    /// Append a serialized block, rolling to the next numbered file when the
    /// current one is full.
    pub fn append_block(&mut self, bytes: &[u8]) -> Result<BlockFilePos, StoreError> {
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(self.current_file))?;
        if handle.metadata()?.len() + bytes.len() as u64 + 8 > MAX_BLOCK_FILE_SIZE {
            self.current_file += 1;
            handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(self.current_file))?;
        }
        let start = handle.metadata()?.len();
        handle.write_all(&self.magic)?;
        handle.write_all(&(bytes.len() as u32).to_le_bytes())?;
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(BlockFilePos {
            file: self.current_file,
            offset: start + 8,
            size: bytes.len() as u32,
        })
    }

    /// Re-read raw block bytes from a recorded position.
    pub fn read_block(&self, pos: &BlockFilePos) -> Result<Vec<u8>, StoreError> {
        if pos.is_null() {
            return Err(StoreError::NullPosition);
        }
        let mut handle = File::open(self.path(pos.file))?;
        if pos.offset < 8 {
            return Err(StoreError::BadMagic);
        }
        handle.seek(SeekFrom::Start(pos.offset - 8))?;
        let mut frame = [0u8; 8];
        handle.read_exact(&mut frame)?;
        if frame[0..4] != self.magic {
            return Err(StoreError::BadMagic);
        }
        let size = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        if size != pos.size {
            return Err(StoreError::BadMagic);
        }
        let mut bytes = vec![0u8; size as usize];
        handle.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Walk every record of one file in order; used when rebuilding the
    /// transaction index from scratch.
    pub fn scan_file(&self, file: u32) -> Result<Vec<(BlockFilePos, Vec<u8>)>, StoreError> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut handle = File::open(path)?;
        let len = handle.metadata()?.len();
        let mut records = Vec::new();
        let mut at = 0u64;
        while at + 8 <= len {
            handle.seek(SeekFrom::Start(at))?;
            let mut frame = [0u8; 8];
            handle.read_exact(&mut frame)?;
            if frame[0..4] != self.magic {
                return Err(StoreError::BadMagic);
            }
            let size = u32::from_le_bytes(frame[4..8].try_into().unwrap()) as u64;
            if at + 8 + size > len {
                return Err(StoreError::BadMagic);
            }
            let mut bytes = vec![0u8; size as usize];
            handle.read_exact(&mut bytes)?;
            records.push((
                BlockFilePos {
                    file,
                    offset: at + 8,
                    size: size as u32,
                },
                bytes,
            ));
            at += 8 + size;
        }
        Ok(records)
    }

    pub fn file_count(&self) -> u32 {
        self.current_file + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockFileStore::open(dir.path(), *b"test").unwrap();
        let a = store.append_block(b"first block").unwrap();
        let b = store.append_block(b"second, longer block").unwrap();
        assert_eq!(store.read_block(&a).unwrap(), b"first block");
        assert_eq!(store.read_block(&b).unwrap(), b"second, longer block");

        let records = store.scan_file(0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, a);
        assert_eq!(records[1].1, b"second, longer block");
    }

    #[test]
    fn reopen_finds_current_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BlockFileStore::open(dir.path(), *b"test").unwrap();
            store.append_block(b"persisted").unwrap();
        }
        let store = BlockFileStore::open(dir.path(), *b"test").unwrap();
        assert_eq!(store.file_count(), 1);
        let records = store.scan_file(0).unwrap();
        assert_eq!(records[0].1, b"persisted");
    }

    #[test]
    fn wrong_magic_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let pos = {
            let mut store = BlockFileStore::open(dir.path(), *b"aaaa").unwrap();
            store.append_block(b"data").unwrap()
        };
        let other = BlockFileStore::open(dir.path(), *b"bbbb").unwrap();
        assert!(matches!(other.read_block(&pos), Err(StoreError::BadMagic)));
    }
}
