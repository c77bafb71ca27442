//! `FsArchive`: the append-only filesystem side of the index — block
//! headers, tx hashes, raw blocks, and undo records indexed by height/tx
//! ordinal. Kept separate from the KV store because headers/tx-hashes are
//! append-only and never rewritten, so a flat file with fixed-width records
//! is a simpler and cheaper fit than LSM-tree storage.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ArchiveError;

pub trait FsArchive: Send + Sync {
    fn fs_block_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, ArchiveError>;
    fn fs_tx_hash(&self, tx_ordinal: u32) -> Result<([u8; 32], u32), ArchiveError>;
    fn read_raw_block(&self, height: u32) -> Result<Option<Vec<u8>>, ArchiveError>;
    fn write_raw_block(&self, raw: &[u8], height: u32) -> Result<(), ArchiveError>;
    fn read_undo_info(&self, height: u32) -> Result<Option<Vec<u8>>, ArchiveError>;
    fn write_undo_info(&self, height: u32, undo: &[u8]) -> Result<(), ArchiveError>;

    /// Append one block's header hash, tx hashes, and starting tx ordinal.
    /// Called by the flush coordinator's `fs_flush` step.
    fn append_block(
        &self,
        header_hash: [u8; 32],
        tx_hashes: &[[u8; 32]],
        starting_tx_ordinal: u32,
    ) -> Result<(), ArchiveError>;
}

/// Flat-file backed archive. Headers and the per-height starting tx ordinal
/// are fixed-width records (random access by `height * record_len`); tx
/// hashes are fixed-width records indexed by `tx_ordinal`; raw blocks and
/// undo records are one file per height under `blocks/` and `undo/`.
pub struct FileArchive {
    root: PathBuf,
    headers: Mutex<File>,
    tx_hashes: Mutex<File>,
    tx_counts: Mutex<File>,
}

const HASH_LEN: u64 = 32;

impl FileArchive {
    pub fn open(root: &Path) -> Result<Self, ArchiveError> {
        fs::create_dir_all(root)?;
        fs::create_dir_all(root.join("blocks"))?;
        fs::create_dir_all(root.join("undo"))?;

        let open = |name: &str| -> Result<File, ArchiveError> {
            Ok(OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(root.join(name))?)
        };

        Ok(Self {
            root: root.to_path_buf(),
            headers: Mutex::new(open("headers.dat")?),
            tx_hashes: Mutex::new(open("tx_hashes.dat")?),
            tx_counts: Mutex::new(open("tx_counts.dat")?),
        })
    }

    fn block_path(&self, height: u32) -> PathBuf {
        self.root.join("blocks").join(height.to_string())
    }

    fn undo_path(&self, height: u32) -> PathBuf {
        self.root.join("undo").join(height.to_string())
    }

    fn read_fixed(file: &Mutex<File>, index: u64, record_len: u64) -> Result<Option<Vec<u8>>, ArchiveError> {
        let mut f = file.lock().expect("archive file mutex poisoned");
        let len = f.metadata()?.len();
        let offset = index * record_len;
        if offset + record_len > len {
            return Ok(None);
        }
        let mut buf = vec![0u8; record_len as usize];
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Binary search `tx_counts.dat` (starting tx ordinal per height) for
    /// the height whose range `[start, next)` contains `tx_ordinal`.
    fn height_for_ordinal(&self, tx_ordinal: u32) -> Result<u32, ArchiveError> {
        let mut f = self.tx_counts.lock().expect("archive file mutex poisoned");
        let len = f.metadata()?.len();
        let n = (len / 4) as u32;
        if n == 0 {
            return Err(ArchiveError::OrdinalNotFound(tx_ordinal));
        }

        let read_start = |f: &mut File, h: u32| -> Result<u32, ArchiveError> {
            f.seek(SeekFrom::Start(h as u64 * 4))?;
            Ok(f.read_u32::<LittleEndian>()?)
        };

        let (mut lo, mut hi) = (0u32, n - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            let start = read_start(&mut f, mid)?;
            if start <= tx_ordinal {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let start = read_start(&mut f, lo)?;
        if start > tx_ordinal {
            return Err(ArchiveError::OrdinalNotFound(tx_ordinal));
        }
        Ok(lo)
    }
}

impl FsArchive for FileArchive {
    fn fs_block_hashes(&self, start: u32, count: u32) -> Result<Vec<[u8; 32]>, ArchiveError> {
        let mut out = Vec::with_capacity(count as usize);
        for height in start..start + count {
            match Self::read_fixed(&self.headers, height as u64, HASH_LEN)? {
                Some(bytes) => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&bytes);
                    out.push(hash);
                }
                None => return Err(ArchiveError::HeightNotFound(height)),
            }
        }
        Ok(out)
    }

    fn fs_tx_hash(&self, tx_ordinal: u32) -> Result<([u8; 32], u32), ArchiveError> {
        let bytes = Self::read_fixed(&self.tx_hashes, tx_ordinal as u64, HASH_LEN)?
            .ok_or(ArchiveError::OrdinalNotFound(tx_ordinal))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        let height = self.height_for_ordinal(tx_ordinal)?;
        Ok((hash, height))
    }

    fn read_raw_block(&self, height: u32) -> Result<Option<Vec<u8>>, ArchiveError> {
        match fs::read(self.block_path(height)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw_block(&self, raw: &[u8], height: u32) -> Result<(), ArchiveError> {
        let path = self.block_path(height);
        let tmp = path.with_extension("tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(raw)?;
        f.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn read_undo_info(&self, height: u32) -> Result<Option<Vec<u8>>, ArchiveError> {
        match fs::read(self.undo_path(height)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_undo_info(&self, height: u32, undo: &[u8]) -> Result<(), ArchiveError> {
        let path = self.undo_path(height);
        let tmp = path.with_extension("tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(undo)?;
        f.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn append_block(
        &self,
        header_hash: [u8; 32],
        tx_hashes: &[[u8; 32]],
        starting_tx_ordinal: u32,
    ) -> Result<(), ArchiveError> {
        {
            let mut f = self.headers.lock().expect("archive file mutex poisoned");
            f.write_all(&header_hash)?;
            f.sync_all()?;
        }
        {
            let mut f = self.tx_hashes.lock().expect("archive file mutex poisoned");
            for hash in tx_hashes {
                f.write_all(hash)?;
            }
            f.sync_all()?;
        }
        {
            let mut f = self.tx_counts.lock().expect("archive file mutex poisoned");
            f.write_u32::<LittleEndian>(starting_tx_ordinal)?;
            f.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_block_hashes_and_tx_hashes() {
        let dir = TempDir::new().unwrap();
        let archive = FileArchive::open(dir.path()).unwrap();

        let h0 = [1u8; 32];
        let tx0 = [[2u8; 32], [3u8; 32]];
        archive.append_block(h0, &tx0, 0).unwrap();

        let h1 = [4u8; 32];
        let tx1 = [[5u8; 32]];
        archive.append_block(h1, &tx1, 2).unwrap();

        assert_eq!(archive.fs_block_hashes(0, 2).unwrap(), vec![h0, h1]);
        assert_eq!(archive.fs_tx_hash(0).unwrap(), ([2u8; 32], 0));
        assert_eq!(archive.fs_tx_hash(2).unwrap(), ([5u8; 32], 1));
    }

    #[test]
    fn raw_block_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = FileArchive::open(dir.path()).unwrap();
        assert!(archive.read_raw_block(7).unwrap().is_none());
        archive.write_raw_block(b"raw-bytes", 7).unwrap();
        assert_eq!(archive.read_raw_block(7).unwrap().unwrap(), b"raw-bytes");
    }

    #[test]
    fn undo_info_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = FileArchive::open(dir.path()).unwrap();
        assert!(archive.read_undo_info(3).unwrap().is_none());
        archive.write_undo_info(3, b"undo").unwrap();
        assert_eq!(archive.read_undo_info(3).unwrap().unwrap(), b"undo");
    }
}
