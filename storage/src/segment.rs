//! A segment is one append-only log file plus an in-memory key → offset index.
//!
//! The active (last) segment is backed by a pre-sized [`memmap2::MmapMut`], the same
//! technique the teacher's `Log` wrapper uses: the file is extended to its maximum
//! size up front and writes land directly in the mapped region. On rotation the
//! segment is frozen: the file is truncated to its actually-used length and reopened
//! read-only, so later reads never see the zero-padded tail of the original
//! pre-allocation. Frozen reads use positional `read_at` over a single kept-open
//! handle, avoiding both a fresh `open()` per read and any shared seek cursor.

use memmap2::{Mmap, MmapMut};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

use crate::record::{self, Record};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error("offset {0} is out of bounds for this segment")]
    OutOfBounds(u64),
    #[error("segment is frozen and cannot be written to")]
    Frozen,
}

enum Backing {
    /// Writable: file pre-allocated to `max_size`, mapped for read+write.
    Active { file: File, mmap: MmapMut, max_size: u64 },
    /// Read-only: file truncated to its real content length.
    Frozen { file: File },
}

impl Backing {
    fn read_exact_at(&self, offset: u64, len: u32) -> Result<Vec<u8>, Error> {
        let len = len as usize;
        match self {
            Backing::Active { mmap, .. } => {
                let start = offset as usize;
                let end = start
                    .checked_add(len)
                    .ok_or(Error::OutOfBounds(offset))?;
                if end > mmap.len() {
                    return Err(Error::OutOfBounds(offset));
                }
                Ok(mmap[start..end].to_vec())
            }
            Backing::Frozen { file } => {
                let mut buf = vec![0u8; len];
                #[cfg(unix)]
                file.read_exact_at(&mut buf, offset)?;
                #[cfg(not(unix))]
                {
                    use std::io::{Read, Seek, SeekFrom};
                    let mut f = file.try_clone()?;
                    f.seek(SeekFrom::Start(offset))?;
                    f.read_exact(&mut buf)?;
                }
                Ok(buf)
            }
        }
    }
}

pub(crate) fn segment_file_name(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("current-data{ordinal}"))
}

/// Name for a merged segment's scratch file while compaction is still
/// writing it. Deliberately outside the `current-data*` naming scheme so a
/// leftover temp file from a crash mid-compaction is never mistaken for a
/// real segment by `Store::open`'s directory scan.
pub(crate) fn compaction_temp_file_name(dir: &Path, ordinal: u64) -> PathBuf {
    dir.join(format!("compacting-data{ordinal}"))
}

pub struct Segment {
    path: PathBuf,
    ordinal: u64,
    index: RwLock<HashMap<Vec<u8>, u64>>,
    backing: RwLock<Backing>,
}

impl Segment {
    /// Create a brand-new, empty, writable segment at the given ordinal.
    pub fn create(dir: &Path, ordinal: u64, max_size: u64) -> Result<Self, Error> {
        Self::create_at(segment_file_name(dir, ordinal), ordinal, max_size)
    }

    /// Create a brand-new, empty, writable segment at an explicit path. Used
    /// for a merged segment's scratch file, which is written under a
    /// temporary name and relocated once compaction succeeds.
    pub(crate) fn create_at(path: PathBuf, ordinal: u64, max_size: u64) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(max_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let max_size = mmap.len() as u64;

        Ok(Self {
            path,
            ordinal,
            index: RwLock::new(HashMap::new()),
            backing: RwLock::new(Backing::Active { file, mmap, max_size }),
        })
    }

    /// Open an existing segment file as the (still-writable) active segment and
    /// recover its index by scanning from the start, tolerating a truncated
    /// trailing record. Returns the segment and the write offset to resume at.
    pub fn recover_active(dir: &Path, ordinal: u64, max_size: u64) -> Result<(Self, u64), Error> {
        let path = segment_file_name(dir, ordinal);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let current_len = file.metadata()?.len();
        if current_len < max_size {
            file.set_len(max_size)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mapped_len = mmap.len() as u64;

        let mut index = HashMap::new();
        let used_offset = scan_records(&mmap, current_len.min(max_size), |rec, offset| {
            if rec.tombstone {
                index.remove(&rec.key);
            } else {
                index.insert(rec.key.clone(), offset);
            }
        });

        let segment = Self {
            path,
            ordinal,
            index: RwLock::new(index),
            backing: RwLock::new(Backing::Active {
                file,
                mmap,
                max_size: mapped_len,
            }),
        };
        Ok((segment, used_offset))
    }

    /// Open an already-rotated segment file read-only, rebuilding its index by a
    /// full scan (no index is persisted to disk).
    pub fn open_frozen(dir: &Path, ordinal: u64) -> Result<Self, Error> {
        let path = segment_file_name(dir, ordinal);
        let file = OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };

        let mut index = HashMap::new();
        scan_records(&mmap, len, |rec, offset| {
            if rec.tombstone {
                index.remove(&rec.key);
            } else {
                index.insert(rec.key.clone(), offset);
            }
        });
        drop(mmap);

        Ok(Self {
            path,
            ordinal,
            index: RwLock::new(index),
            backing: RwLock::new(Backing::Frozen { file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Reassign this segment's path and ordinal after its backing file has
    /// been relocated on disk (used when a merged segment's scratch file is
    /// renamed into its final, logically-ordered slot).
    pub(crate) fn relocate(&mut self, path: PathBuf, ordinal: u64) {
        self.path = path;
        self.ordinal = ordinal;
    }

    /// Append a record to this (active) segment at `offset`, updating the index.
    /// `offset` must equal the segment's current write cursor as tracked by `Store`.
    /// Grows the backing file (and remaps it) on demand when a single record
    /// does not fit within the segment's current mapped size; the rotation
    /// size limit bounds when a *new* segment is started, not the size of any
    /// one record within it.
    pub fn append(&self, record: &Record, offset: u64) -> Result<usize, Error> {
        let encoded = record.encode();
        {
            let mut backing = self.backing.write().unwrap();
            match &mut *backing {
                Backing::Active { file, mmap, max_size } => {
                    let start = offset as usize;
                    let end = start + encoded.len();
                    if end as u64 > *max_size {
                        let new_size = end as u64;
                        file.set_len(new_size)?;
                        *mmap = unsafe { MmapMut::map_mut(file)? };
                        *max_size = new_size;
                    }
                    mmap[start..end].copy_from_slice(&encoded);
                }
                Backing::Frozen { .. } => return Err(Error::Frozen),
            }
        }

        let mut index = self.index.write().unwrap();
        index.remove(&record.key);
        if !record.tombstone {
            index.insert(record.key.clone(), offset);
        }

        Ok(encoded.len())
    }

    /// Flush the active mapping to disk.
    pub fn flush(&self) -> Result<(), Error> {
        let backing = self.backing.read().unwrap();
        if let Backing::Active { mmap, .. } = &*backing {
            mmap.flush_async()?;
        }
        Ok(())
    }

    /// Freeze this segment: flush, truncate the file to `used_len`, and reopen
    /// read-only. No-op if already frozen.
    pub fn freeze(&self, used_len: u64) -> Result<(), Error> {
        let mut backing = self.backing.write().unwrap();
        if matches!(&*backing, Backing::Frozen { .. }) {
            return Ok(());
        }
        if let Backing::Active { mmap, file, .. } = &*backing {
            mmap.flush()?;
            file.set_len(used_len)?;
        }
        let file = OpenOptions::new().read(true).open(&self.path)?;
        *backing = Backing::Frozen { file };
        Ok(())
    }

    /// Does the index contain `key`?
    pub fn offset_of(&self, key: &[u8]) -> Option<u64> {
        self.index.read().unwrap().get(key).copied()
    }

    /// Read the value stored at `offset`. Returns `Ok(None)` for a tombstone.
    pub fn read(&self, offset: u64) -> Result<Option<Vec<u8>>, Error> {
        let backing = self.backing.read().unwrap();
        let prefix = backing.read_exact_at(offset, 4)?;
        let total_size = Record::decode_len_prefix(&prefix)?;
        let body = backing.read_exact_at(offset + 4, total_size)?;
        let record = Record::decode_body(&body)?;
        if record.tombstone {
            Ok(None)
        } else {
            Ok(Some(record.value))
        }
    }

    /// Snapshot of `(key, offset)` pairs currently indexed, for compaction.
    pub fn index_snapshot(&self) -> Vec<(Vec<u8>, u64)> {
        self.index
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.read().unwrap().contains_key(key)
    }
}

/// Scan raw log bytes, calling `on_record(record, offset)` for every complete
/// record found, stopping cleanly at a truncated trailing record (or at `len`).
/// Returns the offset just past the last complete record: the resumable write
/// cursor / the length to truncate a frozen file to.
fn scan_records(bytes: &[u8], len: u64, mut on_record: impl FnMut(&Record, u64)) -> u64 {
    let len = len as usize;
    let mut offset = 0usize;
    loop {
        if offset + 4 > len {
            break;
        }
        let total_size = match Record::decode_len_prefix(&bytes[offset..offset + 4]) {
            Ok(v) => v as usize,
            Err(_) => break,
        };
        let body_start = offset + 4;
        let body_end = body_start + total_size;
        if body_end > len {
            break;
        }
        match Record::decode_body(&bytes[body_start..body_end]) {
            Ok(record) => {
                on_record(&record, offset as u64);
                offset = body_end;
            }
            Err(_) => break,
        }
    }
    offset as u64
}
