//! File-backed shared mappings and named cross-process locks.
//!
//! Every process that opens the same path maps the same pages, which is what
//! the coordination block relies on. Exclusive creation uses `O_CREAT|O_EXCL`
//! so exactly one of any number of racing creators succeeds.

use fs2::FileExt;
use memmap2::MmapMut;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

pub struct MmapFileMut {
    _file: File,
    mmap: MmapMut,
}

impl MmapFileMut {
    /// Create a new file of `size_bytes` and map it read-write.
    ///
    /// Fails with `io::ErrorKind::AlreadyExists` if the path is already taken.
    /// The new region is zero-filled.
    pub fn create_exclusive<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        // The name is ours now. Don't leave a half-sized segment behind.
        let mapped = file.set_len(size_bytes).and_then(|()| {
            // SAFETY: the file was sized above and stays open for the mapping's lifetime.
            unsafe { MmapMut::map_mut(&file) }
        });
        match mapped {
            Ok(mmap) => Ok(Self { _file: file, mmap }),
            Err(e) => {
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Open an existing file and map it read-write.
    ///
    /// A file shorter than `min_len` is extended with zeros first, so a
    /// segment left truncated by a crashed creator still maps at full size.
    pub fn open_rw<P: AsRef<Path>>(path: P, min_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }

        // SAFETY: the file is at least `min_len` long and outlives the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// A lock shared by every process that opens the same path.
///
/// Backed by an advisory exclusive file lock. The lock belongs to the open
/// file description, so two `NamedLock`s on one path exclude each other even
/// inside a single process.
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    /// Open (creating if needed) the lock file at `path`. Never truncates.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Block until the lock is held. Released when the guard drops.
    pub fn acquire(&self) -> io::Result<NamedLockGuard<'_>> {
        self.file.lock_exclusive()?;
        Ok(NamedLockGuard { lock: self })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedLockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock.file);
    }
}
