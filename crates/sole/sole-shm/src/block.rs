//! The coordination block: a small shared segment plus the named lock that
//! serializes every access to it.
//!
//! Nothing outside a [`BlockGuard`] can see the mapped bytes. Callers copy a
//! [`BlockState`] out, change it, and copy it back while the guard is alive;
//! the lock is released when the guard drops, on every exit path.

use crate::error::BlockError;
use crate::shm_layout::{self, BLOCK_SIZE, BlockState};
use sole_core::Identifier;
use sole_mmap::{MmapFileMut, NamedLock, NamedLockGuard};
use std::path::{Path, PathBuf};

/// Location of the shared segment for `identifier` inside `dir`.
pub fn segment_path(dir: &Path, identifier: &Identifier) -> PathBuf {
    dir.join(format!("{identifier}.shm"))
}

/// Location of the lock file guarding the segment.
pub fn lock_path(dir: &Path, identifier: &Identifier) -> PathBuf {
    dir.join(format!("{identifier}.lock"))
}

pub struct CoordinationBlock {
    map: MmapFileMut,
    lock: NamedLock,
}

impl CoordinationBlock {
    /// Creates the segment, failing with [`BlockError::AlreadyExists`] if any
    /// process got there first.
    ///
    /// `initial` is written before the lock is released, so an attacher can
    /// never observe the zero-filled region.
    pub fn create_exclusive(
        dir: &Path,
        identifier: &Identifier,
        initial: &BlockState,
    ) -> Result<Self, BlockError> {
        let lock = open_lock(dir, identifier)?;
        let path = segment_path(dir, identifier);

        let map = {
            let _guard = acquire(&lock)?;
            let mut map = MmapFileMut::create_exclusive(&path, BLOCK_SIZE as u64)
                .map_err(|e| BlockError::io(&path, e))?;
            initial.write_to(map.as_mut_slice());
            map
        };

        Ok(Self { map, lock })
    }

    /// Maps an existing segment, failing with [`BlockError::NotFound`] if it
    /// does not exist.
    pub fn attach(dir: &Path, identifier: &Identifier) -> Result<Self, BlockError> {
        let lock = open_lock(dir, identifier)?;
        let path = segment_path(dir, identifier);

        let map = {
            let _guard = acquire(&lock)?;
            MmapFileMut::open_rw(&path, BLOCK_SIZE as u64).map_err(|e| BlockError::io(&path, e))?
        };

        Ok(Self { map, lock })
    }

    /// Blocks until this process holds the cross-process lock.
    pub fn lock(&mut self) -> Result<BlockGuard<'_>, BlockError> {
        let Self { map, lock, .. } = self;
        let guard = acquire(lock)?;
        Ok(BlockGuard {
            region: &mut map.as_mut_slice()[..BLOCK_SIZE],
            _lock: guard,
        })
    }

    /// Pid of the current primary, `-1` if there is none or the block is corrupt.
    pub fn primary_process_id(&mut self) -> Result<i64, BlockError> {
        let guard = self.lock()?;
        Ok(guard.read().map(|s| s.primary_pid).unwrap_or(-1))
    }

    /// User the primary runs as, empty if there is none or the block is corrupt.
    pub fn primary_user_name(&mut self) -> Result<String, BlockError> {
        let guard = self.lock()?;
        Ok(guard.read().map(|s| s.primary_user).unwrap_or_default())
    }

    /// Resets the block to "no primary" and unmaps it.
    ///
    /// The segment file stays in place: lingering secondaries may still have
    /// it mapped, and the next process to start takes over the reset block.
    pub fn release(mut self) -> Result<(), BlockError> {
        let mut guard = self.lock()?;
        guard.write(&BlockState::vacant());
        Ok(())
    }
}

/// Exclusive access to the block contents for the guard's lifetime.
pub struct BlockGuard<'a> {
    region: &'a mut [u8],
    _lock: NamedLockGuard<'a>,
}

impl BlockGuard<'_> {
    /// Copies the state out, or reports [`BlockError::Corrupt`] on a checksum mismatch.
    pub fn read(&self) -> Result<BlockState, BlockError> {
        if !shm_layout::is_consistent(self.region) {
            return Err(BlockError::Corrupt);
        }
        Ok(BlockState::read_from(self.region))
    }

    pub fn is_consistent(&self) -> bool {
        shm_layout::is_consistent(self.region)
    }

    /// Copies `state` in and recomputes the checksum.
    pub fn write(&mut self, state: &BlockState) {
        state.write_to(self.region);
    }
}

fn open_lock(dir: &Path, identifier: &Identifier) -> Result<NamedLock, BlockError> {
    let path = lock_path(dir, identifier);
    NamedLock::open(&path).map_err(|source| BlockError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn acquire(lock: &NamedLock) -> Result<NamedLockGuard<'_>, BlockError> {
    lock.acquire().map_err(|source| BlockError::Io {
        path: lock.path().display().to_string(),
        source,
    })
}
