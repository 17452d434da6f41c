//! Primary/secondary election over the coordination block.
//!
//! # Protocol
//!
//! 1. Try to create the segment exclusively, already populated with this
//!    process as primary. Exactly one racer can succeed.
//! 2. Everyone else attaches and, under the lock:
//!    - waits for the block to become consistent (reinitializing it once
//!      the inconsistency has outlived [`DEFAULT_INCONSISTENCY_TIMEOUT`]),
//!    - takes over as primary if the block says there is none,
//!    - otherwise bumps `secondary_count` and adopts it as instance id.
//!
//! If the segment vanishes between a failed create and the attach, the whole
//! sequence is retried once.

use crate::block::CoordinationBlock;
use crate::error::{BlockError, ElectionError};
use crate::shm_layout::BlockState;
use sole_core::{Identifier, Platform, jitter};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_INCONSISTENCY_TIMEOUT: Duration = Duration::from_secs(5);

const ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary { instance_id: u32 },
}

impl Role {
    /// `0` for the primary, the attach order for secondaries.
    pub fn instance_id(&self) -> u32 {
        match self {
            Role::Primary => 0,
            Role::Secondary { instance_id } => *instance_id,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

pub struct Elector<'a> {
    runtime_dir: PathBuf,
    identifier: Identifier,
    platform: &'a dyn Platform,
    inconsistency_timeout: Duration,
}

impl<'a> Elector<'a> {
    pub fn new(runtime_dir: impl Into<PathBuf>, identifier: Identifier, platform: &'a dyn Platform) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            identifier,
            platform,
            inconsistency_timeout: DEFAULT_INCONSISTENCY_TIMEOUT,
        }
    }

    pub fn with_inconsistency_timeout(mut self, timeout: Duration) -> Self {
        self.inconsistency_timeout = timeout;
        self
    }

    pub fn try_become_primary(&self) -> Result<Election, ElectionError> {
        for attempt in 0..ATTEMPTS {
            match CoordinationBlock::create_exclusive(
                &self.runtime_dir,
                &self.identifier,
                &self.primary_state(0),
            ) {
                Ok(block) => {
                    info!(identifier = %self.identifier, "created coordination block as primary");
                    return Ok(Election::new(block, Role::Primary));
                }
                Err(BlockError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            match CoordinationBlock::attach(&self.runtime_dir, &self.identifier) {
                Ok(block) => return self.join(block),
                Err(BlockError::NotFound { .. }) => {
                    debug!(attempt, "coordination block vanished before attach");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ElectionError::Vanished)
    }

    fn join(&self, mut block: CoordinationBlock) -> Result<Election, ElectionError> {
        let started = Instant::now();
        let mut guard = block.lock()?;

        let mut state = loop {
            match guard.read() {
                Ok(state) => break state,
                Err(BlockError::Corrupt) if started.elapsed() >= self.inconsistency_timeout => {
                    warn!(
                        identifier = %self.identifier,
                        waited = ?started.elapsed(),
                        "coordination block stayed inconsistent, assuming primary failure"
                    );
                    let state = BlockState::vacant();
                    guard.write(&state);
                    break state;
                }
                Err(BlockError::Corrupt) => {
                    drop(guard);
                    std::thread::sleep(jitter());
                    guard = block.lock()?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let role = if !state.is_primary {
            state = self.primary_state(state.secondary_count);
            guard.write(&state);
            info!(identifier = %self.identifier, "took over vacant coordination block as primary");
            Role::Primary
        } else {
            state.secondary_count = state.secondary_count.wrapping_add(1);
            guard.write(&state);
            debug!(instance_id = state.secondary_count, primary_pid = state.primary_pid, "joined as secondary");
            Role::Secondary {
                instance_id: state.secondary_count,
            }
        };
        drop(guard);

        Ok(Election::new(block, role))
    }

    fn primary_state(&self, secondary_count: u32) -> BlockState {
        BlockState {
            is_primary: true,
            secondary_count,
            primary_pid: self.platform.process_id(),
            primary_user: self.platform.current_os_user(),
        }
    }
}

/// Outcome of an election. A primary resets the block when this is dropped.
pub struct Election {
    block: Option<CoordinationBlock>,
    role: Role,
}

impl Election {
    fn new(block: CoordinationBlock, role: Role) -> Self {
        Self {
            block: Some(block),
            role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn primary_process_id(&mut self) -> Result<i64, BlockError> {
        match self.block.as_mut() {
            Some(block) => block.primary_process_id(),
            None => Ok(-1),
        }
    }

    pub fn primary_user_name(&mut self) -> Result<String, BlockError> {
        match self.block.as_mut() {
            Some(block) => block.primary_user_name(),
            None => Ok(String::new()),
        }
    }

    /// Gives up the role. For a primary the block is reset to "no primary"
    /// so the next process to start takes over with a zeroed counter.
    pub fn resign(mut self) -> Result<(), BlockError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), BlockError> {
        let Some(block) = self.block.take() else {
            return Ok(());
        };
        if self.role.is_primary() {
            block.release()?;
            info!("primary released coordination block");
        }
        Ok(())
    }
}

impl Drop for Election {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to reset coordination block");
        }
    }
}
