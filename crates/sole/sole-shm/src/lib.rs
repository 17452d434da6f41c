mod block;
mod election;
mod error;
mod shm_layout;

pub use block::{BlockGuard, CoordinationBlock, lock_path, segment_path};
pub use election::{DEFAULT_INCONSISTENCY_TIMEOUT, Election, Elector, Role};
pub use error::{BlockError, ElectionError};
pub use shm_layout::{BLOCK_SIZE, BlockState, PRIMARY_USER_LEN};
