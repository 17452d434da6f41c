//! Byte layout of the coordination block.
//!
//! The block is read and written by unrelated processes, so its layout is
//! fixed here rather than left to the compiler. Integers are native-endian:
//! the block never leaves the machine.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ off  0 │ is_primary        u8   (0 or 1)                             │
//! │ off  1 │ reserved          [u8; 3], always zero                      │
//! │ off  4 │ secondary_count   u32                                       │
//! │ off  8 │ primary_pid       i64  (-1 when there is no primary)        │
//! │ off 16 │ primary_user      [u8; 128] UTF-8, NUL padded               │
//! │ off144 │ checksum          u16  over bytes [0, 144)                  │
//! │ off146 │ reserved          [u8; 6], always zero                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum must stay the last meaningful field: it covers every byte in
//! front of it, reserved bytes included, and is rewritten after every change.

use sole_core::checksum16;

const IS_PRIMARY_OFFSET: usize = 0;
const SECONDARY_COUNT_OFFSET: usize = 4;
const PRIMARY_PID_OFFSET: usize = 8;
const PRIMARY_USER_OFFSET: usize = 16;

/// Capacity of the user name field, NUL terminator included.
pub const PRIMARY_USER_LEN: usize = 128;

const CHECKSUM_OFFSET: usize = PRIMARY_USER_OFFSET + PRIMARY_USER_LEN;

/// Total size of the mapped region.
pub const BLOCK_SIZE: usize = 152;

/// Decoded contents of the coordination block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    /// True while the creator acts as primary and its listener is alive.
    pub is_primary: bool,
    /// Secondaries attached since the block was last reset.
    pub secondary_count: u32,
    pub primary_pid: i64,
    pub primary_user: String,
}

impl BlockState {
    /// "No primary": the state a fresh or released block carries.
    pub fn vacant() -> Self {
        Self {
            is_primary: false,
            secondary_count: 0,
            primary_pid: -1,
            primary_user: String::new(),
        }
    }

    /// Serializes into `region` and stamps a fresh checksum.
    ///
    /// # Panics
    /// Panics if `region` is shorter than [`BLOCK_SIZE`].
    pub fn write_to(&self, region: &mut [u8]) {
        let region = &mut region[..BLOCK_SIZE];
        region.fill(0);

        region[IS_PRIMARY_OFFSET] = u8::from(self.is_primary);
        region[SECONDARY_COUNT_OFFSET..SECONDARY_COUNT_OFFSET + 4]
            .copy_from_slice(&self.secondary_count.to_ne_bytes());
        region[PRIMARY_PID_OFFSET..PRIMARY_PID_OFFSET + 8]
            .copy_from_slice(&self.primary_pid.to_ne_bytes());

        let user = truncate_utf8(&self.primary_user, PRIMARY_USER_LEN - 1);
        region[PRIMARY_USER_OFFSET..PRIMARY_USER_OFFSET + user.len()]
            .copy_from_slice(user.as_bytes());

        let sum = checksum16(&region[..CHECKSUM_OFFSET]);
        region[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_ne_bytes());
    }

    /// Decodes `region` without looking at the checksum.
    pub fn read_from(region: &[u8]) -> Self {
        let user_field = &region[PRIMARY_USER_OFFSET..PRIMARY_USER_OFFSET + PRIMARY_USER_LEN];
        let user_len = user_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PRIMARY_USER_LEN);

        Self {
            is_primary: region[IS_PRIMARY_OFFSET] != 0,
            secondary_count: u32::from_ne_bytes(read_array(region, SECONDARY_COUNT_OFFSET)),
            primary_pid: i64::from_ne_bytes(read_array(region, PRIMARY_PID_OFFSET)),
            primary_user: String::from_utf8_lossy(&user_field[..user_len]).into_owned(),
        }
    }
}

/// Checksum as stored in the block.
pub fn stored_checksum(region: &[u8]) -> u16 {
    u16::from_ne_bytes(read_array(region, CHECKSUM_OFFSET))
}

/// Checksum recomputed over everything in front of the checksum field.
pub fn computed_checksum(region: &[u8]) -> u16 {
    checksum16(&region[..CHECKSUM_OFFSET])
}

pub fn is_consistent(region: &[u8]) -> bool {
    region.len() >= BLOCK_SIZE && stored_checksum(region) == computed_checksum(region)
}

#[inline]
fn read_array<const N: usize>(region: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&region[offset..offset + N]);
    out
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockState {
        BlockState {
            is_primary: true,
            secondary_count: 7,
            primary_pid: 4242,
            primary_user: "alice".into(),
        }
    }

    #[test]
    fn layout_fits_region() {
        assert!(CHECKSUM_OFFSET + 2 <= BLOCK_SIZE);
        assert_eq!(CHECKSUM_OFFSET, 144);
    }

    #[test]
    fn written_state_reads_back_and_is_consistent() {
        let mut region = [0xFFu8; BLOCK_SIZE];
        sample().write_to(&mut region);

        assert!(is_consistent(&region));
        assert_eq!(BlockState::read_from(&region), sample());
    }

    #[test]
    fn zeroed_region_is_not_consistent() {
        // A freshly created segment must not pass as a valid block.
        let region = [0u8; BLOCK_SIZE];
        assert!(!is_consistent(&region));
    }

    #[test]
    fn any_corrupted_byte_before_checksum_is_detected() {
        let mut clean = [0u8; BLOCK_SIZE];
        sample().write_to(&mut clean);

        for offset in 0..CHECKSUM_OFFSET {
            let mut region = clean;
            region[offset] ^= 0x5A;
            assert!(!is_consistent(&region), "offset {offset}");
        }
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let mut region = [0u8; BLOCK_SIZE];
        sample().write_to(&mut region);
        region[CHECKSUM_OFFSET] ^= 1;
        assert!(!is_consistent(&region));
    }

    #[test]
    fn vacant_state_has_no_primary() {
        let mut region = [0u8; BLOCK_SIZE];
        BlockState::vacant().write_to(&mut region);

        let state = BlockState::read_from(&region);
        assert!(!state.is_primary);
        assert_eq!(state.primary_pid, -1);
        assert_eq!(state.secondary_count, 0);
        assert!(state.primary_user.is_empty());
        assert!(is_consistent(&region));
    }

    #[test]
    fn long_user_names_are_truncated_on_char_boundary() {
        let mut state = sample();
        state.primary_user = "é".repeat(100); // 200 bytes

        let mut region = [0u8; BLOCK_SIZE];
        state.write_to(&mut region);

        let back = BlockState::read_from(&region);
        assert_eq!(back.primary_user, "é".repeat(63));
        assert_eq!(region[PRIMARY_USER_OFFSET + PRIMARY_USER_LEN - 1], 0);
    }
}
