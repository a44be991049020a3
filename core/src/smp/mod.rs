/// SMP (Simple Management Protocol) wire format
///
/// - **header**: the fixed 8-byte frame header and its codec
/// - **group**: command group identifiers
///
/// Sequence numbers are drawn from a single wrapping counter so that
/// requests issued through different managers never share a tag.

pub mod group;
pub mod header;

use std::sync::atomic::{AtomicU8, Ordering};

pub use group::{McuMgrGroup, UserGroupId, PER_USER_GROUP_BASE};
pub use header::{FrameTooLarge, McuMgrHeader, McuMgrOperation, HEADER_LENGTH};

static NEXT_SEQUENCE_NUMBER: AtomicU8 = AtomicU8::new(0);

/// Allocate the next request sequence number (wraps at 255)
pub fn next_sequence_number() -> u8 {
    NEXT_SEQUENCE_NUMBER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_advance() {
        let first = next_sequence_number();
        let second = next_sequence_number();
        assert_ne!(first, second);
    }
}
