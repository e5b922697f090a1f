//! Tag codec.
//!
//! A tag travels alongside every event sent across the native boundary and
//! is echoed back with the matching reply:
//!
//! ```text
//! 63        56 55      48 47                                   0
//! ┌───────────┬──────────┬──────────────────────────────────────┐
//! │ data type │ (unused) │            sequence number           │
//! └───────────┴──────────┴──────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BridgeError;

/// Largest sequence number that fits in a tag.
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

const DATA_TYPE_SHIFT: u32 = 56;

/// Payload discriminator carried in the top byte of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    String = 0,
    Number = 1,
}

impl DataType {
    /// Map a raw discriminator back to a [`DataType`].
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DataType::String),
            1 => Some(DataType::Number),
            _ => None,
        }
    }
}

/// Pack `data_type` and `sequence` into a tag.
///
/// # Errors
///
/// Returns [`BridgeError::SequenceOverflow`] when `sequence` exceeds
/// [`MAX_SEQUENCE`]; the value is never silently truncated.
pub fn encode(data_type: DataType, sequence: u64) -> Result<u64, BridgeError> {
    if sequence > MAX_SEQUENCE {
        return Err(BridgeError::SequenceOverflow(sequence));
    }
    Ok(((data_type as u64) << DATA_TYPE_SHIFT) | sequence)
}

/// Split a tag into its raw data-type discriminator and sequence number.
pub fn decode(tag: u64) -> (u8, u64) {
    ((tag >> DATA_TYPE_SHIFT) as u8, tag & MAX_SEQUENCE)
}

/// Sequence number of `tag`.
pub fn sequence(tag: u64) -> u64 {
    tag & MAX_SEQUENCE
}

/// Hands out sequence numbers for outstanding requests.
///
/// Numbers start at 1 and wrap back to 1 after [`MAX_SEQUENCE`], so a tag is
/// only reused after 2^48 requests.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        (raw % MAX_SEQUENCE) + 1
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
