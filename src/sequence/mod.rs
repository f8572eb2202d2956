//! Identifiers and sequence number bookkeeping shared by the sending and the receiving side.

pub mod ranges;
pub mod sequence_id;
pub mod sequence_number;

pub use ranges::{MalformedRanges, SequenceRange, SequenceRangeSet};
pub use sequence_id::SequenceId;
pub use sequence_number::SequenceNumber;
