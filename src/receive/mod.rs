//! The receiving side of a sequence.

pub mod delivery;
pub mod tracker;

pub use delivery::DeliveryBuffer;
pub use tracker::{Classification, SequenceTracker};
