//! The sending side of a sequence.

pub mod congestion;
pub mod rtt;
pub mod window;

pub use window::{AckRejection, Admission, AdmissionTicket, MessageAttempt, TransmissionWindow};
