//! Sessions: the protocol state machine that ties a transmission window and a receiving sequence
//!  together, and drives sequence creation, acknowledgments and shutdown.

pub mod ack_scheduler;
pub mod acceptor;
mod protocol;
pub mod reply_cache;
#[allow(clippy::module_inception)]
pub mod session;
pub mod state;
pub mod timer;
pub mod transport;

pub use acceptor::{AcceptOutcome, SequenceAcceptor};
pub use session::{DeliveredMessage, RequestContext, Session};
pub use state::{SessionKind, SessionOutcome, SessionState};
pub use transport::SessionTransport;
