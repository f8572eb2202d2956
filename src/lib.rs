//! This is the reliability layer for message-oriented RPC: it turns an unreliable transport that
//!  may lose, reorder and duplicate frames into sessions that deliver messages exactly once,
//!  optionally in order.
//!
//! ## Design goals
//!
//! * Each session consists of two *sequences*, one per direction. A sequence is identified by a
//!   random id, and its messages are numbered starting at 1
//!   * the initiator offers the id of its input sequence when creating the session, the acceptor
//!     returns the id of the other one
//! * The sender retains every message until it is acknowledged, retransmitting it based on an
//!   adaptive retry timeout (RTT estimation, exponential back-off) and on gaps in the
//!   acknowledgments
//!   * the number of messages in flight is limited by a congestion window (slow start, additive
//!     increase, multiplicative decrease on timeout) and by the receiver's advertised buffer space
//!   * senders wait in a FIFO queue for room in the window - they are suspended, not blocked
//! * The receiver acknowledges the set of received numbers as a list of ranges, coalescing
//!   acknowledgments for a configurable interval
//!   * duplicates are never delivered to the application
//!   * in ordered mode, messages are buffered until all lower numbers were delivered
//! * Request-reply sessions produce the outcome of a request at most once: duplicates of a request
//!   get the cached reply, bit for bit
//! * Shutdown is either two-phase (CloseSequence agrees on the last number, TerminateSequence
//!   releases resources) or simplified (a last message marker, then TerminateSequence)
//! * Protocol violations by the peer fault the session, and are reported to the peer
//! * Every operation that can suspend is cancellable and has a deadline, and observes a terminal
//!   state of its session exactly once
//!
//! ## Layers
//!
//! * [sequence] - sequence ids, sequence numbers and sets of number ranges
//! * [transmission] - the sending side: transmission window, RTT estimation, congestion control
//! * [receive] - the receiving side: sequence tracker and delivery buffer
//! * [session] - the protocol state machine, timers, the reply cache, and session creation
//!
//! The wire format is out of scope: frames arrive already classified as [frames::Frame], and
//!  are sent through a [session::SessionTransport].

pub mod config;
pub mod error;
pub mod frames;
pub mod receive;
pub mod safe_converter;
pub mod sequence;
pub mod session;
pub mod test_util;
pub mod transmission;
