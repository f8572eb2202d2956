//! Frames exchanged between the two ends of a session. Encoding them is the transport's business:
//!  the session only ever sees frames that were already decoded and classified by kind.

use std::fmt::{Display, Formatter};
use std::time::Duration;
use bytes::Bytes;
use uuid::Uuid;
use crate::sequence::{SequenceId, SequenceNumber, SequenceRange, SequenceRangeSet};

/// Correlates a CreateSequence with its response, and identifies retransmissions of the same
///  CreateSequence.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CreateId(pub Uuid);

impl CreateId {
    pub fn new_random() -> CreateId {
        CreateId(Uuid::new_v4())
    }
}

/// Acknowledgment state of one sequence as reported by its receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckInfo {
    pub sequence_id: SequenceId,
    /// ranges as they are transmitted: they are checked for being ordered and disjoint when they
    ///  are processed
    pub ranges: Vec<SequenceRange>,
    /// set once the receiver knows the sequence's final number
    pub is_final: bool,
    /// number of messages the receiver can still buffer, if it chooses to advertise it
    pub buffer_remaining: Option<u32>,
}

impl AckInfo {
    pub fn new(sequence_id: SequenceId, ranges: &SequenceRangeSet, is_final: bool, buffer_remaining: Option<u32>) -> AckInfo {
        AckInfo {
            sequence_id,
            ranges: ranges.ranges().to_vec(),
            is_final,
            buffer_remaining,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefusalReason {
    /// the initiator did not offer a sequence for the return direction
    NoOffer,
    /// the offered sequence id is already bound to a different CreateSequence
    ConflictingOffer,
    EndpointNotFound,
    ServerTooBusy,
}

impl Display for RefusalReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RefusalReason::NoOffer => write!(f, "no offer"),
            RefusalReason::ConflictingOffer => write!(f, "conflicting offer"),
            RefusalReason::EndpointNotFound => write!(f, "endpoint not found"),
            RefusalReason::ServerTooBusy => write!(f, "server too busy"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultKind {
    InvalidAcknowledgement,
    UnknownSequence,
    MessageNumberRollover,
    LastMessageNumberExceeded,
    /// a sequence was closed, or a close / terminate arrived before it was legal
    SequenceClosed,
    SequenceTerminated,
    ReplyBeforeRequest,
    CreateSequenceRefused(RefusalReason),
}

/// A violation of the protocol, either detected locally (and reported to the peer) or reported
///  by the peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolFault {
    pub kind: FaultKind,
    pub sequence_id: Option<SequenceId>,
    pub reason: String,
}

impl ProtocolFault {
    pub fn new(kind: FaultKind, sequence_id: Option<SequenceId>, reason: impl Into<String>) -> ProtocolFault {
        ProtocolFault {
            kind,
            sequence_id,
            reason: reason.into(),
        }
    }
}

impl Display for ProtocolFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.sequence_id {
            Some(id) => write!(f, "{:?} on {}: {}", self.kind, id, self.reason),
            None => write!(f, "{:?}: {}", self.kind, self.reason),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequence {
    pub create_id: CreateId,
    /// logical name of the endpoint the session is opened to
    pub endpoint: String,
    /// the initiator's input sequence, i.e. the sequence the responder will send on
    pub offer: Option<SequenceId>,
    pub expires: Option<Duration>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceAccepted {
    /// the sequence the initiator sends on
    pub sequence_id: SequenceId,
    pub expires: Option<Duration>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    SequencedMessage {
        sequence_id: SequenceId,
        sequence_number: SequenceNumber,
        is_last: bool,
        /// `None` for a control-only last marker
        payload: Option<Bytes>,
        /// for replies: the request they answer
        relates_to: Option<SequenceNumber>,
        /// piggybacked acknowledgment of the sender's input sequence
        ack: Option<AckInfo>,
    },
    Acknowledgment(AckInfo),
    AckRequested {
        sequence_id: SequenceId,
    },
    CreateSequence(CreateSequence),
    CreateSequenceResponse {
        create_id: CreateId,
        result: Result<CreateSequenceAccepted, RefusalReason>,
    },
    CloseSequence {
        sequence_id: SequenceId,
        last: Option<SequenceNumber>,
        /// acknowledgment of the closing side's input sequence
        ack: Option<AckInfo>,
    },
    CloseSequenceResponse {
        sequence_id: SequenceId,
        ack: AckInfo,
    },
    TerminateSequence {
        sequence_id: SequenceId,
        last: Option<SequenceNumber>,
    },
    TerminateSequenceResponse {
        sequence_id: SequenceId,
    },
    Fault(ProtocolFault),
}

impl Frame {
    /// short name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::SequencedMessage { .. } => "SequencedMessage",
            Frame::Acknowledgment(_) => "Acknowledgment",
            Frame::AckRequested { .. } => "AckRequested",
            Frame::CreateSequence(_) => "CreateSequence",
            Frame::CreateSequenceResponse { .. } => "CreateSequenceResponse",
            Frame::CloseSequence { .. } => "CloseSequence",
            Frame::CloseSequenceResponse { .. } => "CloseSequenceResponse",
            Frame::TerminateSequence { .. } => "TerminateSequence",
            Frame::TerminateSequenceResponse { .. } => "TerminateSequenceResponse",
            Frame::Fault(_) => "Fault",
        }
    }
}
