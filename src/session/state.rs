use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use crate::config::{EffectiveReceiveConfig, ProtocolVariant, ReliableSessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::frames::{AckInfo, CreateId, FaultKind, Frame, ProtocolFault};
use crate::receive::{DeliveryBuffer, SequenceTracker};
use crate::sequence::{SequenceId, SequenceNumber};
use crate::session::ack_scheduler::AckScheduler;
use crate::session::reply_cache::{ReplyCache, ReplyRecord};
use crate::session::session::DeliveredMessage;
use crate::session::timer::{SessionEvent, TimerKind, TimerSlot};
use crate::transmission::{Admission, MessageAttempt, TransmissionWindow};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionKind {
    /// both sides send and receive independently
    Duplex,
    /// sends requests, and receives replies to them
    RequestReplyClient,
    /// receives requests, and replies to them through a [crate::session::RequestContext]
    RequestReplyServer,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Established,
    Closing,
    /// both sequences were shut down gracefully
    Terminated,
    Faulted,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Faulted | SessionState::Aborted)
    }
}

/// Progress of the local shutdown of the output sequence
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputState {
    Open,
    /// the last number is fixed, waiting for everything to be acknowledged
    Sealed,
    CloseSent,
    TerminateSent,
    Terminated,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    Closed,
    Aborted,
    Faulted(SessionError),
}

impl SessionOutcome {
    pub fn to_error(&self) -> SessionError {
        match self {
            SessionOutcome::Closed => SessionError::Closed,
            SessionOutcome::Aborted => SessionError::Aborted,
            SessionOutcome::Faulted(cause) => SessionError::faulted(cause.clone()),
        }
    }
}

/// Per-message data the window keeps alongside the payload, so that retransmissions are
///  identical to the first attempt
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutboundContext {
    pub relates_to: Option<SequenceNumber>,
    pub ack: Option<AckInfo>,
}

/// What an outbound message is, for the bookkeeping done when it is issued
pub enum OutboundPurpose {
    Message,
    Request(oneshot::Sender<Bytes>),
    Reply(Arc<ReplyRecord>),
    LastMarker,
}

#[derive(Debug)]
pub struct InboundItem {
    pub payload: Bytes,
    pub relates_to: Option<SequenceNumber>,
}

/// A message released by the delivery buffer, not yet handed to the application
pub struct ReleasedMessage {
    pub sequence_number: SequenceNumber,
    pub item: InboundItem,
    pub reply_record: Option<Arc<ReplyRecord>>,
}

/// Everything about a session that is guarded by the session lock. Frame handling is synchronous:
///  frames to be sent are collected in the outbox, and messages for the application in
///  `released`, both to be drained by the caller after the state change.
pub struct SessionInner {
    pub kind: SessionKind,
    pub variant: ProtocolVariant,
    pub state: SessionState,
    pub output_state: OutputState,

    pub input_id: SequenceId,
    pub output_id: Option<SequenceId>,
    pub create_id: Option<CreateId>,

    pub window: TransmissionWindow<OutboundContext>,
    pub tracker: SequenceTracker,
    pub delivery: DeliveryBuffer<InboundItem>,
    pub receive_config: Arc<EffectiveReceiveConfig>,
    pub acks: AckScheduler,
    pub retry_timer: TimerSlot,
    max_retry_count: u32,
    max_retry_timeout: Duration,

    /// a handshake frame (CreateSequence, CloseSequence, TerminateSequence) that is resent on
    ///  the retry timer until it is answered
    pub handshake_frame: Option<Frame>,
    pub handshake_retries: u32,
    handshake_timeout: Duration,
    pub open_waiter: Option<oneshot::Sender<SessionResult<()>>>,

    pub replies: ReplyCache,
    pub pending_requests: FxHashMap<SequenceNumber, oneshot::Sender<Bytes>>,
    pub requests_sent: u64,

    pub expiry: Option<Instant>,
    pub last_transport_error: Option<String>,

    pub outbox: Vec<Frame>,
    pub released: Vec<ReleasedMessage>,
    /// dropped when the session reaches a terminal state, which ends the application's receive loop
    pub app_tx: Option<mpsc::UnboundedSender<DeliveredMessage>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub completion: watch::Sender<Option<SessionOutcome>>,
}

impl SessionInner {
    pub fn new(
        config: &ReliableSessionConfig,
        kind: SessionKind,
        input_id: SequenceId,
        output_id: Option<SequenceId>,
        events: mpsc::UnboundedSender<SessionEvent>,
        app_tx: mpsc::UnboundedSender<DeliveredMessage>,
        completion: watch::Sender<Option<SessionOutcome>>,
    ) -> SessionInner {
        let transmission_config = config.get_effective_transmission_config();
        let receive_config = config.get_effective_receive_config();

        let mut delivery = DeliveryBuffer::new(receive_config.buffer_capacity, receive_config.ordered);
        let released_events = events.clone();
        delivery.set_dequeue_callback(Box::new(move |remaining| {
            let _ = released_events.send(SessionEvent::BufferReleased { remaining });
        }));

        let window = TransmissionWindow::new(transmission_config);
        let handshake_timeout = window.timeout();

        SessionInner {
            kind,
            variant: config.protocol_variant,
            state: SessionState::Created,
            output_state: OutputState::Open,
            input_id,
            output_id,
            create_id: None,
            window,
            tracker: SequenceTracker::new(input_id),
            delivery,
            acks: AckScheduler::new(receive_config.max_pending_acks, receive_config.acknowledgement_interval),
            receive_config,
            retry_timer: TimerSlot::new(TimerKind::Retry),
            max_retry_count: config.max_retry_count,
            max_retry_timeout: config.max_retry_timeout,
            handshake_frame: None,
            handshake_retries: 0,
            handshake_timeout,
            open_waiter: None,
            replies: ReplyCache::default(),
            pending_requests: FxHashMap::default(),
            requests_sent: 0,
            expiry: None,
            last_transport_error: None,
            outbox: Vec::new(),
            released: Vec::new(),
            app_tx: Some(app_tx),
            events,
            completion,
        }
    }

    pub fn take_outbox(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_released(&mut self) -> Vec<ReleasedMessage> {
        std::mem::take(&mut self.released)
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.completion.borrow().clone()
    }

    /// the error a caller observes when the session reached a terminal state
    pub fn terminal_error(&self) -> Option<SessionError> {
        self.outcome().map(|o| o.to_error())
    }

    pub fn buffer_remaining_hint(&self) -> Option<u32> {
        if self.receive_config.advertise_buffer_remaining {
            Some(self.delivery.remaining_capacity())
        }
        else {
            None
        }
    }

    pub fn current_ack(&self) -> AckInfo {
        self.tracker.build_acknowledgment(self.buffer_remaining_hint())
    }

    pub fn send_ack_now(&mut self) {
        let ack = self.current_ack();
        trace!("acknowledging {:?} on {}", self.tracker.ranges(), self.input_id);
        self.acks.on_ack_sent(ack.buffer_remaining);
        self.outbox.push(Frame::Acknowledgment(ack));
    }

    pub fn message_frame(&self, attempt: &MessageAttempt<OutboundContext>) -> Option<Frame> {
        Some(Frame::SequencedMessage {
            sequence_id: self.output_id?,
            sequence_number: attempt.sequence_number,
            is_last: attempt.is_last,
            payload: attempt.payload.clone(),
            relates_to: attempt.user_state.relates_to,
            ack: attempt.user_state.ack.clone(),
        })
    }

    /// Checks whether a message with the given purpose can be added to the output sequence now
    pub fn check_can_send(&self, purpose: &OutboundPurpose) -> SessionResult<()> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        match (self.kind, purpose) {
            (SessionKind::RequestReplyServer, OutboundPurpose::Message) |
            (SessionKind::RequestReplyServer, OutboundPurpose::Request(_)) =>
                return Err(SessionError::InvalidOperation("a request-reply server only sends replies")),
            (SessionKind::RequestReplyClient, OutboundPurpose::Reply(_)) |
            (SessionKind::Duplex, OutboundPurpose::Reply(_)) |
            (SessionKind::Duplex, OutboundPurpose::Request(_)) =>
                return Err(SessionError::InvalidOperation("only a request-reply server sends replies")),
            _ => {}
        }

        match self.state {
            SessionState::Established => Ok(()),
            // replies to requests that arrived before the close was agreed on are still sent
            SessionState::Closing if matches!(purpose, OutboundPurpose::Reply(_) | OutboundPurpose::LastMarker) => Ok(()),
            SessionState::Created => Err(SessionError::InvalidOperation("the session is not open yet")),
            _ => Err(SessionError::InvalidOperation("the session is closing")),
        }
    }

    /// Adds an outbound message to the window. Running out of sequence numbers faults the session
    ///  and tells the peer.
    pub fn add_outbound(&mut self, payload: Option<Bytes>, is_last: bool, purpose: &OutboundPurpose, now: Instant) -> SessionResult<Admission<OutboundContext>> {
        self.check_can_send(purpose)?;

        let context = match purpose {
            OutboundPurpose::Reply(record) => OutboundContext {
                relates_to: Some(record.request_number()),
                ack: Some(self.current_ack()),
            },
            _ => OutboundContext::default(),
        };
        let admission = match self.window.add(payload, is_last, context, now) {
            Err(SessionError::Rollover) => {
                let fault = ProtocolFault::new(FaultKind::MessageNumberRollover, self.output_id, "no sequence number left for the next message");
                self.fault(SessionError::Rollover, Some(fault));
                return Err(SessionError::Rollover);
            }
            other => other?,
        };

        if let OutboundPurpose::Request(_) = purpose {
            self.requests_sent += 1;
        }
        if let Admission::Blocked(_) = &admission {
            self.ensure_retry_timer();
        }
        Ok(admission)
    }

    /// Bookkeeping for a message that was admitted into the window, returning the frame to send
    pub fn on_attempt_issued(&mut self, attempt: &MessageAttempt<OutboundContext>, purpose: OutboundPurpose) -> SessionResult<Frame> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let frame = self.message_frame(attempt)
            .ok_or(SessionError::InvalidOperation("the session is not open yet"))?;

        match purpose {
            OutboundPurpose::Message | OutboundPurpose::LastMarker => {}
            OutboundPurpose::Request(reply_sender) => {
                self.pending_requests.insert(attempt.sequence_number, reply_sender);
            }
            OutboundPurpose::Reply(record) => {
                if self.window.acknowledged().contains(attempt.sequence_number) {
                    // acknowledged before we got here: nothing left to cache
                    self.replies.complete_without_reply(&record);
                }
                else {
                    self.replies.bind_reply(&record, attempt.sequence_number, frame.clone());
                }
            }
        }
        if let Some(ack) = &attempt.user_state.ack {
            self.acks.on_ack_sent(ack.buffer_remaining);
        }

        self.ensure_retry_timer();
        Ok(frame)
    }

    pub fn ensure_retry_timer(&mut self) {
        if self.retry_timer.is_armed() || self.state.is_terminal() {
            return;
        }
        if self.handshake_frame.is_some() {
            self.retry_timer.arm(self.handshake_timeout, &self.events);
        }
        else if self.window.has_unacknowledged() || self.window.is_blocked_by_quota() {
            self.retry_timer.arm(self.window.timeout(), &self.events);
        }
    }

    /// restarts the retry timer after progress, or stops it if nothing is outstanding
    pub fn restart_retry_timer(&mut self) {
        self.retry_timer.cancel();
        self.ensure_retry_timer();
    }

    pub fn start_handshake(&mut self, frame: Frame) {
        self.outbox.push(frame.clone());
        self.handshake_frame = Some(frame);
        self.handshake_retries = 0;
        self.handshake_timeout = self.window.timeout();
        self.restart_retry_timer();
    }

    pub fn finish_handshake(&mut self) {
        self.handshake_frame = None;
        self.handshake_retries = 0;
        self.restart_retry_timer();
    }

    pub fn drain_retries(&mut self, now: Instant) {
        while let Some(attempt) = self.window.get_retry_candidate(now) {
            if let Some(frame) = self.message_frame(&attempt) {
                self.outbox.push(frame);
            }
        }
    }

    pub fn on_retry_timer(&mut self, generation: u64, now: Instant) {
        if !self.retry_timer.on_fired(generation) || self.state.is_terminal() {
            return;
        }

        if let Some(frame) = self.handshake_frame.clone() {
            if self.handshake_retries >= self.max_retry_count {
                warn!("{} was not answered after {} retries", frame.kind_name(), self.handshake_retries);
                let cause = SessionError::MaxRetryExceeded(self.last_transport_error.clone());
                self.fault(cause, None);
                return;
            }
            self.handshake_retries += 1;
            self.handshake_timeout = (self.handshake_timeout * 2).min(self.max_retry_timeout);
            debug!("resending {} (retry #{})", frame.kind_name(), self.handshake_retries);
            self.outbox.push(frame);
        }

        if self.window.is_blocked_by_quota() {
            // the acknowledgment announcing room may have been lost
            if let Some(output_id) = self.output_id {
                debug!("no room advertised by the receiver of {} - requesting an acknowledgment", output_id);
                self.outbox.push(Frame::AckRequested { sequence_id: output_id });
            }
            self.ensure_retry_timer();
            return;
        }

        match self.window.on_retry_timeout(now) {
            Ok(true) => self.drain_retries(now),
            Ok(false) => {}
            Err(SessionError::MaxRetryExceeded(_)) => {
                let cause = SessionError::MaxRetryExceeded(self.last_transport_error.clone());
                self.fault(cause, None);
                return;
            }
            Err(e) => {
                self.fault(e, None);
                return;
            }
        }
        self.ensure_retry_timer();
    }

    pub fn on_ack_timer(&mut self, generation: u64) {
        if self.state.is_terminal() {
            return;
        }
        if self.acks.on_timer_fired(generation) {
            self.send_ack_now();
        }
    }

    pub fn on_buffer_released(&mut self, remaining: u32) {
        if self.state.is_terminal() {
            return;
        }
        if self.acks.on_buffer_released(remaining) {
            debug!("delivery buffer has room again - announcing {} free slots", remaining);
            self.send_ack_now();
        }
    }

    fn cancel_timers(&mut self) {
        self.retry_timer.cancel();
        self.acks.cancel();
    }

    fn release_waiters(&mut self, err: &SessionError) {
        self.pending_requests.clear();
        self.app_tx = None;
        if let Some(waiter) = self.open_waiter.take() {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Faults the session. If `fault` is given, it is reported to the peer.
    pub fn fault(&mut self, cause: SessionError, fault: Option<ProtocolFault>) {
        if self.state.is_terminal() {
            return;
        }
        error!("session {} faulted: {}", self.input_id, cause);

        self.state = SessionState::Faulted;
        self.window.fault(cause.clone());
        self.delivery.dispose();
        self.replies.clear();
        self.handshake_frame = None;
        self.cancel_timers();
        self.release_waiters(&SessionError::faulted(cause.clone()));
        self.released.clear();
        if let Some(fault) = fault {
            self.outbox.push(Frame::Fault(fault));
        }
        self.completion.send_replace(Some(SessionOutcome::Faulted(cause)));
    }

    /// Faults the session because the peer violated the protocol, reporting the violation to it
    pub fn protocol_fault(&mut self, kind: FaultKind, sequence_id: Option<SequenceId>, reason: impl Into<String>) {
        let fault = ProtocolFault::new(kind, sequence_id, reason);
        warn!("protocol violation: {}", fault);
        self.fault(SessionError::ProtocolFault(fault.clone()), Some(fault));
    }

    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!("aborting session {}", self.input_id);

        self.state = SessionState::Aborted;
        self.window.abort();
        self.delivery.dispose();
        self.replies.clear();
        self.handshake_frame = None;
        self.cancel_timers();
        self.release_waiters(&SessionError::Aborted);
        self.released.clear();
        self.completion.send_replace(Some(SessionOutcome::Aborted));
    }

    /// Transitions to `Terminated` once both directions are shut down
    pub fn check_completion(&mut self) {
        if !matches!(self.state, SessionState::Established | SessionState::Closing) {
            return;
        }
        if self.output_state != OutputState::Terminated || !self.tracker.is_terminated() {
            return;
        }

        debug!("session {} closed", self.input_id);
        self.state = SessionState::Terminated;
        self.window.close();
        self.cancel_timers();
        self.release_waiters(&SessionError::Closed);
        self.completion.send_replace(Some(SessionOutcome::Closed));
    }

    /// Fixes the output's last number and starts the shutdown handshake as far as possible.
    ///  With the simplified protocol, the last number is fixed by a last marker message instead
    ///  of sealing.
    pub fn begin_output_shutdown(&mut self) -> SessionResult<()> {
        if self.output_state != OutputState::Open {
            return Ok(());
        }
        if self.variant == ProtocolVariant::TwoPhase {
            self.window.seal()?;
        }
        self.output_state = OutputState::Sealed;
        if self.state == SessionState::Established {
            self.state = SessionState::Closing;
        }
        self.advance_output_shutdown();
        Ok(())
    }

    /// Takes the next step of the output's shutdown once everything sent is acknowledged
    pub fn advance_output_shutdown(&mut self) {
        if self.output_state != OutputState::Sealed || !self.window.is_complete() {
            return;
        }
        let Some(output_id) = self.output_id else {
            return;
        };
        let last = self.window.last_sequence_number();

        match self.variant {
            ProtocolVariant::TwoPhase => {
                debug!("all messages on {} acknowledged - closing it", output_id);
                self.output_state = OutputState::CloseSent;
                let ack = if self.tracker.is_terminated() { None } else { Some(self.current_ack()) };
                self.start_handshake(Frame::CloseSequence {
                    sequence_id: output_id,
                    last,
                    ack,
                });
            }
            ProtocolVariant::Simplified => {
                debug!("all messages on {} acknowledged - terminating it", output_id);
                if self.kind == SessionKind::RequestReplyClient && !self.tracker.is_terminated() {
                    // the server only accepts the termination once it knows all replies arrived
                    self.send_ack_now();
                }
                self.outbox.push(Frame::TerminateSequence {
                    sequence_id: output_id,
                    last,
                });
                self.on_output_terminated();
            }
        }
    }

    pub fn on_output_terminated(&mut self) {
        self.output_state = OutputState::Terminated;
        if self.kind == SessionKind::RequestReplyClient {
            // replies travel on the server's output, which ends with the request sequence
            self.tracker.mark_terminated();
        }
        self.check_completion();
    }

    /// A request-reply server's replies end with its input: the client only terminates the
    ///  request sequence when all replies are acknowledged
    pub fn on_input_terminated(&mut self) {
        if self.kind == SessionKind::RequestReplyServer && self.output_state != OutputState::Terminated {
            if let Err(e) = self.window.seal() {
                debug!("could not seal replies on terminated request sequence: {}", e);
            }
            self.output_state = OutputState::Terminated;
        }
        self.check_completion();
    }
}
