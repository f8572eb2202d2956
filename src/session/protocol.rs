use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::ProtocolVariant;
use crate::error::SessionError;
use crate::frames::{AckInfo, CreateId, CreateSequenceAccepted, FaultKind, Frame, RefusalReason};
use crate::receive::Classification;
use crate::sequence::{SequenceId, SequenceNumber};
use crate::session::state::{InboundItem, OutputState, ReleasedMessage, SessionInner, SessionKind, SessionState};

/// Handling of inbound frames. Handlers only change state: frames to send go to the outbox, and
///  messages for the application to the list of released messages.
impl SessionInner {
    pub fn on_frame(&mut self, frame: Frame, now: Instant) {
        trace!("received {} on session {}", frame.kind_name(), self.input_id);

        match self.state {
            SessionState::Terminated => return self.on_frame_after_termination(frame),
            SessionState::Faulted | SessionState::Aborted => {
                trace!("session {} is {:?} - ignoring {}", self.input_id, self.state, frame.kind_name());
                return;
            }
            _ => {}
        }

        match frame {
            Frame::SequencedMessage { sequence_id, sequence_number, is_last, payload, relates_to, ack } => {
                if self.check_input_id(sequence_id) {
                    self.on_sequenced_message(sequence_number, is_last, payload, relates_to, ack, now);
                }
            }
            Frame::Acknowledgment(ack) => {
                self.process_ack(&ack, now);
            }
            Frame::AckRequested { sequence_id } => {
                if self.check_input_id(sequence_id) {
                    self.send_ack_now();
                }
            }
            Frame::CreateSequence(create) => {
                trace!("CreateSequence {:?} reached an existing session - ignoring", create.create_id);
            }
            Frame::CreateSequenceResponse { create_id, result } => {
                self.on_create_sequence_response(create_id, result, now);
            }
            Frame::CloseSequence { sequence_id, last, ack } => {
                if self.check_input_id(sequence_id) {
                    self.on_close_sequence(sequence_id, last, ack, now);
                }
            }
            Frame::CloseSequenceResponse { sequence_id, ack } => {
                if self.check_output_id(sequence_id) {
                    self.on_close_sequence_response(ack, now);
                }
            }
            Frame::TerminateSequence { sequence_id, last } => {
                if self.check_input_id(sequence_id) {
                    self.on_terminate_sequence(sequence_id, last);
                }
            }
            Frame::TerminateSequenceResponse { sequence_id } => {
                if self.check_output_id(sequence_id) {
                    self.on_terminate_sequence_response();
                }
            }
            Frame::Fault(fault) => {
                warn!("peer reported a fault: {}", fault);
                self.fault(SessionError::ProtocolFault(fault), None);
            }
        }
    }

    /// The peer may not have seen our last response, so shutdown requests are answered again
    fn on_frame_after_termination(&mut self, frame: Frame) {
        match frame {
            Frame::CloseSequence { sequence_id, .. } if sequence_id == self.input_id => {
                debug!("answering repeated CloseSequence on terminated session {}", self.input_id);
                let ack = self.current_ack();
                self.outbox.push(Frame::CloseSequenceResponse { sequence_id, ack });
            }
            Frame::TerminateSequence { sequence_id, .. } if sequence_id == self.input_id => {
                if self.variant == ProtocolVariant::TwoPhase {
                    debug!("answering repeated TerminateSequence on terminated session {}", self.input_id);
                    self.outbox.push(Frame::TerminateSequenceResponse { sequence_id });
                }
            }
            other => {
                trace!("session {} is terminated - ignoring {}", self.input_id, other.kind_name());
            }
        }
    }

    fn check_input_id(&mut self, sequence_id: SequenceId) -> bool {
        if sequence_id == self.input_id {
            return true;
        }
        self.protocol_fault(FaultKind::UnknownSequence, Some(sequence_id), format!("expected input sequence {}", self.input_id));
        false
    }

    fn check_output_id(&mut self, sequence_id: SequenceId) -> bool {
        match self.output_id {
            Some(output_id) if output_id == sequence_id => true,
            None if self.state == SessionState::Created => {
                trace!("output sequence is not established yet - ignoring frame for {}", sequence_id);
                false
            }
            _ => {
                self.protocol_fault(FaultKind::UnknownSequence, Some(sequence_id), "not this session's output sequence");
                false
            }
        }
    }

    /// Feeds an acknowledgment into the transmission window. Returns false if it was rejected,
    ///  which faults the session.
    fn process_ack(&mut self, ack: &AckInfo, now: Instant) -> bool {
        if !self.check_output_id(ack.sequence_id) {
            return false;
        }

        let acknowledged_before = self.window.acknowledged().count();
        let blocked_before = self.window.is_blocked_by_quota();
        match self.window.process_acknowledgment(&ack.ranges, ack.buffer_remaining, now) {
            Err(rejection) => {
                self.protocol_fault(FaultKind::InvalidAcknowledgement, Some(ack.sequence_id), format!("{:?} acknowledgment {:?}", rejection, ack.ranges));
                false
            }
            Ok(retries_queued) => {
                if retries_queued {
                    self.drain_retries(now);
                }

                let released = self.replies.release_acknowledged(self.window.acknowledged());
                if released > 0 {
                    trace!("released {} reply records", released);
                }

                if self.window.acknowledged().count() != acknowledged_before || (blocked_before && !self.window.is_blocked_by_quota()) {
                    self.restart_retry_timer();
                }
                else {
                    self.ensure_retry_timer();
                }

                self.advance_output_shutdown();
                true
            }
        }
    }

    fn on_sequenced_message(&mut self, number: SequenceNumber, is_last: bool, payload: Option<Bytes>, relates_to: Option<SequenceNumber>, ack: Option<AckInfo>, now: Instant) {
        if let Some(ack) = ack {
            if !self.process_ack(&ack, now) {
                return;
            }
        }

        if self.kind == SessionKind::RequestReplyClient && self.requests_sent == 0 {
            self.protocol_fault(FaultKind::ReplyBeforeRequest, Some(self.input_id), format!("message #{} arrived before any request was sent", number));
            return;
        }

        match self.tracker.classify(number, is_last) {
            Classification::OutOfRange => {
                let kind = if !number.is_assignable() {
                    FaultKind::MessageNumberRollover
                }
                else {
                    match self.variant {
                        ProtocolVariant::Simplified => FaultKind::LastMessageNumberExceeded,
                        ProtocolVariant::TwoPhase => FaultKind::SequenceClosed,
                    }
                };
                self.protocol_fault(kind, Some(self.input_id), format!("message #{} (last: {}) is out of range", number, is_last));
            }
            Classification::Duplicate => {
                trace!("duplicate message #{} on {}", number, self.input_id);
                match self.replies.get(number).and_then(|r| r.cached_reply()) {
                    Some(reply) => {
                        debug!("resending cached reply to duplicate request #{}", number);
                        self.outbox.push(reply);
                    }
                    None => self.send_ack_now(),
                }
            }
            Classification::Accept => {
                let Some(payload) = payload else {
                    debug!("received last message marker #{} on {}", number, self.input_id);
                    self.tracker.merge(number, is_last);
                    self.send_ack_now();
                    return;
                };

                if !self.delivery.can_enqueue(number) {
                    debug!("no room in delivery buffer for message #{} - dropping it", number);
                    return;
                }
                self.tracker.merge(number, is_last);
                if self.kind == SessionKind::RequestReplyServer {
                    self.replies.get_or_create(number);
                }

                let item = InboundItem { payload, relates_to };
                for (sequence_number, item) in self.delivery.enqueue(item, number) {
                    self.released.push(ReleasedMessage {
                        sequence_number,
                        item,
                        reply_record: self.replies.get(sequence_number).cloned(),
                    });
                }

                if is_last || self.acks.on_message_received(&self.events) {
                    self.send_ack_now();
                }
            }
        }
    }

    fn on_create_sequence_response(&mut self, create_id: CreateId, result: Result<CreateSequenceAccepted, RefusalReason>, now: Instant) {
        if self.state != SessionState::Created || self.create_id != Some(create_id) {
            trace!("ignoring CreateSequenceResponse for {:?}", create_id);
            return;
        }

        match result {
            Ok(accepted) => {
                debug!("sequence {} was accepted - session {} is established", accepted.sequence_id, self.input_id);
                self.output_id = Some(accepted.sequence_id);
                self.expiry = accepted.expires.map(|expires| now + expires);
                self.state = SessionState::Established;
                self.finish_handshake();
                if let Some(waiter) = self.open_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(reason) => {
                let fault = crate::frames::ProtocolFault::new(FaultKind::CreateSequenceRefused(reason), None, "the peer refused to create the sequence");
                warn!("{}", fault);
                self.fault(SessionError::ProtocolFault(fault), None);
            }
        }
    }

    fn has_open_requests(&self) -> bool {
        self.kind == SessionKind::RequestReplyServer && !self.replies.is_empty()
    }

    fn on_close_sequence(&mut self, sequence_id: SequenceId, last: Option<SequenceNumber>, ack: Option<AckInfo>, now: Instant) {
        if self.variant == ProtocolVariant::Simplified {
            self.protocol_fault(FaultKind::SequenceClosed, Some(sequence_id), "CloseSequence is not part of the simplified protocol");
            return;
        }
        if let Some(ack) = ack {
            if !self.process_ack(&ack, now) {
                return;
            }
        }

        if self.has_open_requests() {
            let reason = format!("close requested while {} requests are not replied to and acknowledged", self.replies.len());
            self.protocol_fault(FaultKind::SequenceClosed, Some(sequence_id), reason);
            return;
        }
        if !self.tracker.set_close_sequence_last(last) {
            self.protocol_fault(FaultKind::SequenceClosed, Some(sequence_id), format!("{:?} conflicts with the messages received", last));
            return;
        }

        debug!("input sequence {} closed at {:?}", sequence_id, last);
        if self.state == SessionState::Established {
            self.state = SessionState::Closing;
        }
        let ack = self.current_ack();
        self.acks.on_ack_sent(ack.buffer_remaining);
        self.outbox.push(Frame::CloseSequenceResponse { sequence_id, ack });
    }

    fn on_terminate_sequence(&mut self, sequence_id: SequenceId, last: Option<SequenceNumber>) {
        if self.tracker.is_terminated() {
            if self.variant == ProtocolVariant::TwoPhase {
                self.outbox.push(Frame::TerminateSequenceResponse { sequence_id });
            }
            return;
        }

        if self.has_open_requests() {
            let reason = format!("terminate requested while {} requests are not replied to and acknowledged", self.replies.len());
            self.protocol_fault(FaultKind::SequenceTerminated, Some(sequence_id), reason);
            return;
        }
        let (accepted, large_enough) = self.tracker.set_terminate_sequence_last(last);
        if !accepted || !self.tracker.all_received() {
            let reason = if large_enough {
                format!("terminate at {:?} before all messages were received", last)
            }
            else {
                format!("terminate at {:?} is below the messages received", last)
            };
            self.protocol_fault(FaultKind::SequenceTerminated, Some(sequence_id), reason);
            return;
        }

        debug!("input sequence {} terminated", sequence_id);
        if self.state == SessionState::Established {
            self.state = SessionState::Closing;
        }
        if self.variant == ProtocolVariant::TwoPhase {
            self.outbox.push(Frame::TerminateSequenceResponse { sequence_id });
        }
        self.on_input_terminated();
    }

    fn on_close_sequence_response(&mut self, ack: AckInfo, now: Instant) {
        if self.output_state != OutputState::CloseSent {
            trace!("ignoring CloseSequenceResponse in output state {:?}", self.output_state);
            return;
        }
        if !self.process_ack(&ack, now) {
            return;
        }
        let Some(output_id) = self.output_id else {
            return;
        };

        debug!("output sequence {} closed - terminating it", output_id);
        self.finish_handshake();
        self.output_state = OutputState::TerminateSent;
        self.start_handshake(Frame::TerminateSequence {
            sequence_id: output_id,
            last: self.window.last_sequence_number(),
        });
    }

    fn on_terminate_sequence_response(&mut self) {
        if self.output_state != OutputState::TerminateSent {
            trace!("ignoring TerminateSequenceResponse in output state {:?}", self.output_state);
            return;
        }
        debug!("output sequence of session {} terminated", self.input_id);
        self.finish_handshake();
        self.on_output_terminated();
    }
}
