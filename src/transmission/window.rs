use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::EffectiveTransmissionConfig;
use crate::error::{SessionError, SessionResult};
use crate::safe_converter::{PrecheckedCast, SaturatingCast};
use crate::sequence::{MalformedRanges, SequenceNumber, SequenceRange, SequenceRangeSet};
use crate::transmission::congestion::CongestionWindow;
use crate::transmission::rtt::RttEstimator;

/// A message that was issued into the window and is retained until its transfer is confirmed
///  and the window slides past it.
#[derive(Debug)]
pub struct PendingMessage<S> {
    pub sequence_number: SequenceNumber,
    pub payload: Option<Bytes>,
    pub is_last: bool,
    pub first_send_time: Instant,
    pub last_attempt_time: Instant,
    /// strictly increasing over all attempts in the window, for deciding which of two attempts
    ///  happened first when their timestamps coincide
    last_attempt_order: u64,
    pub retry_count: u32,
    pub transferred: bool,
    pub user_state: S,
}

/// Everything the caller needs to (re)send a message
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageAttempt<S> {
    pub sequence_number: SequenceNumber,
    pub payload: Option<Bytes>,
    pub is_last: bool,
    pub retry_count: u32,
    pub user_state: S,
}

/// A queued admission. The receiver completes when the message is admitted (with its sequence
///  number assigned) or when the window is closed, aborted or faulted.
#[derive(Debug)]
pub struct AdmissionTicket<S> {
    pub id: u64,
    pub receiver: oneshot::Receiver<SessionResult<MessageAttempt<S>>>,
}

#[derive(Debug)]
pub enum Admission<S> {
    Admitted(MessageAttempt<S>),
    Blocked(AdmissionTicket<S>),
}

struct Waiter<S> {
    id: u64,
    payload: Option<Bytes>,
    is_last: bool,
    user_state: S,
    sender: oneshot::Sender<SessionResult<MessageAttempt<S>>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckRejection {
    /// references a number that was never sent, or is malformed
    Invalid,
    /// drops numbers that were acknowledged before
    Inconsistent,
}

/// The sender side of a sequence: assigns sequence numbers, retains messages until they are
///  acknowledged, and decides what to retransmit and when.
///
/// The window is plain data guarded by the session's lock; the current time is passed in by the
///  caller.
pub struct TransmissionWindow<S> {
    config: Arc<EffectiveTransmissionConfig>,

    slots: BTreeMap<SequenceNumber, PendingMessage<S>>,
    /// the lowest number the window has not slid past yet
    window_start: SequenceNumber,
    /// the number the next admitted message gets
    next_number: SequenceNumber,
    last_sequence_number: Option<SequenceNumber>,
    /// no more messages can be added: either the last message was added, or the window was sealed
    sealed: bool,

    congestion: CongestionWindow,
    rtt: RttEstimator,
    quota_remaining: u32,
    acknowledged: SequenceRangeSet,

    retry_queue: VecDeque<SequenceNumber>,
    attempt_counter: u64,

    waiters: VecDeque<Waiter<S>>,
    next_waiter_id: u64,
    last_requested: bool,

    terminal: Option<SessionError>,
}

impl<S: Clone> TransmissionWindow<S> {
    pub fn new(config: Arc<EffectiveTransmissionConfig>) -> TransmissionWindow<S> {
        TransmissionWindow {
            congestion: CongestionWindow::new(config.max_window_size),
            rtt: RttEstimator::new(config.initial_rtt, config.min_retry_timeout, config.max_retry_timeout),
            quota_remaining: config.max_window_size,
            config,
            slots: BTreeMap::default(),
            window_start: SequenceNumber::FIRST,
            next_number: SequenceNumber::FIRST,
            last_sequence_number: None,
            sealed: false,
            acknowledged: SequenceRangeSet::empty(),
            retry_queue: VecDeque::default(),
            attempt_counter: 0,
            waiters: VecDeque::default(),
            next_waiter_id: 0,
            last_requested: false,
            terminal: None,
        }
    }

    #[cfg(test)]
    pub fn set_next_number(&mut self, next: SequenceNumber) {
        assert!(self.slots.is_empty());
        self.next_number = next;
        self.window_start = next;
        if let Some(prefix_end) = next.checked_minus(1).and_then(|n| SequenceRange::new(SequenceNumber::FIRST, n)) {
            self.acknowledged = SequenceRangeSet::from_ranges([prefix_end]);
        }
    }

    pub fn window_start(&self) -> SequenceNumber {
        self.window_start
    }

    pub fn window_size(&self) -> u32 {
        self.congestion.window_size()
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.congestion.slow_start_threshold()
    }

    pub fn quota_remaining(&self) -> u32 {
        self.quota_remaining
    }

    pub fn timeout(&self) -> Duration {
        self.rtt.timeout()
    }

    pub fn mean_rtt(&self) -> Option<Duration> {
        self.rtt.mean_rtt()
    }

    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        self.last_sequence_number
    }

    /// the highest number that was assigned so far, if any
    pub fn highest_assigned(&self) -> Option<SequenceNumber> {
        self.next_number.checked_minus(1)
            .filter(|n| n.is_assignable())
    }

    /// number of messages in the window, i.e. issued but not slid past yet
    pub fn occupancy(&self) -> u32 {
        self.slots.len().prechecked_cast()
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_unacknowledged(&self) -> bool {
        self.slots.values().any(|m| !m.transferred)
    }

    /// Senders are waiting only because the receiver advertised no buffer space. Nothing is in
    ///  flight, so no acknowledgment is coming unless the sender asks for one.
    pub fn is_blocked_by_quota(&self) -> bool {
        self.config.flow_control_enabled
            && !self.waiters.is_empty()
            && self.quota_remaining == 0
            && !self.has_unacknowledged()
    }

    pub fn has_pending_retries(&self) -> bool {
        !self.retry_queue.is_empty()
    }

    /// the last number is fixed and everything up to it is acknowledged
    pub fn is_complete(&self) -> bool {
        self.sealed && self.slots.is_empty() && self.waiters.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn acknowledged(&self) -> &SequenceRangeSet {
        &self.acknowledged
    }

    fn has_room(&self) -> bool {
        let occupancy = self.occupancy();
        if self.config.flow_control_enabled {
            occupancy < self.congestion.window_size() && self.quota_remaining > 0
        }
        else {
            occupancy < self.config.max_window_size
        }
    }

    fn next_attempt_order(&mut self) -> u64 {
        self.attempt_counter += 1;
        self.attempt_counter
    }

    /// Adds a message to the window. If there is room and nobody is queued, it is admitted right
    ///  away, otherwise the caller gets a ticket for a FIFO wait queue.
    pub fn add(&mut self, payload: Option<Bytes>, is_last: bool, user_state: S, now: Instant) -> SessionResult<Admission<S>> {
        if let Some(terminal) = &self.terminal {
            return Err(terminal.clone());
        }
        if self.sealed || self.last_requested {
            return Err(SessionError::InvalidOperation("no message can be added after the last message"));
        }

        // waiters get their numbers before this message does
        let number = self.next_number.checked_plus(self.waiters.len() as u64)
            .filter(|n| n.is_assignable())
            .ok_or(SessionError::Rollover)?;

        let admit_now = self.waiters.is_empty() && self.has_room();
        if !admit_now && self.waiters.len() >= self.config.max_queued_sends {
            return Err(SessionError::QuotaExceeded(format!("{} sends are already waiting for admission", self.waiters.len())));
        }

        if is_last {
            self.last_requested = true;
        }

        if admit_now {
            debug_assert_eq!(number, self.next_number);
            return Ok(Admission::Admitted(self.admit(payload, is_last, user_state, now)));
        }

        let (sender, receiver) = oneshot::channel();
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        trace!("no room in transmission window (occupancy {}, window size {}, quota {}) - queueing as waiter #{}", self.occupancy(), self.window_size(), self.quota_remaining, id);
        self.waiters.push_back(Waiter {
            id,
            payload,
            is_last,
            user_state,
            sender,
        });
        Ok(Admission::Blocked(AdmissionTicket { id, receiver }))
    }

    fn admit(&mut self, payload: Option<Bytes>, is_last: bool, user_state: S, now: Instant) -> MessageAttempt<S> {
        let sequence_number = self.next_number;
        self.next_number = self.next_number.checked_plus(1)
            .expect("rollover is checked before admission");
        self.quota_remaining = self.quota_remaining.saturating_sub(1);

        if is_last {
            self.last_sequence_number = Some(sequence_number);
            self.sealed = true;
        }

        let attempt_order = self.next_attempt_order();
        let attempt = MessageAttempt {
            sequence_number,
            payload: payload.clone(),
            is_last,
            retry_count: 0,
            user_state: user_state.clone(),
        };
        self.slots.insert(sequence_number, PendingMessage {
            sequence_number,
            payload,
            is_last,
            first_send_time: now,
            last_attempt_time: now,
            last_attempt_order: attempt_order,
            retry_count: 0,
            transferred: false,
            user_state,
        });

        trace!("admitted message #{} into transmission window", sequence_number);
        attempt
    }

    fn admit_waiters(&mut self, now: Instant) {
        while self.has_room() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let attempt = self.admit(waiter.payload, waiter.is_last, waiter.user_state, now);
            debug!("admitted waiter #{} as message #{}", waiter.id, attempt.sequence_number);
            if waiter.sender.send(Ok(attempt)).is_err() {
                // the message stays in the window and goes out with the next retry
                debug!("waiter #{} is gone", waiter.id);
            }
        }
    }

    /// Removes a queued admission. Returns false if the ticket is not queued (anymore), i.e. the
    ///  message was admitted or the window reached a terminal state in the meantime.
    pub fn cancel_waiter(&mut self, id: u64) -> bool {
        let Some(idx) = self.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        if let Some(waiter) = self.waiters.remove(idx) {
            if waiter.is_last {
                self.last_requested = false;
            }
        }
        trace!("cancelled waiter #{}", id);
        true
    }

    /// Fixes the last sequence number to the highest number assigned so far, without sending a
    ///  last message.
    pub fn seal(&mut self) -> SessionResult<Option<SequenceNumber>> {
        if let Some(terminal) = &self.terminal {
            return Err(terminal.clone());
        }
        if !self.waiters.is_empty() {
            return Err(SessionError::InvalidOperation("there are sends waiting for admission"));
        }
        if !self.sealed {
            self.sealed = true;
            self.last_sequence_number = self.highest_assigned();
        }
        Ok(self.last_sequence_number)
    }

    /// Processes an acknowledgment from the peer. Returns true if messages were queued for
    ///  retransmission and should be fetched via [TransmissionWindow::get_retry_candidate] right
    ///  away. A rejected acknowledgment leaves the window unchanged.
    pub fn process_acknowledgment(&mut self, ranges: &[SequenceRange], buffer_remaining: Option<u32>, now: Instant) -> Result<bool, AckRejection> {
        let ranges = match SequenceRangeSet::try_from_received(ranges) {
            Ok(r) => r,
            Err(MalformedRanges::Overlapping) | Err(MalformedRanges::Unordered) => {
                warn!("malformed acknowledgment ranges {:?}", ranges);
                return Err(AckRejection::Invalid);
            }
        };

        if let Some(highest) = ranges.highest() {
            if self.highest_assigned().map(|h| highest > h).unwrap_or(true) {
                warn!("acknowledgment {:?} references message #{} which was never sent", ranges, highest);
                return Err(AckRejection::Invalid);
            }
        }
        if !ranges.contains_all(&self.acknowledged) {
            warn!("acknowledgment {:?} drops messages that were acknowledged before ({:?})", ranges, self.acknowledged);
            return Err(AckRejection::Inconsistent);
        }

        // mark newly acknowledged messages, and remember the latest attempt among them for loss detection
        let mut newly_acked_orders: BTreeMap<SequenceNumber, u64> = BTreeMap::new();
        for (number, msg) in self.slots.iter_mut() {
            if !msg.transferred && ranges.contains(*number) {
                msg.transferred = true;
                newly_acked_orders.insert(*number, msg.last_attempt_order);
            }
        }
        self.acknowledged = ranges;

        // gap based loss detection: an unacknowledged message whose latest attempt was before the
        //  latest attempt of a newly acknowledged higher message is considered lost
        let mut max_later_order: Option<u64> = None;
        let mut lost = Vec::new();
        for (number, msg) in self.slots.iter().rev() {
            if let Some(order) = newly_acked_orders.get(number) {
                max_later_order = Some(max_later_order.map_or(*order, |o| o.max(*order)));
            }
            else if !msg.transferred {
                if let Some(later) = max_later_order {
                    if msg.last_attempt_order < later && !self.retry_queue.contains(number) {
                        lost.push(*number);
                    }
                }
            }
        }
        for number in lost.into_iter().rev() {
            debug!("message #{} was overtaken by an acknowledged message - queueing for retry", number);
            self.retry_queue.push_back(number);
        }

        // slide
        let mut num_slid = 0u32;
        while let Some(entry) = self.slots.first_entry() {
            if !entry.get().transferred {
                break;
            }
            let msg = entry.remove();
            if msg.retry_count == 0 {
                self.rtt.on_sample(now.saturating_duration_since(msg.first_send_time));
            }
            num_slid += 1;
        }
        self.window_start = self.slots.keys().next()
            .cloned()
            .unwrap_or(self.next_number);
        if num_slid > 0 {
            trace!("transmission window slid past {} messages to #{}", num_slid, self.window_start);
            self.congestion.on_ack(num_slid);
        }
        self.retry_queue.retain(|n| self.slots.get(n).map(|m| !m.transferred).unwrap_or(false));

        // quota: what the receiver can still buffer, minus what is on its way beyond the highest acknowledgment
        let beyond_acknowledged = match (self.highest_assigned(), self.acknowledged.highest()) {
            (Some(assigned), Some(acked)) => assigned.distance_from(acked).saturating_cast(),
            (Some(assigned), None) => assigned.to_raw().saturating_cast(),
            (None, _) => 0u32,
        };
        let advertised = buffer_remaining.unwrap_or(self.config.max_window_size);
        self.quota_remaining = advertised.saturating_sub(beyond_acknowledged);

        self.admit_waiters(now);

        Ok(!self.retry_queue.is_empty())
    }

    /// Pops the oldest message queued for retransmission that is still unacknowledged
    pub fn get_retry_candidate(&mut self, now: Instant) -> Option<MessageAttempt<S>> {
        while let Some(number) = self.retry_queue.pop_front() {
            let attempt_order = self.attempt_counter + 1;
            let Some(msg) = self.slots.get_mut(&number) else {
                continue;
            };
            if msg.transferred {
                continue;
            }

            msg.retry_count += 1;
            msg.last_attempt_time = now;
            msg.last_attempt_order = attempt_order;
            let attempt = MessageAttempt {
                sequence_number: msg.sequence_number,
                payload: msg.payload.clone(),
                is_last: msg.is_last,
                retry_count: msg.retry_count,
                user_state: msg.user_state.clone(),
            };
            self.attempt_counter = attempt_order;
            trace!("retrying message #{} (retry #{})", number, attempt.retry_count);
            return Some(attempt);
        }
        None
    }

    /// Called when the retry timer expired. Returns true if a message was queued for retry.
    pub fn on_retry_timeout(&mut self, _now: Instant) -> SessionResult<bool> {
        let Some(oldest) = self.slots.values().find(|m| !m.transferred) else {
            return Ok(false);
        };
        if oldest.retry_count >= self.config.max_retry_count {
            warn!("message #{} was retried {} times without acknowledgment", oldest.sequence_number, oldest.retry_count);
            return Err(SessionError::MaxRetryExceeded(None));
        }
        let oldest = oldest.sequence_number;

        self.congestion.on_timeout();
        self.rtt.back_off();
        if !self.retry_queue.contains(&oldest) {
            self.retry_queue.push_front(oldest);
        }
        debug!("retry timeout - retrying message #{}, next timeout {:?}", oldest, self.rtt.timeout());
        Ok(true)
    }

    fn terminate(&mut self, outcome: SessionError) {
        if self.terminal.is_some() {
            return;
        }
        debug!("transmission window terminated: {}", outcome);
        self.slots.clear();
        self.retry_queue.clear();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.sender.send(Err(outcome.clone()));
        }
        self.terminal = Some(outcome);
    }

    pub fn close(&mut self) {
        self.terminate(SessionError::Closed);
    }

    pub fn abort(&mut self) {
        self.terminate(SessionError::Aborted);
    }

    pub fn fault(&mut self, cause: SessionError) {
        self.terminate(SessionError::faulted(cause));
    }

    pub fn terminal(&self) -> Option<&SessionError> {
        self.terminal.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(max_window_size: u32, flow_control_enabled: bool) -> Arc<EffectiveTransmissionConfig> {
        Arc::new(EffectiveTransmissionConfig {
            max_window_size,
            flow_control_enabled,
            max_retry_count: 3,
            initial_rtt: Duration::from_millis(200),
            min_retry_timeout: Duration::from_millis(100),
            max_retry_timeout: Duration::from_secs(10),
            max_queued_sends: 8,
        })
    }

    fn ranges(raw: &[(u64, u64)]) -> Vec<SequenceRange> {
        raw.iter()
            .map(|&(l, u)| SequenceRange::from_raw(l, u).unwrap())
            .collect()
    }

    fn add_admitted(window: &mut TransmissionWindow<()>, now: Instant) -> MessageAttempt<()> {
        match window.add(Some(Bytes::from_static(b"abc")), false, (), now).unwrap() {
            Admission::Admitted(a) => a,
            Admission::Blocked(_) => panic!("expected admission"),
        }
    }

    fn add_blocked(window: &mut TransmissionWindow<()>, now: Instant) -> AdmissionTicket<()> {
        match window.add(Some(Bytes::from_static(b"abc")), false, (), now).unwrap() {
            Admission::Admitted(a) => panic!("expected to be blocked, was admitted as #{}", a.sequence_number),
            Admission::Blocked(t) => t,
        }
    }

    #[test]
    fn test_happy_path() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));

        for expected in 1..=3 {
            let attempt = add_admitted(&mut window, now);
            assert_eq!(attempt.sequence_number, SequenceNumber::from_raw(expected));
            assert_eq!(attempt.retry_count, 0);
        }

        let needs_retry = window.process_acknowledgment(&ranges(&[(1, 3)]), None, now + Duration::from_millis(50)).unwrap();

        assert!(!needs_retry);
        assert_eq!(window.window_start(), SequenceNumber::from_raw(4));
        assert_eq!(window.occupancy(), 0);
        assert!(!window.has_unacknowledged());
        assert!(window.get_retry_candidate(now).is_none());
        assert_eq!(window.mean_rtt(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_timeout_retry() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        add_admitted(&mut window, now);

        assert!(window.on_retry_timeout(now + Duration::from_millis(200)).unwrap());
        let retry = window.get_retry_candidate(now + Duration::from_millis(200)).unwrap();

        assert_eq!(retry.sequence_number, SequenceNumber::FIRST);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(window.window_size(), 1);
        assert_eq!(window.slow_start_threshold(), 2);
        assert_eq!(window.timeout(), Duration::from_millis(400));
        assert!(window.get_retry_candidate(now).is_none());
    }

    #[test]
    fn test_max_retry_exceeded() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        add_admitted(&mut window, now);

        for _ in 0..3 {
            assert!(window.on_retry_timeout(now).unwrap());
            assert!(window.get_retry_candidate(now).is_some());
        }
        assert_eq!(window.on_retry_timeout(now), Err(SessionError::MaxRetryExceeded(None)));
    }

    #[test]
    fn test_retry_timeout_without_pending_messages() {
        let now = Instant::now();
        let mut window = TransmissionWindow::<()>::new(config(5, true));
        assert_eq!(window.on_retry_timeout(now), Ok(false));
        assert_eq!(window.window_size(), 5);
    }

    #[test]
    fn test_retransmitted_message_gives_no_rtt_sample() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        add_admitted(&mut window, now);
        window.on_retry_timeout(now).unwrap();
        window.get_retry_candidate(now).unwrap();

        window.process_acknowledgment(&ranges(&[(1, 1)]), None, now + Duration::from_secs(3)).unwrap();
        assert_eq!(window.mean_rtt(), None);
        assert_eq!(window.window_start(), SequenceNumber::from_raw(2));
    }

    #[rstest]
    #[case::flow_control_window_size(true, 3, None, 3)]
    #[case::flow_control_quota(true, 10, Some(2), 2)]
    #[case::without_flow_control(false, 3, Some(0), 3)]
    fn test_window_bound_at_admission(#[case] flow_control: bool, #[case] max_window_size: u32, #[case] advertised: Option<u32>, #[case] expected_admitted: u64) {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(max_window_size, flow_control));

        // establish the advertised quota with an acknowledgment of the first message
        add_admitted(&mut window, now);
        window.process_acknowledgment(&ranges(&[(1, 1)]), advertised, now).unwrap();

        let mut admitted = 0;
        loop {
            match window.add(None, false, (), now).unwrap() {
                Admission::Admitted(_) => admitted += 1,
                Admission::Blocked(_) => break,
            }
            assert!(window.occupancy() <= max_window_size);
            assert!(admitted <= 100);
        }
        assert_eq!(admitted, expected_admitted);
    }

    #[test]
    fn test_waiters_are_admitted_in_fifo_order() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(2, true));
        add_admitted(&mut window, now);
        add_admitted(&mut window, now);

        let mut t1 = add_blocked(&mut window, now);
        let mut t2 = add_blocked(&mut window, now);
        let mut t3 = add_blocked(&mut window, now);
        assert_eq!(window.num_waiters(), 3);

        window.process_acknowledgment(&ranges(&[(1, 1)]), None, now).unwrap();
        assert_eq!(t1.receiver.try_recv().unwrap().unwrap().sequence_number, SequenceNumber::from_raw(3));
        assert!(t2.receiver.try_recv().is_err());

        window.process_acknowledgment(&ranges(&[(1, 3)]), None, now).unwrap();
        assert_eq!(t2.receiver.try_recv().unwrap().unwrap().sequence_number, SequenceNumber::from_raw(4));
        assert_eq!(t3.receiver.try_recv().unwrap().unwrap().sequence_number, SequenceNumber::from_raw(5));
        assert_eq!(window.num_waiters(), 0);
    }

    #[test]
    fn test_later_add_does_not_overtake_waiters() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(1, true));
        add_admitted(&mut window, now);
        let _t1 = add_blocked(&mut window, now);

        window.process_acknowledgment(&ranges(&[(1, 1)]), Some(0), now).unwrap();
        // no quota, so the waiter is still queued - and a new message must queue behind it
        assert_eq!(window.num_waiters(), 1);
        add_blocked(&mut window, now);
        assert_eq!(window.num_waiters(), 2);
    }

    #[test]
    fn test_blocked_by_quota() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(3, true));
        add_admitted(&mut window, now);
        window.process_acknowledgment(&ranges(&[(1, 1)]), Some(0), now).unwrap();
        assert!(!window.is_blocked_by_quota());

        let mut ticket = add_blocked(&mut window, now);
        assert!(window.is_blocked_by_quota());

        // the answer to an acknowledgment request announces room again
        window.process_acknowledgment(&ranges(&[(1, 1)]), Some(2), now).unwrap();
        assert_eq!(ticket.receiver.try_recv().unwrap().unwrap().sequence_number, SequenceNumber::from_raw(2));
        assert!(!window.is_blocked_by_quota());
    }

    #[test]
    fn test_not_blocked_by_quota_while_messages_are_in_flight() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(1, true));
        add_admitted(&mut window, now);
        add_blocked(&mut window, now);
        assert!(!window.is_blocked_by_quota());
    }

    #[test]
    fn test_wait_queue_is_bounded() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(1, true));
        add_admitted(&mut window, now);
        for _ in 0..8 {
            add_blocked(&mut window, now);
        }

        match window.add(Some(Bytes::from_static(b"abc")), true, (), now) {
            Err(SessionError::QuotaExceeded(_)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert_eq!(window.num_waiters(), 8);
        assert!(window.last_sequence_number().is_none());

        // the rejected message did not claim the last number
        window.process_acknowledgment(&ranges(&[(1, 1)]), None, now).unwrap();
        add_blocked(&mut window, now);
    }

    #[test]
    fn test_cancel_waiter() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(1, true));
        add_admitted(&mut window, now);
        let t1 = add_blocked(&mut window, now);
        let mut t2 = add_blocked(&mut window, now);

        assert!(window.cancel_waiter(t1.id));
        assert!(!window.cancel_waiter(t1.id));

        window.process_acknowledgment(&ranges(&[(1, 1)]), None, now).unwrap();
        assert_eq!(t2.receiver.try_recv().unwrap().unwrap().sequence_number, SequenceNumber::from_raw(2));
        assert!(!window.cancel_waiter(t2.id));
    }

    #[rstest]
    #[case::at_limit(i64::MAX as u64)]
    #[case::beyond_limit(i64::MAX as u64 + 5)]
    fn test_rollover_rejected_without_allocation(#[case] next: u64) {
        let now = Instant::now();
        let mut window = TransmissionWindow::<()>::new(config(5, true));
        window.set_next_number(SequenceNumber::from_raw(next));

        assert_eq!(window.add(Some(Bytes::from_static(b"x")), false, (), now).unwrap_err(), SessionError::Rollover);
        assert_eq!(window.occupancy(), 0);
        assert_eq!(window.num_waiters(), 0);
    }

    #[test]
    fn test_last_assignable_number() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        window.set_next_number(SequenceNumber::from_raw(i64::MAX as u64 - 1));

        let attempt = add_admitted(&mut window, now);
        assert_eq!(attempt.sequence_number, SequenceNumber::from_raw(i64::MAX as u64 - 1));
        assert_eq!(window.add(None, false, (), now).unwrap_err(), SessionError::Rollover);
        assert_eq!(window.occupancy(), 1);
    }

    #[test]
    fn test_last_message() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        add_admitted(&mut window, now);
        let last = match window.add(None, true, (), now).unwrap() {
            Admission::Admitted(a) => a,
            Admission::Blocked(_) => panic!("expected admission"),
        };
        assert!(last.is_last);
        assert_eq!(window.last_sequence_number(), Some(SequenceNumber::from_raw(2)));
        assert!(matches!(window.add(None, false, (), now), Err(SessionError::InvalidOperation(_))));
        assert!(matches!(window.add(None, true, (), now), Err(SessionError::InvalidOperation(_))));

        assert!(!window.is_complete());
        window.process_acknowledgment(&ranges(&[(1, 2)]), None, now).unwrap();
        assert!(window.is_complete());
    }

    #[rstest]
    #[case::nothing_sent(0, None)]
    #[case::some_sent(3, Some(3))]
    fn test_seal(#[case] num_sent: u64, #[case] expected_last: Option<u64>) {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        for _ in 0..num_sent {
            add_admitted(&mut window, now);
        }

        assert_eq!(window.seal().unwrap(), expected_last.map(SequenceNumber::from_raw));
        assert!(matches!(window.add(None, false, (), now), Err(SessionError::InvalidOperation(_))));
        assert_eq!(window.is_complete(), num_sent == 0);
    }

    #[rstest]
    #[case::unsent(vec![(1, 4)], AckRejection::Invalid)]
    #[case::nothing_sent_beyond(vec![(1, 3), (5, 5)], AckRejection::Invalid)]
    #[case::overlapping(vec![(1, 2), (2, 3)], AckRejection::Invalid)]
    #[case::unordered(vec![(3, 3), (1, 1)], AckRejection::Invalid)]
    #[case::drops_acknowledged(vec![(2, 3)], AckRejection::Inconsistent)]
    #[case::drops_everything(vec![], AckRejection::Inconsistent)]
    fn test_rejected_acknowledgment(#[case] ack: Vec<(u64, u64)>, #[case] expected: AckRejection) {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        for _ in 0..3 {
            add_admitted(&mut window, now);
        }
        window.process_acknowledgment(&ranges(&[(1, 1)]), Some(7), now).unwrap();
        let quota_before = window.quota_remaining();

        assert_eq!(window.process_acknowledgment(&ranges(&ack), Some(1), now), Err(expected));

        assert_eq!(window.window_start(), SequenceNumber::from_raw(2));
        assert_eq!(window.occupancy(), 2);
        assert_eq!(window.quota_remaining(), quota_before);
        assert_eq!(window.acknowledged(), &SequenceRangeSet::from_raw(&[(1, 1)]));
    }

    #[test]
    fn test_acknowledgment_is_idempotent() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(5, true));
        for _ in 0..4 {
            add_admitted(&mut window, now);
        }

        window.process_acknowledgment(&ranges(&[(1, 2), (4, 4)]), None, now).unwrap();
        let start = window.window_start();
        let occupancy = window.occupancy();
        let window_size = window.window_size();

        window.process_acknowledgment(&ranges(&[(1, 2), (4, 4)]), None, now).unwrap();
        assert_eq!(window.window_start(), start);
        assert_eq!(window.occupancy(), occupancy);
        assert_eq!(window.window_size(), window_size);
    }

    #[test]
    fn test_gap_loss_detection() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(10, true));
        for _ in 0..4 {
            add_admitted(&mut window, now);
        }

        // 4 was acknowledged, 2 and 3 were sent before it and are missing
        let needs_retry = window.process_acknowledgment(&ranges(&[(1, 1), (4, 4)]), None, now).unwrap();
        assert!(needs_retry);
        assert_eq!(window.get_retry_candidate(now).unwrap().sequence_number, SequenceNumber::from_raw(2));
        assert_eq!(window.get_retry_candidate(now).unwrap().sequence_number, SequenceNumber::from_raw(3));
        assert!(window.get_retry_candidate(now).is_none());

        // 2 and 3 were retransmitted after 4 was sent, so acknowledging 4 again does not requeue them
        let needs_retry = window.process_acknowledgment(&ranges(&[(1, 1), (4, 4)]), None, now).unwrap();
        assert!(!needs_retry);

        // acknowledging the retransmitted 2 does not requeue 3: it is lower
        let needs_retry = window.process_acknowledgment(&ranges(&[(1, 2), (4, 4)]), None, now).unwrap();
        assert!(!needs_retry);
        assert_eq!(window.window_start(), SequenceNumber::from_raw(3));
    }

    #[test]
    fn test_retry_candidates_skip_acknowledged() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(10, true));
        for _ in 0..3 {
            add_admitted(&mut window, now);
        }
        window.process_acknowledgment(&ranges(&[(3, 3)]), None, now).unwrap();
        window.process_acknowledgment(&ranges(&[(1, 1), (3, 3)]), None, now).unwrap();

        assert_eq!(window.get_retry_candidate(now).unwrap().sequence_number, SequenceNumber::from_raw(2));
        assert!(window.get_retry_candidate(now).is_none());
    }

    #[test]
    fn test_slow_start_after_timeout() {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(8, true));
        for _ in 0..8 {
            add_admitted(&mut window, now);
        }
        window.on_retry_timeout(now).unwrap();
        window.get_retry_candidate(now).unwrap();
        assert_eq!(window.window_size(), 1);
        assert_eq!(window.slow_start_threshold(), 4);

        window.process_acknowledgment(&ranges(&[(1, 3)]), None, now).unwrap();
        assert_eq!(window.window_size(), 4);
        window.process_acknowledgment(&ranges(&[(1, 5)]), None, now).unwrap();
        // 4 <= 4 grows to 5, then congestion avoidance
        assert_eq!(window.window_size(), 5);
    }

    #[rstest]
    #[case::nothing_advertised(None, 8)]
    #[case::advertised(Some(6), 4)]
    #[case::advertised_less_than_in_flight(Some(1), 0)]
    fn test_quota(#[case] advertised: Option<u32>, #[case] expected_quota: u32) {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(10, true));
        for _ in 0..4 {
            add_admitted(&mut window, now);
        }
        // two messages are still in flight beyond the acknowledged ones; with nothing advertised,
        //  the maximum window size is the upper bound
        window.process_acknowledgment(&ranges(&[(1, 2)]), advertised, now).unwrap();
        assert_eq!(window.quota_remaining(), expected_quota);
    }

    #[rstest]
    #[case::close(SessionError::Closed)]
    #[case::abort(SessionError::Aborted)]
    #[case::fault(SessionError::Faulted(Box::new(SessionError::Timeout)))]
    fn test_terminal_releases_waiters(#[case] expected: SessionError) {
        let now = Instant::now();
        let mut window = TransmissionWindow::new(config(1, true));
        add_admitted(&mut window, now);
        let mut t1 = add_blocked(&mut window, now);
        let mut t2 = add_blocked(&mut window, now);

        match &expected {
            SessionError::Closed => window.close(),
            SessionError::Aborted => window.abort(),
            _ => window.fault(SessionError::Timeout),
        }
        // idempotent: the first outcome sticks
        window.abort();

        assert_eq!(t1.receiver.try_recv().unwrap().unwrap_err(), expected);
        assert_eq!(t2.receiver.try_recv().unwrap().unwrap_err(), expected);
        assert_eq!(window.occupancy(), 0);
        assert_eq!(window.add(None, false, (), now).unwrap_err(), expected);
    }
}
