use tracing::{debug, trace};
use crate::frames::AckInfo;
use crate::sequence::{SequenceId, SequenceNumber, SequenceRangeSet};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Classification {
    Accept,
    Duplicate,
    OutOfRange,
}

/// Receiver side bookkeeping for a sequence: which numbers arrived, and what the final number is.
#[derive(Debug)]
pub struct SequenceTracker {
    sequence_id: SequenceId,
    ranges: SequenceRangeSet,
    last_sequence_number: Option<SequenceNumber>,
    /// the final number is agreed on. This is separate from `last_sequence_number` because an
    ///  empty sequence has a final state without a last number.
    final_known: bool,
    closed: bool,
    terminated: bool,
}

impl SequenceTracker {
    pub fn new(sequence_id: SequenceId) -> SequenceTracker {
        SequenceTracker {
            sequence_id,
            ranges: SequenceRangeSet::empty(),
            last_sequence_number: None,
            final_known: false,
            closed: false,
            terminated: false,
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn ranges(&self) -> &SequenceRangeSet {
        &self.ranges
    }

    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        self.last_sequence_number
    }

    pub fn is_final_known(&self) -> bool {
        self.final_known
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn classify(&self, number: SequenceNumber, is_last: bool) -> Classification {
        if !number.is_assignable() {
            trace!("#{} on {} is not an assignable sequence number", number, self.sequence_id);
            return Classification::OutOfRange;
        }

        if self.final_known {
            match self.last_sequence_number {
                Some(last) if number > last => return Classification::OutOfRange,
                Some(last) if is_last && number != last => return Classification::OutOfRange,
                None => return Classification::OutOfRange,
                _ => {}
            }
        }
        if is_last && self.ranges.highest().map(|h| h > number).unwrap_or(false) {
            return Classification::OutOfRange;
        }

        if self.ranges.contains(number) {
            Classification::Duplicate
        }
        else {
            Classification::Accept
        }
    }

    pub fn merge(&mut self, number: SequenceNumber, is_last: bool) {
        self.ranges = self.ranges.merged_with(number);
        if is_last {
            debug!("received last message #{} on {}", number, self.sequence_id);
            self.last_sequence_number = Some(number);
            self.final_known = true;
        }
    }

    pub fn all_received(&self) -> bool {
        if !self.final_known {
            return false;
        }
        match self.last_sequence_number {
            Some(last) => self.ranges.is_complete_up_to(last),
            None => self.ranges.is_empty(),
        }
    }

    /// `None` is 'nothing was sent'
    fn is_large_enough(&self, candidate: Option<SequenceNumber>) -> bool {
        match (candidate, self.ranges.highest()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(c), Some(highest)) => c >= highest,
        }
    }

    fn matches_known_last(&self, candidate: Option<SequenceNumber>) -> bool {
        !self.final_known || self.last_sequence_number == candidate
    }

    /// Agrees on the final number when the sender closes the sequence. Returns false if the
    ///  candidate contradicts a known last number or numbers that already arrived.
    pub fn set_close_sequence_last(&mut self, candidate: Option<SequenceNumber>) -> bool {
        if !self.matches_known_last(candidate) || !self.is_large_enough(candidate) {
            debug!("rejecting {:?} as the last number of {} (known last {:?}, received {:?})", candidate, self.sequence_id, self.last_sequence_number, self.ranges);
            return false;
        }

        self.last_sequence_number = candidate;
        self.final_known = true;
        self.closed = true;
        true
    }

    /// Agrees on the final number when the sender terminates the sequence. `None` means the
    ///  sender did not state a last number, which is accepted if the final number is known already
    ///  or nothing was received.
    ///
    /// Returns `(accepted, large_enough_or_unknown)`.
    pub fn set_terminate_sequence_last(&mut self, candidate: Option<SequenceNumber>) -> (bool, bool) {
        let candidate = match candidate {
            Some(c) => Some(c),
            None if self.final_known => self.last_sequence_number,
            None if self.ranges.is_empty() => None,
            None => return (false, true),
        };

        let large_enough = self.is_large_enough(candidate);
        let accepted = large_enough && self.matches_known_last(candidate);
        if accepted {
            self.last_sequence_number = candidate;
            self.final_known = true;
            self.terminated = true;
        }
        else {
            debug!("rejecting {:?} as the terminating last number of {}", candidate, self.sequence_id);
        }
        (accepted, large_enough)
    }

    pub fn mark_terminated(&mut self) {
        self.terminated = true;
    }

    pub fn build_acknowledgment(&self, buffer_remaining: Option<u32>) -> AckInfo {
        AckInfo::new(self.sequence_id, &self.ranges, self.closed || self.terminated, buffer_remaining)
    }
}
