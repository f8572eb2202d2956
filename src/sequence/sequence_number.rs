use std::fmt::{Display, Formatter};

/// A message's position in a sequence. Valid numbers start at 1; the protocol represents them as
///  signed 64 bit integers on the wire, so `i64::MAX` is the rollover limit that is never assigned.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u64);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    /// This is the first value that can *not* be assigned to a message
    pub const ROLLOVER_LIMIT: SequenceNumber = SequenceNumber(i64::MAX as u64);

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn to_raw(&self) -> u64 {
        self.0
    }

    /// true for the numbers a sender may actually assign
    pub fn is_assignable(&self) -> bool {
        self.0 >= 1 && *self < Self::ROLLOVER_LIMIT
    }

    /// the following number, or `None` if that would reach the rollover limit
    pub fn next(&self) -> Option<SequenceNumber> {
        let next = SequenceNumber(self.0.checked_add(1)?);
        if next < Self::ROLLOVER_LIMIT {
            Some(next)
        }
        else {
            None
        }
    }

    pub fn checked_plus(&self, delta: u64) -> Option<SequenceNumber> {
        self.0.checked_add(delta).map(SequenceNumber)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<SequenceNumber> {
        self.0.checked_sub(delta).map(SequenceNumber)
    }

    /// number of sequence numbers from `other` (incl) to `self` (excl), or 0 if `other` is not
    ///  below `self`
    pub fn distance_from(&self, other: SequenceNumber) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// iterates from `self` (incl) to `upper` (excl)
    pub fn to(&self, upper: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (self.0..upper.0).map(SequenceNumber)
    }
}
