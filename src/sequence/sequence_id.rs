use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

/// Names one direction of reliable delivery. Ids are random and globally unique, so a session's
///  input and output sequence ids are independent of each other.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new_random() -> SequenceId {
        SequenceId(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> SequenceId {
        SequenceId(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for SequenceId {
    fn from(value: Uuid) -> Self {
        SequenceId(value)
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

impl Debug for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SequenceId({})", self.0)
    }
}
