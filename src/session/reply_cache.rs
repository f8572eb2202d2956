use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;
use crate::frames::Frame;
use crate::sequence::{SequenceNumber, SequenceRangeSet};

#[derive(Debug, Default)]
struct ReplyState {
    replying: bool,
    outcome_known: bool,
    reply_number: Option<SequenceNumber>,
    /// the reply exactly as it was first sent, including its piggybacked acknowledgment
    buffered_reply: Option<Frame>,
}

/// The outcome of one request on a request-reply server. The application produces the outcome at
///  most once; duplicates of the request are answered from here.
///
/// The record has its own lock. It may be acquired while holding the session lock, but never the
///  other way around.
#[derive(Debug)]
pub struct ReplyRecord {
    request_number: SequenceNumber,
    state: Mutex<ReplyState>,
}

impl ReplyRecord {
    fn new(request_number: SequenceNumber) -> ReplyRecord {
        ReplyRecord {
            request_number,
            state: Mutex::new(ReplyState::default()),
        }
    }

    pub fn request_number(&self) -> SequenceNumber {
        self.request_number
    }

    fn lock(&self) -> MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the right to reply. Returns false if a reply was started before.
    pub fn begin_reply(&self) -> bool {
        let mut state = self.lock();
        if state.replying {
            return false;
        }
        state.replying = true;
        true
    }

    pub fn is_outcome_known(&self) -> bool {
        self.lock().outcome_known
    }

    pub fn reply_number(&self) -> Option<SequenceNumber> {
        self.lock().reply_number
    }

    /// the reply to resend for a duplicate request, if the outcome is known and there was a reply
    pub fn cached_reply(&self) -> Option<Frame> {
        let state = self.lock();
        if state.outcome_known {
            state.buffered_reply.clone()
        }
        else {
            None
        }
    }

    fn complete(&self, reply_number: Option<SequenceNumber>, reply: Option<Frame>) {
        let mut state = self.lock();
        state.outcome_known = true;
        state.reply_number = reply_number;
        state.buffered_reply = reply;
    }
}

/// Reply records of a request-reply server, indexed by request number and by reply number
#[derive(Debug, Default)]
pub struct ReplyCache {
    by_request: BTreeMap<SequenceNumber, Arc<ReplyRecord>>,
    by_reply: BTreeMap<SequenceNumber, SequenceNumber>,
}

impl ReplyCache {
    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }

    pub fn get(&self, request_number: SequenceNumber) -> Option<&Arc<ReplyRecord>> {
        self.by_request.get(&request_number)
    }

    pub fn get_or_create(&mut self, request_number: SequenceNumber) -> Arc<ReplyRecord> {
        self.by_request.entry(request_number)
            .or_insert_with(|| Arc::new(ReplyRecord::new(request_number)))
            .clone()
    }

    /// Records the reply that was sent for a request. The record is kept until the reply is
    ///  acknowledged.
    pub fn bind_reply(&mut self, record: &ReplyRecord, reply_number: SequenceNumber, reply: Frame) {
        record.complete(Some(reply_number), Some(reply));
        if self.by_request.contains_key(&record.request_number) {
            trace!("reply #{} bound to request #{}", reply_number, record.request_number);
            self.by_reply.insert(reply_number, record.request_number);
        }
    }

    /// The application finished a request without a reply: there is nothing to resend, so
    ///  duplicates of the request are just acknowledged.
    pub fn complete_without_reply(&mut self, record: &ReplyRecord) {
        record.complete(None, None);
        self.by_request.remove(&record.request_number);
    }

    /// Drops records whose replies are acknowledged. Returns the number of dropped records.
    pub fn release_acknowledged(&mut self, acknowledged: &SequenceRangeSet) -> usize {
        let released = self.by_reply.keys()
            .filter(|n| acknowledged.contains(**n))
            .cloned()
            .collect::<Vec<_>>();

        for reply_number in &released {
            if let Some(request_number) = self.by_reply.remove(reply_number) {
                trace!("reply #{} to request #{} was acknowledged - releasing its record", reply_number, request_number);
                self.by_request.remove(&request_number);
            }
        }
        released.len()
    }

    pub fn clear(&mut self) {
        self.by_request.clear();
        self.by_reply.clear();
    }
}
