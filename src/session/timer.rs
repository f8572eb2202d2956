use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    Acknowledgment,
    Retry,
}

/// Events that a session's driver processes one at a time
#[derive(Debug)]
pub enum SessionEvent {
    Frame(crate::frames::Frame),
    TransportFault(String),
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
    /// the application took a message out of the delivery buffer
    BufferReleased {
        remaining: u32,
    },
}

/// A cancellable one-shot timer that reports its expiry as a [SessionEvent]. Every arm or cancel
///  starts a new generation, so an expiry that was already queued when the timer was re-armed
///  or cancelled is recognized as stale.
#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> TimerSlot {
        TimerSlot {
            kind,
            generation: 0,
            handle: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn arm(&mut self, delay: Duration, events: &mpsc::UnboundedSender<SessionEvent>) {
        self.cancel();

        let kind = self.kind;
        let generation = self.generation;
        let events = events.clone();
        trace!("arming {:?} timer #{} for {:?}", kind, generation, delay);
        self.handle = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = events.send(SessionEvent::TimerFired { kind, generation });
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    /// Checks a fired timer's generation. Returns true iff it is current, and disarms the slot
    ///  in that case.
    pub fn on_fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            trace!("ignoring stale {:?} timer #{} (current #{})", self.kind, generation, self.generation);
            return false;
        }
        self.handle = None;
        true
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
