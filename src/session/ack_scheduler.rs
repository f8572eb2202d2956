use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;
use crate::session::timer::{SessionEvent, TimerKind, TimerSlot};

/// Decides when the receiver sends an acknowledgment. Acknowledgments for received messages are
///  coalesced: one goes out when enough messages are pending, or when the acknowledgment timer
///  (armed by the first pending message) expires, whichever comes first.
#[derive(Debug)]
pub struct AckScheduler {
    max_pending: u32,
    interval: Duration,
    pending: u32,
    /// the last acknowledgment told the sender that there is no room left
    advertised_zero: bool,
    timer: TimerSlot,
}

impl AckScheduler {
    pub fn new(max_pending: u32, interval: Duration) -> AckScheduler {
        AckScheduler {
            max_pending,
            interval,
            pending: 0,
            advertised_zero: false,
            timer: TimerSlot::new(TimerKind::Acknowledgment),
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Returns true if an acknowledgment should be sent right away
    pub fn on_message_received(&mut self, events: &mpsc::UnboundedSender<SessionEvent>) -> bool {
        self.pending += 1;
        if self.pending >= self.max_pending {
            trace!("{} pending acknowledgments - acknowledging now", self.pending);
            return true;
        }
        if !self.timer.is_armed() {
            self.timer.arm(self.interval, events);
        }
        false
    }

    pub fn on_ack_sent(&mut self, buffer_remaining: Option<u32>) {
        self.pending = 0;
        self.timer.cancel();
        self.advertised_zero = buffer_remaining == Some(0);
    }

    /// Returns true if the freed capacity should be announced right away
    pub fn on_buffer_released(&self, remaining: u32) -> bool {
        self.advertised_zero && remaining > 0
    }

    /// Returns true if the timer is current and an acknowledgment should be sent
    pub fn on_timer_fired(&mut self, generation: u64) -> bool {
        self.timer.on_fired(generation) && self.pending > 0
    }

    pub fn cancel(&mut self) {
        self.timer.cancel();
        self.pending = 0;
    }
}
