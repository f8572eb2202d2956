//! Congestion window with slow start, additive increase and multiplicative decrease on a retry
//!  timeout.
//!
//! The window starts fully open (at the configured maximum), since sessions typically run on
//!  networks where loss is the exception. Only after a timeout does it collapse to a single
//!  message and grow back: by one message per acknowledged message while it is at or below the
//!  slow start threshold, and by one message per window's worth of acknowledged messages above it.

use std::cmp::{max, min};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct CongestionWindow {
    max_window_size: u32,
    window_size: u32,
    slow_start_threshold: u32,
    avoidance_counter: u32,
}

impl CongestionWindow {
    pub fn new(max_window_size: u32) -> CongestionWindow {
        assert!(max_window_size >= 1);

        CongestionWindow {
            max_window_size,
            window_size: max_window_size,
            slow_start_threshold: max_window_size,
            avoidance_counter: 0,
        }
    }

    #[cfg(test)]
    pub fn set_internals(&mut self, window_size: u32, slow_start_threshold: u32, avoidance_counter: u32) {
        self.window_size = window_size;
        self.slow_start_threshold = slow_start_threshold;
        self.avoidance_counter = avoidance_counter;
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.slow_start_threshold
    }

    fn is_slow_start(&self) -> bool {
        self.window_size <= self.slow_start_threshold
    }

    /// called when the window slid past `num_acknowledged` messages
    pub fn on_ack(&mut self, num_acknowledged: u32) {
        for _ in 0..num_acknowledged {
            if self.window_size >= self.max_window_size {
                trace!("congestion window at its maximum of {}", self.max_window_size);
                break;
            }

            if self.is_slow_start() {
                self.window_size += 1;
            }
            else {
                self.avoidance_counter += 1;
                if self.avoidance_counter >= self.window_size {
                    self.avoidance_counter -= self.window_size;
                    self.window_size += 1;
                }
            }
        }

        self.window_size = min(self.window_size, self.max_window_size);
        trace!("congestion window is {} (slow start threshold {})", self.window_size, self.slow_start_threshold);
    }

    pub fn on_timeout(&mut self) {
        self.slow_start_threshold = max(self.window_size / 2, 1);
        self.window_size = 1;
        self.avoidance_counter = 0;
        debug!("retry timeout -> congestion window 1, slow start threshold {}", self.slow_start_threshold);
    }
}
