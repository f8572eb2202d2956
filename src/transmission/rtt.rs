//! Retry timeout estimation along the lines of RFC 6298: smoothed RTT and RTT variation as
//!  exponentially weighted moving averages, with the timeout derived from both.

use std::time::Duration;
use tracing::trace;

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;
const RTT_K: u32 = 4;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// `None` until the first sample
    mean_rtt: Option<Duration>,
    rtt_variance: Duration,
    timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration, min_timeout: Duration, max_timeout: Duration) -> RttEstimator {
        RttEstimator {
            mean_rtt: None,
            rtt_variance: Duration::ZERO,
            timeout: initial_rtt.clamp(min_timeout, max_timeout),
            min_timeout,
            max_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mean_rtt(&self) -> Option<Duration> {
        self.mean_rtt
    }

    pub fn rtt_variance(&self) -> Duration {
        self.rtt_variance
    }

    pub fn on_sample(&mut self, sample: Duration) {
        match self.mean_rtt {
            None => {
                self.mean_rtt = Some(sample);
                self.rtt_variance = sample / 2;
            }
            Some(mean) => {
                let diff = sample.abs_diff(mean);
                self.rtt_variance = self.rtt_variance.mul_f64(1.0 - RTT_BETA) + diff.mul_f64(RTT_BETA);
                self.mean_rtt = Some(mean.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA));
            }
        }

        let mean = self.mean_rtt.unwrap_or(sample);
        self.timeout = (mean + self.rtt_variance * RTT_K).clamp(self.min_timeout, self.max_timeout);
        trace!("rtt sample {:?} -> mean {:?}, variance {:?}, timeout {:?}", sample, mean, self.rtt_variance, self.timeout);
    }

    /// doubles the timeout after a retry timer expired
    pub fn back_off(&mut self) {
        self.timeout = (self.timeout * 2).min(self.max_timeout);
    }
}
