use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashSet;

/// Which shutdown protocol a session speaks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolVariant {
    /// The sender marks the last message, and terminates the sequence once everything is
    ///  acknowledged. There is no close handshake.
    Simplified,
    /// The sender closes the sequence (agreeing on the final number with the receiver), and
    ///  then terminates it. Both steps are confirmed by the receiver.
    TwoPhase,
}

pub struct ReliableSessionConfig {
    /// This is the maximum number of messages that can be pending at the sender side, waiting for
    ///  acknowledgment. It is also the capacity of the receiver's delivery buffer, and the number
    ///  of pending acknowledgments that causes an acknowledgment to be sent immediately.
    pub max_transfer_window_size: u32,

    /// If true, messages are delivered to the application in the order they were sent. Otherwise,
    ///  they are delivered as they arrive (still exactly once).
    pub ordered: bool,

    /// With flow control, the sender's window is bounded by the congestion window and the
    ///  buffer space advertised by the receiver. Without it, the only bound is
    ///  `max_transfer_window_size`.
    pub flow_control_enabled: bool,

    /// Maximum delay between receiving a message and acknowledging it
    pub acknowledgement_interval: Duration,

    /// Number of retransmissions of a single message (or handshake frame) before the session is
    ///  faulted
    pub max_retry_count: u32,

    pub protocol_variant: ProtocolVariant,

    /// RTT assumed before the first sample is taken
    pub initial_rtt: Duration,
    /// lower bound for the retry timeout, regardless of measured RTT
    pub min_retry_timeout: Duration,
    /// upper bound for the retry timeout, including backoff
    pub max_retry_timeout: Duration,

    /// A session that receives no frame at all for this long is faulted
    pub inactivity_timeout: Duration,

    /// Upper bound for the lifetime of a sequence, applied to the expiry a peer asks for when
    ///  creating it. `None` means sequences may live indefinitely.
    pub max_sequence_expiry: Option<Duration>,

    /// Maximum number of accepted sessions that are not yet completed
    pub max_pending_sessions: usize,

    /// Deadline for a single send operation, including the time spent waiting for admission
    pub send_timeout: Duration,

    /// Maximum number of sends waiting for room in the transmission window. Further sends fail
    ///  with [crate::error::SessionError::QuotaExceeded].
    pub max_queued_sends: usize,

    /// Endpoint names that CreateSequence requests may address. An empty set accepts any endpoint.
    pub known_endpoints: FxHashSet<String>,
}

impl Default for ReliableSessionConfig {
    fn default() -> Self {
        ReliableSessionConfig {
            max_transfer_window_size: 32,
            ordered: true,
            flow_control_enabled: true,
            acknowledgement_interval: Duration::from_millis(200),
            max_retry_count: 8,
            protocol_variant: ProtocolVariant::TwoPhase,
            initial_rtt: Duration::from_millis(200),
            min_retry_timeout: Duration::from_millis(100),
            max_retry_timeout: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(600),
            max_sequence_expiry: None,
            max_pending_sessions: 128,
            send_timeout: Duration::from_secs(60),
            max_queued_sends: 1024,
            known_endpoints: FxHashSet::default(),
        }
    }
}

impl ReliableSessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transfer_window_size == 0 {
            bail!("max transfer window size must be at least 1");
        }
        if self.max_retry_count == 0 {
            bail!("max retry count must be at least 1");
        }
        if self.min_retry_timeout.is_zero() {
            bail!("min retry timeout must be positive");
        }
        if self.min_retry_timeout > self.max_retry_timeout {
            bail!("min retry timeout {:?} is greater than max retry timeout {:?}", self.min_retry_timeout, self.max_retry_timeout);
        }
        if self.acknowledgement_interval.is_zero() {
            bail!("acknowledgement interval must be positive");
        }
        if self.inactivity_timeout <= self.acknowledgement_interval {
            bail!("inactivity timeout must be longer than the acknowledgement interval");
        }
        if self.max_pending_sessions == 0 {
            bail!("max pending sessions must be at least 1");
        }
        if self.max_queued_sends == 0 {
            bail!("max queued sends must be at least 1");
        }
        Ok(())
    }

    pub fn is_known_endpoint(&self, endpoint: &str) -> bool {
        self.known_endpoints.is_empty() || self.known_endpoints.contains(endpoint)
    }

    /// the expiry actually granted for a sequence when the peer asks for `requested`
    pub fn effective_expiry(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested, self.max_sequence_expiry) {
            (Some(r), Some(max)) => Some(r.min(max)),
            (Some(r), None) => Some(r),
            (None, max) => max,
        }
    }

    pub fn get_effective_transmission_config(&self) -> Arc<EffectiveTransmissionConfig> {
        Arc::new(EffectiveTransmissionConfig {
            max_window_size: self.max_transfer_window_size,
            flow_control_enabled: self.flow_control_enabled,
            max_retry_count: self.max_retry_count,
            initial_rtt: self.initial_rtt,
            min_retry_timeout: self.min_retry_timeout,
            max_retry_timeout: self.max_retry_timeout,
            max_queued_sends: self.max_queued_sends,
        })
    }

    pub fn get_effective_receive_config(&self) -> Arc<EffectiveReceiveConfig> {
        Arc::new(EffectiveReceiveConfig {
            buffer_capacity: self.max_transfer_window_size,
            ordered: self.ordered,
            acknowledgement_interval: self.acknowledgement_interval,
            max_pending_acks: self.max_transfer_window_size,
            advertise_buffer_remaining: self.flow_control_enabled,
        })
    }
}

#[derive(Debug)]
pub struct EffectiveTransmissionConfig {
    pub max_window_size: u32,
    pub flow_control_enabled: bool,
    pub max_retry_count: u32,
    pub initial_rtt: Duration,
    pub min_retry_timeout: Duration,
    pub max_retry_timeout: Duration,
    pub max_queued_sends: usize,
}

#[derive(Debug)]
pub struct EffectiveReceiveConfig {
    pub buffer_capacity: u32,
    pub ordered: bool,
    pub acknowledgement_interval: Duration,
    /// pending acknowledgments that trigger an immediate acknowledgment
    pub max_pending_acks: u32,
    pub advertise_buffer_remaining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(ReliableSessionConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_window(|c: &mut ReliableSessionConfig| c.max_transfer_window_size = 0)]
    #[case::zero_retries(|c: &mut ReliableSessionConfig| c.max_retry_count = 0)]
    #[case::zero_min_timeout(|c: &mut ReliableSessionConfig| c.min_retry_timeout = Duration::ZERO)]
    #[case::inverted_timeouts(|c: &mut ReliableSessionConfig| c.max_retry_timeout = Duration::from_millis(50))]
    #[case::zero_ack_interval(|c: &mut ReliableSessionConfig| c.acknowledgement_interval = Duration::ZERO)]
    #[case::short_inactivity(|c: &mut ReliableSessionConfig| c.inactivity_timeout = Duration::from_millis(100))]
    #[case::no_pending_sessions(|c: &mut ReliableSessionConfig| c.max_pending_sessions = 0)]
    #[case::no_queued_sends(|c: &mut ReliableSessionConfig| c.max_queued_sends = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut ReliableSessionConfig)) {
        let mut config = ReliableSessionConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::neither(None, None, None)]
    #[case::requested_only(Some(10), None, Some(10))]
    #[case::max_only(None, Some(20), Some(20))]
    #[case::requested_below_max(Some(10), Some(20), Some(10))]
    #[case::requested_above_max(Some(30), Some(20), Some(20))]
    fn test_effective_expiry(#[case] requested: Option<u64>, #[case] max: Option<u64>, #[case] expected: Option<u64>) {
        let config = ReliableSessionConfig {
            max_sequence_expiry: max.map(Duration::from_secs),
            ..ReliableSessionConfig::default()
        };
        assert_eq!(config.effective_expiry(requested.map(Duration::from_secs)), expected.map(Duration::from_secs));
    }

    #[rstest]
    #[case::any_endpoint(vec![], "svc", true)]
    #[case::known(vec!["svc", "other"], "svc", true)]
    #[case::unknown(vec!["other"], "svc", false)]
    fn test_is_known_endpoint(#[case] known: Vec<&str>, #[case] endpoint: &str, #[case] expected: bool) {
        let config = ReliableSessionConfig {
            known_endpoints: known.into_iter().map(|s| s.to_string()).collect(),
            ..ReliableSessionConfig::default()
        };
        assert_eq!(config.is_known_endpoint(endpoint), expected);
    }
}
