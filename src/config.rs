use std::time::Duration;

use rand::Rng;

// RFC 7252 Section 4.8 - Transmission Parameters
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const ACK_RANDOM_FACTOR: f64 = 1.5;
pub const MAX_RETRANSMIT: u32 = 4;
pub const MAX_TRANSMIT_WAIT: Duration = Duration::from_secs(93);

// RFC 7641 Section 3.4 - Observe
pub const MAX_OBSERVE_OPTION_VALUE: u32 = 1 << 23;
pub const MAX_NOTIFICATION_DELAY: Duration = Duration::from_secs(128);

/// Length of the tokens the exchange generates.
pub const TOKEN_LENGTH: usize = 4;

/// Timing knobs of one exchange. The defaults are the RFC values and are
/// what third-party servers expect; tests shrink them.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParameters {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    pub max_transmit_wait: Duration,
    pub max_notification_delay: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: ACK_TIMEOUT,
            ack_random_factor: ACK_RANDOM_FACTOR,
            max_retransmit: MAX_RETRANSMIT,
            max_transmit_wait: MAX_TRANSMIT_WAIT,
            max_notification_delay: MAX_NOTIFICATION_DELAY,
        }
    }
}

impl TransmissionParameters {
    /// A random initial retransmission timeout in
    /// `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub fn initial_timeout(&self) -> Duration {
        let lo = self.ack_timeout.as_secs_f64();
        let hi = lo * self.ack_random_factor.max(1.0);
        if hi <= lo {
            return self.ack_timeout;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Options for an exchange
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExchangeOptions {
    pub parameters: TransmissionParameters,
    /// Local UDP port to bind; an ephemeral port when `None`.
    pub local_port: Option<u16>,
}
