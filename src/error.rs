use std::io;

use thiserror::Error;

pub use crate::codec::{DecodeError, EncodeError};

/// Why an exchange failed or a request was refused.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// An inbound datagram could not be decoded. Such datagrams are dropped
    /// and never end an exchange.
    #[error("malformed message: {0}")]
    Format(#[from] DecodeError),
    /// The request could not be encoded; nothing was sent.
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
    /// `MAX_TRANSMIT_WAIT` passed without a response.
    #[error("no response received")]
    NoResponse,
    /// Every retransmission went unanswered.
    #[error("no response after {attempts} retransmissions")]
    MaxRetransmitReached { attempts: u32 },
    /// Binding or sending on the UDP socket failed.
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),
    /// The HTTP proxy path failed.
    #[error("proxying error: {0}")]
    Proxying(String),
    /// A request is still in transmission.
    #[error("a message is already in transmission")]
    Busy,
    /// The exchange was closed before the operation could run.
    #[error("exchange closed")]
    Closed,
}

impl ExchangeError {
    /// Whether the error ended the exchange it was reported on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ExchangeError::Format(_) | ExchangeError::Busy | ExchangeError::Encode(_)
        )
    }
}

impl From<ExchangeError> for io::Error {
    fn from(error: ExchangeError) -> io::Error {
        let kind = match &error {
            ExchangeError::NoResponse | ExchangeError::MaxRetransmitReached { .. } => {
                io::ErrorKind::TimedOut
            }
            ExchangeError::Socket(e) => e.kind(),
            ExchangeError::Format(_) | ExchangeError::Encode(_) => io::ErrorKind::InvalidData,
            ExchangeError::Busy => io::ErrorKind::WouldBlock,
            ExchangeError::Closed => io::ErrorKind::NotConnected,
            ExchangeError::Proxying(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}
