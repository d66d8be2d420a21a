//! Client side of the [CoAP Protocol][spec].
//!
//! The crate is built around [`Exchange`], a transmission state machine
//! that carries one request at a time over UDP (or through an HTTP proxy)
//! and reports what happens to it as [`ExchangeEvent`]s. The engine does no
//! I/O itself; [`CoAPClient`] runs it on tokio.
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt):
//!   confirmable retransmission with exponential backoff, piggybacked and
//!   separate responses
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//!   with notification reordering detection
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//!   (Block2 reassembly)
//! - *Too Many Requests* Response Code [RFC 8516](https://tools.ietf.org/html/rfc8516)
//! - Requests carried through an HTTP proxy
//!
//! # Example
//!
//! ```no_run
//! use coap_exchange::{CoAPClient, ExchangeOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let url = "coap://127.0.0.1:5683/Rust";
//!     println!("Client request: {}", url);
//!
//!     let mut client = CoAPClient::new(ExchangeOptions::default());
//!     let response = client.get(url).await.unwrap();
//!     println!("Server reply: {}", String::from_utf8(response.payload).unwrap());
//! }
//! ```
//!
//! [spec]: https://tools.ietf.org/html/rfc7252

#[cfg(test)]
extern crate quickcheck;

pub use self::client::CoAPClient;
pub use self::config::{ExchangeOptions, TransmissionParameters};
pub use self::error::ExchangeError;
pub use self::exchange::{Exchange, ExchangeEvent, ExchangeState};
pub use self::message::{Message, MessageClass, MessageType, Method, ResponseCode};

pub mod block;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod exchange;
pub mod message;
pub mod observer;
pub mod proxy;
pub mod transport;
