//! The CoAP message model: a typed message plus its option collection.
//!
//! Nothing in here touches the network or a clock; the exchange engine
//! stamps message IDs, tokens and timestamps once a message is handed to it.

use std::time::Instant;

pub mod header;
pub mod options;
pub mod request;

pub use self::header::{MessageClass, MessageType, Method, ResponseCode};
pub use self::options::{CoapOption, ContentFormat, ObserveOption, OptionMap};

use self::header::{code_to_class, code_to_str, is_request_code, is_response_code};
use self::options::{decode_uint, encode_uint};
use crate::block::BlockValue;

/// The default CoAP port.
pub const COAP_PORT: u16 = 5683;

/// An HTTP proxy a message should be carried through instead of plain UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    /// Request method or response status as the raw 8-bit code.
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: OptionMap,
    pub payload: Vec<u8>,
    /// Destination for outgoing messages, origin for received ones.
    pub host: String,
    pub port: u16,
    /// When the message was sent or received.
    pub timestamp: Option<Instant>,
    /// Ask the exchange to assign a random token before the first send.
    pub is_token_requested: bool,
    pub proxy: Option<HttpProxy>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            message_type: MessageType::Confirmable,
            code: 0,
            message_id: 0,
            token: Vec::new(),
            options: OptionMap::new(),
            payload: Vec::new(),
            host: String::new(),
            port: COAP_PORT,
            timestamp: None,
            is_token_requested: false,
            proxy: None,
        }
    }
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    pub fn is_request(&self) -> bool {
        is_request_code(self.code)
    }

    pub fn is_response(&self) -> bool {
        is_response_code(self.code)
    }

    /// An empty message (code 0.00): a bare ACK, a ping or a reset.
    pub fn is_empty(&self) -> bool {
        self.code == 0
    }

    pub fn class(&self) -> MessageClass {
        code_to_class(&self.code)
    }

    pub fn code_str(&self) -> String {
        code_to_str(&self.code)
    }

    pub fn set_class(&mut self, class: MessageClass) {
        self.code = header::class_to_code(&class);
    }

    pub fn set_destination(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    /// Appends `value` to the option `number`; earlier values are kept.
    pub fn add_option<N: Into<u16>>(&mut self, number: N, value: Vec<u8>) {
        self.options.add(number.into(), value);
    }

    pub fn get_option<N: Into<u16>>(&self, number: N) -> Option<&[Vec<u8>]> {
        self.options.get(number.into())
    }

    pub fn get_first_option<N: Into<u16>>(&self, number: N) -> Option<&[u8]> {
        self.options.first(number.into())
    }

    pub fn clear_option<N: Into<u16>>(&mut self, number: N) {
        self.options.remove(number.into());
    }

    pub fn set_observe(&mut self, value: u32) {
        self.options.set(CoapOption::Observe.number(), encode_uint(value));
    }

    /// The Observe sequence number, if the option is present and well formed.
    pub fn observe(&self) -> Option<u32> {
        self.get_first_option(CoapOption::Observe).and_then(decode_uint)
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.options.set(CoapOption::Block2.number(), block.into());
    }

    /// The Block2 option, if present. A malformed value is reported as `Some(Err(_))`.
    pub fn block2(&self) -> Option<Result<BlockValue, crate::block::InvalidBlockValue>> {
        self.get_first_option(CoapOption::Block2)
            .map(BlockValue::try_from)
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.options
            .set(CoapOption::ContentFormat.number(), encode_uint(cf as u32));
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.get_first_option(CoapOption::ContentFormat)
            .and_then(decode_uint)
            .and_then(|n| u16::try_from(n).ok())
            .and_then(ContentFormat::from_u16)
    }

    /// Builds the empty acknowledgement for a received confirmable message.
    pub fn empty_ack(message_id: u16) -> Message {
        Message {
            message_type: MessageType::Acknowledgement,
            message_id,
            ..Message::default()
        }
    }

    pub fn reset(message_id: u16) -> Message {
        Message {
            message_type: MessageType::Reset,
            message_id,
            ..Message::default()
        }
    }
}
