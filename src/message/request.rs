use std::io::Result;
use std::str;

use super::header::{MessageClass, MessageType, Method};
use super::options::CoapOption;
use super::Message;
use crate::client::parse_coap_url;

impl Message {
    /// Creates a request. The token is only requested here; the exchange
    /// assigns it together with the message ID when the request is sent.
    pub fn request(confirmable: bool, method: Method, token_requested: bool, payload: &[u8]) -> Message {
        let message_type = match confirmable {
            true => MessageType::Confirmable,
            false => MessageType::NonConfirmable,
        };

        let mut message = Message {
            message_type,
            is_token_requested: token_requested,
            payload: payload.to_vec(),
            ..Message::default()
        };
        message.set_method(method);
        message
    }

    /// Creates a confirmable request for a `coap://host:port/path?query` URL.
    pub fn from_url(method: Method, url: &str) -> Result<Message> {
        let (_scheme, host, port, path, query) = parse_coap_url(url)?;

        let mut message = Message::request(true, method, true, &[]);
        message.set_destination(&host, port);
        message.set_path(&path);
        if let Some(query) = query {
            for q in query.split('&').filter(|q| !q.is_empty()) {
                message.add_query(q);
            }
        }
        Ok(message)
    }

    pub fn set_method(&mut self, method: Method) {
        self.set_class(MessageClass::Request(method));
    }

    pub fn method(&self) -> Option<Method> {
        match self.class() {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    /// Replaces the Uri-Path with the segments of `path`.
    pub fn set_path(&mut self, path: &str) {
        self.clear_option(CoapOption::UriPath);

        for s in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, s.as_bytes().to_vec());
        }
    }

    pub fn path(&self) -> String {
        match self.get_option(CoapOption::UriPath) {
            Some(options) => options
                .iter()
                .filter_map(|option| str::from_utf8(option).ok())
                .collect::<Vec<_>>()
                .join("/"),
            None => String::new(),
        }
    }

    pub fn add_query(&mut self, query: &str) {
        self.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }

    pub fn queries(&self) -> Vec<String> {
        self.get_option(CoapOption::UriQuery)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
