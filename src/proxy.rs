//! Carrying CoAP requests through an HTTP proxy.
//!
//! A message whose `proxy` field is set is not sent over UDP. It is
//! translated into an HTTP request addressed to the proxy, with the CoAP
//! target URI in the path and the CoAP message type in a `COAP_TYPE`
//! header. The proxy's HTTP response is translated back into a message.
//! The HTTP transfer itself is done by an [`HttpClient`].

use std::io;

use async_trait::async_trait;
use url::Url;

use crate::error::ExchangeError;
use crate::message::header::{MessageType, ResponseCode};
use crate::message::{CoapOption, ContentFormat, Message, MessageClass};
use crate::message::options::decode_uint;

/// Header carrying the CoAP message type between client and proxy.
pub const COAP_TYPE_HEADER: &str = "COAP_TYPE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Header lookup, ignoring the case of the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Performs HTTP requests for the proxy path.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse>;
}

fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn proxying_error<E: ToString>(e: E) -> ExchangeError {
    ExchangeError::Proxying(e.to_string())
}

/// Translates a proxied request into the HTTP request sent to the proxy.
pub fn to_http_request(message: &Message) -> Result<HttpRequest, ExchangeError> {
    let proxy = message
        .proxy
        .as_ref()
        .ok_or_else(|| proxying_error("message is not marked for proxying"))?;
    let method = message
        .method()
        .ok_or_else(|| proxying_error(format!("{} is not a request method", message.code_str())))?;

    let mut url = Url::parse(&format!("http://{}:{}/", url_host(&proxy.host), proxy.port))
        .map_err(proxying_error)?;
    url.set_path(&format!(
        "/coap://{}:{}/{}",
        url_host(&message.host),
        message.port,
        message.path()
    ));
    let queries = message.queries();
    if !queries.is_empty() {
        url.set_query(Some(&queries.join("&")));
    }

    let mut headers = vec![(
        COAP_TYPE_HEADER.to_string(),
        message.message_type.to_bits().to_string(),
    )];
    let accept = message
        .get_first_option(CoapOption::Accept)
        .and_then(decode_uint)
        .and_then(|n| u16::try_from(n).ok())
        .and_then(ContentFormat::from_u16);
    if let Some(accept) = accept {
        headers.push(("Accept".to_string(), accept.media_type().to_string()));
    }
    if let Some(cf) = message.content_format() {
        headers.push(("Content-Type".to_string(), cf.media_type().to_string()));
    }

    Ok(HttpRequest {
        method: method.as_str().to_string(),
        url,
        headers,
        body: message.payload.clone(),
    })
}

/// Maps an HTTP status onto the CoAP response code a proxy would have relayed.
pub fn status_to_response_code(status: u16) -> Option<ResponseCode> {
    let code = match status {
        200 => ResponseCode::Content,
        201 => ResponseCode::Created,
        204 => ResponseCode::Changed,
        304 => ResponseCode::Valid,
        400 => ResponseCode::BadRequest,
        401 => ResponseCode::Unauthorized,
        403 => ResponseCode::Forbidden,
        404 => ResponseCode::NotFound,
        405 => ResponseCode::MethodNotAllowed,
        406 => ResponseCode::NotAcceptable,
        412 => ResponseCode::PreconditionFailed,
        413 => ResponseCode::RequestEntityTooLarge,
        415 => ResponseCode::UnsupportedContentFormat,
        429 => ResponseCode::TooManyRequests,
        500 => ResponseCode::InternalServerError,
        501 => ResponseCode::NotImplemented,
        502 => ResponseCode::BadGateway,
        503 => ResponseCode::ServiceUnavailable,
        504 => ResponseCode::GatewayTimeout,
        _ => return None,
    };
    Some(code)
}

/// Translates the proxy's HTTP response back into the response to `request`.
pub fn from_http_response(request: &Message, response: HttpResponse) -> Result<Message, ExchangeError> {
    let status = status_to_response_code(response.status)
        .ok_or_else(|| proxying_error(format!("unmapped HTTP status {}", response.status)))?;

    let message_type = match response.header(COAP_TYPE_HEADER) {
        Some(value) => {
            let bits: u8 = value
                .trim()
                .parse()
                .map_err(|_| proxying_error(format!("invalid {} header {:?}", COAP_TYPE_HEADER, value)))?;
            if bits > 3 {
                return Err(proxying_error(format!("invalid {} header {:?}", COAP_TYPE_HEADER, value)));
            }
            MessageType::from_bits(bits)
        }
        None => match request.message_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        },
    };

    let content_format = response
        .header("Content-Type")
        .and_then(ContentFormat::from_media_type);
    let mut message = Message {
        message_type,
        message_id: request.message_id,
        token: request.token.clone(),
        payload: response.body,
        host: request.host.clone(),
        port: request.port,
        ..Message::default()
    };
    message.set_class(MessageClass::Response(status));
    if let Some(cf) = content_format {
        message.set_content_format(cf);
    }
    Ok(message)
}

#[cfg(feature = "reqwest-proxy")]
pub use self::reqwest_client::ReqwestClient;

#[cfg(feature = "reqwest-proxy")]
mod reqwest_client {
    use super::*;

    /// [`HttpClient`] backed by `reqwest`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        inner: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new(inner: reqwest::Client) -> ReqwestClient {
            ReqwestClient { inner }
        }
    }

    fn to_io(e: reqwest::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn execute(&self, request: HttpRequest) -> io::Result<HttpResponse> {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            let mut builder = self.inner.request(method, request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.body(request.body).send().await.map_err(to_io)?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.bytes().await.map_err(to_io)?.to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}
