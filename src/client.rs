//! Async client: one [`Exchange`] driven by a tokio task.
//!
//! The task owns the exchange together with its sockets and timers. Caller
//! commands, datagrams, timer expiries and HTTP results all arrive on
//! channels and are applied one at a time, and the events the exchange
//! produces are forwarded to the [`CoAPClient`], which is a `Stream` of
//! them.

use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use log::{debug, trace};
use regex::Regex;
use tokio::net::lookup_host;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use crate::config::ExchangeOptions;
use crate::error::ExchangeError;
use crate::exchange::{Exchange, ExchangeEvent};
use crate::message::{Message, Method, ObserveOption, COAP_PORT};
use crate::proxy::{HttpClient, HttpResponse};
use crate::transport::{TokioSocket, TokioTimers, TransportEvent, UdpSocketFactory};

/// Splits a `coap://host:port/path?query` URL into its parts. IPv6 hosts
/// are returned without brackets; the port defaults to 5683.
pub fn parse_coap_url(url: &str) -> Result<(String, String, u16, String, Option<String>)> {
    let url_params = match Url::parse(url) {
        Ok(url_params) => url_params,
        Err(_) => return Err(Error::new(ErrorKind::InvalidInput, "url error")),
    };

    let scheme = url_params.scheme().to_string();
    if scheme != "coap" {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unsupported scheme {}", scheme),
        ));
    }

    let host = match url_params.host_str() {
        Some("") | None => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
        Some(h) => h,
    };
    let brackets =
        Regex::new(r"^\[(.*?)]$").map_err(|e| Error::new(ErrorKind::Other, e))?;
    let host = brackets.replace(host, "$1").to_string();

    let port = url_params.port().unwrap_or(COAP_PORT);
    let path = url_params.path().to_string();
    let query = url_params.query().map(|q| q.to_string());

    Ok((scheme, host, port, path, query))
}

enum Command {
    Send {
        message: Message,
        reply: oneshot::Sender<std::result::Result<(), ExchangeError>>,
    },
    CancelObserve,
    Close {
        reply: oneshot::Sender<()>,
    },
}

type UdpExchange = Exchange<UdpSocketFactory, TokioTimers>;

pub struct CoAPClient {
    commands: UnboundedSender<Command>,
    events: UnboundedReceiverStream<ExchangeEvent>,
    _actor: JoinHandle<()>,
}

impl CoAPClient {
    /// Starts a client on the current tokio runtime. Proxied messages go
    /// through `reqwest` when the `reqwest-proxy` feature is enabled and
    /// fail otherwise.
    pub fn new(options: ExchangeOptions) -> CoAPClient {
        #[cfg(feature = "reqwest-proxy")]
        let http: Option<Arc<dyn HttpClient>> = Some(Arc::new(crate::proxy::ReqwestClient::default()));
        #[cfg(not(feature = "reqwest-proxy"))]
        let http: Option<Arc<dyn HttpClient>> = None;

        CoAPClient::spawn(options, http)
    }

    /// Starts a client that carries proxied messages through `http`.
    pub fn with_http_client(options: ExchangeOptions, http: Arc<dyn HttpClient>) -> CoAPClient {
        CoAPClient::spawn(options, Some(http))
    }

    fn spawn(options: ExchangeOptions, http: Option<Arc<dyn HttpClient>>) -> CoAPClient {
        let (commands_tx, commands_rx) = unbounded_channel();
        let (transport_tx, transport_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();

        let exchange = Exchange::new(
            options,
            UdpSocketFactory::new(transport_tx.clone()),
            TokioTimers::new(transport_tx),
        );
        let actor = task::spawn(run(exchange, commands_rx, transport_rx, http, events_tx));

        CoAPClient {
            commands: commands_tx,
            events: UnboundedReceiverStream::new(events_rx),
            _actor: actor,
        }
    }

    /// Starts an exchange for `message`.
    ///
    /// The destination host is resolved first. A busy exchange or an
    /// unencodable message is reported here; the outcome of the exchange
    /// arrives as events.
    pub async fn send(&self, mut message: Message) -> std::result::Result<(), ExchangeError> {
        if message.proxy.is_none() {
            let addr = lookup_host((message.host.as_str(), message.port))
                .await
                .map_err(ExchangeError::Socket)?
                .next()
                .ok_or_else(|| {
                    ExchangeError::Socket(Error::new(
                        ErrorKind::NotFound,
                        format!("no address found for {}", message.host),
                    ))
                })?;
            message.host = addr.ip().to_string();
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply })
            .map_err(|_| ExchangeError::Closed)?;
        rx.await.map_err(|_| ExchangeError::Closed)?
    }

    pub fn cancel_observe(&self) {
        let _ = self.commands.send(Command::CancelObserve);
    }

    /// Closes the exchange. Pending timers are cancelled and the socket is
    /// released before this returns.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        self.events.next().await
    }

    /// Performs a confirmable GET and waits for the response.
    pub async fn get(&mut self, url: &str) -> Result<Message> {
        let request = Message::from_url(Method::Get, url)?;
        self.send(request).await?;

        while let Some(event) = self.next_event().await {
            match event {
                ExchangeEvent::MessageReceived(message) => return Ok(message),
                ExchangeEvent::Failed(e) => return Err(e.into()),
                ExchangeEvent::Retransmitted { attempt, .. } => {
                    debug!("GET {} retransmitted ({})", url, attempt)
                }
            }
        }
        Err(ExchangeError::Closed.into())
    }

    /// Registers an observation of `url`. Notifications arrive as events.
    pub async fn observe(&self, url: &str) -> Result<()> {
        let mut request = Message::from_url(Method::Get, url)?;
        request.set_observe(ObserveOption::Register as u32);
        self.send(request).await?;
        Ok(())
    }
}

impl Stream for CoAPClient {
    type Item = ExchangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

fn from_current_socket(exchange: &UdpExchange, socket: u64) -> bool {
    exchange.socket().map(TokioSocket::id) == Some(socket)
}

async fn run(
    mut exchange: UdpExchange,
    mut commands: UnboundedReceiver<Command>,
    mut transport: UnboundedReceiver<TransportEvent>,
    http: Option<Arc<dyn HttpClient>>,
    events: UnboundedSender<ExchangeEvent>,
) {
    let (http_tx, mut http_rx) = unbounded_channel::<(u64, Result<HttpResponse>)>();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { message, reply }) => {
                    let _ = reply.send(exchange.send_request(message));
                }
                Some(Command::CancelObserve) => exchange.cancel_observe(),
                Some(Command::Close { reply }) => {
                    exchange.close();
                    let _ = reply.send(());
                }
                None => {
                    exchange.close();
                    break;
                }
            },
            Some(event) = transport.recv() => match event {
                TransportEvent::Datagram { socket, bytes, from } => {
                    if from_current_socket(&exchange, socket) {
                        exchange.on_datagram(&bytes, &from.ip().to_string(), from.port());
                    } else {
                        trace!("dropping datagram from {} received on a released socket", from);
                    }
                }
                TransportEvent::SocketFailed { socket, error } => {
                    if from_current_socket(&exchange, socket) {
                        exchange.on_socket_error(error);
                    }
                }
                TransportEvent::TimerFired(handle) => exchange.on_timer(handle),
            },
            Some((generation, result)) = http_rx.recv() => {
                exchange.on_http_response(generation, result);
            }
        }

        while let Some((generation, request)) = exchange.take_http_request() {
            match &http {
                Some(client) => {
                    let client = client.clone();
                    let tx = http_tx.clone();
                    task::spawn(async move {
                        let result = client.execute(request).await;
                        let _ = tx.send((generation, result));
                    });
                }
                None => exchange.on_http_response(
                    generation,
                    Err(Error::new(ErrorKind::Unsupported, "no HTTP client configured")),
                ),
            }
        }

        while let Some(event) = exchange.poll_event() {
            let _ = events.send(event);
        }
    }
    debug!("client task finished");
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::SinkExt;
    use tokio::net::UdpSocket;
    use tokio_test::{assert_err, assert_ok};
    use tokio_util::udp::UdpFramed;

    use super::*;
    use crate::codec::MessageCodec;
    use crate::message::{HttpProxy, MessageClass, MessageType, ResponseCode};
    use crate::proxy::HttpRequest;

    async fn server() -> (UdpFramed<MessageCodec>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (UdpFramed::new(socket, MessageCodec::new()), addr)
    }

    fn reply(request: &Message, payload: &[u8]) -> Message {
        let mut response = Message::new();
        response.message_type = MessageType::Acknowledgement;
        response.message_id = request.message_id;
        response.token = request.token.clone();
        response.set_class(MessageClass::Response(ResponseCode::Content));
        response.payload = payload.to_vec();
        response
    }

    #[test]
    fn test_parse_coap_url_good_url() {
        assert!(parse_coap_url("coap://127.0.0.1").is_ok());
        assert!(parse_coap_url("coap://127.0.0.1:5683").is_ok());
        assert!(parse_coap_url("coap://[::1]").is_ok());
        assert!(parse_coap_url("coap://[::1]:5683").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]").is_ok());
        assert!(parse_coap_url("coap://[bbbb::9329:f033:f558:7418]:5683").is_ok());

        let (scheme, host, port, path, query) =
            parse_coap_url("coap://[bbbb::9329:f033:f558:7418]:5684/sensors/temp?unit=c").unwrap();
        assert_eq!(scheme, "coap");
        assert_eq!(host, "bbbb::9329:f033:f558:7418");
        assert_eq!(port, 5684);
        assert_eq!(path, "/sensors/temp");
        assert_eq!(query.as_deref(), Some("unit=c"));

        let (_, host, port, _, query) = parse_coap_url("coap://localhost").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 5683);
        assert_eq!(query, None);
    }

    #[test]
    fn test_parse_coap_url_bad_url() {
        assert!(parse_coap_url("coap://127.0.0.1:65536").is_err());
        assert!(parse_coap_url("coap://").is_err());
        assert!(parse_coap_url("coap://:5683").is_err());
        assert!(parse_coap_url("127.0.0.1").is_err());
        assert!(parse_coap_url("http://127.0.0.1/").is_err());
    }

    #[tokio::test]
    async fn test_get() {
        let (mut server, addr) = server().await;
        task::spawn(async move {
            let (request, peer) = server.next().await.unwrap().unwrap();
            assert_eq!(request.path(), "hello");
            assert_eq!(request.message_type, MessageType::Confirmable);
            server.send((reply(&request, b"world"), peer)).await.unwrap();
        });

        let mut client = CoAPClient::new(ExchangeOptions::default());
        let url = format!("coap://127.0.0.1:{}/hello", addr.port());
        let response = assert_ok!(client.get(&url).await);
        assert_eq!(response.payload, b"world".to_vec());
        assert_eq!(response.class(), MessageClass::Response(ResponseCode::Content));
        client.close().await;
    }

    #[tokio::test]
    async fn test_busy_until_closed() {
        let (_server, addr) = server().await;
        let client = CoAPClient::new(ExchangeOptions::default());
        let url = format!("coap://127.0.0.1:{}/slow", addr.port());

        assert_ok!(client.send(Message::from_url(Method::Get, &url).unwrap()).await);
        let busy = client.send(Message::from_url(Method::Get, &url).unwrap()).await;
        assert!(matches!(busy, Err(ExchangeError::Busy)));

        client.close().await;
        assert_ok!(client.send(Message::from_url(Method::Get, &url).unwrap()).await);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_exhausts_retransmissions() {
        let (_server, addr) = server().await;
        let mut client = CoAPClient::new(ExchangeOptions::default());
        let url = format!("coap://127.0.0.1:{}/void", addr.port());
        client
            .send(Message::from_url(Method::Get, &url).unwrap())
            .await
            .unwrap();

        let mut attempts = Vec::new();
        loop {
            match client.next().await.unwrap() {
                ExchangeEvent::Retransmitted { attempt, is_final, .. } => {
                    attempts.push((attempt, is_final))
                }
                ExchangeEvent::Failed(e) => {
                    assert!(matches!(e, ExchangeError::MaxRetransmitReached { attempts: 4 }));
                    break;
                }
                ExchangeEvent::MessageReceived(m) => panic!("unexpected message {:?}", m),
            }
        }
        assert_eq!(attempts, vec![(1, false), (2, false), (3, false), (4, true)]);
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let client = CoAPClient::new(ExchangeOptions::default());
        let mut request = Message::request(true, Method::Get, true, b"");
        request.set_destination("host.invalid", 5683);
        assert_err!(client.send(request).await);
    }

    #[derive(Default)]
    struct RecordingHttp {
        requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for RecordingHttp {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(HttpResponse {
                status: 200,
                headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
                body: b"via proxy".to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn test_proxied_get() {
        let http = Arc::new(RecordingHttp::default());
        let mut client = CoAPClient::with_http_client(ExchangeOptions::default(), http.clone());

        let mut request = Message::from_url(Method::Get, "coap://sensor.local/temp").unwrap();
        request.proxy = Some(HttpProxy {
            host: "127.0.0.1".to_string(),
            port: 8080,
        });
        client.send(request).await.unwrap();

        match client.next_event().await.unwrap() {
            ExchangeEvent::MessageReceived(message) => {
                assert_eq!(message.payload, b"via proxy".to_vec());
                assert_eq!(message.message_type, MessageType::Acknowledgement);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].url.as_str(),
            "http://127.0.0.1:8080/coap://sensor.local:5683/temp"
        );
    }
}
