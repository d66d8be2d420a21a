//! The transmission state machine.
//!
//! An [`Exchange`] carries one logical request at a time: it sends the
//! request, retransmits confirmable messages with exponential backoff,
//! matches the response, follows Block2 transfers and Observe
//! notifications, and reports everything as [`ExchangeEvent`]s.
//!
//! The engine does no I/O of its own. Sockets and timers are collaborators
//! handed in at construction, and every input (datagram, timer, HTTP
//! response) is fed in by the owner through one `&mut self` method, so all
//! transitions are serialized on whatever context owns the exchange.

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::Rng;

use crate::block::{BlockProgress, BlockTransfer, BlockValue};
use crate::codec;
use crate::config::{ExchangeOptions, TOKEN_LENGTH};
use crate::error::ExchangeError;
use crate::message::{CoapOption, Message, MessageType, ObserveOption};
use crate::observer::ObserveSubscription;
use crate::proxy::{self, HttpRequest, HttpResponse};

/// A bound UDP endpoint owned by one exchange.
pub trait DatagramSocket {
    fn send_to(&mut self, bytes: &[u8], host: &str, port: u16) -> io::Result<()>;
    /// Stops receiving and releases the endpoint.
    fn close(&mut self);
}

pub trait SocketFactory {
    type Socket: DatagramSocket;

    /// Binds a socket able to reach `remote_host`, on `local_port` when given.
    fn bind(&mut self, local_port: Option<u16>, remote_host: &str) -> io::Result<Self::Socket>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    MaxWait,
}

/// Identifies one arming of a timer. Handles are never reused, so a
/// callback for a cancelled or superseded timer can be told apart from the
/// live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub kind: TimerKind,
    pub id: u64,
}

/// One-shot timers. When an armed timer expires the owner of the exchange
/// calls [`Exchange::on_timer`] with its handle.
pub trait TimerService {
    fn now(&self) -> Instant;
    fn arm(&mut self, kind: TimerKind, after: Duration) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
    AwaitingMatch,
    Delivered,
    Retrying,
    TimedOut,
    SocketError,
    Closed,
}

/// What an exchange reports to its owner.
#[derive(Debug)]
pub enum ExchangeEvent {
    MessageReceived(Message),
    Retransmitted {
        message: Message,
        attempt: u32,
        is_final: bool,
    },
    /// The exchange ended with an error. Reported once per exchange.
    Failed(ExchangeError),
}

/// Wrapping message ID counter with a random start.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: u16,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        MessageIdAllocator::new()
    }
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self {
            next: rand::thread_rng().gen(),
        }
    }

    pub fn allocate(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// The message currently on the wire.
#[derive(Debug)]
struct Transmission {
    message: Message,
    datagram: Vec<u8>,
    retransmissions: u32,
    timeout: Duration,
    retransmit_timer: Option<TimerHandle>,
    max_wait_timer: Option<TimerHandle>,
    /// An empty ACK arrived; a separate response is expected.
    acknowledged: bool,
}

pub struct Exchange<F: SocketFactory, T: TimerService> {
    options: ExchangeOptions,
    sockets: F,
    timers: T,
    socket: Option<F::Socket>,
    state: ExchangeState,
    /// The request as the caller submitted it, with its token assigned.
    /// Block follow-ups and deregistration are derived from it.
    request: Option<Message>,
    pending: Option<Transmission>,
    observe: Option<ObserveSubscription>,
    block: Option<BlockTransfer>,
    message_ids: MessageIdAllocator,
    events: VecDeque<ExchangeEvent>,
    http_request: Option<(u64, HttpRequest)>,
    generation: u64,
}

impl<F: SocketFactory, T: TimerService> Exchange<F, T> {
    pub fn new(options: ExchangeOptions, sockets: F, timers: T) -> Self {
        Exchange {
            options,
            sockets,
            timers,
            socket: None,
            state: ExchangeState::Idle,
            request: None,
            pending: None,
            observe: None,
            block: None,
            message_ids: MessageIdAllocator::new(),
            events: VecDeque::new(),
            http_request: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub fn socket(&self) -> Option<&F::Socket> {
        self.socket.as_ref()
    }

    /// Whether a response, separate response, further block or further
    /// notification is still expected.
    pub fn is_message_in_transmission(&self) -> bool {
        self.pending.is_some()
            || self.block.is_some()
            || self
                .observe
                .as_ref()
                .map_or(false, |subscription| !subscription.is_cancelled())
    }

    pub fn poll_event(&mut self) -> Option<ExchangeEvent> {
        self.events.pop_front()
    }

    /// The HTTP request waiting to be executed for a proxied message, tagged
    /// with the generation to pass back to [`Exchange::on_http_response`].
    pub fn take_http_request(&mut self) -> Option<(u64, HttpRequest)> {
        self.http_request.take()
    }

    /// Starts a new exchange for `message`.
    ///
    /// Only a busy exchange or an unencodable message is reported here;
    /// every later failure arrives as a single [`ExchangeEvent::Failed`].
    pub fn send_request(&mut self, mut message: Message) -> Result<(), ExchangeError> {
        if self.is_message_in_transmission() {
            debug!("rejecting request, a message is already in transmission");
            return Err(ExchangeError::Busy);
        }

        if message.is_token_requested && message.token.is_empty() {
            message.token = rand::thread_rng().gen::<[u8; TOKEN_LENGTH]>().to_vec();
        }
        message.message_id = self.message_ids.allocate();
        let datagram = codec::encode(&message)?;

        self.block = None;
        self.observe = match message.observe() {
            Some(value) if value == ObserveOption::Register as u32 && message.is_request() => Some(
                ObserveSubscription::new(self.options.parameters.max_notification_delay),
            ),
            _ => None,
        };
        self.request = Some(message.clone());
        self.begin(message, datagram);
        Ok(())
    }

    /// Feeds a datagram received on the exchange's socket.
    pub fn on_datagram(&mut self, bytes: &[u8], host: &str, port: u16) {
        if self.state == ExchangeState::Closed {
            return;
        }

        let mut message = match codec::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("discarding malformed datagram from {}:{}: {}", host, port, e);
                return;
            }
        };
        trace!(
            "received {:?} {} id={} from {}:{}",
            message.message_type,
            message.code_str(),
            message.message_id,
            host,
            port
        );
        message.set_destination(host, port);
        message.timestamp = Some(self.timers.now());

        match message.message_type {
            MessageType::Acknowledgement | MessageType::Reset => self.on_acknowledgement(message),
            MessageType::Confirmable | MessageType::NonConfirmable => self.on_response(message),
        }
    }

    /// Feeds an expired timer. Handles that are no longer armed are ignored.
    pub fn on_timer(&mut self, handle: TimerHandle) {
        let pending = match self.pending.as_mut() {
            Some(pending)
                if pending.retransmit_timer == Some(handle)
                    || pending.max_wait_timer == Some(handle) =>
            {
                pending
            }
            _ => {
                trace!("ignoring stale timer {:?}", handle);
                return;
            }
        };

        match handle.kind {
            TimerKind::MaxWait => {
                pending.max_wait_timer = None;
                self.fail(ExchangeError::NoResponse);
            }
            TimerKind::Retransmit => {
                pending.retransmit_timer = None;
                self.retransmit();
            }
        }
    }

    /// Reports a receive failure on the exchange's socket.
    pub fn on_socket_error(&mut self, error: io::Error) {
        if self.socket.is_none() || self.state == ExchangeState::Closed {
            return;
        }
        if self.is_message_in_transmission() {
            self.fail(ExchangeError::Socket(error));
        } else {
            debug!("releasing socket after receive error: {}", error);
            self.release_socket();
        }
    }

    /// Feeds the outcome of an HTTP request obtained from
    /// [`Exchange::take_http_request`].
    pub fn on_http_response(&mut self, generation: u64, result: io::Result<HttpResponse>) {
        let request = match &self.pending {
            Some(pending) if generation == self.generation && pending.message.proxy.is_some() => {
                pending.message.clone()
            }
            _ => {
                debug!("ignoring HTTP response for a finished request");
                return;
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail(ExchangeError::Proxying(e.to_string()));
                return;
            }
        };
        match proxy::from_http_response(&request, response) {
            Ok(mut message) => {
                message.timestamp = Some(self.timers.now());
                self.on_matched(message);
            }
            Err(e) => self.fail(e),
        }
    }

    /// Ends the current Observe registration by sending the original
    /// request again with `Observe: 1`. The answer to that request is still
    /// delivered; further notifications are not.
    pub fn cancel_observe(&mut self) {
        match self.observe.as_mut() {
            Some(subscription) if !subscription.is_cancelled() => subscription.cancel(),
            _ => {
                debug!("no active observation to cancel");
                return;
            }
        }
        let mut request = match &self.request {
            Some(request) => request.clone(),
            None => return,
        };

        self.stop_pending();
        self.block = None;
        request.set_observe(ObserveOption::Deregister as u32);
        request.clear_option(CoapOption::Block2);
        debug!("deregistering observation of {}", request.path());
        self.transmit(request);
    }

    /// Cancels all timers, releases the socket and moves to `Closed`.
    /// Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if self.state == ExchangeState::Closed {
            return;
        }
        self.stop_pending();
        self.block = None;
        self.observe = None;
        self.release_socket();
        self.generation += 1;
        self.state = ExchangeState::Closed;
        debug!("exchange closed");
    }

    fn transmit(&mut self, mut message: Message) {
        message.message_id = self.message_ids.allocate();
        match codec::encode(&message) {
            Ok(datagram) => self.begin(message, datagram),
            Err(e) => self.fail(e.into()),
        }
    }

    fn begin(&mut self, mut message: Message, datagram: Vec<u8>) {
        self.generation += 1;
        self.state = ExchangeState::Sending;
        message.timestamp = Some(self.timers.now());

        let proxied = message.proxy.is_some();
        if proxied {
            match proxy::to_http_request(&message) {
                Ok(request) => {
                    debug!("forwarding message {} as {} {}", message.message_id, request.method, request.url);
                    self.http_request = Some((self.generation, request));
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        } else if let Err(e) = self.send_datagram(&datagram, &message.host, message.port) {
            self.fail(ExchangeError::Socket(e));
            return;
        }

        let timeout = self.options.parameters.initial_timeout();
        let retransmit_timer = if message.message_type == MessageType::Confirmable && !proxied {
            Some(self.timers.arm(TimerKind::Retransmit, timeout))
        } else {
            None
        };
        let max_wait_timer = Some(
            self.timers
                .arm(TimerKind::MaxWait, self.options.parameters.max_transmit_wait),
        );

        self.pending = Some(Transmission {
            message,
            datagram,
            retransmissions: 0,
            timeout,
            retransmit_timer,
            max_wait_timer,
            acknowledged: false,
        });
        self.state = ExchangeState::AwaitingMatch;
    }

    fn send_datagram(&mut self, datagram: &[u8], host: &str, port: u16) -> io::Result<()> {
        if self.socket.is_none() {
            let socket = self.sockets.bind(self.options.local_port, host)?;
            self.socket = Some(socket);
        }
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))?;
        trace!("sending {} bytes to {}:{}", datagram.len(), host, port);
        socket.send_to(datagram, host, port)
    }

    fn retransmit(&mut self) {
        let max_retransmit = self.options.parameters.max_retransmit;
        let pending = match self.pending.as_mut() {
            Some(pending) => pending,
            None => return,
        };
        if pending.retransmissions >= max_retransmit {
            let attempts = pending.retransmissions;
            self.fail(ExchangeError::MaxRetransmitReached { attempts });
            return;
        }

        pending.retransmissions += 1;
        pending.timeout *= 2;
        let attempt = pending.retransmissions;
        let timeout = pending.timeout;
        let message = pending.message.clone();
        let datagram = pending.datagram.clone();

        self.state = ExchangeState::Retrying;
        if let Err(e) = self.send_datagram(&datagram, &message.host, message.port) {
            self.fail(ExchangeError::Socket(e));
            return;
        }
        debug!(
            "retransmission {}/{} of message {}",
            attempt, max_retransmit, message.message_id
        );

        let handle = self.timers.arm(TimerKind::Retransmit, timeout);
        if let Some(pending) = self.pending.as_mut() {
            pending.retransmit_timer = Some(handle);
        }
        self.state = ExchangeState::AwaitingMatch;
        self.events.push_back(ExchangeEvent::Retransmitted {
            message,
            attempt,
            is_final: attempt == max_retransmit,
        });
    }

    fn on_acknowledgement(&mut self, message: Message) {
        let pending = match &self.pending {
            Some(pending)
                if pending.message.message_id == message.message_id
                    && pending.message.proxy.is_none()
                    && same_endpoint(&message, &pending.message) =>
            {
                pending
            }
            _ => {
                debug!(
                    "discarding {:?} with unknown message id {}",
                    message.message_type, message.message_id
                );
                return;
            }
        };

        if message.message_type == MessageType::Reset {
            debug!("message {} was reset by the peer", message.message_id);
            self.stop_pending();
            self.block = None;
            self.observe = None;
            self.deliver(message);
            return;
        }

        if message.is_empty() {
            if pending.acknowledged {
                trace!("duplicate acknowledgement of message {}", message.message_id);
                return;
            }
            debug!(
                "message {} acknowledged, waiting for a separate response",
                message.message_id
            );
            self.acknowledge_pending();
            return;
        }

        if !message.is_response() {
            debug!(
                "discarding acknowledgement {} carrying code {}",
                message.message_id,
                message.code_str()
            );
            return;
        }
        if message.token != pending.message.token {
            debug!(
                "discarding piggybacked response {} with a foreign token",
                message.message_id
            );
            return;
        }
        self.on_matched(message);
    }

    fn on_response(&mut self, message: Message) {
        if !message.is_response() {
            self.reject(message);
            return;
        }

        let expected = self.pending.is_some() || self.observe.is_some();
        let matches = self.request.as_ref().map_or(false, |request| {
            request.token == message.token && same_endpoint(&message, request)
        });
        if !expected || !matches {
            debug!(
                "discarding message {} with an unexpected token",
                message.message_id
            );
            return;
        }

        if message.message_type == MessageType::Confirmable {
            match codec::encode(&Message::empty_ack(message.message_id)) {
                Ok(ack) => {
                    if let Err(e) = self.send_datagram(&ack, &message.host, message.port) {
                        self.fail(ExchangeError::Socket(e));
                        return;
                    }
                }
                Err(e) => warn!("cannot acknowledge message {}: {}", message.message_id, e),
            }
        }
        self.on_matched(message);
    }

    /// Answers a confirmable ping or request from the peer with a reset.
    /// Non-confirmable ones are dropped.
    fn reject(&mut self, message: Message) {
        debug!(
            "discarding {:?} {} id={}: not a response",
            message.message_type,
            message.code_str(),
            message.message_id
        );
        if message.message_type != MessageType::Confirmable {
            return;
        }
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return,
        };
        match codec::encode(&Message::reset(message.message_id)) {
            Ok(rst) => {
                if let Err(e) = socket.send_to(&rst, &message.host, message.port) {
                    warn!("cannot reset message {}: {}", message.message_id, e);
                }
            }
            Err(e) => warn!("cannot reset message {}: {}", message.message_id, e),
        }
    }

    /// Handles a response that belongs to this exchange, running it through
    /// the Observe and Block2 layers before it is delivered.
    fn on_matched(&mut self, mut message: Message) {
        let now = message.timestamp.unwrap_or_else(|| self.timers.now());
        let notification = message.observe();
        let block = match message.block2() {
            Some(Ok(block)) => Some(block),
            Some(Err(e)) => {
                debug!("ignoring invalid Block2 option: {}", e);
                None
            }
            None => None,
        };

        if let Some(subscription) = &self.observe {
            if subscription.is_cancelled()
                && notification.is_some()
                && message.message_type != MessageType::Acknowledgement
            {
                debug!("suppressing notification after deregistration");
                return;
            }
        }
        if let Some(transfer) = &self.block {
            if block.map(|b| b.num) != Some(transfer.next_num()) {
                debug!(
                    "discarding response while waiting for block {}",
                    transfer.next_num()
                );
                return;
            }
        } else if let (Some(subscription), Some(value)) = (&self.observe, notification) {
            if !subscription.is_cancelled() && !subscription.is_fresh(value, now) {
                debug!("discarding stale notification {}", value);
                return;
            }
        }

        self.stop_pending();

        if self.block.is_none() {
            if let Some(subscription) = self.observe.as_mut() {
                let active = match notification {
                    Some(value) if !subscription.is_cancelled() => subscription.accept(value, now),
                    _ => false,
                };
                if !active {
                    debug!("observation ended");
                    self.observe = None;
                }
            }
        }

        let block = match block {
            Some(block) => block,
            None => {
                self.deliver(message);
                return;
            }
        };
        let progress = match self.block.as_mut() {
            Some(transfer) => transfer.push(block, &message.payload),
            None if block.more => match BlockTransfer::start(block, &message.payload) {
                Ok((transfer, progress)) => {
                    self.block = Some(transfer);
                    Ok(progress)
                }
                Err(e) => Err(e),
            },
            None => {
                self.deliver(message);
                return;
            }
        };

        match progress {
            Ok(BlockProgress::Request(next)) => self.request_block(next),
            Ok(BlockProgress::Complete(body)) => {
                self.block = None;
                message.payload = body;
                self.deliver(message);
            }
            Ok(BlockProgress::OutOfSequence) => {
                debug!("block {} arrived out of sequence", block.num);
            }
            Err(e) => {
                warn!("abandoning block transfer: {}", e);
                self.block = None;
                self.deliver(message);
            }
        }
    }

    fn request_block(&mut self, next: BlockValue) {
        let mut request = match &self.request {
            Some(request) => request.clone(),
            None => return,
        };
        request.clear_option(CoapOption::Observe);
        request.set_block2(next);
        debug!("requesting block {} of {} bytes", next.num, next.size());
        self.transmit(request);
    }

    fn deliver(&mut self, message: Message) {
        self.state = ExchangeState::Delivered;
        self.events.push_back(ExchangeEvent::MessageReceived(message));
    }

    fn acknowledge_pending(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.acknowledged = true;
            let timers = [pending.retransmit_timer.take(), pending.max_wait_timer.take()];
            for handle in timers.into_iter().flatten() {
                self.timers.cancel(handle);
            }
        }
    }

    fn stop_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            for handle in [pending.retransmit_timer, pending.max_wait_timer]
                .into_iter()
                .flatten()
            {
                self.timers.cancel(handle);
            }
        }
        self.http_request = None;
    }

    fn release_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
    }

    fn fail(&mut self, error: ExchangeError) {
        warn!("exchange failed: {}", error);
        self.stop_pending();
        self.block = None;
        self.observe = None;
        self.release_socket();
        self.state = match error {
            ExchangeError::NoResponse | ExchangeError::MaxRetransmitReached { .. } => {
                ExchangeState::TimedOut
            }
            _ => ExchangeState::SocketError,
        };
        self.events.push_back(ExchangeEvent::Failed(error));
    }
}

/// Whether `message` came from the endpoint `request` was sent to. Hosts
/// that are not IP literals are only compared by port.
fn same_endpoint(message: &Message, request: &Message) -> bool {
    if message.port != request.port {
        return false;
    }
    match (message.host.parse::<IpAddr>(), request.host.parse::<IpAddr>()) {
        (Ok(from), Ok(to)) => canonical(from) == canonical(to),
        (Err(_), Ok(_)) => message.host.eq_ignore_ascii_case(&request.host),
        (_, Err(_)) => true,
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}
