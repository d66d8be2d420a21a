//! tokio implementations of the exchange's socket and timer collaborators.
//!
//! Receive loops and timers run as their own tasks and report back through
//! an unbounded channel of [`TransportEvent`]s, which the task owning the
//! exchange feeds into it one at a time.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{self, JoinHandle};
use tokio::time;

use crate::exchange::{DatagramSocket, SocketFactory, TimerHandle, TimerKind, TimerService};

pub const COAP_MTU: usize = 1600;

#[derive(Debug)]
pub enum TransportEvent {
    Datagram {
        socket: u64,
        bytes: Vec<u8>,
        from: SocketAddr,
    },
    SocketFailed {
        socket: u64,
        error: Error,
    },
    TimerFired(TimerHandle),
}

/// Binds tokio UDP sockets, each with its own receive task.
pub struct UdpSocketFactory {
    events: UnboundedSender<TransportEvent>,
    next_id: u64,
}

impl UdpSocketFactory {
    pub fn new(events: UnboundedSender<TransportEvent>) -> UdpSocketFactory {
        UdpSocketFactory { events, next_id: 0 }
    }
}

impl SocketFactory for UdpSocketFactory {
    type Socket = TokioSocket;

    fn bind(&mut self, local_port: Option<u16>, remote_host: &str) -> Result<TokioSocket> {
        // Choose the local address family from the peer
        let port = local_port.unwrap_or(0);
        let bind_addr = match remote_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        };

        let socket = std::net::UdpSocket::bind(bind_addr).map_err(|e| {
            error!("Error binding local socket {}: {:?}", bind_addr, e);
            e
        })?;
        socket.set_nonblocking(true)?;
        let sender = socket.try_clone()?;
        let rx = UdpSocket::from_std(socket)?;
        let local_addr = rx.local_addr()?;
        debug!("Bound to socket: {}", local_addr);

        self.next_id += 1;
        let id = self.next_id;
        let events = self.events.clone();
        let listener = task::spawn(async move {
            let mut buf = vec![0u8; COAP_MTU];
            loop {
                match rx.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        trace!("Received data: {:?} from {:?}", &buf[..n], from);
                        let event = TransportEvent::Datagram {
                            socket: id,
                            bytes: buf[..n].to_vec(),
                            from,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving on {}: {:?}", local_addr, e);
                        let _ = events.send(TransportEvent::SocketFailed { socket: id, error: e });
                        break;
                    }
                }
            }
        });

        Ok(TokioSocket {
            id,
            sender,
            local_addr,
            listener,
        })
    }
}

/// A bound UDP socket. Sends go straight through the non-blocking std
/// handle; receiving is done by the spawned listener task.
pub struct TokioSocket {
    id: u64,
    sender: std::net::UdpSocket,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
}

impl TokioSocket {
    /// Tags the [`TransportEvent`]s coming from this socket.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let ipv6 = self.local_addr.is_ipv6();
        (host, port)
            .to_socket_addrs()?
            .find_map(|addr| match (addr, ipv6) {
                (SocketAddr::V4(v4), true) => Some(SocketAddr::new(
                    IpAddr::V6(v4.ip().to_ipv6_mapped()),
                    v4.port(),
                )),
                (SocketAddr::V6(_), false) => None,
                (addr, _) => Some(addr),
            })
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("{} is not reachable from {}", host, self.local_addr),
                )
            })
    }
}

impl DatagramSocket for TokioSocket {
    fn send_to(&mut self, bytes: &[u8], host: &str, port: u16) -> Result<()> {
        let addr = self.resolve(host, port)?;
        trace!("Sending data: {:?} to {:?}", bytes, addr);
        self.sender.send_to(bytes, addr).map(|_| ())
    }

    fn close(&mut self) {
        debug!("Closing socket {}", self.local_addr);
        self.listener.abort();
    }
}

impl Drop for TokioSocket {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Timers backed by `tokio::time::sleep`. The clock is tokio's, so a paused
/// test runtime drives the exchange as well.
pub struct TokioTimers {
    events: UnboundedSender<TransportEvent>,
    next_id: u64,
    tasks: HashMap<u64, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(events: UnboundedSender<TransportEvent>) -> TokioTimers {
        TokioTimers {
            events,
            next_id: 0,
            tasks: HashMap::new(),
        }
    }
}

impl TimerService for TokioTimers {
    fn now(&self) -> Instant {
        time::Instant::now().into_std()
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) -> TimerHandle {
        self.tasks.retain(|_, task| !task.is_finished());

        self.next_id += 1;
        let handle = TimerHandle {
            kind,
            id: self.next_id,
        };
        let events = self.events.clone();
        let task = task::spawn(async move {
            time::sleep(after).await;
            let _ = events.send(TransportEvent::TimerFired(handle));
        });
        self.tasks.insert(handle.id, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle.id) {
            task.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (tx, mut rx) = unbounded_channel();
        let mut factory = UdpSocketFactory::new(tx);
        let mut socket = factory.bind(None, "127.0.0.1").unwrap();
        assert!(socket.local_addr().is_ipv4());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        socket.send_to(b"ping", "127.0.0.1", peer_addr.port()).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Datagram { socket: id, bytes, from } => {
                assert_eq!(id, socket.id());
                assert_eq!(bytes, b"pong".to_vec());
                assert_eq!(from, peer_addr);
            }
            other => panic!("unexpected event {:?}", other),
        }
        socket.close();
    }

    #[tokio::test]
    async fn test_ipv4_socket_cannot_reach_ipv6() {
        let (tx, _rx) = unbounded_channel();
        let mut socket = UdpSocketFactory::new(tx).bind(None, "127.0.0.1").unwrap();
        let e = socket.send_to(b"ping", "::1", 5683).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AddrNotAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_and_cancel() {
        let (tx, mut rx) = unbounded_channel();
        let mut timers = TokioTimers::new(tx);
        let start = timers.now();

        let cancelled = timers.arm(TimerKind::Retransmit, Duration::from_secs(1));
        let fired = timers.arm(TimerKind::MaxWait, Duration::from_secs(3));
        assert_ne!(cancelled, fired);
        timers.cancel(cancelled);

        match rx.recv().await.unwrap() {
            TransportEvent::TimerFired(handle) => assert_eq!(handle, fired),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(timers.now() - start >= Duration::from_secs(3));
    }
}
