use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use log::{debug, error, warn};
use mio::event::Event;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};

use super::{Driver, Stats};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::protocol::MAX_FRAME_LEN;
use crate::service::{Reply, Service};

/// Replies waiting for the socket to become writable again.
const MAX_OUTBOUND: usize = 64;

/// UDP transport: one bound socket, no per-client state.
///
/// Every datagram is a complete request and is answered to its sender
/// address. Only replies the kernel refused with `WouldBlock` are kept, in a
/// bounded queue.
pub struct DatagramDriver {
    socket: UdpSocket,
    outbound: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl Driver for DatagramDriver {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr)?,
            outbound: VecDeque::new(),
        })
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.socket,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn on_ready<D: Dispatcher>(
        &mut self,
        _event: &Event,
        _registry: &Registry,
        service: &Service<D>,
        stats: &mut Stats,
    ) -> Result<()> {
        // Both directions are drained on every edge; the one that is not
        // ready stops at its first WouldBlock.
        self.flush(stats);
        self.receive_all(service, stats)
    }
}

impl DatagramDriver {
    fn receive_all<D: Dispatcher>(&mut self, service: &Service<D>, stats: &mut Stats) -> Result<()> {
        // One spare byte: the kernel truncates silently, the decoder does not.
        let mut buf = [0u8; MAX_FRAME_LEN + 1];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_peer_error(&e) => {
                    debug!("recv_from: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("datagram socket failed: {}", e);
                    return Err(e.into());
                }
            };

            match service.handle(&buf[..n]) {
                Ok(Reply::Frame(frame)) => self.send(frame, peer, stats),
                Ok(Reply::Hangup) => debug!("ignoring exit request from {}", peer),
                Err(e) => {
                    warn!("dropping datagram from {}: {}", peer, e);
                    stats.dropped += 1;
                }
            }
        }
    }

    /// Send errors concern one peer only and never fail the socket.
    fn send(&mut self, frame: Vec<u8>, peer: SocketAddr, stats: &mut Stats) {
        if !self.outbound.is_empty() {
            return self.enqueue(frame, peer, stats);
        }
        loop {
            match self.socket.send_to(&frame, peer) {
                Ok(_) => stats.served += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.enqueue(frame, peer, stats),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("reply to {} failed: {}", peer, e);
                    stats.dropped += 1;
                }
            }
            return;
        }
    }

    fn enqueue(&mut self, frame: Vec<u8>, peer: SocketAddr, stats: &mut Stats) {
        if self.outbound.len() >= MAX_OUTBOUND {
            warn!("outbound queue full, dropping reply to {}", peer);
            stats.dropped += 1;
        } else {
            self.outbound.push_back((frame, peer));
        }
    }

    fn flush(&mut self, stats: &mut Stats) {
        while let Some((frame, peer)) = self.outbound.front() {
            match self.socket.send_to(frame, *peer) {
                Ok(_) => stats.served += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("queued reply to {} failed: {}", peer, e);
                    stats.dropped += 1;
                }
            }
            self.outbound.pop_front();
        }
    }
}

/// Errors that concern one remote peer, e.g. a stale ICMP unreachable.
fn is_peer_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}
