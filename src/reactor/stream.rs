use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use log::{debug, error, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use super::{Driver, Stats};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::protocol::{MAX_FRAME_LEN, frame_len};
use crate::service::{Reply, Service};

/// Tokens below this one belong to the reactor itself.
const FIRST_PEER: usize = 2;

const READ_CHUNK: usize = 512;

/// Lifecycle of one TCP connection.
///
/// ```text
/// Accepted -> Reading -> Processing -> Writing -> Closed
///     \__________\___________\____________\_______/
///           disconnect / decode error / EXT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accepted and registered, nothing read yet.
    Accepted,
    /// Accumulating bytes until a full frame arrives.
    Reading,
    /// Decoding and dispatching; never suspends.
    Processing,
    /// Flushing the encoded response.
    Writing,
    /// Done; the connection is deregistered and dropped.
    Closed,
}

/// TCP transport: one listener and a table of live connections.
pub struct StreamDriver {
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl Driver for StreamDriver {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            connections: HashMap::new(),
            next_token: FIRST_PEER,
        })
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.listener, token, Interest::READABLE)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn on_ready<D: Dispatcher>(
        &mut self,
        event: &Event,
        registry: &Registry,
        service: &Service<D>,
        stats: &mut Stats,
    ) -> Result<()> {
        if event.token() == super::LISTENER {
            return self.accept_all(registry, service, stats);
        }

        let token = event.token();
        // Events for a connection closed earlier in the same batch are stale.
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        conn.on_event(service, stats);
        if conn.phase == Phase::Closed {
            if let Some(conn) = self.connections.remove(&token) {
                conn.release(registry);
            }
        }
        Ok(())
    }

    fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

impl StreamDriver {
    fn accept_all<D: Dispatcher>(
        &mut self,
        registry: &Registry,
        service: &Service<D>,
        stats: &mut Stats,
    ) -> Result<()> {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("accept: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("listener failed: {}", e);
                    return Err(e.into());
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = registry.register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("cannot register {}: {}", peer, e);
                continue;
            }
            stats.accepted += 1;
            debug!("accepted {} as {:?}", peer, token);

            // The request may already be buffered; reading now does not wait
            // for the registration edge.
            let mut conn = Connection::new(stream, peer);
            conn.on_event(service, stats);
            if conn.phase == Phase::Closed {
                conn.release(registry);
            } else {
                self.connections.insert(token, conn);
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    )
}

/// Per-connection state, owned by the reactor thread.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    input: Vec<u8>,
    output: Vec<u8>,
    written: usize,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            phase: Phase::Accepted,
            input: Vec::with_capacity(READ_CHUNK),
            output: Vec::new(),
            written: 0,
        }
    }

    /// Drive the connection as far as the socket allows.
    fn on_event<D: Dispatcher>(&mut self, service: &Service<D>, stats: &mut Stats) {
        match self.phase {
            Phase::Accepted | Phase::Reading => self.read(service, stats),
            Phase::Writing => self.flush(stats),
            Phase::Processing | Phase::Closed => {}
        }
    }

    fn read<D: Dispatcher>(&mut self, service: &Service<D>, stats: &mut Stats) {
        self.phase = Phase::Reading;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(len) = frame_len(&self.input) {
                self.input.truncate(len);
                return self.process(service, stats);
            }
            if self.input.len() >= MAX_FRAME_LEN {
                warn!("{} sent no frame within {} bytes", self.peer, MAX_FRAME_LEN);
                stats.dropped += 1;
                return self.close();
            }

            let room = (MAX_FRAME_LEN - self.input.len()).min(READ_CHUNK);
            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => {
                    debug!("{} disconnected", self.peer);
                    return self.close();
                }
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read from {} failed: {}", self.peer, e);
                    return self.close();
                }
            }
        }
    }

    fn process<D: Dispatcher>(&mut self, service: &Service<D>, stats: &mut Stats) {
        self.phase = Phase::Processing;
        match service.handle(&self.input) {
            Ok(Reply::Frame(frame)) => {
                self.output = frame;
                self.written = 0;
                self.phase = Phase::Writing;
                self.flush(stats);
            }
            Ok(Reply::Hangup) => {
                debug!("{} asked to exit", self.peer);
                self.close();
            }
            Err(e) => {
                warn!("closing {}: {}", self.peer, e);
                stats.dropped += 1;
                self.close();
            }
        }
    }

    fn flush(&mut self, stats: &mut Stats) {
        while self.written < self.output.len() {
            match self.stream.write(&self.output[self.written..]) {
                Ok(0) => return self.close(),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("write to {} failed: {}", self.peer, e);
                    return self.close();
                }
            }
        }
        stats.served += 1;
        // One request per connection.
        self.close();
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
    }

    fn release(mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            debug!("deregister {}: {}", self.peer, e);
        }
    }
}
