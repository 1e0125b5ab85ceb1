//! A single-threaded, readiness-driven server.
//!
//! The [`Reactor`] owns one [`mio::Poll`] and one listening or bound socket,
//! and multiplexes every client over it without blocking. `mio` delivers
//! edge-triggered readiness, so every event is drained until the socket
//! reports `WouldBlock` before the loop waits again; an event left half
//! consumed would not be reported a second time.
//!
//! The loop itself knows nothing about TCP or UDP: a [`Driver`] owns the
//! socket and reacts to its events. [`StreamDriver`] runs one small state
//! machine per accepted connection, [`DatagramDriver`] answers every datagram
//! on its own.

mod datagram;
mod stream;

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::service::Service;

pub use self::datagram::DatagramDriver;
pub use self::stream::StreamDriver;

/// Token of the listening or bound socket.
const LISTENER: Token = Token(0);
/// Token of the shutdown waker.
const WAKER: Token = Token(1);

const EVENTS_CAPACITY: usize = 128;

/// A trait for the transport half of a [`Reactor`].
///
/// Errors returned from [`Driver::on_ready`] are fatal to the loop and are
/// reserved for the listening or bound socket; a failing client is torn down
/// inside the driver.
pub trait Driver: Sized {
    /// Bind the server socket in non-blocking mode.
    fn bind(addr: SocketAddr) -> io::Result<Self>;

    /// Register the server socket under `token`.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Address the server socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Handle one readiness event, draining it completely.
    fn on_ready<D: Dispatcher>(
        &mut self,
        event: &Event,
        registry: &Registry,
        service: &Service<D>,
        stats: &mut Stats,
    ) -> Result<()>;

    /// Number of client connections currently held.
    fn open_connections(&self) -> usize {
        0
    }
}

/// Counters kept by the reactor thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted.
    pub accepted: u64,
    /// Responses fully written.
    pub served: u64,
    /// Requests dropped: malformed frames, overflowing buffers, failed sends.
    pub dropped: u64,
}

/// Stops a running [`Reactor`] from another thread.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Shutdown {
    /// Ask the reactor to return from [`Reactor::run`].
    pub fn trigger(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Event loop over one server socket, generic over its transport.
pub struct Reactor<T, D> {
    poll: Poll,
    events: Events,
    driver: T,
    service: Service<D>,
    shutdown: Shutdown,
    stats: Stats,
}

/// Reactor serving TCP clients.
pub type StreamReactor<D> = Reactor<StreamDriver, D>;

/// Reactor serving UDP clients.
pub type DatagramReactor<D> = Reactor<DatagramDriver, D>;

impl<T: Driver, D: Dispatcher> Reactor<T, D> {
    /// Bind the server socket and register it.
    ///
    /// Failing here is fatal: a server without its socket has nothing to do.
    pub fn bind(addr: SocketAddr, service: Service<D>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut driver = T::bind(addr)?;
        driver.register(poll.registry(), LISTENER)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            driver,
            service,
            shutdown: Shutdown {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
            stats: Stats::default(),
        })
    }

    /// Address the server socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.driver.local_addr()?)
    }

    /// A handle that stops [`Reactor::run`].
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Counters so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Client connections currently held.
    pub fn open_connections(&self) -> usize {
        self.driver.open_connections()
    }

    /// Wait for readiness once and service every reported event.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in self.events.iter() {
            match event.token() {
                WAKER => debug!("{} woken up", self.service.tag()),
                _ => self.driver.on_ready(
                    event,
                    self.poll.registry(),
                    &self.service,
                    &mut self.stats,
                )?,
            }
        }
        Ok(())
    }

    /// Serve until [`Shutdown::trigger`] is called or the server socket fails.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "{} serving on {}",
            self.service.tag(),
            self.driver.local_addr()?
        );
        while !self.shutdown.is_triggered() {
            self.turn(None)?;
        }
        info!(
            "{} stopped: {} accepted, {} served, {} dropped",
            self.service.tag(),
            self.stats.accepted,
            self.stats.served,
            self.stats.dropped
        );
        Ok(())
    }
}
