//! Blocking servers.
//!
//! [`StreamServer`] and [`DatagramServer`] serve requests with ordinary
//! blocking sockets, either one client at a time or by handing each client to
//! a [`WorkerPool`]. Both poll a stop flag so they can be shut down from
//! another thread.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{CalcError, Result};
use crate::protocol::{FrameReader, MAX_FRAME_LEN, Response};
use crate::service::{BAD_REQUEST, Reply, Service};
use crate::thread_pool::{ThreadPool, WorkerPool};

/// How often an idle server checks its stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a connected client may stay silent before it is dropped.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a blocking server spreads its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Serve one client at a time on the accepting thread.
    Iterative,
    /// Hand every client to a pool with this many workers.
    Pooled(u32),
}

/// Stops a running blocking server.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the server to stop after its current client.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn pool_for(concurrency: Concurrency) -> Result<Option<WorkerPool>> {
    match concurrency {
        Concurrency::Iterative => Ok(None),
        Concurrency::Pooled(threads) => Ok(Some(WorkerPool::new(threads)?)),
    }
}

/// Blocking TCP server.
pub struct StreamServer<D> {
    listener: TcpListener,
    service: Service<D>,
    pool: Option<WorkerPool>,
    stop: StopHandle,
}

impl<D: Dispatcher> StreamServer<D> {
    /// Bind the listener.
    pub fn bind(addr: SocketAddr, service: Service<D>, concurrency: Concurrency) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        // Non-blocking accept lets the loop notice the stop flag.
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            service,
            pool: pool_for(concurrency)?,
            stop: StopHandle::default(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that stops [`StreamServer::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Accept and serve clients until stopped.
    pub fn run(&mut self) -> Result<()> {
        info!("{} serving on {}", self.service.tag(), self.local_addr()?);
        while !self.stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("connection from {}", peer);
                    match &self.pool {
                        Some(pool) => {
                            let service = self.service.clone();
                            pool.spawn(move || serve_connection(stream, peer, &service));
                        }
                        None => serve_connection(stream, peer, &self.service),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionAborted) => {
                    continue;
                }
                Err(e) => {
                    error!("listener failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        info!("{} stopped accepting connections", self.service.tag());
        // Dropping the pool waits for clients still being served.
        Ok(())
    }
}

fn serve_connection<D: Dispatcher>(stream: TcpStream, peer: SocketAddr, service: &Service<D>) {
    match serve_stream(stream, service) {
        Ok(()) => debug!("{} done", peer),
        Err(e) => warn!("error serving {}: {}", peer, e),
    }
}

/// Answer every request on one connection until EOF or `EXT`.
fn serve_stream<D: Dispatcher>(stream: TcpStream, service: &Service<D>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_IDLE_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = FrameReader::new(stream);
    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(CalcError::Format(reason)) => {
                // No frame boundary to resync on: reject and hang up.
                warn!("{}: {}", service.tag(), reason);
                writer.write_all(&Response::failed(BAD_REQUEST, service.tag()).encode())?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match service.handle_or_reject(&frame) {
            Reply::Frame(response) => writer.write_all(&response)?,
            Reply::Hangup => return Ok(()),
        }
    }
}

/// Blocking UDP server.
pub struct DatagramServer<D> {
    socket: Arc<UdpSocket>,
    service: Service<D>,
    pool: Option<WorkerPool>,
    stop: StopHandle,
}

impl<D: Dispatcher> DatagramServer<D> {
    /// Bind the socket.
    pub fn bind(addr: SocketAddr, service: Service<D>, concurrency: Concurrency) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket: Arc::new(socket),
            service,
            pool: pool_for(concurrency)?,
            stop: StopHandle::default(),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A handle that stops [`DatagramServer::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Receive and answer datagrams until stopped.
    pub fn run(&mut self) -> Result<()> {
        info!("{} serving on {}", self.service.tag(), self.local_addr()?);
        // One spare byte: the kernel truncates silently, the decoder does not.
        let mut buf = [0u8; MAX_FRAME_LEN + 1];
        while !self.stop.is_stopped() {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted
                            | ErrorKind::ConnectionRefused
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("datagram socket failed: {}", e);
                    return Err(e.into());
                }
            };

            match &self.pool {
                Some(pool) => {
                    let socket = self.socket.clone();
                    let service = self.service.clone();
                    let request = buf[..n].to_vec();
                    pool.spawn(move || answer(&socket, &service, &request, peer));
                }
                None => answer(&self.socket, &self.service, &buf[..n], peer),
            }
        }
        info!("{} stopped", self.service.tag());
        Ok(())
    }
}

fn answer<D: Dispatcher>(socket: &UdpSocket, service: &Service<D>, request: &[u8], peer: SocketAddr) {
    match service.handle_or_reject(request) {
        Reply::Frame(response) => {
            if let Err(e) = socket.send_to(&response, peer) {
                warn!("reply to {} failed: {}", peer, e);
            }
        }
        Reply::Hangup => debug!("ignoring exit request from {}", peer),
    }
}
