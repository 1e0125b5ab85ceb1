//! Failover client.
//!
//! [`FailoverClient`] holds an ordered endpoint table and a rotating cursor.
//! Each call tries the endpoints one after another, starting at the cursor,
//! and accepts the first well-formed [`Response`], whether or not it carries
//! an application error.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::endpoint::{Endpoint, Transport};
use crate::error::{AttemptFailure, CalcError, Result};
use crate::protocol::{FrameReader, MAX_FRAME_LEN, Operation, Request, Response};

/// How long one attempt may wait for connect, send and receive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A trait for the transport side of one attempt.
///
/// Sends one encoded request frame to an endpoint and returns the raw reply
/// frame.
pub trait Exchange {
    /// Perform one request/reply exchange with `endpoint`.
    fn exchange(&mut self, endpoint: &Endpoint, frame: &[u8], timeout: Duration)
    -> Result<Vec<u8>>;
}

/// [`Exchange`] over real TCP and UDP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetExchange;

impl Exchange for NetExchange {
    fn exchange(
        &mut self,
        endpoint: &Endpoint,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let addr = endpoint.socket_addr();
        match endpoint.transport {
            Transport::Stream => stream_exchange(addr, frame, timeout),
            Transport::Datagram => datagram_exchange(addr, frame, timeout),
        }
        .map_err(|e| classify(e, timeout))
    }
}

fn stream_exchange(addr: SocketAddr, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(remaining(deadline)?))?;
    (&stream).write_all(frame)?;

    let mut reader = FrameReader::new(Deadline {
        stream: &stream,
        deadline,
    });
    reader.read_frame()?.ok_or_else(|| {
        CalcError::Transport("server closed the connection without answering".to_string())
    })
}

/// Reads from a stream, failing once `deadline` has passed no matter how
/// many reads one frame takes.
struct Deadline<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl Read for Deadline<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.set_read_timeout(Some(remaining(self.deadline)?))?;
        self.stream.read(buf)
    }
}

fn remaining(deadline: Instant) -> io::Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| io::Error::from(ErrorKind::TimedOut))
}

/// The socket is connected to the endpoint, so the kernel discards datagrams
/// from any other source and reports ICMP port-unreachable as a refusal.
fn datagram_exchange(addr: SocketAddr, frame: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(addr)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    socket.send(frame)?;

    // One spare byte: the kernel truncates silently, the decoder does not.
    let mut buf = [0u8; MAX_FRAME_LEN + 1];
    let n = socket.recv(&mut buf)?;
    Ok(buf[..n].to_vec())
}

fn classify(e: CalcError, timeout: Duration) -> CalcError {
    match e {
        CalcError::IOError(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            CalcError::Timeout(timeout)
        }
        other => other,
    }
}

/// The result of a call that reached a server.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Name of the endpoint that answered.
    pub endpoint: String,
    /// The server's response, possibly carrying an application error.
    pub response: Response,
}

/// Client that fails over across an ordered endpoint table.
///
/// `call` takes `&mut self`: callers sharing one client across threads must
/// serialize access, since the cursor update is a read-modify-write.
pub struct FailoverClient<X = NetExchange> {
    endpoints: Vec<Endpoint>,
    cursor: usize,
    timeout: Duration,
    exchange: X,
}

impl FailoverClient<NetExchange> {
    /// Create a client over real sockets.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        Self::with_exchange(endpoints, NetExchange)
    }
}

impl<X: Exchange> FailoverClient<X> {
    /// Create a client over a custom [`Exchange`].
    pub fn with_exchange(endpoints: Vec<Endpoint>, exchange: X) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(CalcError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            cursor: 0,
            timeout: DEFAULT_TIMEOUT,
            exchange,
        })
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Index of the endpoint the next call starts from.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The endpoint table.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Compute `lhs <op> rhs` on the first endpoint that answers.
    pub fn call(&mut self, op: Operation, lhs: f64, rhs: f64) -> Result<CallOutcome> {
        self.send(&Request::new(op, lhs, rhs))
    }

    /// Send a request, trying each endpoint at most once.
    pub fn send(&mut self, request: &Request) -> Result<CallOutcome> {
        let frame = request.encode();
        let start = self.cursor;
        let len = self.endpoints.len();
        let mut failures = Vec::new();

        for step in 0..len {
            let index = (start + step) % len;
            let endpoint = &self.endpoints[index];
            debug!("attempting {} with {}", request.operation, endpoint);

            let attempt = self
                .exchange
                .exchange(endpoint, &frame, self.timeout)
                .and_then(|reply| Response::decode(&reply));
            match attempt {
                Ok(response) => {
                    info!("{} answered by {}", request.operation, endpoint.name);
                    self.cursor = (index + 1) % len;
                    return Ok(CallOutcome {
                        endpoint: endpoint.name.clone(),
                        response,
                    });
                }
                Err(e) => {
                    warn!("failed to get a response from {}: {}", endpoint, e);
                    failures.push(AttemptFailure {
                        endpoint: endpoint.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.cursor = (start + 1) % len;
        Err(CalcError::AllEndpointsFailed(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Replies per endpoint name; endpoints without a script are down.
    #[derive(Default)]
    struct Scripted {
        replies: HashMap<String, Vec<u8>>,
        tried: Vec<String>,
    }

    impl Scripted {
        fn reply(mut self, name: &str, frame: &[u8]) -> Self {
            self.replies.insert(name.to_string(), frame.to_vec());
            self
        }
    }

    impl Exchange for Scripted {
        fn exchange(
            &mut self,
            endpoint: &Endpoint,
            _frame: &[u8],
            _timeout: Duration,
        ) -> Result<Vec<u8>> {
            self.tried.push(endpoint.name.clone());
            self.replies
                .get(&endpoint.name)
                .cloned()
                .ok_or_else(|| CalcError::Transport("connection refused".to_string()))
        }
    }

    fn table(n: u16) -> Vec<Endpoint> {
        (0..n)
            .map(|i| {
                Endpoint::new(
                    format!("e{i}"),
                    Ipv4Addr::LOCALHOST,
                    9000 + i,
                    Transport::Stream,
                )
            })
            .collect()
    }

    #[test]
    fn fails_over_to_the_last_endpoint() {
        let exchange = Scripted::default().reply("e2", b"RES:7;ERR:NULL;STYPE:third;");
        let mut client = FailoverClient::with_exchange(table(3), exchange).unwrap();

        let outcome = client.call(Operation::Add, 3.0, 4.0).unwrap();
        assert_eq!(outcome.endpoint, "e2");
        assert_eq!(outcome.response, Response::ok(7.0, "third"));
        assert_eq!(client.cursor(), 0);
        assert_eq!(client.exchange.tried, ["e0", "e1", "e2"]);
    }

    #[test]
    fn cursor_moves_past_the_answering_endpoint() {
        let exchange = Scripted::default().reply("e1", b"RES:1;ERR:NULL;STYPE:s;");
        let mut client = FailoverClient::with_exchange(table(4), exchange).unwrap();

        client.call(Operation::Add, 0.0, 1.0).unwrap();
        assert_eq!(client.cursor(), 2);

        // Next call starts at e2, wraps around and lands on e1 again.
        client.call(Operation::Add, 0.0, 1.0).unwrap();
        assert_eq!(client.exchange.tried, ["e0", "e1", "e2", "e3", "e0", "e1"]);
        assert_eq!(client.cursor(), 2);
    }

    #[test]
    fn round_robin_when_everyone_is_up() {
        let exchange = Scripted::default()
            .reply("e0", b"RES:0;ERR:NULL;STYPE:a;")
            .reply("e1", b"RES:1;ERR:NULL;STYPE:b;")
            .reply("e2", b"RES:2;ERR:NULL;STYPE:c;");
        let mut client = FailoverClient::with_exchange(table(3), exchange).unwrap();

        let served: Vec<_> = (0..4)
            .map(|_| client.call(Operation::Add, 1.0, 1.0).unwrap().endpoint)
            .collect();
        assert_eq!(served, ["e0", "e1", "e2", "e0"]);
    }

    #[test]
    fn application_error_is_final() {
        let exchange = Scripted::default()
            .reply("e0", b"RES:0;ERR:Division by zero;STYPE:a;")
            .reply("e1", b"RES:5;ERR:NULL;STYPE:b;");
        let mut client = FailoverClient::with_exchange(table(2), exchange).unwrap();

        let outcome = client.call(Operation::Divide, 5.0, 0.0).unwrap();
        assert_eq!(outcome.response.error.as_deref(), Some("Division by zero"));
        assert_eq!(client.exchange.tried, ["e0"]);
    }

    #[test]
    fn malformed_reply_moves_on() {
        let exchange = Scripted::default()
            .reply("e0", b"RES:garbage")
            .reply("e1", b"RES:5;ERR:NULL;STYPE:b;");
        let mut client = FailoverClient::with_exchange(table(2), exchange).unwrap();

        let outcome = client.call(Operation::Add, 2.0, 3.0).unwrap();
        assert_eq!(outcome.endpoint, "e1");
    }

    #[test]
    fn exhaustion_reports_every_attempt_and_advances_by_one() {
        let mut client = FailoverClient::with_exchange(table(3), Scripted::default()).unwrap();

        match client.call(Operation::Add, 1.0, 2.0) {
            Err(CalcError::AllEndpointsFailed(failures)) => {
                let names: Vec<_> = failures.iter().map(|f| f.endpoint.as_str()).collect();
                assert_eq!(names, ["e0", "e1", "e2"]);
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
        assert_eq!(client.cursor(), 1);

        assert!(client.call(Operation::Add, 1.0, 2.0).is_err());
        assert_eq!(client.cursor(), 2);
        assert_eq!(client.exchange.tried[3..], ["e1", "e2", "e0"]);
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(matches!(
            FailoverClient::new(Vec::new()),
            Err(CalcError::NoEndpoints)
        ));
    }
}
