//! The static endpoint table the client fails over across.

use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CalcError, Result};

/// How an endpoint is reached.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// TCP, one request per connection.
    Stream,
    /// UDP, one request per datagram.
    Datagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => f.write_str("tcp"),
            Transport::Datagram => f.write_str("udp"),
        }
    }
}

/// One server instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Human readable name used in logs and errors.
    pub name: String,
    /// IPv4 address of the server.
    pub address: Ipv4Addr,
    /// Port of the server.
    pub port: u16,
    /// Transport the server speaks.
    pub transport: Transport,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(name: impl Into<String>, address: Ipv4Addr, port: u16, transport: Transport) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            transport,
        }
    }

    /// Socket address to connect or send to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}/{})", self.name, self.address, self.port, self.transport)
    }
}

/// The eight well-known local servers, one per concurrency model and transport.
pub fn default_table() -> Vec<Endpoint> {
    let local = Ipv4Addr::LOCALHOST;
    vec![
        Endpoint::new("Iterative TCP Server", local, 9001, Transport::Stream),
        Endpoint::new("Concurrent TCP Threads Server", local, 9002, Transport::Stream),
        Endpoint::new("Concurrent TCP Processes Server", local, 9003, Transport::Stream),
        Endpoint::new("Concurrent TCP Async Server", local, 9004, Transport::Stream),
        Endpoint::new("Iterative UDP Server", local, 9005, Transport::Datagram),
        Endpoint::new("Concurrent UDP Threads Server", local, 9006, Transport::Datagram),
        Endpoint::new("Concurrent UDP Processes Server", local, 9007, Transport::Datagram),
        Endpoint::new("Concurrent UDP Async Server", local, 9008, Transport::Datagram),
    ]
}

/// Load an endpoint table from a JSON array of endpoints.
pub fn load_table(path: impl AsRef<Path>) -> Result<Vec<Endpoint>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| {
        CalcError::Config(format!("cannot read endpoint table {}: {e}", path.display()))
    })?;
    let table: Vec<Endpoint> = serde_json::from_str(&text)?;
    if table.is_empty() {
        return Err(CalcError::NoEndpoints);
    }
    Ok(table)
}
