//! Error
//!
//! This module provides the errors shared by the codec, the servers and
//! the [`crate::FailoverClient`], with [`thiserror`]
//!
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result use the [`CalcError`] as error.
pub type Result<T> = std::result::Result<T, CalcError>;

/// CalcError is the specific error for the calculator RPC stack.
#[derive(Error, Debug)]
pub enum CalcError {
    #[error("io error {0}")]
    /// IO relevant errors
    IOError(#[from] io::Error),

    #[error("serde error {0}")]
    /// Endpoint table (de)serialization errors
    SerdeError(#[from] serde_json::Error),

    /// A frame that does not follow the wire format.
    #[error("malformed frame: {0}")]
    Format(String),

    /// No response arrived within the per-attempt timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed or reset the transport before a full frame arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// A failover client needs at least one endpoint.
    #[error("the endpoint table is empty")]
    NoEndpoints,

    /// Every endpoint was tried once and none produced a response.
    #[error("no endpoint could complete the request ({})", summarize(.0))]
    AllEndpointsFailed(Vec<AttemptFailure>),

    /// Invalid configuration such as an unparsable endpoint address.
    #[error("config error: {0}")]
    Config(String),
}

/// One failed attempt against one endpoint.
#[derive(Debug)]
pub struct AttemptFailure {
    /// Name of the endpoint that was tried.
    pub endpoint: String,
    /// Why the attempt failed.
    pub reason: String,
}

fn summarize(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.endpoint, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
