//! Glue between the codec and a [`Dispatcher`], shared by every server.

use log::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::protocol::{Operation, Request, Response};

/// Error string sent back by the blocking servers for an undecodable request.
pub const BAD_REQUEST: &str = "Server error: Bad request format";

/// What a server should do after handling one request frame.
#[derive(Debug, PartialEq)]
pub enum Reply {
    /// Send this response frame.
    Frame(Vec<u8>),
    /// The client asked to end the session; send nothing.
    Hangup,
}

/// Decodes a request, runs it through the dispatcher and encodes the answer,
/// stamping every response with the server tag.
#[derive(Clone, Debug)]
pub struct Service<D> {
    dispatcher: D,
    tag: String,
}

impl<D: Dispatcher> Service<D> {
    /// Create a service answering as `tag`.
    pub fn new(dispatcher: D, tag: impl Into<String>) -> Self {
        Self {
            dispatcher,
            tag: tag.into(),
        }
    }

    /// The tag written in the `STYPE` field.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Compute the response for a decoded request.
    pub fn respond(&self, request: &Request) -> Response {
        match self
            .dispatcher
            .dispatch(request.operation, request.lhs, request.rhs)
        {
            Ok(value) => Response::ok(value, self.tag.as_str()),
            Err(e) => Response::failed(e.to_string(), self.tag.as_str()),
        }
    }

    /// Handle one request frame.
    ///
    /// A frame that does not decode is returned as an error so the caller can
    /// decide between closing the connection and rejecting the request.
    pub fn handle(&self, frame: &[u8]) -> Result<Reply> {
        let request = Request::decode(frame)?;
        debug!("{} received {:?}", self.tag, request);
        if request.operation == Operation::Exit {
            return Ok(Reply::Hangup);
        }
        Ok(Reply::Frame(self.respond(&request).encode()))
    }

    /// Like [`Service::handle`], but answers an undecodable frame with a
    /// [`BAD_REQUEST`] response instead of failing.
    pub fn handle_or_reject(&self, frame: &[u8]) -> Reply {
        self.handle(frame).unwrap_or_else(|e| {
            warn!(
                "{} rejecting request {:?}: {}",
                self.tag,
                String::from_utf8_lossy(frame),
                e
            );
            Reply::Frame(Response::failed(BAD_REQUEST, self.tag.as_str()).encode())
        })
    }
}
