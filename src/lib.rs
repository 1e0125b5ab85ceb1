pub mod protocol;

pub mod dispatcher;

pub mod service;

pub mod reactor;

pub mod server;

pub mod client;

pub mod endpoint;

pub mod thread_pool;

pub mod error;

pub use crate::client::{CallOutcome, FailoverClient};
pub use crate::dispatcher::{Calculator, Dispatcher};
pub use crate::endpoint::{Endpoint, Transport};
pub use crate::error::{CalcError, Result};
pub use crate::protocol::{Operation, Request, Response};
pub use crate::reactor::{DatagramReactor, StreamReactor};
pub use crate::service::Service;
