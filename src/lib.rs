//! `reqfan`: a connection-multiplexing request dispatcher.
//!
//! Accepts client connections on one or more listening sockets, forwards
//! their requests to a single upstream [`Queue`], and routes each response
//! back to the client that asked for it. [`Dispatcher`] is the core
//! state machine; everything else in this crate (the framing layer, the
//! reference `Queue` implementations, the binaries) is the ambient stack a
//! real deployment of it needs.

mod connection;
mod dispatcher;
pub mod error;
mod event;
mod forwardee;
mod listener;
pub mod packet;
pub mod queue;

pub use dispatcher::Dispatcher;
pub use error::{DispatchError, QueueError};
pub use packet::Payload;
pub use queue::{EchoQueue, Queue, TcpUpstreamQueue};

/// Default port `reqfand` listens on when none is given on the command line.
pub const DEFAULT_PORT: u16 = 7878;

/// Default cap on concurrently active client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 250;

/// Error type for top-level process wiring (the binaries). The dispatcher's
/// own fallible API uses the narrower [`DispatchError`]/[`QueueError`]
/// enums; this boxed alias is only for glue code like argument parsing and
/// socket setup where any error can simply be reported and exit.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for process-wiring code.
pub type Result<T> = std::result::Result<T, Error>;
