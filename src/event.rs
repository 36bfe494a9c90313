//! The events that flow back into the dispatcher's single driving task.
//!
//! Every suspension point in the design -- accept, packet read, upstream
//! submission, packet write -- is realized as a short-lived spawned task
//! that performs exactly one `.await` and sends exactly one [`Event`] back
//! over a shared channel. [`crate::dispatcher::Dispatcher::run`] is the only
//! reader of that channel, so every state transition it drives runs to
//! completion between event arrivals without any locking.

use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::TcpStream;

use crate::connection::ConnId;
use crate::error::QueueError;
use crate::forwardee::Forwardee;
use crate::packet::{PacketReader, Payload};

#[derive(Debug)]
pub(crate) enum Event {
    /// A listener's accept finished (or failed). `generation` fences
    /// completions that raced a `quiesce()`/`solicit()` pair.
    Accepted {
        listener: usize,
        generation: u64,
        result: io::Result<(TcpStream, SocketAddr)>,
    },

    /// A connection's packet read finished. The `reader` is handed back so
    /// it can be reinstalled: reads are driven one at a time, each one
    /// temporarily taking ownership of the `PacketReader` out of its
    /// connection slot for the duration of the `.await`.
    Read {
        conn: ConnId,
        generation: u64,
        reader: PacketReader,
        outcome: Option<io::Result<BytesMut>>,
    },

    /// The upstream queue resolved (or failed) one submitted request.
    Upstream {
        forwardee: Forwardee,
        result: Result<Payload, QueueError>,
    },

    /// A response finished writing (or failed to). The failure flag is
    /// carried only for logging -- the dispatcher's bookkeeping proceeds the
    /// same way either way, per the design's write-completion handling.
    Written { conn: ConnId, failed: bool },

    /// An external caller (typically a signal handler) asked for a graceful
    /// shutdown. Funnels through the same transition as an upstream failure.
    ShutdownRequested,
}
