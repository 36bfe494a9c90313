//! The active connection: a client connection's read/write state, its
//! outstanding-request counter, and its membership in the dispatcher's
//! active set.
//!
//! A connection is referred to everywhere outside this module by [`ConnId`],
//! a plain integer key into the dispatcher's `slab::Slab`, rather than by a
//! borrowed reference -- this is what lets a [`crate::forwardee::Forwardee`]
//! carry its origin connection across an `.await` point without fighting the
//! borrow checker.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::event::Event;
use crate::packet::{self, PacketReader, Payload};

/// Identifies an [`ActiveConnection`] inside the dispatcher's active set.
pub(crate) type ConnId = usize;

/// A client connection's read/write state and in-flight counter.
///
/// Reads and writes are driven independently: the reader is handed off to a
/// short-lived task for each `begin_read()` and handed back on completion,
/// while the writer lives permanently inside its own task fed by an
/// unbounded channel, so a slow or stalled write never blocks the next
/// pipelined read.
#[derive(Debug)]
pub(crate) struct ActiveConnection {
    pub(crate) peer: SocketAddr,
    reader: Option<PacketReader>,
    read_task: Option<JoinHandle<()>>,
    read_generation: u64,
    read_closed: bool,
    responses: mpsc::UnboundedSender<Payload>,
    _writer_task: JoinHandle<()>,
    pub(crate) in_flight: usize,
}

impl ActiveConnection {
    /// Installs a freshly accepted socket. Does not itself start the first
    /// read -- the dispatcher does that with `begin_read` once the
    /// connection is linked into the active set, so `conn`'s id is known.
    pub(crate) fn new(
        socket: TcpStream,
        peer: SocketAddr,
        id: ConnId,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (reader, writer) = packet::split(socket);
        let (responses, outbox) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(drive_writes(id, writer, outbox, events));

        Self {
            peer,
            reader: Some(reader),
            read_task: None,
            read_generation: 0,
            read_closed: false,
            responses,
            _writer_task: writer_task,
            in_flight: 0,
        }
    }

    pub(crate) fn read_pending(&self) -> bool {
        self.read_task.is_some()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight == 0 && !self.read_pending()
    }

    /// Registers the next packet read. Precondition: no read already
    /// pending and the read side hasn't been closed by a prior EOF/error.
    pub(crate) fn begin_read(&mut self, id: ConnId, events: mpsc::UnboundedSender<Event>) {
        debug_assert!(!self.read_pending());
        debug_assert!(!self.read_closed);

        let mut reader = self
            .reader
            .take()
            .expect("reader present while the read side is open and idle");

        self.read_generation += 1;
        let generation = self.read_generation;

        let handle = tokio::spawn(async move {
            let outcome = reader.next().await;
            let _ = events.send(Event::Read {
                conn: id,
                generation,
                reader,
                outcome,
            });
        });
        self.read_task = Some(handle);
    }

    /// Cancels a pending read. The read side is considered closed from this
    /// point on -- unlike a listener's accept, a cancelled read is never
    /// reissued, so dropping the in-flight `PacketReader` along with the
    /// aborted task is exactly what we want.
    pub(crate) fn cancel_read(&mut self) {
        debug_assert!(self.read_pending());
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        self.read_generation += 1;
        self.read_closed = true;
        self.reader = None;
    }

    pub(crate) fn is_current_read(&self, generation: u64) -> bool {
        self.read_generation == generation
    }

    pub(crate) fn clear_read_pending(&mut self) {
        self.read_task = None;
    }

    pub(crate) fn reinstall_reader(&mut self, reader: PacketReader) {
        self.reader = Some(reader);
    }

    pub(crate) fn mark_read_closed(&mut self) {
        self.read_closed = true;
        self.reader = None;
    }

    /// Queues a response for delivery. Write ordering -- and thus the order
    /// the client observes responses in -- is whatever order this is called
    /// in, which is upstream completion order, not request arrival order.
    pub(crate) fn send_response(&self, payload: Payload) {
        let _ = self.responses.send(payload);
    }
}

async fn drive_writes(
    id: ConnId,
    mut writer: packet::PacketWriter,
    mut outbox: mpsc::UnboundedReceiver<Payload>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(payload) = outbox.recv().await {
        let failed = writer.send(payload).await.is_err();
        if events.send(Event::Written { conn: id, failed }).is_err() {
            break;
        }
    }
    trace!(conn = id, "writer task exiting");
}
