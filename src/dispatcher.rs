//! The dispatcher: the owning aggregate that ties the listener set, the
//! active-connection set, and the upstream queue together into one
//! single-threaded, event-driven state machine.
//!
//! Every suspension point -- accept, packet read, upstream submission,
//! packet write -- is realized as a short-lived spawned task that performs
//! exactly one `.await` and sends exactly one [`Event`] back over
//! `events_tx`. [`Dispatcher::run`] is the only reader of `events_rx` and
//! the only code that ever touches dispatcher state, so every transition
//! below runs to completion between event arrivals without any locking,
//! even though the underlying I/O is driven by the multi-threaded Tokio
//! runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use slab::Slab;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ActiveConnection, ConnId};
use crate::error::{DispatchError, QueueError};
use crate::event::Event;
use crate::forwardee::Forwardee;
use crate::listener::ListenerSet;
use crate::packet::{self, Payload};
use crate::queue::Queue;

/// The connection-multiplexing dispatcher: admission control over one or
/// more listening sockets, per-connection request/response framing, and
/// orderly teardown on upstream failure.
pub struct Dispatcher<Q: Queue> {
    listeners: ListenerSet,
    active: Slab<ActiveConnection>,
    active_max: usize,
    queue: Arc<Q>,
    failed: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl<Q: Queue> Dispatcher<Q> {
    /// Builds a dispatcher over `listeners` and immediately starts
    /// soliciting accepts on all of them, up to `max_connections`.
    pub fn construct(
        listeners: Vec<TcpListener>,
        queue: Arc<Q>,
        max_connections: usize,
    ) -> Result<Self, DispatchError> {
        if listeners.is_empty() {
            return Err(DispatchError::NoListeners);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Self {
            listeners: ListenerSet::new(listeners),
            active: Slab::new(),
            active_max: max_connections,
            queue,
            failed: false,
            events_tx,
            events_rx,
        };
        let events_tx = dispatcher.events_tx.clone();
        dispatcher.listeners.solicit(&events_tx);
        info!(
            listeners = dispatcher.listeners.len(),
            max_connections, "dispatcher constructed"
        );
        Ok(dispatcher)
    }

    /// `failed == false || active_count > 0`.
    pub fn alive(&self) -> bool {
        !self.failed || !self.active.is_empty()
    }

    /// Requests the same graceful drain as an upstream failure, without an
    /// actual upstream error. Wired to `SIGINT`/`SIGTERM`/`ctrl_c()` by the
    /// embedding binary. Safe to call at any time, including after the
    /// dispatcher has already failed (the transition is idempotent).
    pub fn shutdown(&self) {
        let _ = self.events_tx.send(Event::ShutdownRequested);
    }

    /// Drives the event loop until [`Dispatcher::alive`] would return
    /// false, then tears down and returns. May be called more than once --
    /// for example, once racing a shutdown signal and once more afterward
    /// to finish draining -- each call simply resumes from wherever the
    /// last one left off.
    pub async fn run(&mut self) -> Result<(), DispatchError> {
        while self.alive() {
            let event = match self.events_rx.recv().await {
                Some(event) => event,
                None => break,
            };
            self.handle_event(event);
        }
        self.destruct();
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted {
                listener,
                generation,
                result,
            } => self.on_accept_complete(listener, generation, result),
            Event::Read {
                conn,
                generation,
                reader,
                outcome,
            } => self.on_read_complete(conn, generation, reader, outcome),
            Event::Upstream { forwardee, result } => self.on_response(forwardee, result),
            Event::Written { conn, failed } => self.on_write_complete(conn, failed),
            Event::ShutdownRequested => self.enter_upstream_failed_mode(),
        }
    }

    // ---- listener set ---------------------------------------------------

    fn on_accept_complete(
        &mut self,
        listener: usize,
        generation: u64,
        result: std::io::Result<(TcpStream, SocketAddr)>,
    ) {
        if !self.listeners.is_current(listener, generation) {
            return; // raced a quiesce/resolicit; discard
        }
        self.listeners.mark_idle(listener);

        let (socket, peer) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(
                    listener,
                    error = %err,
                    "accept failed; listener stays idle until the next set-wide solicit"
                );
                return;
            }
        };

        self.listeners.quiesce();
        self.install(socket, peer);

        if !self.failed && self.active.len() < self.active_max {
            let events_tx = self.events_tx.clone();
            self.listeners.solicit(&events_tx);
        }
    }

    // ---- active connection ----------------------------------------------

    #[instrument(skip(self, socket))]
    fn install(&mut self, socket: TcpStream, peer: SocketAddr) {
        if let Err(err) = socket.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }

        let events_tx = self.events_tx.clone();
        let entry = self.active.vacant_entry();
        let conn_id = entry.key();
        entry.insert(ActiveConnection::new(socket, peer, conn_id, events_tx.clone()));

        info!(conn = conn_id, %peer, active = self.active.len(), "connection accepted");
        self.active[conn_id].begin_read(conn_id, events_tx);
    }

    fn on_read_complete(
        &mut self,
        conn_id: ConnId,
        generation: u64,
        reader: packet::PacketReader,
        outcome: Option<std::io::Result<bytes::BytesMut>>,
    ) {
        let conn = match self.active.get_mut(conn_id) {
            Some(conn) => conn,
            None => return, // connection already dropped; stale completion
        };
        if !conn.is_current_read(generation) {
            return; // raced a cancel_read (upstream-failed drain); discard
        }
        conn.clear_read_pending();

        match outcome {
            None => {
                debug!(conn = conn_id, "client closed the read side");
                conn.mark_read_closed();
                if conn.is_idle() {
                    self.drop_connection(conn_id);
                }
            }
            Some(Err(err)) => {
                warn!(conn = conn_id, error = %err, "packet read failed");
                conn.mark_read_closed();
                if conn.is_idle() {
                    self.drop_connection(conn_id);
                }
            }
            Some(Ok(bytes)) => {
                conn.reinstall_reader(reader);
                let request = packet::freeze(bytes);
                conn.in_flight += 1;

                let forwardee = Forwardee { conn: conn_id };
                self.submit(forwardee, request);

                let events_tx = self.events_tx.clone();
                self.active[conn_id].begin_read(conn_id, events_tx);
            }
        }
    }

    fn submit(&self, forwardee: Forwardee, request: Payload) {
        let queue = Arc::clone(&self.queue);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = queue.submit(request).await;
            let _ = events.send(Event::Upstream { forwardee, result });
        });
    }

    fn on_response(&mut self, forwardee: Forwardee, result: Result<Payload, QueueError>) {
        let conn_id = forwardee.conn;
        match result {
            Ok(response) => {
                if let Some(conn) = self.active.get(conn_id) {
                    conn.send_response(response);
                } else {
                    debug!(conn = conn_id, "response arrived for a connection already gone");
                }
            }
            Err(err) => {
                warn!(conn = conn_id, error = %err, "upstream failed");
                self.finish_request(conn_id);
                self.enter_upstream_failed_mode();
            }
        }
    }

    fn on_write_complete(&mut self, conn_id: ConnId, failed: bool) {
        if failed {
            // The write failure flag is ignored for bookkeeping purposes: a
            // failed write just means the client won't see this particular
            // response, which is unremarkable (writes commonly race a
            // client close). Preserved from the source design.
            debug!(conn = conn_id, "response write failed; dropping silently");
        }
        self.finish_request(conn_id);
    }

    /// Shared tail of both `on_write_complete` and the upstream-failure arm
    /// of `on_response`: accounts for one fewer in-flight request and drops
    /// the connection if it has become idle.
    fn finish_request(&mut self, conn_id: ConnId) {
        let drop_now = match self.active.get_mut(conn_id) {
            Some(conn) => {
                debug_assert!(conn.in_flight > 0);
                conn.in_flight -= 1;
                conn.is_idle()
            }
            None => false,
        };
        if drop_now {
            self.drop_connection(conn_id);
        }
    }

    /// Precondition: `read_pending == None && in_flight == 0`.
    fn drop_connection(&mut self, conn_id: ConnId) {
        if !self.active.contains(conn_id) {
            return;
        }
        let was_full = self.active.len() == self.active_max;
        let conn = self.active.remove(conn_id);
        debug_assert!(conn.in_flight == 0 && !conn.read_pending());
        debug!(conn = conn_id, peer = %conn.peer, active = self.active.len(), "connection dropped");

        if was_full && !self.failed {
            let events_tx = self.events_tx.clone();
            self.listeners.solicit(&events_tx);
        }
    }

    // ---- upstream-failed mode -------------------------------------------

    fn enter_upstream_failed_mode(&mut self) {
        if self.failed {
            return; // monotonic: already entered
        }
        info!(active = self.active.len(), "entering upstream-failed mode");
        self.listeners.quiesce();
        self.failed = true;

        let draining: Vec<ConnId> = self
            .active
            .iter()
            .filter(|(_, conn)| conn.read_pending())
            .map(|(id, _)| id)
            .collect();

        for conn_id in draining {
            self.cancel_read(conn_id);
        }
    }

    fn cancel_read(&mut self, conn_id: ConnId) {
        let drop_now = match self.active.get_mut(conn_id) {
            Some(conn) => {
                conn.cancel_read();
                conn.is_idle()
            }
            None => false,
        };
        if drop_now {
            self.drop_connection(conn_id);
        }
    }

    fn destruct(&mut self) {
        debug_assert!(self.failed && self.active.is_empty());
        self.listeners.quiesce();
        info!("dispatcher torn down");
    }
}
