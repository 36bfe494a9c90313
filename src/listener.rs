//! Admission control over the dispatcher's fixed set of listening sockets.
//!
//! Accept is a set-wide on/off switch. Either every listener has an
//! outstanding accept registered (`solicit`) or none do (`quiesce`); the cap
//! is enforced by gating accept at the OS rather than by accepting and
//! immediately closing, which preserves backpressure into the kernel's
//! accept queue.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::Event;

/// One listening socket plus at most one outstanding accept on it.
///
/// The socket is kept behind an `Arc` so an accept task can borrow it for
/// the duration of its `.await` without taking ownership -- aborting that
/// task (in `quiesce`) then only drops the task's clone of the `Arc`, never
/// the listening socket itself, which the `ListenerSet` keeps regardless.
///
/// `generation` is bumped on every `solicit_one`/`quiesce`. A completion
/// whose generation doesn't match the listener's current generation raced a
/// cancel-then-reregister and is discarded -- this stands in for the
/// source's synchronous accept-cancellation guarantee, which `JoinHandle`
/// abort can only offer cooperatively.
#[derive(Debug)]
struct Listener {
    socket: Arc<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
    generation: u64,
}

impl Listener {
    fn new(socket: TcpListener) -> Self {
        Self {
            socket: Arc::new(socket),
            accept_task: None,
            generation: 0,
        }
    }

    fn accept_pending(&self) -> bool {
        self.accept_task.is_some()
    }
}

/// The fixed-length sequence of listeners, set at construction and never
/// resized.
#[derive(Debug)]
pub(crate) struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    pub(crate) fn new(sockets: Vec<TcpListener>) -> Self {
        Self {
            listeners: sockets.into_iter().map(Listener::new).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Registers an accept on every listener that doesn't already have one.
    ///
    /// Precondition: no listener has `accept_pending` (callers only reach
    /// this after a `quiesce()` or at construction). Unlike the source,
    /// registering an accept here is spawning a task, which cannot fail
    /// synchronously, so there is no partial-registration unwind to perform.
    pub(crate) fn solicit(&mut self, events: &mpsc::UnboundedSender<Event>) {
        for index in 0..self.listeners.len() {
            self.solicit_one(index, events);
        }
    }

    /// Registers an accept on a single listener, regardless of the others.
    /// Used both by `solicit` and to rejoin a listener that errored on its
    /// last accept: it simply rejoins the next set-wide solicit rather than
    /// being retried with a local backoff loop.
    pub(crate) fn solicit_one(&mut self, index: usize, events: &mpsc::UnboundedSender<Event>) {
        let listener = &mut self.listeners[index];
        debug_assert!(!listener.accept_pending());

        listener.generation += 1;
        let generation = listener.generation;
        let socket = Arc::clone(&listener.socket);
        let events = events.clone();

        let handle = tokio::spawn(async move {
            let result = socket.accept().await;
            let _ = events.send(Event::Accepted {
                listener: index,
                generation,
                result,
            });
        });
        listener.accept_task = Some(handle);
    }

    /// Cancels every outstanding accept. Idempotent.
    pub(crate) fn quiesce(&mut self) {
        for listener in &mut self.listeners {
            if let Some(task) = listener.accept_task.take() {
                task.abort();
            }
            listener.generation += 1;
        }
    }

    pub(crate) fn is_current(&self, index: usize, generation: u64) -> bool {
        self.listeners[index].generation == generation
    }

    pub(crate) fn mark_idle(&mut self, index: usize) {
        self.listeners[index].accept_task = None;
    }

    /// Test-only seam: lets a unit test synthesize an `Event::Accepted` for
    /// a given listener without waiting on a real `accept()` to fail.
    #[cfg(test)]
    pub(crate) fn current_generation(&self, index: usize) -> u64 {
        self.listeners[index].generation
    }

    #[cfg(test)]
    pub(crate) fn accept_pending(&self, index: usize) -> bool {
        self.listeners[index].accept_pending()
    }
}
