use thiserror::Error;

/// Errors that can arise while constructing or running a [`crate::Dispatcher`].
///
/// Per-connection trouble (a bad read, a failed write, one listener's accept
/// erroring out) is *not* represented here: those are handled locally and
/// logged, never propagated. A `DispatchError` means the dispatcher itself
/// could not come up, or hit a contract violation it cannot recover from.
///
/// The source distinguishes a synchronous accept/read "registration"
/// failure from the later completion failure; in this async rewrite,
/// registering either one is just spawning a Tokio task, which cannot fail
/// synchronously, so that distinction collapses and only the truly fatal
/// construction failure remains (see DESIGN.md).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("construct() requires at least one listening socket")]
    NoListeners,
}

/// A failure reported by the upstream request queue for one submitted request.
///
/// The dispatcher treats any `QueueError` surfacing from `Queue::submit`'s
/// completion as *fatal to the dispatcher as a service* (see
/// `Dispatcher::on_upstream_failure`): the first one observed tips the
/// dispatcher into upstream-failed mode. The error itself is only used for
/// logging; it carries no recovery information because none is expected.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("upstream queue failed: {0}")]
    Failed(String),

    #[error("upstream queue is closed")]
    Closed,
}
