use crate::connection::ConnId;

/// The binding between an in-flight upstream request and the connection that
/// asked for it.
///
/// A `Forwardee` is created the moment a request packet is handed to the
/// upstream queue and lives until that request's response (or failure) has
/// been fully accounted for. The dispatcher keeps no index of live
/// forwardees; the only place one exists is inside the task that is
/// awaiting `Queue::submit`'s completion, which hands it back unchanged when
/// that future resolves.
#[derive(Debug)]
pub(crate) struct Forwardee {
    pub(crate) conn: ConnId,
}
