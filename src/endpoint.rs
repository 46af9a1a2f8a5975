//! Connection-state tracking shared by sources and sinks.
//!
//! Every endpoint owns a [`StateCell`]: a mutex-held [`ConnectionState`]
//! that publishes one [`StateEvent`] per transition onto the session's
//! event channel.  Events sent after the session stopped listening are
//! dropped on the floor, which is exactly what a torn-down session wants.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `stop` waits for an endpoint task before giving up on it.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);

/// Await `task`, but no longer than [`STOP_GRACE`]; a task that overstays
/// is logged and aborted so `stop` always returns.
pub(crate) async fn join_with_grace(name: &str, mut task: JoinHandle<()>) {
    if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
        warn!("{name}: task did not stop within {STOP_GRACE:?}");
        task.abort();
    }
}

/// Lifecycle state of a single source or sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting   => "connecting",
            ConnectionState::Connected    => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error        => "error",
        };
        f.write_str(s)
    }
}

/// Which side of the pipeline an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Source,
    Sink,
}

/// One connection-state transition of a named endpoint.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub endpoint: String,
    pub kind:     EndpointKind,
    pub old:      ConnectionState,
    pub new:      ConnectionState,
    pub message:  Option<String>,
}

#[derive(Debug)]
pub(crate) struct StateCell {
    name:   String,
    kind:   EndpointKind,
    state:  Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl StateCell {
    pub fn new(
        name: impl Into<String>,
        kind: EndpointKind,
        events: mpsc::UnboundedSender<StateEvent>,
    ) -> Self {
        StateCell {
            name: name.into(),
            kind,
            state: Mutex::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set(&self, new: ConnectionState) {
        self.set_with(new, None);
    }

    /// Transition to `new`, publishing the change once.  Setting the
    /// current state again is a no-op.
    pub fn set_with(&self, new: ConnectionState, message: Option<String>) {
        let old = {
            let mut state = self.state.lock().unwrap();
            if *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        debug!("{}: {old} -> {new}", self.name);
        let _ = self.events.send(StateEvent {
            endpoint: self.name.clone(),
            kind:     self.kind,
            old,
            new,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_publish_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cell = StateCell::new("test", EndpointKind::Sink, tx);
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        cell.set(ConnectionState::Connecting);
        cell.set(ConnectionState::Connecting); // repeat: no event
        cell.set_with(ConnectionState::Error, Some("boom".into()));

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.old, ConnectionState::Disconnected);
        assert_eq!(ev.new, ConnectionState::Connecting);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.new, ConnectionState::Error);
        assert_eq!(ev.message.as_deref(), Some("boom"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_after_receiver_drop_are_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let cell = StateCell::new("test", EndpointKind::Source, tx);
        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }
}
