//! Session state for one connection

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use parley_core::{ConversationRecord, Turn};
use parley_pipeline::{ContextStore, TurnLedger, TurnMonitor};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Conversation state owned by one connection.
///
/// Status only moves forward. The context store and turn ledger are written
/// by pipeline stages; everything else reads them.
pub struct Session {
    connection_id: String,
    status: watch::Sender<SessionStatus>,
    store: ContextStore,
    ledger: TurnLedger,
    monitor: Mutex<Option<TurnMonitor>>,
    degraded: Mutex<bool>,
}

impl Session {
    pub fn new(connection_id: impl Into<String>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Connecting);
        Self {
            connection_id: connection_id.into(),
            status,
            store: ContextStore::new(),
            ledger: TurnLedger::new(),
            monitor: Mutex::new(None),
            degraded: Mutex::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Move to `next`; moving backwards is ignored
    pub(crate) fn advance(&self, next: SessionStatus) -> bool {
        let mut previous = next;
        let changed = self.status.send_if_modified(|current| {
            if next > *current {
                previous = *current;
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(
                connection_id = %self.connection_id,
                from = previous.as_str(),
                to = next.as_str(),
                "Session status changed"
            );
        }
        changed
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn ledger(&self) -> &TurnLedger {
        &self.ledger
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.ledger.turns()
    }

    /// Turn phase of the running pipeline, once started
    pub fn turn_monitor(&self) -> Option<TurnMonitor> {
        self.monitor.lock().clone()
    }

    pub(crate) fn set_turn_monitor(&self, monitor: TurnMonitor) {
        *self.monitor.lock() = Some(monitor);
    }

    /// Whether the session started without knowledge
    pub fn is_degraded(&self) -> bool {
        *self.degraded.lock()
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        *self.degraded.lock() = degraded;
    }

    pub fn record(&self) -> ConversationRecord {
        self.store.record(&self.connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        let session = Session::new("c1");
        assert_eq!(session.status(), SessionStatus::Connecting);

        assert!(session.advance(SessionStatus::Active));
        assert!(session.advance(SessionStatus::Closed));
        assert!(!session.advance(SessionStatus::Closing));
        assert!(!session.advance(SessionStatus::Active));
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_status_watch() {
        let session = Session::new("c1");
        let mut rx = session.watch_status();
        session.advance(SessionStatus::Active);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionStatus::Active);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Closing).unwrap(),
            "\"closing\""
        );
    }
}
