//! Turn history and phase observation

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use parley_core::{Turn, TurnId, TurnOwner, TurnStatus};

use super::TurnPhase;

/// Ordered turn history shared between the turn stage (single writer) and
/// the session that owns it
#[derive(Debug, Clone, Default)]
pub struct TurnLedger {
    turns: Arc<RwLock<Vec<Turn>>>,
}

impl TurnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new turn or update an existing one in place
    pub fn record(&self, turn: &Turn) {
        let mut turns = self.turns.write();
        match turns.iter_mut().rev().find(|t| t.id == turn.id) {
            Some(existing) => existing.status = turn.status,
            None => turns.push(turn.clone()),
        }
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.read().clone()
    }

    pub fn get(&self, id: TurnId) -> Option<Turn> {
        self.turns.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn last(&self) -> Option<Turn> {
        self.turns.read().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }

    /// Count turns by owner and status
    pub fn count(&self, owner: TurnOwner, status: TurnStatus) -> usize {
        self.turns
            .read()
            .iter()
            .filter(|t| t.owner == owner && t.status == status)
            .count()
    }
}

/// Read side of the turn stage's current phase
#[derive(Debug, Clone)]
pub struct TurnMonitor {
    rx: watch::Receiver<TurnPhase>,
}

impl TurnMonitor {
    pub(crate) fn new(rx: watch::Receiver<TurnPhase>) -> Self {
        Self { rx }
    }

    pub fn phase(&self) -> TurnPhase {
        *self.rx.borrow()
    }

    /// Wait until the phase equals `phase`. Returns false on timeout or when
    /// the turn stage is gone.
    pub async fn wait_for(&mut self, phase: TurnPhase, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.rx.wait_for(|p| *p == phase)).await,
            Ok(Ok(_))
        )
    }
}
