//! Turn detection
//!
//! - `state_machine` - pure turn-taking transitions
//! - `ledger` - turn history and phase observation

mod ledger;
mod state_machine;

pub use ledger::{TurnLedger, TurnMonitor};
pub use state_machine::{TurnEffect, TurnPhase, TurnStateMachine};
