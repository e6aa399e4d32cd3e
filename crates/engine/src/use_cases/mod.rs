//! Application use cases.

pub mod turn;

pub use turn::{TurnError, TurnOrchestrator, TurnPhases, TurnStarted};
