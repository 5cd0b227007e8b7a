//! Durable per-user conversation records and their lifecycle.

pub mod manager;
pub mod model;

pub use manager::ConversationManager;
pub use model::{ConversationState, FlowState, WaitingFor, WorkflowPhase, WorkflowSnapshot};
