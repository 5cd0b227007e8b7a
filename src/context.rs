//! Context assembler — the bundle handed to the classification service.
//!
//! The service sees the raw text plus a compact picture of where the
//! conversation stands: active workflow and phase, the exact tag the engine
//! is waiting on, which slots are already filled, and a short history
//! window. Priority hints are heuristic; the resolver, not the classifier,
//! owns the final interpretation.

use serde::Serialize;

use crate::conversation::model::ConversationState;
use crate::engine::slots::{PROMPT_ORDER, WorkflowSpec};
use crate::store::model::{Direction, LoggedMessage};

/// How many history lines go into the bundle.
pub const HISTORY_WINDOW: usize = 10;

/// Sender role carried on the inbound request. Absent means owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Owner,
    Member,
}

impl Role {
    pub fn from_flag(flag: Option<&str>) -> Role {
        match flag {
            Some("member") => Role::Member,
            _ => Role::Owner,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Owner)
    }
}

/// Signals that bias the classification, computed before the round-trip.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityHints {
    /// The engine is waiting on a yes/no confirmation.
    pub in_confirmation: bool,
    /// The engine is waiting on a numbered-list pick.
    pub in_selection: bool,
    /// Some workflow is mid-flight collecting slots.
    pub collecting_slots: bool,
    /// Short reply likely answering a pending prompt, not a new command.
    pub is_terse_reply: bool,
    /// Identity provisioning has not finished.
    pub onboarding_pending: bool,
}

/// One line of conversation history in the bundle.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryLine {
    pub from_user: bool,
    pub text: String,
}

/// Everything the classification service receives besides the raw text.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub user_key: String,
    pub role: Role,
    /// Label of the current flow state, e.g. "create_event:collecting".
    pub current_state: String,
    pub waiting_for: Option<&'static str>,
    /// Slot names already filled for the workflow in flight.
    pub filled_slots: Vec<&'static str>,
    /// Slot names still required.
    pub missing_slots: Vec<&'static str>,
    pub history: Vec<HistoryLine>,
    pub hints: PriorityHints,
}

/// Build the context bundle for one inbound message.
pub fn assemble(
    state: &ConversationState,
    history: &[LoggedMessage],
    role: Role,
    text: &str,
) -> ContextBundle {
    let slots = state.accumulated_slots();
    let mut filled_slots = Vec::new();
    let mut missing_slots = Vec::new();
    if let Some(kind) = state.current_state.workflow() {
        let spec = WorkflowSpec::for_kind(kind);
        for slot in PROMPT_ORDER {
            if !spec.required.contains(slot) && !spec.optional.contains(slot) {
                continue;
            }
            if slots.is_set(*slot) {
                filled_slots.push(slot.label());
            } else if spec.required.contains(slot) {
                missing_slots.push(slot.label());
            }
        }
    }

    let waiting = state.waiting_for;
    let hints = PriorityHints {
        in_confirmation: waiting.is_some_and(|w| w.is_confirmation()),
        in_selection: waiting.is_some_and(|w| w.is_selection()),
        collecting_slots: waiting.is_some_and(|w| w.is_collecting()),
        is_terse_reply: is_terse(text),
        onboarding_pending: state
            .onboarding_step
            .is_some_and(|step| !step.is_terminal()),
    };

    // History arrives newest-first from the store; the service reads
    // top-down, so flip to chronological.
    let history = history
        .iter()
        .take(HISTORY_WINDOW)
        .rev()
        .map(|m| HistoryLine {
            from_user: m.direction == Direction::Inbound,
            text: m.body.chars().take(300).collect(),
        })
        .collect();

    ContextBundle {
        user_key: state.user_key.clone(),
        role,
        current_state: state.current_state.label(),
        waiting_for: waiting.map(|w| w.label()),
        filled_slots,
        missing_slots,
        history,
        hints,
    }
}

/// Terse replies ("yes", "1", "Friday") usually answer the pending prompt.
fn is_terse(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() <= 12 && trimmed.split_whitespace().count() <= 2
}
