//! Context/priority resolver.
//!
//! Several workflows can look plausible for one terse reply. A strict
//! total order picks exactly one interpretation, evaluated as an ordered
//! predicate list — a lower rung never preempts a higher one even on a
//! superficial text match. The first five rungs are decided before the
//! classifier round-trip; the rest need the classified action.

use crate::classifier::Action;
use crate::context::Role;
use crate::conversation::model::{ConversationState, WaitingFor};

/// The single chosen interpretation for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// `waiting_for` is a confirmation tag; reply is strictly yes/no/unclear.
    Confirmation,
    /// `waiting_for` is a numbered-selection tag.
    Selection,
    /// The invitee-side waiting tags (poll options, RSVP).
    InviteeReply,
    /// Explicit help request.
    Help,
    /// Restricted (member) capability set.
    Restricted,
    /// Identity not fully provisioned.
    Onboarding,
    /// Explicit command override — restarts its workflow unconditionally.
    Command(Action),
    /// Generic slot-filling continuation of the workflow in flight.
    Continuation,
    /// Nothing placeable.
    Fallback,
}

/// Rungs 1–5: decided from the record, role, and raw text alone.
/// `None` means the classifier must weigh in.
pub fn resolve_early(state: &ConversationState, role: Role, text: &str) -> Option<Resolution> {
    let waiting = state.waiting_for;

    // 1. Explicit confirmation state.
    if waiting.is_some_and(|w| w.is_confirmation()) {
        return Some(Resolution::Confirmation);
    }
    // 2. Active numbered-selection state.
    if waiting.is_some_and(|w| w.is_selection()) {
        return Some(Resolution::Selection);
    }
    if matches!(
        waiting,
        Some(WaitingFor::PollOptionReply) | Some(WaitingFor::RsvpReply)
    ) {
        return Some(Resolution::InviteeReply);
    }
    // 3. Explicit high-priority help request.
    if is_help_request(text) {
        return Some(Resolution::Help);
    }
    // 4. Role check: members get the restricted capability set.
    if !role.is_elevated() {
        return Some(Resolution::Restricted);
    }
    // 5. Onboarding phase while identity is not fully provisioned.
    if state
        .onboarding_step
        .is_some_and(|step| !step.is_terminal())
    {
        return Some(Resolution::Onboarding);
    }
    None
}

/// Rungs 6–8: dispatch on the classified action.
pub fn resolve_classified(state: &ConversationState, action: Option<Action>) -> Resolution {
    // 6. Explicit command override restarts its workflow regardless of
    //    other pending state.
    if let Some(action) = action {
        if action != Action::Chat {
            return Resolution::Command(action);
        }
    }
    // 7. Generic slot-filling continuation.
    if state
        .waiting_for
        .is_some_and(|w| w.is_collecting())
    {
        return Resolution::Continuation;
    }
    // 8. Fallback.
    Resolution::Fallback
}

fn is_help_request(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "help" | "help!" | "?" | "what can you do" | "what can you do?" | "commands"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::model::WaitingFor;
    use crate::engine::slots::WorkflowKind;

    fn idle(key: &str) -> ConversationState {
        ConversationState::new(key)
    }

    #[test]
    fn confirmation_beats_generic_command_text() {
        let mut state = idle("+15550000001");
        state.enter_confirmation(WorkflowKind::CreateEvent, WaitingFor::EventConfirmation);
        // Text that would classify as a command still lands on rung 1.
        assert_eq!(
            resolve_early(&state, Role::Owner, "create group Tennis"),
            Some(Resolution::Confirmation)
        );
    }

    #[test]
    fn selection_beats_help_text() {
        let mut state = idle("+15550000002");
        state.enter_workflow(WorkflowKind::Broadcast, WaitingFor::BroadcastDetails);
        state.waiting_for = Some(WaitingFor::GroupSelection);
        assert_eq!(
            resolve_early(&state, Role::Owner, "help"),
            Some(Resolution::Selection)
        );
    }

    #[test]
    fn help_beats_role_and_onboarding() {
        let state = idle("+15550000003");
        assert_eq!(
            resolve_early(&state, Role::Member, "help"),
            Some(Resolution::Help)
        );
    }

    #[test]
    fn member_role_is_restricted() {
        let state = idle("+15550000004");
        assert_eq!(
            resolve_early(&state, Role::Member, "1 3"),
            Some(Resolution::Restricted)
        );
    }

    #[test]
    fn onboarding_outranks_commands() {
        let mut state = idle("+15550000005");
        state.onboarding_step = Some(crate::onboarding::OnboardingStep::AwaitingName);
        assert_eq!(
            resolve_early(&state, Role::Owner, "create group Tennis"),
            Some(Resolution::Onboarding)
        );
    }

    #[test]
    fn command_override_restarts_over_continuation() {
        let mut state = idle("+15550000006");
        state.enter_workflow(WorkflowKind::CreateEvent, WaitingFor::EventDetails);
        assert_eq!(resolve_early(&state, Role::Owner, "create group Tennis"), None);
        assert_eq!(
            resolve_classified(&state, Some(Action::CreateGroup)),
            Resolution::Command(Action::CreateGroup)
        );
    }

    #[test]
    fn chat_falls_through_to_continuation_then_fallback() {
        let mut state = idle("+15550000007");
        state.enter_workflow(WorkflowKind::CreateEvent, WaitingFor::EventDetails);
        assert_eq!(
            resolve_classified(&state, Some(Action::Chat)),
            Resolution::Continuation
        );
        assert_eq!(
            resolve_classified(&idle("+15550000008"), Some(Action::Chat)),
            Resolution::Fallback
        );
        assert_eq!(resolve_classified(&idle("+15550000009"), None), Resolution::Fallback);
    }

    #[test]
    fn invitee_tags_resolve_before_classification() {
        let mut state = idle("+15550000010");
        state.waiting_for = Some(WaitingFor::PollOptionReply);
        assert_eq!(
            resolve_early(&state, Role::Member, "1 3"),
            Some(Resolution::InviteeReply)
        );
    }
}
