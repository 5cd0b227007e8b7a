//! Conversation record — the durable per-user state machine.
//!
//! One record per normalized phone key. The engine reconstructs everything
//! from this record on each invocation; nothing survives in memory between
//! inbound messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::slots::{SlotId, SlotValues, WorkflowKind};
use crate::onboarding::OnboardingStep;

/// What the engine expects next, drawn from a fixed tag vocabulary.
///
/// Invariant: `ConversationState::waiting_for` is `Some` iff the engine
/// expects one specific next input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingFor {
    /// Collecting tags — one per workflow.
    GroupName,
    MemberEntries,
    EventDetails,
    PollDetails,
    BroadcastDetails,
    /// Confirmation tags — next reply is strictly yes/no/unclear.
    EventConfirmation,
    PollConfirmation,
    BroadcastConfirmation,
    PollStopConfirmation,
    /// Numbered-selection tags.
    GroupSelection,
    PollPausedMenu,
    /// Invitee-side tags.
    PollOptionReply,
    RsvpReply,
    /// Identity provisioning.
    OnboardingName,
}

impl WaitingFor {
    pub fn is_confirmation(&self) -> bool {
        matches!(
            self,
            Self::EventConfirmation
                | Self::PollConfirmation
                | Self::BroadcastConfirmation
                | Self::PollStopConfirmation
        )
    }

    pub fn is_selection(&self) -> bool {
        matches!(self, Self::GroupSelection | Self::PollPausedMenu)
    }

    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            Self::GroupName
                | Self::MemberEntries
                | Self::EventDetails
                | Self::PollDetails
                | Self::BroadcastDetails
        )
    }

    /// Workflow a collecting or confirmation tag belongs to.
    pub fn workflow(&self) -> Option<WorkflowKind> {
        match self {
            Self::GroupName => Some(WorkflowKind::CreateGroup),
            Self::MemberEntries => Some(WorkflowKind::AddMembers),
            Self::EventDetails | Self::EventConfirmation => Some(WorkflowKind::CreateEvent),
            Self::PollDetails | Self::PollConfirmation => Some(WorkflowKind::CreatePoll),
            Self::BroadcastDetails | Self::BroadcastConfirmation => Some(WorkflowKind::Broadcast),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::GroupName => "group_name",
            Self::MemberEntries => "member_entries",
            Self::EventDetails => "event_details",
            Self::PollDetails => "poll_details",
            Self::BroadcastDetails => "broadcast_details",
            Self::EventConfirmation => "event_confirmation",
            Self::PollConfirmation => "poll_confirmation",
            Self::BroadcastConfirmation => "broadcast_confirmation",
            Self::PollStopConfirmation => "poll_stop_confirmation",
            Self::GroupSelection => "group_selection",
            Self::PollPausedMenu => "poll_paused_menu",
            Self::PollOptionReply => "poll_option_reply",
            Self::RsvpReply => "rsvp_reply",
            Self::OnboardingName => "onboarding_name",
        }
    }
}

impl std::fmt::Display for WaitingFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Workflow name + phase, the `current_state` field of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FlowState {
    #[default]
    Idle,
    InWorkflow {
        kind: WorkflowKind,
        phase: WorkflowPhase,
    },
}

/// Phase of the active workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Collecting,
    Confirming,
    Selecting,
}

impl FlowState {
    pub fn workflow(&self) -> Option<WorkflowKind> {
        match self {
            Self::Idle => None,
            Self::InWorkflow { kind, .. } => Some(*kind),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Idle => "idle".to_string(),
            Self::InWorkflow { kind, phase } => {
                let phase = match phase {
                    WorkflowPhase::Collecting => "collecting",
                    WorkflowPhase::Confirming => "confirming",
                    WorkflowPhase::Selecting => "selecting",
                };
                format!("{kind}:{phase}")
            }
        }
    }
}

/// Immutable snapshot appended after each engine step.
///
/// The ordered list is the audit trail; slot resolution scans it
/// newest-first and takes the first defined value per slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Which step produced it, e.g. "create_event:collect" or
    /// "create_group:done".
    pub step: String,
    pub at: DateTime<Utc>,
    /// Raw inbound text that drove the step.
    pub input: String,
    /// Derived effect, if the step produced one (e.g. "group_created:Tennis").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Known slot values at this point.
    #[serde(default)]
    pub slots: SlotValues,
}

/// Durable per-user conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    /// Normalized phone key.
    pub user_key: String,
    pub current_state: FlowState,
    pub waiting_for: Option<WaitingFor>,
    /// Last classified action label.
    pub last_action: Option<String>,
    pub last_action_at: Option<DateTime<Utc>>,
    /// Set while identity provisioning is incomplete.
    pub onboarding_step: Option<OnboardingStep>,
    /// Append-only audit trail, oldest first.
    pub snapshots: Vec<WorkflowSnapshot>,
    /// Absent while sticky (onboarding); otherwise records age out.
    pub expires_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter; 0 means never persisted.
    pub version: i64,
}

impl ConversationState {
    pub fn new(user_key: &str) -> Self {
        Self {
            user_key: user_key.to_string(),
            current_state: FlowState::Idle,
            waiting_for: None,
            last_action: None,
            last_action_at: None,
            onboarding_step: None,
            snapshots: Vec::new(),
            expires_at: None,
            version: 0,
        }
    }

    /// Current value of a slot: scan snapshots newest-first, first defined
    /// value wins (last-write-wins at slot granularity).
    pub fn current_slot(&self, slot: SlotId) -> Option<String> {
        self.snapshots
            .iter()
            .rev()
            .find(|snap| snap.slots.is_set(slot))
            .and_then(|snap| match slot {
                SlotId::Name => snap.slots.name.clone(),
                SlotId::Date => snap.slots.date.clone(),
                SlotId::Time => snap.slots.time.clone(),
                SlotId::Location => snap.slots.location.clone(),
                SlotId::Notes => snap.slots.notes.clone(),
                SlotId::Members => snap.slots.members.clone(),
                SlotId::Message => snap.slots.message.clone(),
                SlotId::Audience => snap.slots.audience.clone(),
                SlotId::Group => snap.slots.group.clone(),
                SlotId::Options => snap.slots.options.clone().map(|o| o.join(", ")),
            })
    }

    /// Accumulated slots for the workflow in flight — the newest snapshot's
    /// merged set, or empty when idle.
    pub fn accumulated_slots(&self) -> SlotValues {
        if self.current_state == FlowState::Idle {
            return SlotValues::default();
        }
        self.snapshots
            .last()
            .map(|s| s.slots.clone())
            .unwrap_or_default()
    }

    /// Most recent effect matching a prefix, e.g. "group_created:".
    pub fn latest_effect(&self, prefix: &str) -> Option<&str> {
        self.snapshots
            .iter()
            .rev()
            .filter_map(|s| s.effect.as_deref())
            .find(|e| e.starts_with(prefix))
    }

    /// Append an audit snapshot.
    pub fn push_snapshot(&mut self, step: &str, input: &str, effect: Option<String>, slots: SlotValues) {
        self.snapshots.push(WorkflowSnapshot {
            step: step.to_string(),
            at: Utc::now(),
            input: input.to_string(),
            effect,
            slots,
        });
    }

    /// Enter a workflow in its collecting phase.
    pub fn enter_workflow(&mut self, kind: WorkflowKind, collecting: WaitingFor) {
        self.current_state = FlowState::InWorkflow {
            kind,
            phase: WorkflowPhase::Collecting,
        };
        self.waiting_for = Some(collecting);
    }

    /// Move the active workflow to its confirming phase.
    pub fn enter_confirmation(&mut self, kind: WorkflowKind, tag: WaitingFor) {
        self.current_state = FlowState::InWorkflow {
            kind,
            phase: WorkflowPhase::Confirming,
        };
        self.waiting_for = Some(tag);
    }

    /// Reset to idle, clearing the waiting tag. Snapshots are kept — they
    /// are the audit trail, not working memory.
    pub fn reset_flow(&mut self) {
        self.current_state = FlowState::Idle;
        self.waiting_for = None;
    }

    /// Record the classified action of the latest inbound message.
    pub fn touch(&mut self, action_label: &str) {
        self.last_action = Some(action_label.to_string());
        self.last_action_at = Some(Utc::now());
    }

    /// Whether the record has aged out.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(slots: SlotValues) -> WorkflowSnapshot {
        WorkflowSnapshot {
            step: "test".into(),
            at: Utc::now(),
            input: String::new(),
            effect: None,
            slots,
        }
    }

    #[test]
    fn waiting_for_serde_matches_display() {
        for tag in [
            WaitingFor::GroupName,
            WaitingFor::MemberEntries,
            WaitingFor::EventDetails,
            WaitingFor::EventConfirmation,
            WaitingFor::PollDetails,
            WaitingFor::PollConfirmation,
            WaitingFor::BroadcastDetails,
            WaitingFor::BroadcastConfirmation,
            WaitingFor::PollStopConfirmation,
            WaitingFor::GroupSelection,
            WaitingFor::PollPausedMenu,
            WaitingFor::PollOptionReply,
            WaitingFor::RsvpReply,
            WaitingFor::OnboardingName,
        ] {
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{tag}\""));
        }
    }

    #[test]
    fn tag_classification_is_disjoint() {
        let confirmations = [
            WaitingFor::EventConfirmation,
            WaitingFor::PollConfirmation,
            WaitingFor::BroadcastConfirmation,
            WaitingFor::PollStopConfirmation,
        ];
        for tag in confirmations {
            assert!(tag.is_confirmation());
            assert!(!tag.is_collecting());
            assert!(!tag.is_selection());
        }
        assert!(WaitingFor::GroupSelection.is_selection());
        assert!(WaitingFor::EventDetails.is_collecting());
    }

    #[test]
    fn slot_resolution_scans_newest_first() {
        let mut state = ConversationState::new("+15551234567");
        state.snapshots.push(snapshot_with(SlotValues {
            name: Some("Game Night".into()),
            date: Some("Friday".into()),
            ..Default::default()
        }));
        state.snapshots.push(snapshot_with(SlotValues {
            date: Some("Saturday".into()),
            ..Default::default()
        }));

        // Newest snapshot defines date; older one still supplies name.
        assert_eq!(state.current_slot(SlotId::Date).as_deref(), Some("Saturday"));
        assert_eq!(
            state.current_slot(SlotId::Name).as_deref(),
            Some("Game Night")
        );
        assert_eq!(state.current_slot(SlotId::Location), None);
    }

    #[test]
    fn reset_keeps_audit_trail() {
        let mut state = ConversationState::new("+15551234567");
        state.enter_workflow(WorkflowKind::CreateEvent, WaitingFor::EventDetails);
        state.push_snapshot("create_event:collect", "game night friday", None, SlotValues::default());
        state.reset_flow();

        assert_eq!(state.current_state, FlowState::Idle);
        assert!(state.waiting_for.is_none());
        assert_eq!(state.snapshots.len(), 1);
    }

    #[test]
    fn accumulated_slots_empty_when_idle() {
        let mut state = ConversationState::new("+15551234567");
        state.push_snapshot(
            "create_group:done",
            "create group Tennis",
            Some("group_created:Tennis".into()),
            SlotValues {
                name: Some("Tennis".into()),
                ..Default::default()
            },
        );
        // Flow already reset — idle means no working slots.
        assert!(state.accumulated_slots().is_empty());
    }

    #[test]
    fn latest_effect_matches_prefix() {
        let mut state = ConversationState::new("+15551234567");
        state.push_snapshot("a", "", Some("group_created:Tennis".into()), SlotValues::default());
        state.push_snapshot("b", "", Some("event_created:42".into()), SlotValues::default());
        assert_eq!(state.latest_effect("group_created:"), Some("group_created:Tennis"));
        assert_eq!(state.latest_effect("event_created:"), Some("event_created:42"));
        assert_eq!(state.latest_effect("poll_created:"), None);
    }

    #[test]
    fn expiry_absent_means_sticky() {
        let state = ConversationState::new("+15551234567");
        assert!(!state.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn state_serde_roundtrip() {
        let mut state = ConversationState::new("+15551234567");
        state.enter_workflow(WorkflowKind::CreatePoll, WaitingFor::PollDetails);
        state.touch("create_poll");
        state.push_snapshot(
            "create_poll:collect",
            "poll the tennis crew",
            None,
            SlotValues {
                group: Some("Tennis".into()),
                ..Default::default()
            },
        );

        let json = serde_json::to_string(&state).unwrap();
        let parsed: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.user_key, "+15551234567");
        assert_eq!(parsed.waiting_for, Some(WaitingFor::PollDetails));
        assert_eq!(
            parsed.current_state.workflow(),
            Some(WorkflowKind::CreatePoll)
        );
        assert_eq!(parsed.snapshots.len(), 1);
    }
}
