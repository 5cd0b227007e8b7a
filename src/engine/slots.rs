//! Slot vocabulary and per-workflow slot accumulation.
//!
//! A "slot" is one named field a workflow must collect. Values arrive all at
//! once (the classifier extracted several from one utterance) or one turn at
//! a time; merging is field-level overwrite, newest wins.

use serde::{Deserialize, Serialize};

use crate::conversation::model::WaitingFor;

/// Closed set of multi-step workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    CreateGroup,
    AddMembers,
    CreateEvent,
    CreatePoll,
    Broadcast,
}

impl WorkflowKind {
    /// Short label for logging and snapshot tags.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateGroup => "create_group",
            Self::AddMembers => "add_members",
            Self::CreateEvent => "create_event",
            Self::CreatePoll => "create_poll",
            Self::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Closed set of slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotId {
    /// Group name or event title.
    Name,
    Date,
    Time,
    Location,
    Notes,
    /// Raw member entries ("John 555-123-4567, Mary 555-987-6543").
    Members,
    /// Broadcast body.
    Message,
    /// Broadcast audience filter ("everyone", "in", "out", "no_response").
    Audience,
    /// Target group name.
    Group,
    /// Poll time options.
    Options,
}

impl SlotId {
    /// Human prompt asking for this slot.
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Name => "What should it be called?",
            Self::Date => "What date? (e.g. \"Friday\" or \"March 14\")",
            Self::Time => "What time?",
            Self::Location => "Where is it? (reply \"skip\" to leave it out)",
            Self::Notes => "Any notes to include? (reply \"skip\" for none)",
            Self::Members => {
                "Who's in? Send names and numbers like \"John 555-123-4567, Mary 555-987-6543\", or \"done\" to finish."
            }
            Self::Message => "What should the message say?",
            Self::Audience => "Who should get it? (everyone / in / out / no reply yet)",
            Self::Group => "Which group is this for?",
            Self::Options => {
                "Send up to 3 time options, like \"Friday 6pm, Saturday 10am\"."
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Date => "date",
            Self::Time => "time",
            Self::Location => "location",
            Self::Notes => "notes",
            Self::Members => "members",
            Self::Message => "message",
            Self::Audience => "audience",
            Self::Group => "group",
            Self::Options => "options",
        }
    }
}

/// Fixed priority order for sequential slot requests:
/// name → date → time → location → notes last. Workflow-specific slots
/// (group target, members, message, options) come before the generic run.
pub const PROMPT_ORDER: &[SlotId] = &[
    SlotId::Group,
    SlotId::Name,
    SlotId::Date,
    SlotId::Time,
    SlotId::Members,
    SlotId::Message,
    SlotId::Options,
    SlotId::Location,
    SlotId::Audience,
    SlotId::Notes,
];

/// Accumulated slot values for the workflow in flight.
///
/// One struct covers all workflows; each `WorkflowSpec` names the subset it
/// requires. Field-level merge keeps the newest defined value per slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// Pending numbered-list choices while `waiting_for` is a selection tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

impl SlotValues {
    /// Merge `newer` into `self` — field-level overwrite, newest wins.
    pub fn merge(&mut self, newer: &SlotValues) {
        macro_rules! take {
            ($field:ident) => {
                if newer.$field.is_some() {
                    self.$field = newer.$field.clone();
                }
            };
        }
        take!(name);
        take!(date);
        take!(time);
        take!(location);
        take!(notes);
        take!(members);
        take!(message);
        take!(audience);
        take!(group);
        take!(options);
        take!(choices);
    }

    /// Whether a slot holds a value.
    pub fn is_set(&self, slot: SlotId) -> bool {
        match slot {
            SlotId::Name => self.name.is_some(),
            SlotId::Date => self.date.is_some(),
            SlotId::Time => self.time.is_some(),
            SlotId::Location => self.location.is_some(),
            SlotId::Notes => self.notes.is_some(),
            SlotId::Members => self.members.is_some(),
            SlotId::Message => self.message.is_some(),
            SlotId::Audience => self.audience.is_some(),
            SlotId::Group => self.group.is_some(),
            SlotId::Options => self.options.as_ref().is_some_and(|o| !o.is_empty()),
        }
    }

    /// Set a slot from free text (sequential fallback answers).
    pub fn set_text(&mut self, slot: SlotId, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        match slot {
            SlotId::Name => self.name = Some(value.to_string()),
            SlotId::Date => self.date = Some(value.to_string()),
            SlotId::Time => self.time = Some(value.to_string()),
            SlotId::Location => self.location = Some(value.to_string()),
            SlotId::Notes => self.notes = Some(value.to_string()),
            SlotId::Members => self.members = Some(value.to_string()),
            SlotId::Message => self.message = Some(value.to_string()),
            SlotId::Audience => self.audience = Some(value.to_string()),
            SlotId::Group => self.group = Some(value.to_string()),
            SlotId::Options => {
                self.options = Some(
                    value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .take(3)
                        .collect(),
                )
            }
        }
    }

    /// First still-missing required slot in the fixed prompt order.
    pub fn first_missing(&self, required: &[SlotId]) -> Option<SlotId> {
        PROMPT_ORDER
            .iter()
            .copied()
            .find(|slot| required.contains(slot) && !self.is_set(*slot))
    }

    pub fn is_empty(&self) -> bool {
        *self == SlotValues::default()
    }
}

/// Static descriptor of one workflow: ordered slot lists plus its
/// collecting tag and optional terminal confirmation tag.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowSpec {
    pub kind: WorkflowKind,
    pub required: &'static [SlotId],
    pub optional: &'static [SlotId],
    pub collecting: WaitingFor,
    /// `None` means the terminal action fires as soon as slots are complete
    /// (group creation — see the create-group flow).
    pub confirmation: Option<WaitingFor>,
}

impl WorkflowSpec {
    /// Descriptor for a workflow kind. Exhaustive over the closed set.
    pub fn for_kind(kind: WorkflowKind) -> &'static WorkflowSpec {
        match kind {
            WorkflowKind::CreateGroup => &CREATE_GROUP_SPEC,
            WorkflowKind::AddMembers => &ADD_MEMBERS_SPEC,
            WorkflowKind::CreateEvent => &CREATE_EVENT_SPEC,
            WorkflowKind::CreatePoll => &CREATE_POLL_SPEC,
            WorkflowKind::Broadcast => &BROADCAST_SPEC,
        }
    }
}

pub static CREATE_GROUP_SPEC: WorkflowSpec = WorkflowSpec {
    kind: WorkflowKind::CreateGroup,
    required: &[SlotId::Name],
    optional: &[],
    collecting: WaitingFor::GroupName,
    confirmation: None,
};

pub static ADD_MEMBERS_SPEC: WorkflowSpec = WorkflowSpec {
    kind: WorkflowKind::AddMembers,
    required: &[SlotId::Group, SlotId::Members],
    optional: &[],
    collecting: WaitingFor::MemberEntries,
    confirmation: None,
};

pub static CREATE_EVENT_SPEC: WorkflowSpec = WorkflowSpec {
    kind: WorkflowKind::CreateEvent,
    required: &[SlotId::Group, SlotId::Name, SlotId::Date, SlotId::Time],
    optional: &[SlotId::Location, SlotId::Notes],
    collecting: WaitingFor::EventDetails,
    confirmation: Some(WaitingFor::EventConfirmation),
};

pub static CREATE_POLL_SPEC: WorkflowSpec = WorkflowSpec {
    kind: WorkflowKind::CreatePoll,
    required: &[SlotId::Group, SlotId::Name, SlotId::Options],
    optional: &[],
    collecting: WaitingFor::PollDetails,
    confirmation: Some(WaitingFor::PollConfirmation),
};

pub static BROADCAST_SPEC: WorkflowSpec = WorkflowSpec {
    kind: WorkflowKind::Broadcast,
    required: &[SlotId::Group, SlotId::Message],
    optional: &[SlotId::Audience],
    collecting: WaitingFor::BroadcastDetails,
    confirmation: Some(WaitingFor::BroadcastConfirmation),
};
