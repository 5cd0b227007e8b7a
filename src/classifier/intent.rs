//! Classifier output — symbolic action plus extracted parameters.
//!
//! The classification service is a black box reached over HTTP. It returns
//! either a JSON object `{action, params, confidence}` or a bare action
//! token; both shapes are normalized here into a `Classification`.

use serde::Deserialize;

use crate::engine::slots::{SlotValues, WorkflowKind};
use crate::error::ClassifierError;

/// Closed set of actions the service may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateGroup,
    AddMembers,
    CreateEvent,
    CreatePoll,
    Broadcast,
    CheckPoll,
    StopPoll,
    ListGroups,
    Help,
    /// Conversational text with no recognizable command.
    Chat,
}

impl Action {
    pub fn from_token(token: &str) -> Option<Action> {
        match token.trim().to_lowercase().as_str() {
            "create_group" => Some(Self::CreateGroup),
            "add_members" => Some(Self::AddMembers),
            "create_event" | "create_invite" => Some(Self::CreateEvent),
            "create_poll" => Some(Self::CreatePoll),
            "broadcast" | "send_message" => Some(Self::Broadcast),
            "check_poll" => Some(Self::CheckPoll),
            "stop_poll" => Some(Self::StopPoll),
            "list_groups" => Some(Self::ListGroups),
            "help" => Some(Self::Help),
            "chat" | "other" => Some(Self::Chat),
            _ => None,
        }
    }

    /// The workflow this action starts, if it starts one.
    pub fn workflow(&self) -> Option<WorkflowKind> {
        match self {
            Self::CreateGroup => Some(WorkflowKind::CreateGroup),
            Self::AddMembers => Some(WorkflowKind::AddMembers),
            Self::CreateEvent => Some(WorkflowKind::CreateEvent),
            Self::CreatePoll => Some(WorkflowKind::CreatePoll),
            Self::Broadcast => Some(WorkflowKind::Broadcast),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateGroup => "create_group",
            Self::AddMembers => "add_members",
            Self::CreateEvent => "create_event",
            Self::CreatePoll => "create_poll",
            Self::Broadcast => "broadcast",
            Self::CheckPoll => "check_poll",
            Self::StopPoll => "stop_poll",
            Self::ListGroups => "list_groups",
            Self::Help => "help",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalized classifier result.
#[derive(Debug, Clone)]
pub struct Classification {
    /// `None` when the service returned a token outside the closed set —
    /// input ambiguity, handled by a clarification prompt upstream.
    pub action: Option<Action>,
    /// Slot values the service extracted from the utterance.
    pub slots: SlotValues,
    pub confidence: f32,
    /// The raw action token, kept for logging.
    pub raw_action: String,
}

/// Wire shape of the structured response.
#[derive(Debug, Deserialize)]
struct WireResponse {
    action: String,
    #[serde(default, alias = "extractedParams")]
    params: WireParams,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Default, Deserialize)]
struct WireParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    members: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    group: Option<String>,
    /// Poll options: array of strings or a single comma-joined string.
    #[serde(default)]
    options: Option<serde_json::Value>,
}

impl Classification {
    /// Parse raw service output. Accepts a JSON object (possibly wrapped in
    /// markdown fences) or a bare action token.
    pub fn parse(raw: &str) -> Result<Classification, ClassifierError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ClassifierError::InvalidResponse("empty response".into()));
        }

        let json_str = extract_json_object(trimmed);
        if json_str.starts_with('{') {
            let wire: WireResponse = serde_json::from_str(&json_str)?;
            return Ok(Classification {
                action: Action::from_token(&wire.action),
                slots: wire.params.into_slots(),
                confidence: wire.confidence.clamp(0.0, 1.0),
                raw_action: wire.action,
            });
        }

        // Bare token form.
        Ok(Classification {
            action: Action::from_token(trimmed),
            slots: SlotValues::default(),
            confidence: 0.0,
            raw_action: trimmed.to_string(),
        })
    }
}

impl WireParams {
    fn into_slots(self) -> SlotValues {
        let options = self.options.and_then(|v| match v {
            serde_json::Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .take(3)
                    .collect::<Vec<_>>(),
            ),
            serde_json::Value::String(s) => Some(
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .take(3)
                    .collect(),
            ),
            _ => None,
        });
        SlotValues {
            name: non_empty(self.name),
            date: non_empty(self.date),
            time: non_empty(self.time),
            location: non_empty(self.location),
            notes: non_empty(self.notes),
            members: non_empty(self.members),
            message: non_empty(self.message),
            audience: non_empty(self.audience),
            group: non_empty(self.group),
            options: options.filter(|o: &Vec<String>| !o.is_empty()),
            choices: None,
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Extract a JSON object from service output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
