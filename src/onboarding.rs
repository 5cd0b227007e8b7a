//! Identity onboarding — captures a display name before any workflow runs.
//!
//! The first message from an unknown phone lands here (priority rule 5).
//! While a step is active the conversation record is sticky: no expiry.

use serde::{Deserialize, Serialize};

/// Linear onboarding progression: NotStarted → AwaitingName → Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    NotStarted,
    AwaitingName,
    Complete,
}

impl OnboardingStep {
    pub fn next(&self) -> Option<OnboardingStep> {
        match self {
            Self::NotStarted => Some(Self::AwaitingName),
            Self::AwaitingName => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::AwaitingName => "awaiting_name",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Greeting sent when an unknown phone first texts in.
pub fn welcome_prompt() -> &'static str {
    "Hey! I'm Huddle, your group coordinator. What's your name?"
}

/// Reply after the name is captured; lists what the user can do next.
pub fn completion_message(name: &str) -> String {
    format!(
        "Nice to meet you, {name}! You can text me things like \"create group Tennis\", \
         \"invite the crew to game night Friday\", or \"poll the group for times\"."
    )
}

/// Extract a display name from the onboarding reply.
///
/// Strips common lead-ins ("I'm", "my name is") and rejects replies that
/// don't look like a name at all.
pub fn extract_name(reply: &str) -> Option<String> {
    let cleaned = reply.trim().trim_end_matches(['.', '!']);
    let lower = cleaned.to_lowercase();

    let mut stripped = cleaned;
    if lower.len() == cleaned.len() {
        for prefix in ["my name is ", "i'm ", "im ", "it's ", "its ", "this is "] {
            if lower.starts_with(prefix) {
                stripped = &cleaned[prefix.len()..];
                break;
            }
        }
    }

    let stripped = stripped.trim();
    if stripped.is_empty() || stripped.len() > 60 || stripped.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(stripped.to_string())
}
