//! Domain rows — groups, events, invitations, polls, deferred jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A known person, keyed by normalized phone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub phone: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A coordination group. Name is unique per owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    /// Owner's normalized phone key.
    pub owner_key: String,
    pub name: String,
    /// Short shareable handle, e.g. "k3v9qx".
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
}

/// Event lifecycle. Immutable after creation except this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    Cancelled,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown event status: {s}")),
        }
    }
}

/// A scheduled event, created at the terminal step of the invitation
/// workflow. Date/time fields keep the organizer's original wording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub owner_key: String,
    pub group_id: Uuid,
    pub title: String,
    pub date: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

/// Delivery status of one invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Sent,
    Responded,
    Failed,
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Responded => write!(f, "responded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for InvitationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "responded" => Ok(Self::Responded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown invitation status: {s}")),
        }
    }
}

/// Normalized RSVP answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rsvp {
    In,
    Out,
    Maybe,
    NoResponse,
}

impl Rsvp {
    /// Normalize a free-text reply into an RSVP answer.
    pub fn parse(text: &str) -> Option<Rsvp> {
        match text.trim().to_lowercase().as_str() {
            "in" | "i'm in" | "im in" | "yes" | "count me in" | "going" => Some(Self::In),
            "out" | "i'm out" | "im out" | "no" | "can't make it" | "cant make it"
            | "not going" => Some(Self::Out),
            "maybe" | "not sure" | "possibly" => Some(Self::Maybe),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Maybe => "maybe",
            Self::NoResponse => "no_response",
        }
    }
}

impl std::fmt::Display for Rsvp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Rsvp {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "maybe" => Ok(Self::Maybe),
            "no_response" => Ok(Self::NoResponse),
            _ => Err(format!("Unknown rsvp: {s}")),
        }
    }
}

/// One invitation per (event, contact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub event_id: Uuid,
    pub contact_id: Uuid,
    /// Invitee's normalized phone, denormalized for reply lookups.
    pub phone: String,
    pub status: InvitationStatus,
    pub response: Rsvp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Poll lifecycle, advanced only by the scheduler (and explicit stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for PollStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Unknown poll status: {s}")),
        }
    }
}

/// An availability poll scoped to a planned event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingPoll {
    pub id: Uuid,
    pub owner_key: String,
    pub group_id: Uuid,
    pub event_name: String,
    pub status: PollStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// One time option of a poll. `idx` is 0-based in storage; rendered 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub idx: u32,
    /// Original text, e.g. "Friday 6pm".
    pub label: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// A person the poll was sent to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRecipient {
    pub poll_id: Uuid,
    pub phone: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

/// Aggregated response counts for a poll.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseStats {
    pub total: u32,
    pub responded: u32,
    /// Available count per option index (0-based).
    pub per_option: Vec<u32>,
    /// Recipients who answered "none".
    pub none_work: u32,
}

impl ResponseStats {
    pub fn pending(&self) -> u32 {
        self.total.saturating_sub(self.responded)
    }
}

/// Kind of deferred work against a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Reminder,
    PauseCheck,
    AutoEndCheck,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reminder => write!(f, "reminder"),
            Self::PauseCheck => write!(f, "pause_check"),
            Self::AutoEndCheck => write!(f, "auto_end_check"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reminder" => Ok(Self::Reminder),
            "pause_check" => Ok(Self::PauseCheck),
            "auto_end_check" => Ok(Self::AutoEndCheck),
            _ => Err(format!("Unknown job kind: {s}")),
        }
    }
}

/// Deferred job status. `pending → processing` is the atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Processed,
    Skipped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// A scheduled unit of future poll work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredJob {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub kind: JobKind,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Direction of a logged SMS body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// One line of per-user message history, feeding the context assembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub id: Uuid,
    pub user_key: String,
    pub direction: Direction,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsvp_parse_normalizes_variants() {
        assert_eq!(Rsvp::parse("IN"), Some(Rsvp::In));
        assert_eq!(Rsvp::parse("I'm in"), Some(Rsvp::In));
        assert_eq!(Rsvp::parse("can't make it"), Some(Rsvp::Out));
        assert_eq!(Rsvp::parse("maybe"), Some(Rsvp::Maybe));
        assert_eq!(Rsvp::parse("what time again?"), None);
    }

    #[test]
    fn status_roundtrips() {
        for s in ["running", "paused", "stopped"] {
            assert_eq!(s.parse::<PollStatus>().unwrap().to_string(), s);
        }
        for s in ["pending", "processing", "processed", "skipped"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().to_string(), s);
        }
        for s in ["reminder", "pause_check", "auto_end_check"] {
            assert_eq!(s.parse::<JobKind>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn stats_pending_never_underflows() {
        let stats = ResponseStats {
            total: 2,
            responded: 5,
            ..Default::default()
        };
        assert_eq!(stats.pending(), 0);
    }
}
