//! Unified `Database` trait — single async interface for all persistence.
//!
//! The engine and scheduler depend only on this trait; the libSQL backend
//! implements it. Conditional updates (versioned conversation writes, job
//! claims, poll transitions) report whether they won via `bool` or a
//! `Conflict` error so callers can treat a lost race as retry-safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::conversation::model::ConversationState;
use crate::error::DatabaseError;
use crate::store::model::{
    Contact, DeferredJob, Direction, Event, EventStatus, Group, Invitation, InvitationStatus,
    JobKind, JobStatus, LoggedMessage, PollOption, PollRecipient, PollStatus, ResponseStats,
    Rsvp, SchedulingPoll,
};

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversation records ────────────────────────────────────────

    /// Fetch the conversation record for a user key.
    async fn get_conversation(
        &self,
        user_key: &str,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// Insert a brand-new record (version 1). `Conflict` if one exists.
    async fn insert_conversation(&self, state: &ConversationState) -> Result<(), DatabaseError>;

    /// Versioned update: applies only if the stored version equals
    /// `expected_version`, writing `expected_version + 1`. `Conflict` when
    /// another worker got there first.
    async fn update_conversation(
        &self,
        state: &ConversationState,
        expected_version: i64,
    ) -> Result<(), DatabaseError>;

    // ── Message history ─────────────────────────────────────────────

    /// Append one line of per-user message history.
    async fn log_message(
        &self,
        user_key: &str,
        direction: Direction,
        body: &str,
    ) -> Result<(), DatabaseError>;

    /// Most recent history lines, newest first.
    async fn recent_messages(
        &self,
        user_key: &str,
        limit: usize,
    ) -> Result<Vec<LoggedMessage>, DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert or update a contact by phone; a non-empty name overwrites.
    async fn upsert_contact(&self, phone: &str, name: &str) -> Result<Contact, DatabaseError>;

    async fn get_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, DatabaseError>;

    // ── Groups ──────────────────────────────────────────────────────

    /// Insert a group. `Constraint` on duplicate (owner, name) or handle.
    async fn insert_group(&self, group: &Group) -> Result<(), DatabaseError>;

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, DatabaseError>;

    /// Case-insensitive lookup by owner + name.
    async fn find_group_by_name(
        &self,
        owner_key: &str,
        name: &str,
    ) -> Result<Option<Group>, DatabaseError>;

    /// All groups owned by a user, oldest first.
    async fn list_groups(&self, owner_key: &str) -> Result<Vec<Group>, DatabaseError>;

    /// Add a contact to a group. Idempotent.
    async fn add_member(&self, group_id: Uuid, contact_id: Uuid) -> Result<(), DatabaseError>;

    async fn list_members(&self, group_id: Uuid) -> Result<Vec<Contact>, DatabaseError>;

    // ── Events & invitations ────────────────────────────────────────

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, DatabaseError>;

    async fn update_event_status(
        &self,
        id: Uuid,
        status: EventStatus,
    ) -> Result<(), DatabaseError>;

    /// Most recent active event for a group, used for audience filtering.
    async fn latest_event_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Option<Event>, DatabaseError>;

    /// Insert an invitation. `Constraint` on duplicate (event, contact).
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), DatabaseError>;

    async fn update_invitation_status(
        &self,
        id: Uuid,
        status: InvitationStatus,
    ) -> Result<(), DatabaseError>;

    /// Record a normalized RSVP answer; flips status to `responded`.
    async fn record_rsvp(&self, id: Uuid, response: Rsvp) -> Result<(), DatabaseError>;

    /// The invitee's most recent invitation for an active event, with the
    /// event itself, for resolving terse RSVP replies.
    async fn latest_invitation_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<(Invitation, Event)>, DatabaseError>;

    async fn list_invitations(&self, event_id: Uuid) -> Result<Vec<Invitation>, DatabaseError>;

    // ── Scheduling polls ────────────────────────────────────────────

    /// Insert a poll with its options and recipients in one transaction.
    async fn insert_poll(
        &self,
        poll: &SchedulingPoll,
        options: &[PollOption],
        recipients: &[PollRecipient],
    ) -> Result<(), DatabaseError>;

    async fn get_poll(&self, id: Uuid) -> Result<Option<SchedulingPoll>, DatabaseError>;

    async fn poll_options(&self, poll_id: Uuid) -> Result<Vec<PollOption>, DatabaseError>;

    async fn poll_recipients(&self, poll_id: Uuid) -> Result<Vec<PollRecipient>, DatabaseError>;

    /// Conditional status transition. `Ok(false)` when the poll was no
    /// longer in `from` — the caller must not force the change.
    async fn transition_poll(
        &self,
        id: Uuid,
        from: PollStatus,
        to: PollStatus,
    ) -> Result<bool, DatabaseError>;

    /// Owner's most recent poll in any of the given statuses.
    async fn find_poll_for_owner(
        &self,
        owner_key: &str,
        statuses: &[PollStatus],
    ) -> Result<Option<SchedulingPoll>, DatabaseError>;

    /// The running poll this phone was invited to, if any.
    async fn find_running_poll_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SchedulingPoll>, DatabaseError>;

    /// Record an invitee's availability. Empty `option_idxs` means
    /// "none work". Overwrites a previous answer from the same phone.
    async fn record_poll_response(
        &self,
        poll_id: Uuid,
        phone: &str,
        option_idxs: &[u32],
    ) -> Result<(), DatabaseError>;

    async fn poll_stats(&self, poll_id: Uuid) -> Result<ResponseStats, DatabaseError>;

    /// Recipients who have not responded yet.
    async fn non_responders(&self, poll_id: Uuid) -> Result<Vec<PollRecipient>, DatabaseError>;

    // ── Deferred job queue ──────────────────────────────────────────

    /// Enqueue a job. Returns `Ok(None)` when a pending job for the same
    /// (poll, kind) already exists — the store-level uniqueness constraint
    /// is the sole duplicate-prevention mechanism.
    async fn enqueue_job(
        &self,
        poll_id: Uuid,
        kind: JobKind,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError>;

    /// Pending jobs with `scheduled_at <= now`, oldest first.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeferredJob>, DatabaseError>;

    /// Atomic claim: `pending → processing` filtered on still-pending.
    /// `Ok(false)` means another runner claimed it.
    async fn claim_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Terminal job transition (`processed` or `skipped`).
    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError>;
}
