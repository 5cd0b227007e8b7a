//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Conditional writes
//! (versioned conversation updates, job claims, poll transitions) rely on
//! the rows-changed count of a filtered UPDATE, so two concurrent runners
//! can race safely: exactly one observes a change.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::conversation::model::ConversationState;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Contact, DeferredJob, Direction, Event, EventStatus, Group, Invitation, InvitationStatus,
    JobKind, JobStatus, LoggedMessage, PollOption, PollRecipient, PollStatus, ResponseStats,
    Rsvp, SchedulingPoll,
};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(|d| d.to_rfc3339()))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Whether a libsql error is a store-level uniqueness violation.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn query_err(context: &str) -> impl FnOnce(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

// ── Row mappers ─────────────────────────────────────────────────────

const CONVERSATION_COLUMNS: &str = "user_key, current_state, waiting_for, last_action, \
     last_action_at, onboarding_step, snapshots, expires_at, version";

/// Column order matches CONVERSATION_COLUMNS. The JSON columns
/// (current_state, waiting_for, onboarding_step, snapshots) are decoded
/// with serde; a corrupt column surfaces as a Serialization error rather
/// than a silent default.
fn row_to_conversation(row: &libsql::Row) -> Result<ConversationState, DatabaseError> {
    let user_key: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("conversation user_key: {e}")))?;
    let current_state_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("conversation current_state: {e}")))?;
    let waiting_for_str: Option<String> = row.get(2).ok();
    let last_action: Option<String> = row.get(3).ok();
    let last_action_at: Option<String> = row.get(4).ok();
    let onboarding_str: Option<String> = row.get(5).ok();
    let snapshots_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("conversation snapshots: {e}")))?;
    let expires_at: Option<String> = row.get(7).ok();
    let version: i64 = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("conversation version: {e}")))?;

    let current_state = serde_json::from_str(&current_state_str)
        .map_err(|e| DatabaseError::Serialization(format!("current_state: {e}")))?;
    let waiting_for = match waiting_for_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("waiting_for: {e}")))?,
        ),
        None => None,
    };
    let onboarding_step = match onboarding_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("onboarding_step: {e}")))?,
        ),
        None => None,
    };
    let snapshots = serde_json::from_str(&snapshots_str)
        .map_err(|e| DatabaseError::Serialization(format!("snapshots: {e}")))?;

    Ok(ConversationState {
        user_key,
        current_state,
        waiting_for,
        last_action,
        last_action_at: parse_optional_datetime(&last_action_at),
        onboarding_step,
        snapshots,
        expires_at: parse_optional_datetime(&expires_at),
        version,
    })
}

/// Serialize conversation columns for a write. Returns the JSON columns
/// as owned strings; the caller binds them positionally.
fn conversation_columns(
    state: &ConversationState,
) -> Result<(String, Option<String>, Option<String>, String), DatabaseError> {
    let current_state = serde_json::to_string(&state.current_state)
        .map_err(|e| DatabaseError::Serialization(format!("current_state: {e}")))?;
    let waiting_for = state
        .waiting_for
        .map(|w| serde_json::to_string(&w))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("waiting_for: {e}")))?;
    let onboarding = state
        .onboarding_step
        .map(|o| serde_json::to_string(&o))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("onboarding_step: {e}")))?;
    let snapshots = serde_json::to_string(&state.snapshots)
        .map_err(|e| DatabaseError::Serialization(format!("snapshots: {e}")))?;
    Ok((current_state, waiting_for, onboarding, snapshots))
}

fn row_to_message(row: &libsql::Row) -> Result<LoggedMessage, libsql::Error> {
    let id: String = row.get(0)?;
    let user_key: String = row.get(1)?;
    let direction: String = row.get(2)?;
    let body: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(LoggedMessage {
        id: parse_uuid(&id),
        user_key,
        direction: if direction == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        body,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let id: String = row.get(0)?;
    let phone: String = row.get(1)?;
    let name: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Contact {
        id: parse_uuid(&id),
        phone,
        name,
        created_at: parse_datetime(&created_at),
    })
}

const GROUP_COLUMNS: &str = "id, owner_key, name, invite_code, created_at";

fn row_to_group(row: &libsql::Row) -> Result<Group, libsql::Error> {
    let id: String = row.get(0)?;
    let owner_key: String = row.get(1)?;
    let name: String = row.get(2)?;
    let invite_code: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(Group {
        id: parse_uuid(&id),
        owner_key,
        name,
        invite_code,
        created_at: parse_datetime(&created_at),
    })
}

const EVENT_COLUMNS: &str =
    "id, owner_key, group_id, title, date, start_time, end_time, location, notes, status, created_at";

fn row_to_event(row: &libsql::Row) -> Result<Event, libsql::Error> {
    let id: String = row.get(0)?;
    let owner_key: String = row.get(1)?;
    let group_id: String = row.get(2)?;
    let title: String = row.get(3)?;
    let date: String = row.get(4)?;
    let start_time: String = row.get(5)?;
    let end_time: Option<String> = row.get(6).ok();
    let location: Option<String> = row.get(7).ok();
    let notes: Option<String> = row.get(8).ok();
    let status: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    Ok(Event {
        id: parse_uuid(&id),
        owner_key,
        group_id: parse_uuid(&group_id),
        title,
        date,
        start_time,
        end_time,
        location,
        notes,
        status: status.parse().unwrap_or(EventStatus::Active),
        created_at: parse_datetime(&created_at),
    })
}

const INVITATION_COLUMNS: &str =
    "id, event_id, contact_id, phone, status, response, responded_at, created_at";

fn row_to_invitation(row: &libsql::Row) -> Result<Invitation, libsql::Error> {
    let id: String = row.get(0)?;
    let event_id: String = row.get(1)?;
    let contact_id: String = row.get(2)?;
    let phone: String = row.get(3)?;
    let status: String = row.get(4)?;
    let response: String = row.get(5)?;
    let responded_at: Option<String> = row.get(6).ok();
    let created_at: String = row.get(7)?;
    Ok(Invitation {
        id: parse_uuid(&id),
        event_id: parse_uuid(&event_id),
        contact_id: parse_uuid(&contact_id),
        phone,
        status: status.parse().unwrap_or(InvitationStatus::Sent),
        response: response.parse().unwrap_or(Rsvp::NoResponse),
        responded_at: parse_optional_datetime(&responded_at),
        created_at: parse_datetime(&created_at),
    })
}

const POLL_COLUMNS: &str =
    "id, owner_key, group_id, event_name, status, created_at, paused_at, stopped_at";

fn row_to_poll(row: &libsql::Row) -> Result<SchedulingPoll, libsql::Error> {
    let id: String = row.get(0)?;
    let owner_key: String = row.get(1)?;
    let group_id: String = row.get(2)?;
    let event_name: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let paused_at: Option<String> = row.get(6).ok();
    let stopped_at: Option<String> = row.get(7).ok();
    Ok(SchedulingPoll {
        id: parse_uuid(&id),
        owner_key,
        group_id: parse_uuid(&group_id),
        event_name,
        status: status.parse().unwrap_or(PollStatus::Running),
        created_at: parse_datetime(&created_at),
        paused_at: parse_optional_datetime(&paused_at),
        stopped_at: parse_optional_datetime(&stopped_at),
    })
}

fn row_to_poll_option(row: &libsql::Row) -> Result<PollOption, libsql::Error> {
    let id: String = row.get(0)?;
    let poll_id: String = row.get(1)?;
    let idx: i64 = row.get(2)?;
    let label: String = row.get(3)?;
    let starts_at: String = row.get(4)?;
    let ends_at: String = row.get(5)?;
    Ok(PollOption {
        id: parse_uuid(&id),
        poll_id: parse_uuid(&poll_id),
        idx: idx as u32,
        label,
        starts_at: parse_datetime(&starts_at),
        ends_at: parse_datetime(&ends_at),
    })
}

fn row_to_recipient(row: &libsql::Row) -> Result<PollRecipient, libsql::Error> {
    let poll_id: String = row.get(0)?;
    let phone: String = row.get(1)?;
    let name: String = row.get(2)?;
    let responded_at: Option<String> = row.get(3).ok();
    Ok(PollRecipient {
        poll_id: parse_uuid(&poll_id),
        phone,
        name,
        responded_at: parse_optional_datetime(&responded_at),
    })
}

const JOB_COLUMNS: &str = "id, poll_id, kind, scheduled_at, status, created_at, processed_at";

fn row_to_job(row: &libsql::Row) -> Result<DeferredJob, libsql::Error> {
    let id: String = row.get(0)?;
    let poll_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let scheduled_at: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let processed_at: Option<String> = row.get(6).ok();
    Ok(DeferredJob {
        id: parse_uuid(&id),
        poll_id: parse_uuid(&poll_id),
        kind: kind.parse().unwrap_or(JobKind::Reminder),
        scheduled_at: parse_datetime(&scheduled_at),
        status: status.parse().unwrap_or(JobStatus::Pending),
        created_at: parse_datetime(&created_at),
        processed_at: parse_optional_datetime(&processed_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::apply_all(self.conn()).await
    }

    async fn get_conversation(
        &self,
        user_key: &str,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversation_state WHERE user_key = ?1"),
                params![user_key],
            )
            .await
            .map_err(query_err("get_conversation"))?;
        match rows.next().await.map_err(query_err("get_conversation row"))? {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_conversation(&self, state: &ConversationState) -> Result<(), DatabaseError> {
        let (current_state, waiting_for, onboarding, snapshots) = conversation_columns(state)?;
        let result = self
            .conn()
            .execute(
                "INSERT INTO conversation_state
                     (user_key, current_state, waiting_for, last_action, last_action_at,
                      onboarding_step, snapshots, expires_at, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, datetime('now'))",
                params![
                    state.user_key.as_str(),
                    current_state,
                    opt_text_owned(waiting_for),
                    opt_text_owned(state.last_action.clone()),
                    opt_datetime(&state.last_action_at),
                    opt_text_owned(onboarding),
                    snapshots,
                    opt_datetime(&state.expires_at),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Conflict {
                entity: "conversation_state".into(),
                key: state.user_key.clone(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("insert_conversation: {e}"))),
        }
    }

    async fn update_conversation(
        &self,
        state: &ConversationState,
        expected_version: i64,
    ) -> Result<(), DatabaseError> {
        let (current_state, waiting_for, onboarding, snapshots) = conversation_columns(state)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE conversation_state
                 SET current_state = ?2, waiting_for = ?3, last_action = ?4,
                     last_action_at = ?5, onboarding_step = ?6, snapshots = ?7,
                     expires_at = ?8, version = ?9, updated_at = datetime('now')
                 WHERE user_key = ?1 AND version = ?10",
                params![
                    state.user_key.as_str(),
                    current_state,
                    opt_text_owned(waiting_for),
                    opt_text_owned(state.last_action.clone()),
                    opt_datetime(&state.last_action_at),
                    opt_text_owned(onboarding),
                    snapshots,
                    opt_datetime(&state.expires_at),
                    expected_version + 1,
                    expected_version,
                ],
            )
            .await
            .map_err(query_err("update_conversation"))?;
        if changed == 0 {
            return Err(DatabaseError::Conflict {
                entity: "conversation_state".into(),
                key: state.user_key.clone(),
            });
        }
        Ok(())
    }

    async fn log_message(
        &self,
        user_key: &str,
        direction: Direction,
        body: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO message_log (id, user_key, direction, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user_key,
                    direction.to_string(),
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("log_message"))?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        user_key: &str,
        limit: usize,
    ) -> Result<Vec<LoggedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_key, direction, body, created_at FROM message_log
                 WHERE user_key = ?1 ORDER BY created_at DESC LIMIT ?2",
                params![user_key, limit as i64],
            )
            .await
            .map_err(query_err("recent_messages"))?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("recent_messages row"))? {
            messages.push(
                row_to_message(&row).map_err(query_err("recent_messages decode"))?,
            );
        }
        Ok(messages)
    }

    async fn upsert_contact(&self, phone: &str, name: &str) -> Result<Contact, DatabaseError> {
        // A non-empty name overwrites; an empty one keeps what we had.
        self.conn()
            .execute(
                "INSERT INTO contacts (id, phone, name, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (phone) DO UPDATE SET
                     name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE name END",
                params![
                    Uuid::new_v4().to_string(),
                    phone,
                    name,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("upsert_contact"))?;
        self.get_contact_by_phone(phone)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "contact".into(),
                id: phone.into(),
            })
    }

    async fn get_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, phone, name, created_at FROM contacts WHERE phone = ?1",
                params![phone],
            )
            .await
            .map_err(query_err("get_contact_by_phone"))?;
        match rows.next().await.map_err(query_err("get_contact row"))? {
            Some(row) => Ok(Some(
                row_to_contact(&row).map_err(query_err("get_contact decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn insert_group(&self, group: &Group) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                &format!("INSERT INTO groups ({GROUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    group.id.to_string(),
                    group.owner_key.as_str(),
                    group.name.as_str(),
                    group.invite_code.as_str(),
                    group.created_at.to_rfc3339(),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Constraint(format!(
                "group '{}' already exists",
                group.name
            ))),
            Err(e) => Err(DatabaseError::Query(format!("insert_group: {e}"))),
        }
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<Group>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_group"))?;
        match rows.next().await.map_err(query_err("get_group row"))? {
            Some(row) => Ok(Some(
                row_to_group(&row).map_err(query_err("get_group decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn find_group_by_name(
        &self,
        owner_key: &str,
        name: &str,
    ) -> Result<Option<Group>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS} FROM groups
                     WHERE owner_key = ?1 AND name = ?2 COLLATE NOCASE"
                ),
                params![owner_key, name],
            )
            .await
            .map_err(query_err("find_group_by_name"))?;
        match rows.next().await.map_err(query_err("find_group row"))? {
            Some(row) => Ok(Some(
                row_to_group(&row).map_err(query_err("find_group decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_groups(&self, owner_key: &str) -> Result<Vec<Group>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {GROUP_COLUMNS} FROM groups
                     WHERE owner_key = ?1 ORDER BY created_at ASC"
                ),
                params![owner_key],
            )
            .await
            .map_err(query_err("list_groups"))?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_groups row"))? {
            groups.push(row_to_group(&row).map_err(query_err("list_groups decode"))?);
        }
        Ok(groups)
    }

    async fn add_member(&self, group_id: Uuid, contact_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO group_members (group_id, contact_id) VALUES (?1, ?2)",
                params![group_id.to_string(), contact_id.to_string()],
            )
            .await
            .map_err(query_err("add_member"))?;
        Ok(())
    }

    async fn list_members(&self, group_id: Uuid) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT c.id, c.phone, c.name, c.created_at
                 FROM group_members gm JOIN contacts c ON c.id = gm.contact_id
                 WHERE gm.group_id = ?1 ORDER BY c.created_at ASC",
                params![group_id.to_string()],
            )
            .await
            .map_err(query_err("list_members"))?;
        let mut members = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_members row"))? {
            members.push(row_to_contact(&row).map_err(query_err("list_members decode"))?);
        }
        Ok(members)
    }

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO events ({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    event.id.to_string(),
                    event.owner_key.as_str(),
                    event.group_id.to_string(),
                    event.title.as_str(),
                    event.date.as_str(),
                    event.start_time.as_str(),
                    opt_text_owned(event.end_time.clone()),
                    opt_text_owned(event.location.clone()),
                    opt_text_owned(event.notes.clone()),
                    event.status.to_string(),
                    event.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_event"))?;
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_event"))?;
        match rows.next().await.map_err(query_err("get_event row"))? {
            Some(row) => Ok(Some(
                row_to_event(&row).map_err(query_err("get_event decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn update_event_status(
        &self,
        id: Uuid,
        status: EventStatus,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE events SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.to_string()],
            )
            .await
            .map_err(query_err("update_event_status"))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "event".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn latest_event_for_group(
        &self,
        group_id: Uuid,
    ) -> Result<Option<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE group_id = ?1 AND status = 'active'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![group_id.to_string()],
            )
            .await
            .map_err(query_err("latest_event_for_group"))?;
        match rows.next().await.map_err(query_err("latest_event row"))? {
            Some(row) => Ok(Some(
                row_to_event(&row).map_err(query_err("latest_event decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO invitations ({INVITATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    invitation.id.to_string(),
                    invitation.event_id.to_string(),
                    invitation.contact_id.to_string(),
                    invitation.phone.as_str(),
                    invitation.status.to_string(),
                    invitation.response.to_string(),
                    opt_datetime(&invitation.responded_at),
                    invitation.created_at.to_rfc3339(),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Constraint(
                "invitation already exists for this contact".into(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("insert_invitation: {e}"))),
        }
    }

    async fn update_invitation_status(
        &self,
        id: Uuid,
        status: InvitationStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE invitations SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.to_string()],
            )
            .await
            .map_err(query_err("update_invitation_status"))?;
        Ok(())
    }

    async fn record_rsvp(&self, id: Uuid, response: Rsvp) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE invitations
                 SET response = ?2, status = 'responded', responded_at = ?3
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    response.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("record_rsvp"))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "invitation".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn latest_invitation_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<(Invitation, Event)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT i.id, i.event_id, i.contact_id, i.phone, i.status, i.response,
                        i.responded_at, i.created_at,
                        e.id, e.owner_key, e.group_id, e.title, e.date, e.start_time,
                        e.end_time, e.location, e.notes, e.status, e.created_at
                 FROM invitations i JOIN events e ON e.id = i.event_id
                 WHERE i.phone = ?1 AND e.status = 'active'
                 ORDER BY i.created_at DESC LIMIT 1",
                params![phone],
            )
            .await
            .map_err(query_err("latest_invitation_for_phone"))?;
        let row = match rows.next().await.map_err(query_err("latest_invitation row"))? {
            Some(row) => row,
            None => return Ok(None),
        };

        let invitation = row_to_invitation(&row).map_err(query_err("latest_invitation decode"))?;

        // Event columns start at offset 8.
        let event_id: String = row.get(8).map_err(query_err("latest_invitation event id"))?;
        let owner_key: String = row.get(9).map_err(query_err("latest_invitation owner"))?;
        let group_id: String = row.get(10).map_err(query_err("latest_invitation group"))?;
        let title: String = row.get(11).map_err(query_err("latest_invitation title"))?;
        let date: String = row.get(12).map_err(query_err("latest_invitation date"))?;
        let start_time: String = row.get(13).map_err(query_err("latest_invitation time"))?;
        let end_time: Option<String> = row.get(14).ok();
        let location: Option<String> = row.get(15).ok();
        let notes: Option<String> = row.get(16).ok();
        let status: String = row.get(17).map_err(query_err("latest_invitation status"))?;
        let created_at: String = row.get(18).map_err(query_err("latest_invitation created"))?;

        let event = Event {
            id: parse_uuid(&event_id),
            owner_key,
            group_id: parse_uuid(&group_id),
            title,
            date,
            start_time,
            end_time,
            location,
            notes,
            status: status.parse().unwrap_or(EventStatus::Active),
            created_at: parse_datetime(&created_at),
        };
        Ok(Some((invitation, event)))
    }

    async fn list_invitations(&self, event_id: Uuid) -> Result<Vec<Invitation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INVITATION_COLUMNS} FROM invitations
                     WHERE event_id = ?1 ORDER BY created_at ASC"
                ),
                params![event_id.to_string()],
            )
            .await
            .map_err(query_err("list_invitations"))?;
        let mut invitations = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_invitations row"))? {
            invitations.push(
                row_to_invitation(&row).map_err(query_err("list_invitations decode"))?,
            );
        }
        Ok(invitations)
    }

    async fn insert_poll(
        &self,
        poll: &SchedulingPoll,
        options: &[PollOption],
        recipients: &[PollRecipient],
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("insert_poll begin"))?;

        tx.execute(
            &format!(
                "INSERT INTO polls ({POLL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                poll.id.to_string(),
                poll.owner_key.as_str(),
                poll.group_id.to_string(),
                poll.event_name.as_str(),
                poll.status.to_string(),
                poll.created_at.to_rfc3339(),
                opt_datetime(&poll.paused_at),
                opt_datetime(&poll.stopped_at),
            ],
        )
        .await
        .map_err(query_err("insert_poll"))?;

        for option in options {
            tx.execute(
                "INSERT INTO poll_options (id, poll_id, idx, label, starts_at, ends_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    option.id.to_string(),
                    option.poll_id.to_string(),
                    option.idx as i64,
                    option.label.as_str(),
                    option.starts_at.to_rfc3339(),
                    option.ends_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_poll option"))?;
        }

        for recipient in recipients {
            tx.execute(
                "INSERT INTO poll_recipients (poll_id, phone, name, responded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    recipient.poll_id.to_string(),
                    recipient.phone.as_str(),
                    recipient.name.as_str(),
                    opt_datetime(&recipient.responded_at),
                ],
            )
            .await
            .map_err(query_err("insert_poll recipient"))?;
        }

        tx.commit().await.map_err(query_err("insert_poll commit"))
    }

    async fn get_poll(&self, id: Uuid) -> Result<Option<SchedulingPoll>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_poll"))?;
        match rows.next().await.map_err(query_err("get_poll row"))? {
            Some(row) => Ok(Some(
                row_to_poll(&row).map_err(query_err("get_poll decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn poll_options(&self, poll_id: Uuid) -> Result<Vec<PollOption>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, poll_id, idx, label, starts_at, ends_at FROM poll_options
                 WHERE poll_id = ?1 ORDER BY idx ASC",
                params![poll_id.to_string()],
            )
            .await
            .map_err(query_err("poll_options"))?;
        let mut options = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("poll_options row"))? {
            options.push(row_to_poll_option(&row).map_err(query_err("poll_options decode"))?);
        }
        Ok(options)
    }

    async fn poll_recipients(&self, poll_id: Uuid) -> Result<Vec<PollRecipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT poll_id, phone, name, responded_at FROM poll_recipients
                 WHERE poll_id = ?1 ORDER BY phone ASC",
                params![poll_id.to_string()],
            )
            .await
            .map_err(query_err("poll_recipients"))?;
        let mut recipients = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("poll_recipients row"))? {
            recipients.push(row_to_recipient(&row).map_err(query_err("poll_recipients decode"))?);
        }
        Ok(recipients)
    }

    async fn transition_poll(
        &self,
        id: Uuid,
        from: PollStatus,
        to: PollStatus,
    ) -> Result<bool, DatabaseError> {
        // Only the matching transition stamps its timestamp column;
        // resuming clears paused_at.
        let sql = match to {
            PollStatus::Running => {
                "UPDATE polls SET status = ?2, paused_at = NULL
                 WHERE id = ?1 AND status = ?3"
            }
            PollStatus::Paused => {
                "UPDATE polls SET status = ?2, paused_at = datetime('now')
                 WHERE id = ?1 AND status = ?3"
            }
            PollStatus::Stopped => {
                "UPDATE polls SET status = ?2, stopped_at = datetime('now')
                 WHERE id = ?1 AND status = ?3"
            }
        };
        let changed = self
            .conn()
            .execute(
                sql,
                params![id.to_string(), to.to_string(), from.to_string()],
            )
            .await
            .map_err(query_err("transition_poll"))?;
        Ok(changed > 0)
    }

    async fn find_poll_for_owner(
        &self,
        owner_key: &str,
        statuses: &[PollStatus],
    ) -> Result<Option<SchedulingPoll>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(None);
        }
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {POLL_COLUMNS} FROM polls
             WHERE owner_key = ?1 AND status IN ({placeholders})
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut values: Vec<libsql::Value> = vec![libsql::Value::Text(owner_key.to_string())];
        values.extend(
            statuses
                .iter()
                .map(|s| libsql::Value::Text(s.to_string())),
        );
        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(query_err("find_poll_for_owner"))?;
        match rows.next().await.map_err(query_err("find_poll row"))? {
            Some(row) => Ok(Some(
                row_to_poll(&row).map_err(query_err("find_poll decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn find_running_poll_for_phone(
        &self,
        phone: &str,
    ) -> Result<Option<SchedulingPoll>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT p.id, p.owner_key, p.group_id, p.event_name, p.status,
                        p.created_at, p.paused_at, p.stopped_at
                 FROM polls p JOIN poll_recipients r ON r.poll_id = p.id
                 WHERE r.phone = ?1 AND p.status = 'running'
                 ORDER BY p.created_at DESC LIMIT 1",
                params![phone],
            )
            .await
            .map_err(query_err("find_running_poll_for_phone"))?;
        match rows.next().await.map_err(query_err("find_running_poll row"))? {
            Some(row) => Ok(Some(
                row_to_poll(&row).map_err(query_err("find_running_poll decode"))?,
            )),
            None => Ok(None),
        }
    }

    async fn record_poll_response(
        &self,
        poll_id: Uuid,
        phone: &str,
        option_idxs: &[u32],
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("record_poll_response begin"))?;

        // Overwrite semantics: drop any earlier answer first.
        tx.execute(
            "DELETE FROM poll_responses WHERE poll_id = ?1 AND phone = ?2",
            params![poll_id.to_string(), phone],
        )
        .await
        .map_err(query_err("record_poll_response clear"))?;

        if option_idxs.is_empty() {
            // "None work" is stored as idx -1 so it participates in the
            // composite primary key.
            tx.execute(
                "INSERT INTO poll_responses (poll_id, phone, option_idx) VALUES (?1, ?2, -1)",
                params![poll_id.to_string(), phone],
            )
            .await
            .map_err(query_err("record_poll_response none"))?;
        } else {
            for idx in option_idxs {
                tx.execute(
                    "INSERT OR IGNORE INTO poll_responses (poll_id, phone, option_idx)
                     VALUES (?1, ?2, ?3)",
                    params![poll_id.to_string(), phone, *idx as i64],
                )
                .await
                .map_err(query_err("record_poll_response insert"))?;
            }
        }

        tx.execute(
            "UPDATE poll_recipients SET responded_at = ?3 WHERE poll_id = ?1 AND phone = ?2",
            params![poll_id.to_string(), phone, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(query_err("record_poll_response recipient"))?;

        tx.commit()
            .await
            .map_err(query_err("record_poll_response commit"))
    }

    async fn poll_stats(&self, poll_id: Uuid) -> Result<ResponseStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                     (SELECT COUNT(*) FROM poll_recipients WHERE poll_id = ?1),
                     (SELECT COUNT(*) FROM poll_recipients
                        WHERE poll_id = ?1 AND responded_at IS NOT NULL),
                     (SELECT COUNT(*) FROM poll_responses
                        WHERE poll_id = ?1 AND option_idx = -1)",
                params![poll_id.to_string()],
            )
            .await
            .map_err(query_err("poll_stats"))?;
        let row = rows
            .next()
            .await
            .map_err(query_err("poll_stats row"))?
            .ok_or_else(|| DatabaseError::Query("poll_stats returned no row".into()))?;
        let total: i64 = row.get(0).map_err(query_err("poll_stats total"))?;
        let responded: i64 = row.get(1).map_err(query_err("poll_stats responded"))?;
        let none_work: i64 = row.get(2).map_err(query_err("poll_stats none"))?;

        let option_count = self.poll_options(poll_id).await?.len();
        let mut per_option = vec![0u32; option_count];
        let mut rows = self
            .conn()
            .query(
                "SELECT option_idx, COUNT(*) FROM poll_responses
                 WHERE poll_id = ?1 AND option_idx >= 0 GROUP BY option_idx",
                params![poll_id.to_string()],
            )
            .await
            .map_err(query_err("poll_stats per option"))?;
        while let Some(row) = rows.next().await.map_err(query_err("poll_stats option row"))? {
            let idx: i64 = row.get(0).map_err(query_err("poll_stats idx"))?;
            let count: i64 = row.get(1).map_err(query_err("poll_stats count"))?;
            if let Some(slot) = per_option.get_mut(idx as usize) {
                *slot = count as u32;
            }
        }

        Ok(ResponseStats {
            total: total as u32,
            responded: responded as u32,
            per_option,
            none_work: none_work as u32,
        })
    }

    async fn non_responders(&self, poll_id: Uuid) -> Result<Vec<PollRecipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT poll_id, phone, name, responded_at FROM poll_recipients
                 WHERE poll_id = ?1 AND responded_at IS NULL ORDER BY phone ASC",
                params![poll_id.to_string()],
            )
            .await
            .map_err(query_err("non_responders"))?;
        let mut recipients = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("non_responders row"))? {
            recipients.push(row_to_recipient(&row).map_err(query_err("non_responders decode"))?);
        }
        Ok(recipients)
    }

    async fn enqueue_job(
        &self,
        poll_id: Uuid,
        kind: JobKind,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let id = Uuid::new_v4();
        let result = self
            .conn()
            .execute(
                "INSERT INTO job_queue (id, poll_id, kind, scheduled_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![
                    id.to_string(),
                    poll_id.to_string(),
                    kind.to_string(),
                    scheduled_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(Some(id)),
            // Pending (poll, kind) already queued — the partial unique
            // index is the duplicate gate, not application logic.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("enqueue_job: {e}"))),
        }
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeferredJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job_queue
                     WHERE status = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err("due_jobs"))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("due_jobs row"))? {
            jobs.push(row_to_job(&row).map_err(query_err("due_jobs decode"))?);
        }
        Ok(jobs)
    }

    async fn claim_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE job_queue SET status = 'processing'
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("claim_job"))?;
        Ok(changed > 0)
    }

    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE job_queue SET status = ?2, processed_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("finish_job"))?;
        Ok(())
    }
}
