//! Conversation record lifecycle — load, expiry, versioned save.
//!
//! The manager is the only writer of `conversation_state`. Saves are
//! optimistic: the stored version must match what we loaded, otherwise a
//! concurrent handler for the same phone won the race and the caller
//! retries against the fresh record.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::conversation::model::ConversationState;
use crate::error::DatabaseError;
use crate::onboarding::OnboardingStep;
use crate::store::Database;

/// Records age out after a day of silence; an expired record reads as a
/// fresh idle one so a stale half-finished workflow never traps a user.
const RECORD_TTL_HOURS: i64 = 24;

/// Audit snapshots kept per record.
const MAX_SNAPSHOTS: usize = 30;

/// Versioned access to per-user conversation records.
pub struct ConversationManager {
    db: Arc<dyn Database>,
}

impl ConversationManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Load the record for a user key, creating an in-memory fresh one when
    /// none exists. An expired record is reset to idle (snapshots kept).
    pub async fn load(&self, user_key: &str) -> Result<ConversationState, DatabaseError> {
        let mut state = match self.db.get_conversation(user_key).await? {
            Some(state) => state,
            None => {
                debug!(user_key, "No conversation record, starting fresh");
                return Ok(ConversationState::new(user_key));
            }
        };
        if state.is_expired(Utc::now()) {
            debug!(user_key, "Conversation record expired, resetting to idle");
            state.reset_flow();
            state.expires_at = None;
        }
        Ok(state)
    }

    /// Persist the record. Insert on first save, versioned update after.
    /// A `Conflict` is returned untouched so the processor can re-run
    /// against the winner's record.
    pub async fn save(&self, state: &mut ConversationState) -> Result<(), DatabaseError> {
        if state.snapshots.len() > MAX_SNAPSHOTS {
            let excess = state.snapshots.len() - MAX_SNAPSHOTS;
            state.snapshots.drain(..excess);
        }
        state.expires_at = Some(Utc::now() + Duration::hours(RECORD_TTL_HOURS));
        // Onboarding records stay sticky until the name is captured.
        if matches!(state.onboarding_step, Some(step) if !step.is_terminal()) {
            state.expires_at = None;
        }

        if state.version == 0 {
            match self.db.insert_conversation(state).await {
                Ok(()) => {
                    state.version = 1;
                    Ok(())
                }
                Err(e @ DatabaseError::Conflict { .. }) => {
                    warn!(user_key = %state.user_key, "Lost insert race for conversation record");
                    Err(e)
                }
                Err(e) => Err(e),
            }
        } else {
            let expected = state.version;
            self.db.update_conversation(state, expected).await?;
            state.version = expected + 1;
            Ok(())
        }
    }

    /// Mark onboarding complete, used once the user's name is captured.
    pub fn complete_onboarding(state: &mut ConversationState) {
        state.onboarding_step = Some(OnboardingStep::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn manager() -> ConversationManager {
        let db = LibSqlBackend::new_memory().await.unwrap();
        ConversationManager::new(Arc::new(db))
    }

    #[tokio::test]
    async fn load_creates_fresh_record() {
        let mgr = manager().await;
        let state = mgr.load("+15550000001").await.unwrap();
        assert_eq!(state.version, 0);
        assert!(state.waiting_for.is_none());
    }

    #[tokio::test]
    async fn save_inserts_then_updates() {
        let mgr = manager().await;
        let mut state = mgr.load("+15550000002").await.unwrap();
        mgr.save(&mut state).await.unwrap();
        assert_eq!(state.version, 1);

        state.touch("create_group");
        mgr.save(&mut state).await.unwrap();
        assert_eq!(state.version, 2);

        let loaded = mgr.load("+15550000002").await.unwrap();
        assert_eq!(loaded.last_action.as_deref(), Some("create_group"));
    }

    #[tokio::test]
    async fn expired_record_loads_as_idle() {
        let mgr = manager().await;
        let mut state = mgr.load("+15550000003").await.unwrap();
        state.enter_workflow(
            crate::engine::slots::WorkflowKind::CreateGroup,
            crate::conversation::model::WaitingFor::GroupName,
        );
        mgr.save(&mut state).await.unwrap();

        // Force expiry in the past via a direct versioned write.
        state.expires_at = Some(Utc::now() - Duration::hours(1));
        let expected = state.version;
        mgr.db.update_conversation(&state, expected).await.unwrap();

        let loaded = mgr.load("+15550000003").await.unwrap();
        assert!(loaded.waiting_for.is_none());
    }

    #[tokio::test]
    async fn snapshots_are_capped() {
        let mgr = manager().await;
        let mut state = mgr.load("+15550000004").await.unwrap();
        for i in 0..(MAX_SNAPSHOTS + 10) {
            state.push_snapshot(&format!("step_{i}"), "hi", None, Default::default());
        }
        mgr.save(&mut state).await.unwrap();
        assert_eq!(state.snapshots.len(), MAX_SNAPSHOTS);
        // Oldest entries were dropped, newest kept.
        assert_eq!(state.snapshots.last().unwrap().step, "step_39");
    }
}
