//! Workflow engine — the slot-filling state machine.
//!
//! Every inbound message advances at most one workflow by one step. The
//! generic loop here merges newly extracted slots, asks for the first
//! still-missing one in the fixed prompt order, and hands complete slot
//! sets to the per-workflow terminal actions. Entity writes happen inside
//! the terminal action; outbound sends are returned as data and fired only
//! after the state-clearing write has been persisted, so a crash or replay
//! in between is recoverable, never duplicating rows.

pub mod confirm;
pub mod slots;

pub mod broadcast;
pub mod event;
pub mod group;
pub mod members;
pub mod poll;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::conversation::model::{ConversationState, WaitingFor};
use crate::engine::confirm::{ConfirmReply, parse_selection};
use crate::engine::slots::{SlotId, SlotValues, WorkflowKind, WorkflowSpec, PROMPT_ORDER};
use crate::error::EngineError;
use crate::store::Database;

/// One outbound message to deliver after state is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSend {
    pub to: String,
    pub body: String,
}

/// Result of advancing a workflow one step.
#[derive(Debug, Clone)]
pub struct Advance {
    /// Reply to the sender of the inbound message.
    pub reply: String,
    /// Fire-and-forget sends to third parties (members, invitees).
    pub sends: Vec<OutboundSend>,
}

impl Advance {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            sends: Vec::new(),
        }
    }

    pub fn with_sends(text: impl Into<String>, sends: Vec<OutboundSend>) -> Self {
        Self {
            reply: text.into(),
            sends,
        }
    }
}

/// Everything a terminal action needs.
pub struct FlowCtx<'a> {
    pub db: &'a dyn Database,
    pub state: &'a mut ConversationState,
    pub slots: SlotValues,
    pub input: &'a str,
    pub jobs: &'a SchedulerConfig,
}

/// The slot-filling engine.
pub struct Engine {
    db: Arc<dyn Database>,
    jobs: SchedulerConfig,
}

impl Engine {
    pub fn new(db: Arc<dyn Database>, jobs: SchedulerConfig) -> Self {
        Self { db, jobs }
    }

    /// Start (or restart) a workflow. An explicit command always wins over
    /// whatever was pending, so accumulated slots from a previous flow are
    /// abandoned here.
    pub async fn start(
        &self,
        state: &mut ConversationState,
        kind: WorkflowKind,
        extracted: &SlotValues,
        input: &str,
    ) -> Result<Advance, EngineError> {
        let spec = WorkflowSpec::for_kind(kind);
        state.reset_flow();
        state.enter_workflow(kind, spec.collecting);
        state.touch(kind.label());
        info!(user_key = %state.user_key, workflow = %kind, "Workflow started");

        let mut merged = SlotValues::default();
        merged.merge(extracted);
        self.advance(state, kind, merged, input).await
    }

    /// Continue the workflow in flight with a new utterance. Extracted
    /// slots merge in; with nothing extracted the raw text answers the
    /// slot currently being prompted.
    pub async fn continue_collecting(
        &self,
        state: &mut ConversationState,
        extracted: &SlotValues,
        input: &str,
    ) -> Result<Advance, EngineError> {
        let kind = state
            .current_state
            .workflow()
            .ok_or(EngineError::NoActiveWorkflow)?;
        let spec = WorkflowSpec::for_kind(kind);

        let mut merged = state.accumulated_slots();
        merged.merge(extracted);

        if kind == WorkflowKind::AddMembers && merged.is_set(SlotId::Group) {
            let mut ctx = self.ctx(state, merged, input);
            return members::ingest(&mut ctx).await;
        }

        if extracted.is_empty() {
            if let Some(slot) = next_missing(spec, &merged) {
                merged.set_text(slot, input);
            }
        }
        self.advance(state, kind, merged, input).await
    }

    /// Core loop: prompt for the first missing slot, or move to the
    /// terminal step when the set is complete.
    async fn advance(
        &self,
        state: &mut ConversationState,
        kind: WorkflowKind,
        mut slots: SlotValues,
        input: &str,
    ) -> Result<Advance, EngineError> {
        let spec = WorkflowSpec::for_kind(kind);

        // Group target resolution: zero groups is recoverable, one is
        // auto-selected, several become a numbered pick.
        if needs_slot(spec, &slots, SlotId::Group) {
            let groups = self.db.list_groups(&state.user_key).await?;
            match groups.len() {
                0 => {
                    return Err(EngineError::Recoverable(
                        "You don't have any groups yet. Say \"create group <name>\" to make one."
                            .into(),
                    ));
                }
                1 => slots.group = Some(groups[0].name.clone()),
                _ => {
                    let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
                    let menu = numbered_list(&names);
                    slots.choices = Some(names);
                    state.push_snapshot(kind.label(), input, None, slots);
                    state.waiting_for = Some(WaitingFor::GroupSelection);
                    return Ok(Advance::reply(format!("Which group?\n{menu}")));
                }
            }
        }

        if kind == WorkflowKind::AddMembers {
            let mut ctx = self.ctx(state, slots, input);
            return members::ingest(&mut ctx).await;
        }

        if let Some(slot) = next_missing(spec, &slots) {
            debug!(workflow = %kind, slot = slot.label(), "Prompting for slot");
            state.push_snapshot(kind.label(), input, None, slots);
            state.waiting_for = Some(spec.collecting);
            return Ok(Advance::reply(slot.prompt()));
        }

        match spec.confirmation {
            Some(tag) => {
                let summary = render_summary(kind, &slots);
                state.push_snapshot(kind.label(), input, None, slots);
                state.enter_confirmation(kind, tag);
                Ok(Advance::reply(summary))
            }
            None => {
                let mut ctx = self.ctx(state, slots, input);
                self.complete(kind, &mut ctx).await
            }
        }
    }

    /// Interpret a reply while `waiting_for` is a confirmation tag —
    /// strictly yes/no/unclear.
    pub async fn handle_confirmation(
        &self,
        state: &mut ConversationState,
        input: &str,
    ) -> Result<Advance, EngineError> {
        let tag = state.waiting_for.ok_or(EngineError::NoActiveWorkflow)?;

        if tag == WaitingFor::PollStopConfirmation {
            let mut ctx = self.ctx(state, SlotValues::default(), input);
            return poll::confirm_stop(&mut ctx).await;
        }

        let kind = state
            .current_state
            .workflow()
            .ok_or(EngineError::NoActiveWorkflow)?;
        let slots = state.accumulated_slots();

        match ConfirmReply::parse(input) {
            ConfirmReply::Yes => {
                let mut ctx = self.ctx(state, slots, input);
                self.complete(kind, &mut ctx).await
            }
            ConfirmReply::No => {
                state.push_snapshot(kind.label(), input, Some("cancelled".into()), SlotValues::default());
                state.reset_flow();
                info!(user_key = %state.user_key, workflow = %kind, "Workflow cancelled");
                Ok(Advance::reply("Okay, cancelled. Nothing was sent."))
            }
            ConfirmReply::Unclear => {
                // Re-prompt without losing anything.
                let summary = render_summary(kind, &slots);
                Ok(Advance::reply(format!(
                    "Sorry, I need a yes or no.\n\n{summary}"
                )))
            }
        }
    }

    /// Interpret a reply while `waiting_for` is a numbered-selection tag.
    pub async fn handle_selection(
        &self,
        state: &mut ConversationState,
        input: &str,
    ) -> Result<Advance, EngineError> {
        let tag = state.waiting_for.ok_or(EngineError::NoActiveWorkflow)?;

        if tag == WaitingFor::PollPausedMenu {
            let mut ctx = self.ctx(state, SlotValues::default(), input);
            return poll::paused_menu_reply(&mut ctx).await;
        }

        // Group selection.
        let kind = state
            .current_state
            .workflow()
            .ok_or(EngineError::NoActiveWorkflow)?;
        let mut slots = state.accumulated_slots();
        let choices = slots.choices.take().unwrap_or_default();

        match parse_selection(input, choices.len()) {
            Some(idx) => {
                slots.group = Some(choices[idx].clone());
                state.waiting_for = Some(WorkflowSpec::for_kind(kind).collecting);
                self.advance(state, kind, slots, input).await
            }
            None => {
                let menu = numbered_list(&choices);
                slots.choices = Some(choices);
                state.push_snapshot(kind.label(), input, None, slots);
                Ok(Advance::reply(format!(
                    "Please reply with a number from the list.\n{menu}"
                )))
            }
        }
    }

    /// Commands that are not slot-filling workflows.
    pub async fn handle_command(
        &self,
        state: &mut ConversationState,
        action: crate::classifier::Action,
        extracted: &SlotValues,
        input: &str,
    ) -> Result<Advance, EngineError> {
        use crate::classifier::Action;

        if let Some(kind) = action.workflow() {
            return self.start(state, kind, extracted, input).await;
        }

        state.touch(action.label());
        match action {
            Action::CheckPoll => {
                let mut ctx = self.ctx(state, SlotValues::default(), input);
                poll::check(&mut ctx).await
            }
            Action::StopPoll => {
                let mut ctx = self.ctx(state, SlotValues::default(), input);
                poll::request_stop(&mut ctx).await
            }
            Action::ListGroups => {
                let groups = self.db.list_groups(&state.user_key).await?;
                if groups.is_empty() {
                    return Ok(Advance::reply(
                        "No groups yet. Say \"create group <name>\" to make one.",
                    ));
                }
                let mut lines = vec!["Your groups:".to_string()];
                for g in &groups {
                    lines.push(format!("- {} (invite code {})", g.name, g.invite_code));
                }
                Ok(Advance::reply(lines.join("\n")))
            }
            Action::Help | Action::Chat => Ok(Advance::reply(help_text())),
            _ => Ok(Advance::reply(help_text())),
        }
    }

    async fn complete(
        &self,
        kind: WorkflowKind,
        ctx: &mut FlowCtx<'_>,
    ) -> Result<Advance, EngineError> {
        match kind {
            WorkflowKind::CreateGroup => group::complete(ctx).await,
            WorkflowKind::AddMembers => members::ingest(ctx).await,
            WorkflowKind::CreateEvent => event::complete(ctx).await,
            WorkflowKind::CreatePoll => poll::complete(ctx).await,
            WorkflowKind::Broadcast => broadcast::complete(ctx).await,
        }
    }

    fn ctx<'a>(
        &'a self,
        state: &'a mut ConversationState,
        slots: SlotValues,
        input: &'a str,
    ) -> FlowCtx<'a> {
        FlowCtx {
            db: self.db.as_ref(),
            state,
            slots,
            input,
            jobs: &self.jobs,
        }
    }
}

/// First slot still to collect: required first, then optional, both in the
/// fixed prompt order. Optional slots answered "skip" count as collected.
fn next_missing(spec: &WorkflowSpec, slots: &SlotValues) -> Option<SlotId> {
    PROMPT_ORDER
        .iter()
        .copied()
        .find(|slot| {
            (spec.required.contains(slot) || spec.optional.contains(slot)) && !slots.is_set(*slot)
        })
}

fn needs_slot(spec: &WorkflowSpec, slots: &SlotValues, slot: SlotId) -> bool {
    (spec.required.contains(&slot) || spec.optional.contains(&slot)) && !slots.is_set(slot)
}

/// An optional slot's value, with skip markers filtered out.
pub(crate) fn optional_value(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !matches!(v.to_lowercase().as_str(), "skip" | "none" | "no"))
}

/// Render the 1-based numbered list used by selection prompts.
pub(crate) fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Confirmation summary for a complete slot set.
fn render_summary(kind: WorkflowKind, slots: &SlotValues) -> String {
    match kind {
        WorkflowKind::CreateEvent => event::summary(slots),
        WorkflowKind::CreatePoll => poll::summary(slots),
        WorkflowKind::Broadcast => broadcast::summary(slots),
        // Flows without a confirmation step never render one.
        WorkflowKind::CreateGroup | WorkflowKind::AddMembers => String::new(),
    }
}

/// General help, sent for explicit help requests and unplaceable input.
pub fn help_text() -> &'static str {
    "Here's what I can do:\n\
     - \"create group Tennis\" — start a group\n\
     - \"add members\" — add people to a group\n\
     - \"invite the group to dinner Friday 7pm\" — send an event invite\n\
     - \"poll the group for times\" — collect availability\n\
     - \"message the group\" — send a broadcast\n\
     - \"check poll\" / \"stop poll\" — manage a running poll"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::store::model::Group;
    use chrono::Utc;
    use uuid::Uuid;

    async fn engine() -> (Engine, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (Engine::new(db.clone(), SchedulerConfig::default()), db)
    }

    async fn seed_group(db: &dyn Database, owner: &str, name: &str) {
        db.insert_group(&Group {
            id: Uuid::new_v4(),
            owner_key: owner.into(),
            name: name.into(),
            invite_code: Uuid::new_v4().simple().to_string()[..6].to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn event_slots_converge_regardless_of_order() {
        let (engine, db) = engine().await;
        let owner = "+15550001111";
        seed_group(db.as_ref(), owner, "Tennis").await;

        // All at once.
        let mut all_at_once = ConversationState::new(owner);
        let extracted = SlotValues {
            name: Some("Game Night".into()),
            date: Some("Friday".into()),
            time: Some("7pm".into()),
            location: Some("Park".into()),
            ..Default::default()
        };
        let a = engine
            .start(
                &mut all_at_once,
                WorkflowKind::CreateEvent,
                &extracted,
                "game night friday 7pm at the park",
            )
            .await
            .unwrap();

        // One slot per message, different order.
        let mut sequential = ConversationState::new(owner);
        engine
            .start(
                &mut sequential,
                WorkflowKind::CreateEvent,
                &SlotValues {
                    time: Some("7pm".into()),
                    location: Some("Park".into()),
                    ..Default::default()
                },
                "7pm at the park",
            )
            .await
            .unwrap();
        engine
            .continue_collecting(&mut sequential, &SlotValues::default(), "Game Night")
            .await
            .unwrap();
        let b = engine
            .continue_collecting(&mut sequential, &SlotValues::default(), "Friday")
            .await
            .unwrap();

        // Same confirmation summary, skipping only the notes prompt answer.
        let b_final = if b.reply.contains("notes") {
            engine
                .continue_collecting(&mut sequential, &SlotValues::default(), "skip")
                .await
                .unwrap()
        } else {
            b
        };
        let a_final = if a.reply.contains("notes") {
            engine
                .continue_collecting(&mut all_at_once, &SlotValues::default(), "skip")
                .await
                .unwrap()
        } else {
            a
        };
        assert_eq!(a_final.reply, b_final.reply);
        for value in ["Game Night", "Friday", "7pm", "Park"] {
            assert!(a_final.reply.contains(value), "missing {value}");
        }
    }

    #[tokio::test]
    async fn midflow_message_fills_remaining_slots() {
        let (engine, db) = engine().await;
        let owner = "+15550002222";
        seed_group(db.as_ref(), owner, "Tennis").await;

        let mut state = ConversationState::new(owner);
        engine
            .start(
                &mut state,
                WorkflowKind::CreateEvent,
                &SlotValues {
                    name: Some("Game Night".into()),
                    date: Some("Friday".into()),
                    ..Default::default()
                },
                "game night friday",
            )
            .await
            .unwrap();

        let out = engine
            .continue_collecting(
                &mut state,
                &SlotValues {
                    time: Some("7pm".into()),
                    location: Some("Park".into()),
                    ..Default::default()
                },
                "7pm, Park",
            )
            .await
            .unwrap();
        // Not a re-request for name or date.
        for value in ["Game Night", "Friday", "7pm", "Park"] {
            assert!(out.reply.contains(value), "missing {value}");
        }
    }

    #[tokio::test]
    async fn zero_groups_is_recoverable() {
        let (engine, _db) = engine().await;
        let mut state = ConversationState::new("+15550003333");
        let err = engine
            .start(
                &mut state,
                WorkflowKind::CreateEvent,
                &SlotValues::default(),
                "plan something",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Recoverable(_)));
    }

    #[tokio::test]
    async fn multiple_groups_prompt_numbered_selection() {
        let (engine, db) = engine().await;
        let owner = "+15550004444";
        seed_group(db.as_ref(), owner, "Tennis").await;
        seed_group(db.as_ref(), owner, "Book Club").await;

        let mut state = ConversationState::new(owner);
        let out = engine
            .start(
                &mut state,
                WorkflowKind::Broadcast,
                &SlotValues {
                    message: Some("Rain check!".into()),
                    ..Default::default()
                },
                "tell everyone rain check",
            )
            .await
            .unwrap();
        assert!(out.reply.contains("1. Tennis"));
        assert!(out.reply.contains("2. Book Club"));
        assert_eq!(state.waiting_for, Some(WaitingFor::GroupSelection));

        // Out-of-range pick re-prompts, never a silent default.
        let out = engine.handle_selection(&mut state, "5").await.unwrap();
        assert!(out.reply.contains("number from the list"));
        assert_eq!(state.waiting_for, Some(WaitingFor::GroupSelection));

        let out = engine.handle_selection(&mut state, "2").await.unwrap();
        assert!(out.reply.contains("Book Club"));
    }

    #[tokio::test]
    async fn unclear_confirmation_keeps_state() {
        let (engine, db) = engine().await;
        let owner = "+15550005555";
        seed_group(db.as_ref(), owner, "Tennis").await;

        let mut state = ConversationState::new(owner);
        engine
            .start(
                &mut state,
                WorkflowKind::Broadcast,
                &SlotValues {
                    message: Some("Practice moved to 8".into()),
                    audience: Some("everyone".into()),
                    ..Default::default()
                },
                "tell the group practice moved",
            )
            .await
            .unwrap();
        assert_eq!(state.waiting_for, Some(WaitingFor::BroadcastConfirmation));

        let out = engine.handle_confirmation(&mut state, "hmm").await.unwrap();
        assert!(out.reply.contains("yes or no"));
        assert_eq!(state.waiting_for, Some(WaitingFor::BroadcastConfirmation));
        assert!(!state.accumulated_slots().is_empty());

        let out = engine.handle_confirmation(&mut state, "no").await.unwrap();
        assert!(out.reply.contains("cancelled"));
        assert!(state.waiting_for.is_none());
        assert!(state.accumulated_slots().is_empty());
    }
}
