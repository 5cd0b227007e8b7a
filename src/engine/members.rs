//! Member intake — a looping collection step rather than a one-shot
//! terminal action. Each message adds whoever it can parse; "done" ends
//! the loop. Re-adding an existing member is a no-op.

use tracing::debug;

use crate::conversation::model::WaitingFor;
use crate::engine::slots::{SlotId, SlotValues, WorkflowKind};
use crate::engine::{Advance, FlowCtx};
use crate::error::EngineError;
use crate::phone;
use crate::store::model::Group;

/// One parsed "Name 555-123-4567" entry.
#[derive(Debug, PartialEq)]
pub struct MemberEntry {
    pub name: String,
    pub phone: String,
}

/// Parse comma/newline-separated member entries. Returns the entries that
/// carried a usable phone and the chunks that did not.
pub fn parse_entries(text: &str) -> (Vec<MemberEntry>, Vec<String>) {
    let mut entries = Vec::new();
    let mut rejected = Vec::new();
    for chunk in text.split([',', ';', '\n']) {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let digits: String = chunk.chars().filter(|c| c.is_ascii_digit()).collect();
        match phone::normalize(&digits) {
            Some(normalized) => {
                let name: String = chunk
                    .chars()
                    .filter(|c| !c.is_ascii_digit() && !"()-+.".contains(*c))
                    .collect::<String>()
                    .trim()
                    .to_string();
                entries.push(MemberEntry {
                    name,
                    phone: normalized,
                });
            }
            None => rejected.push(chunk.to_string()),
        }
    }
    (entries, rejected)
}

/// Resolve the accumulated group slot to its row.
pub(crate) async fn resolve_group(ctx: &FlowCtx<'_>) -> Result<Group, EngineError> {
    let name = ctx
        .slots
        .group
        .as_deref()
        .ok_or_else(|| EngineError::InvalidSlot {
            slot: SlotId::Group.label().into(),
            message: "group missing at terminal step".into(),
        })?;
    ctx.db
        .find_group_by_name(&ctx.state.user_key, name)
        .await?
        .ok_or_else(|| {
            EngineError::Recoverable(format!(
                "I couldn't find a group called \"{name}\". Reply \"list groups\" to see yours."
            ))
        })
}

/// Ingest one member-entries message for the group in the accumulated slots.
pub async fn ingest(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let group = resolve_group(ctx).await?;

    let trimmed = ctx.input.trim().to_lowercase();
    if trimmed == "done" || trimmed == "that's it" || trimmed == "thats it" {
        let members = ctx.db.list_members(group.id).await?;
        ctx.state.push_snapshot(
            "add_members",
            ctx.input,
            Some(format!("members_done:{}", members.len())),
            SlotValues::default(),
        );
        ctx.state.reset_flow();
        return Ok(Advance::reply(format!(
            "\"{}\" now has {} member{}. You can invite them to an event, poll for times, or message them anytime.",
            group.name,
            members.len(),
            if members.len() == 1 { "" } else { "s" },
        )));
    }

    // Prefer what the classifier extracted; fall back to the raw text.
    let raw = ctx
        .slots
        .members
        .take()
        .unwrap_or_else(|| ctx.input.to_string());
    let (entries, rejected) = parse_entries(&raw);

    if entries.is_empty() {
        // Nothing usable — keep the step, keep the slots.
        let mut slots = ctx.slots.clone();
        slots.members = None;
        ctx.state.push_snapshot("add_members", ctx.input, None, slots);
        ctx.state.waiting_for = Some(WaitingFor::MemberEntries);
        if ctx.state.current_state.workflow() != Some(WorkflowKind::AddMembers) {
            ctx.state
                .enter_workflow(WorkflowKind::AddMembers, WaitingFor::MemberEntries);
        }
        return Ok(Advance::reply(SlotId::Members.prompt()));
    }

    let mut added = Vec::new();
    for entry in &entries {
        let contact = ctx.db.upsert_contact(&entry.phone, &entry.name).await?;
        ctx.db.add_member(group.id, contact.id).await?;
        added.push(if entry.name.is_empty() {
            entry.phone.clone()
        } else {
            entry.name.clone()
        });
    }
    debug!(group = %group.name, count = added.len(), "Members added");

    let mut slots = ctx.slots.clone();
    slots.members = None;
    ctx.state.push_snapshot(
        "add_members",
        ctx.input,
        Some(format!("members_added:{}", added.len())),
        slots,
    );
    if ctx.state.current_state.workflow() != Some(WorkflowKind::AddMembers) {
        ctx.state
            .enter_workflow(WorkflowKind::AddMembers, WaitingFor::MemberEntries);
    }
    ctx.state.waiting_for = Some(WaitingFor::MemberEntries);

    let mut reply = format!("Added {}.", added.join(", "));
    if !rejected.is_empty() {
        reply.push_str(&format!(
            " I couldn't read a number for: {}.",
            rejected.join(", ")
        ));
    }
    reply.push_str(" Anyone else? Reply \"done\" when finished.");
    Ok(Advance::reply(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::conversation::model::ConversationState;
    use crate::store::{Database, LibSqlBackend};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn parses_mixed_entries() {
        let (entries, rejected) =
            parse_entries("John 555-123-4567, Mary (555) 987-6543, Bob no number");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "John");
        assert_eq!(entries[0].phone, "+15551234567");
        assert_eq!(entries[1].name, "Mary");
        assert_eq!(rejected, vec!["Bob no number"]);
    }

    #[test]
    fn bare_number_gets_empty_name() {
        let (entries, _) = parse_entries("5551234567");
        assert_eq!(entries[0].name, "");
        assert_eq!(entries[0].phone, "+15551234567");
    }

    #[tokio::test]
    async fn ingest_adds_and_done_finishes() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_group(&Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "Tennis".into(),
            invite_code: "abc123".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let slots = SlotValues {
            group: Some("Tennis".into()),
            ..Default::default()
        };

        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: slots.clone(),
            input: "John 555-123-4567, Mary 555-987-6543",
            jobs: &jobs,
        };
        let out = ingest(&mut ctx).await.unwrap();
        assert!(out.reply.contains("John"));
        assert!(out.reply.contains("Mary"));
        assert_eq!(state.waiting_for, Some(WaitingFor::MemberEntries));

        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots,
            input: "done",
            jobs: &jobs,
        };
        let out = ingest(&mut ctx).await.unwrap();
        assert!(out.reply.contains("2 members"));
        assert!(state.waiting_for.is_none());
    }
}
