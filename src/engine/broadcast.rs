//! Targeted broadcast — message a group, optionally filtered by RSVP.
//!
//! Audience "everyone" goes to all members; "in"/"out"/"no reply" filter
//! against the group's most recent active event invitations.

use tracing::info;

use crate::engine::slots::{SlotId, SlotValues};
use crate::engine::{members::resolve_group, optional_value, Advance, FlowCtx, OutboundSend};
use crate::error::EngineError;
use crate::store::model::Rsvp;

/// Audience filter over group members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    Everyone,
    Responded(Rsvp),
}

fn parse_audience(value: Option<&str>) -> Audience {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "in" || v == "going" => Audience::Responded(Rsvp::In),
        Some(v) if v == "out" || v == "not going" => Audience::Responded(Rsvp::Out),
        Some(v) if v == "maybe" => Audience::Responded(Rsvp::Maybe),
        Some(v) if v.contains("no reply") || v == "no_response" || v.contains("haven't") => {
            Audience::Responded(Rsvp::NoResponse)
        }
        _ => Audience::Everyone,
    }
}

fn audience_label(audience: Audience) -> &'static str {
    match audience {
        Audience::Everyone => "everyone",
        Audience::Responded(Rsvp::In) => "everyone who's in",
        Audience::Responded(Rsvp::Out) => "everyone who's out",
        Audience::Responded(Rsvp::Maybe) => "the maybes",
        Audience::Responded(Rsvp::NoResponse) => "everyone who hasn't replied",
    }
}

/// Confirmation summary shown before sending.
pub fn summary(slots: &SlotValues) -> String {
    let group = slots.group.as_deref().unwrap_or("(no group)");
    let message = slots.message.as_deref().unwrap_or("");
    let audience = parse_audience(optional_value(&slots.audience));
    format!(
        "To {} in \"{group}\":\n\"{message}\"\nSend it? (yes/no)",
        audience_label(audience)
    )
}

pub async fn complete(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let group = resolve_group(ctx).await?;
    let message = ctx
        .slots
        .message
        .clone()
        .ok_or_else(|| EngineError::InvalidSlot {
            slot: SlotId::Message.label().into(),
            message: "missing at terminal step".into(),
        })?;
    let audience = parse_audience(optional_value(&ctx.slots.audience));

    let members = ctx.db.list_members(group.id).await?;
    if members.is_empty() {
        return Err(EngineError::Recoverable(format!(
            "\"{}\" has no members yet. Say \"add members\" first.",
            group.name
        )));
    }

    let recipients: Vec<String> = match audience {
        Audience::Everyone => members.iter().map(|m| m.phone.clone()).collect(),
        Audience::Responded(wanted) => {
            let Some(event) = ctx.db.latest_event_for_group(group.id).await? else {
                return Err(EngineError::Recoverable(format!(
                    "There's no event invite for \"{}\" yet, so I can't filter by RSVP. Say \"everyone\" to message the whole group.",
                    group.name
                )));
            };
            ctx.db
                .list_invitations(event.id)
                .await?
                .into_iter()
                .filter(|inv| inv.response == wanted)
                .map(|inv| inv.phone)
                .collect()
        }
    };

    if recipients.is_empty() {
        return Err(EngineError::Recoverable(format!(
            "Nobody matches \"{}\" right now.",
            audience_label(audience)
        )));
    }

    let sends: Vec<OutboundSend> = recipients
        .into_iter()
        .map(|to| OutboundSend {
            to,
            body: message.clone(),
        })
        .collect();
    info!(
        user_key = %ctx.state.user_key,
        group = %group.name,
        recipients = sends.len(),
        "Broadcast queued"
    );

    ctx.state.push_snapshot(
        "broadcast",
        ctx.input,
        Some(format!("broadcast_sent:{}", sends.len())),
        SlotValues::default(),
    );
    ctx.state.reset_flow();

    Ok(Advance::with_sends(
        format!(
            "Sent to {} {}.",
            sends.len(),
            if sends.len() == 1 { "person" } else { "people" }
        ),
        sends,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::conversation::model::ConversationState;
    use crate::store::model::{
        Event, EventStatus, Group, Invitation, InvitationStatus,
    };
    use crate::store::{Database, LibSqlBackend};
    use chrono::Utc;
    use uuid::Uuid;

    async fn seeded_with_event() -> (LibSqlBackend, Group) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let group = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "Tennis".into(),
            invite_code: "abc123".into(),
            created_at: Utc::now(),
        };
        db.insert_group(&group).await.unwrap();

        let event = Event {
            id: Uuid::new_v4(),
            owner_key: group.owner_key.clone(),
            group_id: group.id,
            title: "Game Night".into(),
            date: "Friday".into(),
            start_time: "7pm".into(),
            end_time: None,
            location: None,
            notes: None,
            status: EventStatus::Active,
            created_at: Utc::now(),
        };
        db.insert_event(&event).await.unwrap();

        for (name, phone, rsvp) in [
            ("Ana", "+15551110001", Rsvp::In),
            ("Lee", "+15551110002", Rsvp::Out),
            ("Sam", "+15551110003", Rsvp::NoResponse),
        ] {
            let c = db.upsert_contact(phone, name).await.unwrap();
            db.add_member(group.id, c.id).await.unwrap();
            let inv = Invitation {
                id: Uuid::new_v4(),
                event_id: event.id,
                contact_id: c.id,
                phone: phone.into(),
                status: InvitationStatus::Sent,
                response: Rsvp::NoResponse,
                responded_at: None,
                created_at: Utc::now(),
            };
            db.insert_invitation(&inv).await.unwrap();
            if rsvp != Rsvp::NoResponse {
                db.record_rsvp(inv.id, rsvp).await.unwrap();
            }
        }
        (db, group)
    }

    fn ctx_slots(audience: Option<&str>) -> SlotValues {
        SlotValues {
            group: Some("Tennis".into()),
            message: Some("Bring water".into()),
            audience: audience.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn everyone_reaches_all_members() {
        let (db, _group) = seeded_with_event().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: ctx_slots(None),
            input: "yes",
            jobs: &jobs,
        };
        let out = complete(&mut ctx).await.unwrap();
        assert_eq!(out.sends.len(), 3);
        assert!(out.sends.iter().all(|s| s.body == "Bring water"));
    }

    #[tokio::test]
    async fn rsvp_filter_narrows_recipients() {
        let (db, _group) = seeded_with_event().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: ctx_slots(Some("in")),
            input: "yes",
            jobs: &jobs,
        };
        let out = complete(&mut ctx).await.unwrap();
        assert_eq!(out.sends.len(), 1);
        assert_eq!(out.sends[0].to, "+15551110001");
    }

    #[tokio::test]
    async fn empty_audience_is_recoverable() {
        let (db, _group) = seeded_with_event().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: ctx_slots(Some("maybe")),
            input: "yes",
            jobs: &jobs,
        };
        let err = complete(&mut ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Recoverable(_)));
    }

    #[test]
    fn summary_names_audience() {
        let text = summary(&ctx_slots(Some("no reply yet")));
        assert!(text.contains("hasn't replied"));
        assert!(text.contains("Bring water"));
    }
}
