//! Event creation + invitations — the terminal step of the invite workflow.
//!
//! The event row and one invitation per member are written first, then the
//! conversation is reset, and only then do the invite texts go out. A
//! terse "in"/"out"/"maybe" from an invitee later resolves through their
//! most recent invitation for an active event.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::engine::slots::{SlotId, SlotValues};
use crate::engine::{members::resolve_group, optional_value, Advance, FlowCtx, OutboundSend};
use crate::error::EngineError;
use crate::store::model::{Event, EventStatus, Invitation, InvitationStatus, Rsvp};
use crate::store::Database;

/// Confirmation summary shown before anything is sent.
pub fn summary(slots: &SlotValues) -> String {
    let name = slots.name.as_deref().unwrap_or("(untitled)");
    let date = slots.date.as_deref().unwrap_or("(no date)");
    let time = slots.time.as_deref().unwrap_or("(no time)");
    let mut lines = vec![
        "Here's the invite:".to_string(),
        format!("{name} — {date} at {time}"),
    ];
    if let Some(location) = optional_value(&slots.location) {
        lines.push(format!("Where: {location}"));
    }
    if let Some(notes) = optional_value(&slots.notes) {
        lines.push(format!("Notes: {notes}"));
    }
    lines.push("Send it? (yes/no)".to_string());
    lines.join("\n")
}

fn require(slot: SlotId, value: &Option<String>) -> Result<String, EngineError> {
    value.clone().ok_or_else(|| EngineError::InvalidSlot {
        slot: slot.label().into(),
        message: "missing at terminal step".into(),
    })
}

pub async fn complete(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let group = resolve_group(ctx).await?;
    let members = ctx.db.list_members(group.id).await?;
    if members.is_empty() {
        return Err(EngineError::Recoverable(format!(
            "\"{}\" has no members yet. Say \"add members\" first.",
            group.name
        )));
    }

    let title = require(SlotId::Name, &ctx.slots.name)?;
    let date = require(SlotId::Date, &ctx.slots.date)?;
    let time = require(SlotId::Time, &ctx.slots.time)?;

    let event = Event {
        id: Uuid::new_v4(),
        owner_key: ctx.state.user_key.clone(),
        group_id: group.id,
        title: title.clone(),
        date: date.clone(),
        start_time: time.clone(),
        end_time: None,
        location: optional_value(&ctx.slots.location).map(str::to_string),
        notes: optional_value(&ctx.slots.notes).map(str::to_string),
        status: EventStatus::Active,
        created_at: Utc::now(),
    };
    ctx.db.insert_event(&event).await?;

    let body = invite_body(&event);
    let mut sends = Vec::with_capacity(members.len());
    for member in &members {
        let invitation = Invitation {
            id: Uuid::new_v4(),
            event_id: event.id,
            contact_id: member.id,
            phone: member.phone.clone(),
            status: InvitationStatus::Sent,
            response: Rsvp::NoResponse,
            responded_at: None,
            created_at: Utc::now(),
        };
        ctx.db.insert_invitation(&invitation).await?;
        sends.push(OutboundSend {
            to: member.phone.clone(),
            body: body.clone(),
        });
    }
    info!(
        user_key = %ctx.state.user_key,
        event = %event.title,
        invitations = members.len(),
        "Event created"
    );

    ctx.state.push_snapshot(
        "create_event",
        ctx.input,
        Some(format!("event_created:{}", event.id)),
        SlotValues::default(),
    );
    ctx.state.reset_flow();

    Ok(Advance::with_sends(
        format!(
            "Invite sent to {} {} for \"{}\". I'll track who's in.",
            members.len(),
            if members.len() == 1 { "person" } else { "people" },
            event.title,
        ),
        sends,
    ))
}

fn invite_body(event: &Event) -> String {
    let mut body = format!(
        "You're invited: {} — {} at {}",
        event.title, event.date, event.start_time
    );
    if let Some(location) = &event.location {
        body.push_str(&format!(", {location}"));
    }
    if let Some(notes) = &event.notes {
        body.push_str(&format!(". {notes}"));
    }
    body.push_str(". Reply IN, OUT, or MAYBE.");
    body
}

/// Handle an invitee's RSVP reply, resolved through their most recent
/// invitation for an active event. Unparseable text re-prompts and tags
/// the invitee's record so the next terse reply lands here directly.
pub async fn record_rsvp_reply(
    db: &dyn Database,
    state: &mut crate::conversation::model::ConversationState,
    text: &str,
) -> Result<Option<Advance>, EngineError> {
    let Some((invitation, event)) = db.latest_invitation_for_phone(&state.user_key).await? else {
        return Ok(None);
    };
    match Rsvp::parse(text) {
        Some(rsvp) => {
            db.record_rsvp(invitation.id, rsvp).await?;
            state.waiting_for = None;
            state.touch("rsvp");
            let ack = match rsvp {
                Rsvp::In => format!("You're in for \"{}\"!", event.title),
                Rsvp::Out => format!("Got it, you're out for \"{}\".", event.title),
                Rsvp::Maybe => format!("Marked you as maybe for \"{}\".", event.title),
                Rsvp::NoResponse => format!("Noted for \"{}\".", event.title),
            };
            Ok(Some(Advance::reply(ack)))
        }
        None => {
            state.waiting_for = Some(crate::conversation::model::WaitingFor::RsvpReply);
            Ok(Some(Advance::reply(format!(
                "For \"{}\" — reply IN, OUT, or MAYBE.",
                event.title
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::conversation::model::ConversationState;
    use crate::store::model::Group;
    use crate::store::LibSqlBackend;

    async fn seeded() -> (LibSqlBackend, Group) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let group = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "Tennis".into(),
            invite_code: "abc123".into(),
            created_at: Utc::now(),
        };
        db.insert_group(&group).await.unwrap();
        for (name, phone) in [("Ana", "+15551110001"), ("Lee", "+15551110002")] {
            let c = db.upsert_contact(phone, name).await.unwrap();
            db.add_member(group.id, c.id).await.unwrap();
        }
        (db, group)
    }

    fn event_slots() -> SlotValues {
        SlotValues {
            group: Some("Tennis".into()),
            name: Some("Game Night".into()),
            date: Some("Friday".into()),
            time: Some("7pm".into()),
            location: Some("Park".into()),
            notes: Some("skip".into()),
            ..Default::default()
        }
    }

    #[test]
    fn summary_includes_all_supplied_values() {
        let text = summary(&event_slots());
        for value in ["Game Night", "Friday", "7pm", "Park"] {
            assert!(text.contains(value), "missing {value}");
        }
        // Skipped notes stay out of the summary.
        assert!(!text.contains("Notes"));
    }

    #[tokio::test]
    async fn complete_writes_event_invitations_and_sends() {
        let (db, group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: event_slots(),
            input: "yes",
            jobs: &jobs,
        };

        let out = complete(&mut ctx).await.unwrap();
        assert_eq!(out.sends.len(), 2);
        assert!(out.reply.contains("2 people"));
        assert!(state.waiting_for.is_none());

        let event = db.latest_event_for_group(group.id).await.unwrap().unwrap();
        assert_eq!(event.title, "Game Night");
        assert_eq!(event.location.as_deref(), Some("Park"));
        assert!(event.notes.is_none());
        assert_eq!(db.list_invitations(event.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rsvp_reply_records_and_acks() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: event_slots(),
            input: "yes",
            jobs: &jobs,
        };
        complete(&mut ctx).await.unwrap();

        let mut ana = ConversationState::new("+15551110001");
        let out = record_rsvp_reply(&db, &mut ana, "I'm in")
            .await
            .unwrap()
            .unwrap();
        assert!(out.reply.contains("in for"));
        assert!(ana.waiting_for.is_none());

        // Unclear text re-prompts instead of defaulting, and tags the
        // invitee so the next terse reply routes straight back here.
        let mut lee = ConversationState::new("+15551110002");
        let out = record_rsvp_reply(&db, &mut lee, "what time?")
            .await
            .unwrap()
            .unwrap();
        assert!(out.reply.contains("IN, OUT, or MAYBE"));
        assert_eq!(
            lee.waiting_for,
            Some(crate::conversation::model::WaitingFor::RsvpReply)
        );

        let out = record_rsvp_reply(&db, &mut lee, "out").await.unwrap().unwrap();
        assert!(out.reply.contains("you're out"));
        assert!(lee.waiting_for.is_none());

        // Unknown phone resolves to nothing.
        let mut stranger = ConversationState::new("+15559990000");
        assert!(record_rsvp_reply(&db, &mut stranger, "in")
            .await
            .unwrap()
            .is_none());
    }
}
