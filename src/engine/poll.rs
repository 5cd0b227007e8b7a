//! Scheduling polls — creation, invitee replies, owner commands.
//!
//! A poll carries up to 3 time options resolved to concrete windows at
//! creation. The lifecycle (running → paused → stopped) is advanced only
//! through guarded transitions; the deferred jobs that drive reminders,
//! the pause check, and auto-end are enqueued here and consumed by the
//! scheduler.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::conversation::model::WaitingFor;
use crate::engine::confirm::{parse_multi_selection, parse_selection, ConfirmReply};
use crate::engine::slots::{SlotId, SlotValues};
use crate::engine::{members::resolve_group, Advance, FlowCtx, OutboundSend};
use crate::error::EngineError;
use crate::store::model::{
    JobKind, PollOption, PollRecipient, PollStatus, ResponseStats, SchedulingPoll,
};
use crate::store::Database;
use crate::timeparse;

/// Confirmation summary shown before the poll goes out.
pub fn summary(slots: &SlotValues) -> String {
    let name = slots.name.as_deref().unwrap_or("(untitled)");
    let mut lines = vec![format!("Poll for \"{name}\":")];
    if let Some(options) = &slots.options {
        for (i, option) in options.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, option));
        }
    }
    lines.push("Start the poll? (yes/no)".to_string());
    lines.join("\n")
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

    let name = ctx
        .slots
        .name
        .clone()
        .ok_or_else(|| EngineError::InvalidSlot {
            slot: SlotId::Name.label().into(),
            message: "missing at terminal step".into(),
        })?;
    let option_texts = ctx
        .slots
        .options
        .clone()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| EngineError::InvalidSlot {
            slot: SlotId::Options.label().into(),
            message: "missing at terminal step".into(),
        })?;

    let now = Utc::now();
    let poll_id = Uuid::new_v4();
    let mut options = Vec::with_capacity(option_texts.len());
    for (i, text) in option_texts.iter().take(3).enumerate() {
        let Some((starts_at, ends_at)) = timeparse::parse_option(text, now) else {
            return Err(EngineError::Recoverable(format!(
                "I couldn't read \"{text}\" as a time. Try something like \"Friday 6pm\"."
            )));
        };
        options.push(PollOption {
            id: Uuid::new_v4(),
            poll_id,
            idx: i as u32,
            label: text.clone(),
            starts_at,
            ends_at,
        });
    }

    let poll = SchedulingPoll {
        id: poll_id,
        owner_key: ctx.state.user_key.clone(),
        group_id: group.id,
        event_name: name.clone(),
        status: PollStatus::Running,
        created_at: now,
        paused_at: None,
        stopped_at: None,
    };
    let recipients: Vec<PollRecipient> = members
        .iter()
        .map(|m| PollRecipient {
            poll_id,
            phone: m.phone.clone(),
            name: m.name.clone(),
            responded_at: None,
        })
        .collect();
    ctx.db.insert_poll(&poll, &options, &recipients).await?;

    // Reminder first; auto-end wakes at the earliest option end and
    // reschedules itself from there.
    ctx.db
        .enqueue_job(poll_id, JobKind::Reminder, now + ctx.jobs.reminder_offset)
        .await?;
    if let Some(earliest_end) = options.iter().map(|o| o.ends_at).min() {
        ctx.db
            .enqueue_job(poll_id, JobKind::AutoEndCheck, earliest_end)
            .await?;
    }
    info!(
        user_key = %ctx.state.user_key,
        poll = %name,
        recipients = recipients.len(),
        "Poll started"
    );

    let body = invite_body(&name, &options);
    let sends = recipients
        .iter()
        .map(|r| OutboundSend {
            to: r.phone.clone(),
            body: body.clone(),
        })
        .collect();

    ctx.state.push_snapshot(
        "create_poll",
        ctx.input,
        Some(format!("poll_created:{poll_id}")),
        SlotValues::default(),
    );
    ctx.state.reset_flow();

    Ok(Advance::with_sends(
        format!(
            "Poll sent to {} {} for \"{name}\". Say \"check poll\" anytime.",
            recipients.len(),
            if recipients.len() == 1 { "person" } else { "people" },
        ),
        sends,
    ))
}

fn invite_body(event_name: &str, options: &[PollOption]) -> String {
    let mut lines = vec![format!("Finding a time for \"{event_name}\". What works?")];
    for option in options {
        lines.push(format!("{}. {}", option.idx + 1, option.label));
    }
    lines.push("Reply with the numbers that work (e.g. \"1 3\"), or \"none\".".to_string());
    lines.join("\n")
}

/// Handle an invitee reply against the running poll they were sent.
/// Sets or clears the invitee's waiting tag so the next terse reply
/// resolves without a fresh lookup.
pub async fn record_invitee_reply(
    db: &dyn Database,
    state: &mut crate::conversation::model::ConversationState,
    text: &str,
) -> Result<Option<Advance>, EngineError> {
    let phone = state.user_key.clone();
    let Some(poll) = db.find_running_poll_for_phone(&phone).await? else {
        return Ok(None);
    };
    let options = db.poll_options(poll.id).await?;

    match parse_multi_selection(text, options.len()) {
        Some(picks) => {
            db.record_poll_response(poll.id, &phone, &picks).await?;
            state.waiting_for = None;
            state.touch("poll_reply");
            let ack = if picks.is_empty() {
                format!("Got it — none of those work for \"{}\".", poll.event_name)
            } else {
                let chosen: Vec<String> = picks
                    .iter()
                    .filter_map(|i| options.get(*i as usize))
                    .map(|o| o.label.clone())
                    .collect();
                format!(
                    "Got it — you can do {} for \"{}\".",
                    chosen.join(" and "),
                    poll.event_name
                )
            };
            Ok(Some(Advance::reply(ack)))
        }
        None => {
            state.waiting_for = Some(WaitingFor::PollOptionReply);
            Ok(Some(Advance::reply(invite_body(&poll.event_name, &options))))
        }
    }
}

/// "check poll" — current response stats for the owner's latest poll.
pub async fn check(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let Some(poll) = ctx
        .db
        .find_poll_for_owner(&ctx.state.user_key, &[PollStatus::Running, PollStatus::Paused])
        .await?
    else {
        return Ok(Advance::reply("No poll is running right now."));
    };
    let options = ctx.db.poll_options(poll.id).await?;
    let stats = ctx.db.poll_stats(poll.id).await?;
    Ok(Advance::reply(render_stats(&poll, &options, &stats)))
}

/// "stop poll" — asks for confirmation first.
pub async fn request_stop(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let Some(poll) = ctx
        .db
        .find_poll_for_owner(&ctx.state.user_key, &[PollStatus::Running, PollStatus::Paused])
        .await?
    else {
        return Ok(Advance::reply("No poll is running right now."));
    };
    ctx.state.waiting_for = Some(WaitingFor::PollStopConfirmation);
    ctx.state.push_snapshot(
        "stop_poll",
        ctx.input,
        Some(format!("stop_requested:{}", poll.id)),
        SlotValues::default(),
    );
    Ok(Advance::reply(format!(
        "Stop the poll for \"{}\" and close responses? (yes/no)",
        poll.event_name
    )))
}

/// Reply while waiting on the stop confirmation.
pub async fn confirm_stop(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    match ConfirmReply::parse(ctx.input) {
        ConfirmReply::Yes => {
            ctx.state.waiting_for = None;
            let Some(poll) = ctx
                .db
                .find_poll_for_owner(
                    &ctx.state.user_key,
                    &[PollStatus::Running, PollStatus::Paused],
                )
                .await?
            else {
                return Ok(Advance::reply("That poll already ended."));
            };
            let stopped = ctx
                .db
                .transition_poll(poll.id, poll.status, PollStatus::Stopped)
                .await?;
            if !stopped {
                return Ok(Advance::reply("That poll already ended."));
            }
            info!(poll = %poll.event_name, "Poll stopped by owner");
            let options = ctx.db.poll_options(poll.id).await?;
            let stats = ctx.db.poll_stats(poll.id).await?;
            Ok(Advance::reply(format!(
                "Poll stopped.\n{}",
                render_stats(&poll, &options, &stats)
            )))
        }
        ConfirmReply::No => {
            ctx.state.waiting_for = None;
            Ok(Advance::reply("Okay, the poll keeps collecting responses."))
        }
        ConfirmReply::Unclear => Ok(Advance::reply(
            "Stop the poll? Reply yes to close it, no to keep collecting.",
        )),
    }
}

/// Menu text sent to the owner when the scheduler pauses a poll.
pub fn paused_menu(poll: &SchedulingPoll) -> String {
    format!(
        "The poll for \"{}\" is paused. What next?\n1. Send another reminder and keep collecting\n2. Stop the poll and see results",
        poll.event_name
    )
}

/// Owner's numbered pick while the poll sits paused.
pub async fn paused_menu_reply(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let Some(poll) = ctx
        .db
        .find_poll_for_owner(&ctx.state.user_key, &[PollStatus::Paused])
        .await?
    else {
        ctx.state.waiting_for = None;
        return Ok(Advance::reply("That poll already ended."));
    };

    // "stop" is accepted alongside the numbered picks.
    let picked = parse_selection(ctx.input, 2).or_else(|| {
        matches!(
            ctx.input.trim().to_ascii_lowercase().as_str(),
            "stop" | "stop poll" | "stop the poll"
        )
        .then_some(1)
    });
    match picked {
        Some(0) => {
            let resumed = ctx
                .db
                .transition_poll(poll.id, PollStatus::Paused, PollStatus::Running)
                .await?;
            if !resumed {
                ctx.state.waiting_for = None;
                return Ok(Advance::reply("That poll already ended."));
            }
            ctx.state.waiting_for = None;
            ctx.db
                .enqueue_job(poll.id, JobKind::PauseCheck, Utc::now() + ctx.jobs.pause_offset)
                .await?;

            let options = ctx.db.poll_options(poll.id).await?;
            let body = invite_body(&poll.event_name, &options);
            let sends = ctx
                .db
                .non_responders(poll.id)
                .await?
                .into_iter()
                .map(|r| OutboundSend {
                    to: r.phone,
                    body: format!("Reminder: {body}"),
                })
                .collect::<Vec<_>>();
            Ok(Advance::with_sends(
                format!("Reminder sent to {} still waiting.", sends.len()),
                sends,
            ))
        }
        Some(1) => {
            ctx.state.waiting_for = None;
            let stopped = ctx
                .db
                .transition_poll(poll.id, PollStatus::Paused, PollStatus::Stopped)
                .await?;
            if !stopped {
                return Ok(Advance::reply("That poll already ended."));
            }
            let options = ctx.db.poll_options(poll.id).await?;
            let stats = ctx.db.poll_stats(poll.id).await?;
            Ok(Advance::reply(format!(
                "Poll stopped.\n{}",
                render_stats(&poll, &options, &stats)
            )))
        }
        _ => Ok(Advance::reply(paused_menu(&poll))),
    }
}

/// Shared stats rendering for "check poll", stop, and the pause message.
pub fn render_stats(
    poll: &SchedulingPoll,
    options: &[PollOption],
    stats: &ResponseStats,
) -> String {
    let mut lines = vec![format!(
        "\"{}\": {} of {} responded.",
        poll.event_name, stats.responded, stats.total
    )];
    for option in options {
        let count = stats
            .per_option
            .get(option.idx as usize)
            .copied()
            .unwrap_or(0);
        lines.push(format!(
            "{}. {} — {} can make it",
            option.idx + 1,
            option.label,
            count
        ));
    }
    if stats.none_work > 0 {
        lines.push(format!("None work: {}", stats.none_work));
    }
    if stats.pending() > 0 {
        lines.push(format!("Waiting on {}.", stats.pending()));
    }
    lines.join("\n")
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

    fn poll_slots() -> SlotValues {
        SlotValues {
            group: Some("Tennis".into()),
            name: Some("Game Night".into()),
            options: Some(vec!["Friday 6pm".into(), "Saturday 10am".into()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn complete_creates_poll_jobs_and_sends() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: poll_slots(),
            input: "yes",
            jobs: &jobs,
        };

        let out = complete(&mut ctx).await.unwrap();
        assert_eq!(out.sends.len(), 2);
        assert!(out.sends[0].body.contains("1. Friday 6pm"));
        assert!(state.waiting_for.is_none());

        let poll = db
            .find_poll_for_owner("+15550001111", &[PollStatus::Running])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.poll_options(poll.id).await.unwrap().len(), 2);
        // Reminder and auto-end queued; both come due eventually.
        let due = db
            .due_jobs(Utc::now() + chrono::Duration::days(30), 10)
            .await
            .unwrap();
        let kinds: Vec<JobKind> = due.iter().map(|j| j.kind).collect();
        assert!(kinds.contains(&JobKind::Reminder));
        assert!(kinds.contains(&JobKind::AutoEndCheck));
    }

    #[tokio::test]
    async fn unreadable_option_is_recoverable() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut slots = poll_slots();
        slots.options = Some(vec!["whenever".into()]);
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots,
            input: "yes",
            jobs: &jobs,
        };
        let err = complete(&mut ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Recoverable(_)));
    }

    #[tokio::test]
    async fn invitee_reply_roundtrip() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: poll_slots(),
            input: "yes",
            jobs: &jobs,
        };
        complete(&mut ctx).await.unwrap();

        let mut ana = ConversationState::new("+15551110001");
        let out = record_invitee_reply(&db, &mut ana, "1 2")
            .await
            .unwrap()
            .unwrap();
        assert!(out.reply.contains("Friday 6pm and Saturday 10am"));
        assert!(ana.waiting_for.is_none());

        let mut lee = ConversationState::new("+15551110002");
        let out = record_invitee_reply(&db, &mut lee, "none")
            .await
            .unwrap()
            .unwrap();
        assert!(out.reply.contains("none of those work"));

        // Out-of-range re-prompts with the option list and tags the record.
        let out = record_invitee_reply(&db, &mut ana, "7")
            .await
            .unwrap()
            .unwrap();
        assert!(out.reply.contains("1. Friday 6pm"));
        assert_eq!(ana.waiting_for, Some(WaitingFor::PollOptionReply));

        // A phone with no running poll resolves to nothing.
        let mut stranger = ConversationState::new("+15559990000");
        assert!(record_invitee_reply(&db, &mut stranger, "1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn paused_menu_accepts_the_stop_keyword() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: poll_slots(),
            input: "yes",
            jobs: &jobs,
        };
        complete(&mut ctx).await.unwrap();
        let poll = db
            .find_poll_for_owner("+15550001111", &[PollStatus::Running])
            .await
            .unwrap()
            .unwrap();
        db.transition_poll(poll.id, PollStatus::Running, PollStatus::Paused)
            .await
            .unwrap();
        state.waiting_for = Some(WaitingFor::PollPausedMenu);

        // Anything unrecognized re-prompts and keeps the poll paused.
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: SlotValues::default(),
            input: "huh",
            jobs: &jobs,
        };
        let out = paused_menu_reply(&mut ctx).await.unwrap();
        assert!(out.reply.contains("What next?"));
        assert_eq!(state.waiting_for, Some(WaitingFor::PollPausedMenu));

        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: SlotValues::default(),
            input: "stop",
            jobs: &jobs,
        };
        let out = paused_menu_reply(&mut ctx).await.unwrap();
        assert!(out.reply.contains("Poll stopped"));
        assert!(state.waiting_for.is_none());

        let poll = db.get_poll(poll.id).await.unwrap().unwrap();
        assert_eq!(poll.status, PollStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_flow_requires_confirmation() {
        let (db, _group) = seeded().await;
        let jobs = SchedulerConfig::default();
        let mut state = ConversationState::new("+15550001111");
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: poll_slots(),
            input: "yes",
            jobs: &jobs,
        };
        complete(&mut ctx).await.unwrap();

        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: SlotValues::default(),
            input: "stop poll",
            jobs: &jobs,
        };
        let out = request_stop(&mut ctx).await.unwrap();
        assert!(out.reply.contains("yes/no"));
        assert_eq!(state.waiting_for, Some(WaitingFor::PollStopConfirmation));

        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: SlotValues::default(),
            input: "yes",
            jobs: &jobs,
        };
        let out = confirm_stop(&mut ctx).await.unwrap();
        assert!(out.reply.contains("Poll stopped"));
        assert!(state.waiting_for.is_none());

        let poll = db
            .find_poll_for_owner("+15550001111", &[PollStatus::Stopped])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(poll.status, PollStatus::Stopped);
    }
}
