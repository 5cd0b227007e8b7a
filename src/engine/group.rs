//! Group creation — the only workflow with no confirmation step.
//!
//! As soon as the name is known the group is created and the conversation
//! moves straight into member-adding mode. A duplicate name is recoverable:
//! the user stays where they were and can resubmit another name.

use chrono::Utc;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::conversation::model::WaitingFor;
use crate::engine::slots::{SlotId, SlotValues, WorkflowKind};
use crate::engine::{Advance, FlowCtx};
use crate::error::EngineError;
use crate::store::model::Group;
use crate::store::Database;

const CODE_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
const CODE_LEN: usize = 6;
const CODE_RETRIES: usize = 4;

/// Short shareable handle, ambiguous glyphs excluded.
pub fn invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Insert the group, re-rolling the invite code when it lands on one
/// another group already holds. Both the code and (owner, name) are unique
/// at the store level; only the name clash is the user's to resolve.
async fn insert_with_fresh_code(
    db: &dyn Database,
    group: &mut Group,
) -> Result<(), EngineError> {
    let mut attempts = 0;
    loop {
        match db.insert_group(group).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_constraint() => {
                if db
                    .find_group_by_name(&group.owner_key, &group.name)
                    .await?
                    .is_some()
                {
                    return Err(EngineError::Recoverable(format!(
                        "You already have a group called \"{}\". Try a different name.",
                        group.name
                    )));
                }
                attempts += 1;
                if attempts >= CODE_RETRIES {
                    return Err(e.into());
                }
                group.invite_code = invite_code();
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub async fn complete(ctx: &mut FlowCtx<'_>) -> Result<Advance, EngineError> {
    let name = ctx
        .slots
        .name
        .clone()
        .ok_or_else(|| EngineError::InvalidSlot {
            slot: SlotId::Name.label().into(),
            message: "group name missing at terminal step".into(),
        })?;

    let mut group = Group {
        id: Uuid::new_v4(),
        owner_key: ctx.state.user_key.clone(),
        name: name.clone(),
        invite_code: invite_code(),
        created_at: Utc::now(),
    };
    insert_with_fresh_code(ctx.db, &mut group).await?;
    info!(user_key = %ctx.state.user_key, group = %name, "Group created");

    // Straight into member-adding mode with the group pre-selected.
    let slots = SlotValues {
        group: Some(name.clone()),
        ..Default::default()
    };
    ctx.state.push_snapshot(
        "create_group",
        ctx.input,
        Some(format!("group_created:{}", group.id)),
        slots,
    );
    ctx.state
        .enter_workflow(WorkflowKind::AddMembers, WaitingFor::MemberEntries);

    Ok(Advance::reply(format!(
        "Group \"{name}\" is ready! Invite code: {code}.\n\n{prompt}",
        code = group.invite_code,
        prompt = SlotId::Members.prompt(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::conversation::model::ConversationState;
    use crate::store::{Database, LibSqlBackend};

    #[tokio::test]
    async fn creates_group_and_enters_member_mode() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut state = ConversationState::new("+15550001111");
        let jobs = SchedulerConfig::default();
        let mut ctx = FlowCtx {
            db: &db,
            state: &mut state,
            slots: SlotValues {
                name: Some("Tennis".into()),
                ..Default::default()
            },
            input: "create group Tennis",
            jobs: &jobs,
        };

        let out = complete(&mut ctx).await.unwrap();
        assert!(out.reply.contains("Tennis"));
        assert!(out.reply.contains("Invite code"));
        assert_eq!(state.waiting_for, Some(WaitingFor::MemberEntries));

        let group = db
            .find_group_by_name("+15550001111", "tennis")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.invite_code.len(), CODE_LEN);
    }

    #[tokio::test]
    async fn duplicate_name_is_recoverable() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let jobs = SchedulerConfig::default();

        for expect_err in [false, true] {
            let mut state = ConversationState::new("+15550001111");
            let mut ctx = FlowCtx {
                db: &db,
                state: &mut state,
                slots: SlotValues {
                    name: Some("Tennis".into()),
                    ..Default::default()
                },
                input: "create group Tennis",
                jobs: &jobs,
            };
            let result = complete(&mut ctx).await;
            if expect_err {
                assert!(matches!(result, Err(EngineError::Recoverable(_))));
            } else {
                result.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn colliding_invite_code_is_rerolled() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let taken = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "Tennis".into(),
            invite_code: "abc234".into(),
            created_at: Utc::now(),
        };
        db.insert_group(&taken).await.unwrap();

        // Different owner and name, same handle: not a name clash, so the
        // insert must land with a regenerated code.
        let mut group = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550002222".into(),
            name: "Bowling".into(),
            invite_code: "abc234".into(),
            created_at: Utc::now(),
        };
        insert_with_fresh_code(&db, &mut group).await.unwrap();
        assert_ne!(group.invite_code, "abc234");

        let saved = db
            .find_group_by_name("+15550002222", "Bowling")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.invite_code, group.invite_code);
    }

    #[tokio::test]
    async fn code_collision_keeps_the_duplicate_name_message_for_names() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let taken = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "Tennis".into(),
            invite_code: "abc234".into(),
            created_at: Utc::now(),
        };
        db.insert_group(&taken).await.unwrap();

        let mut dup = Group {
            id: Uuid::new_v4(),
            owner_key: "+15550001111".into(),
            name: "tennis".into(),
            invite_code: "xyz789".into(),
            created_at: Utc::now(),
        };
        let err = insert_with_fresh_code(&db, &mut dup).await.unwrap_err();
        match err {
            EngineError::Recoverable(msg) => assert!(msg.contains("already have a group")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invite_codes_use_safe_alphabet() {
        let code = invite_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }
}
