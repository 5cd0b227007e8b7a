//! Message processor — one inbound message in, one reply out.
//!
//! Orchestrates the full path: history logging, onboarding, the priority
//! ladder, classification, the workflow engine, and finally the versioned
//! conversation save. The save is the fence for side effects: fire-and-forget
//! sends go out only after the state-clearing write has landed, and any
//! failure before it leaves the persisted record exactly where it was, so an
//! identical retry completes the same step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::classifier::{ClassifyRequest, IntentClassifier};
use crate::context::{self, Role};
use crate::conversation::{ConversationManager, ConversationState};
use crate::engine::{self, Advance, Engine};
use crate::error::{DatabaseError, EngineError};
use crate::onboarding::{self, OnboardingStep};
use crate::resolver::{self, Resolution};
use crate::store::model::Direction;
use crate::store::Database;
use crate::transport::Transport;

/// History lines handed to the classifier context.
const HISTORY_FETCH: usize = 20;

/// One inbound message, already phone-normalized by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub phone: String,
    pub message: String,
    /// "member" for the restricted capability set; anything else is owner.
    #[serde(default)]
    pub role: Option<String>,
    /// Per-request classifier model override.
    #[serde(default)]
    pub model: Option<String>,
}

/// The reply returned to the caller of the inbound endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedReply {
    pub action: String,
    pub content: String,
    pub confidence: f32,
    pub structured: bool,
    pub user_key: String,
}

/// A handled message before persistence: what to say, under which action
/// label, and whether the in-memory state mutations should be saved.
struct Handled {
    action: &'static str,
    confidence: f32,
    advance: Advance,
    save: bool,
}

impl Handled {
    fn reply(action: &'static str, advance: Advance) -> Self {
        Self {
            action,
            confidence: 1.0,
            advance,
            save: true,
        }
    }
}

/// The full inbound pipeline behind one `process` call.
pub struct MessageProcessor {
    db: Arc<dyn Database>,
    conversations: ConversationManager,
    classifier: Arc<dyn IntentClassifier>,
    engine: Engine,
    transport: Arc<dyn Transport>,
}

impl MessageProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: Arc<dyn IntentClassifier>,
        engine: Engine,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            conversations: ConversationManager::new(db.clone()),
            db,
            classifier,
            engine,
            transport,
        }
    }

    /// Handle one inbound message end to end. Never fails the caller:
    /// every error class degrades to a retry-safe reply with the persisted
    /// conversation record left untouched.
    pub async fn process(&self, inbound: InboundMessage) -> ProcessedReply {
        let user_key = inbound.phone.clone();
        if let Err(e) = self
            .db
            .log_message(&user_key, Direction::Inbound, &inbound.message)
            .await
        {
            warn!(user_key, error = %e, "Failed to log inbound message");
        }

        let (handled, mut state) = match self.handle(&inbound).await {
            Ok(pair) => pair,
            Err(e) => {
                let reply = Self::degrade(&user_key, &e);
                self.log_outbound(&user_key, &reply.content).await;
                return reply;
            }
        };

        if handled.save {
            if let Err(e) = self.conversations.save(&mut state).await {
                let reply = Self::degrade(&user_key, &e.into());
                self.log_outbound(&user_key, &reply.content).await;
                return reply;
            }
        }

        // Side-channel sends fire only after the state write, each with its
        // own logged result. A failed send never fails the request.
        self.log_outbound(&user_key, &handled.advance.reply).await;
        for send in &handled.advance.sends {
            match self.transport.send(&send.to, &send.body).await {
                Ok(()) => self.log_outbound(&send.to, &send.body).await,
                Err(e) => warn!(to = %send.to, error = %e, "Outbound send failed"),
            }
        }

        info!(user_key, action = handled.action, "Message processed");
        ProcessedReply {
            action: handled.action.to_string(),
            content: handled.advance.reply,
            confidence: handled.confidence,
            structured: true,
            user_key,
        }
    }

    async fn handle(
        &self,
        inbound: &InboundMessage,
    ) -> Result<(Handled, ConversationState), crate::error::Error> {
        let user_key = &inbound.phone;
        let text = inbound.message.trim();
        let role = Role::from_flag(inbound.role.as_deref());
        let mut state = self.conversations.load(user_key).await?;

        // A brand-new owner phone starts onboarding before anything else.
        if state.onboarding_step.is_none()
            && role.is_elevated()
            && self.db.get_contact_by_phone(user_key).await?.is_none()
        {
            state.onboarding_step = Some(OnboardingStep::AwaitingName);
            state.waiting_for = Some(crate::conversation::WaitingFor::OnboardingName);
            state.touch("onboarding");
            return Ok((
                Handled::reply("onboarding", Advance::reply(onboarding::welcome_prompt())),
                state,
            ));
        }

        let handled = match resolver::resolve_early(&state, role, text) {
            Some(Resolution::Confirmation) => Handled::reply(
                "confirmation",
                self.engine.handle_confirmation(&mut state, text).await?,
            ),
            Some(Resolution::Selection) => Handled::reply(
                "selection",
                self.engine.handle_selection(&mut state, text).await?,
            ),
            Some(Resolution::InviteeReply) | Some(Resolution::Restricted) => {
                self.member_reply(&mut state, text).await?
            }
            Some(Resolution::Help) => Handled::reply("help", Advance::reply(engine::help_text())),
            Some(Resolution::Onboarding) => self.capture_name(&mut state, text).await?,
            Some(Resolution::Command(_))
            | Some(Resolution::Continuation)
            | Some(Resolution::Fallback)
            | None => self.classify_and_route(&mut state, role, text, inbound).await?,
        };
        Ok((handled, state))
    }

    /// Restricted path: invitees can answer polls and event invites, and
    /// nothing else.
    async fn member_reply(
        &self,
        state: &mut ConversationState,
        text: &str,
    ) -> Result<Handled, crate::error::Error> {
        if let Some(advance) =
            engine::poll::record_invitee_reply(self.db.as_ref(), state, text).await?
        {
            return Ok(Handled::reply("poll_reply", advance));
        }
        if let Some(advance) =
            engine::event::record_rsvp_reply(self.db.as_ref(), state, text).await?
        {
            return Ok(Handled::reply("rsvp", advance));
        }
        // A stale invitee tag (the poll or event it pointed at has since
        // closed) is cleared here, or it would trap every later reply.
        if state.waiting_for.take().is_some() {
            return Ok(Handled::reply(
                "member_help",
                Advance::reply("That one has already wrapped up — nothing is waiting on your reply."),
            ));
        }
        Ok(Handled {
            action: "member_help",
            confidence: 1.0,
            advance: Advance::reply(
                "You can reply to polls with the numbers that work (or \"none\"), \
                 and to invites with IN, OUT, or MAYBE.",
            ),
            save: false,
        })
    }

    /// Onboarding name capture. An unusable reply re-prompts without
    /// touching the stored record.
    async fn capture_name(
        &self,
        state: &mut ConversationState,
        text: &str,
    ) -> Result<Handled, crate::error::Error> {
        match onboarding::extract_name(text) {
            Some(name) => {
                self.db.upsert_contact(&state.user_key, &name).await?;
                ConversationManager::complete_onboarding(state);
                state.waiting_for = None;
                state.touch("onboarding_complete");
                info!(user_key = %state.user_key, "Onboarding complete");
                Ok(Handled::reply(
                    "onboarding",
                    Advance::reply(onboarding::completion_message(&name)),
                ))
            }
            None => Ok(Handled {
                action: "onboarding",
                confidence: 1.0,
                advance: Advance::reply(
                    "Sorry, I didn't catch a name — what should I call you?",
                ),
                save: false,
            }),
        }
    }

    /// Rungs 6–8: classify the text, then route to command override,
    /// slot-filling continuation, or a clarification prompt.
    async fn classify_and_route(
        &self,
        state: &mut ConversationState,
        role: Role,
        text: &str,
        inbound: &InboundMessage,
    ) -> Result<Handled, crate::error::Error> {
        let history = self.db.recent_messages(&state.user_key, HISTORY_FETCH).await?;
        let bundle = context::assemble(state, &history, role, text);
        let classification = self
            .classifier
            .classify(ClassifyRequest {
                text,
                context: &bundle,
                model: inbound.model.as_deref(),
            })
            .await?;
        info!(
            user_key = %state.user_key,
            action = %classification.raw_action,
            confidence = classification.confidence,
            "Classified"
        );

        match resolver::resolve_classified(state, classification.action) {
            Resolution::Command(action) => Ok(Handled {
                action: action.label(),
                confidence: classification.confidence,
                advance: self
                    .engine
                    .handle_command(state, action, &classification.slots, text)
                    .await?,
                save: true,
            }),
            Resolution::Continuation => Ok(Handled {
                action: "continue",
                confidence: classification.confidence,
                advance: self
                    .engine
                    .continue_collecting(state, &classification.slots, text)
                    .await?,
                save: true,
            }),
            // Ambiguity: clarify, leave everything persisted as it was.
            _ => Ok(Handled {
                action: "chat",
                confidence: classification.confidence,
                advance: Advance::reply(
                    "Sorry, I'm not sure what you'd like to do. Reply \"help\" to see \
                     what I can help with.",
                ),
                save: false,
            }),
        }
    }

    /// Map a pipeline error to a retry-safe reply. The conversation record
    /// was not written on any of these paths.
    fn degrade(user_key: &str, err: &crate::error::Error) -> ProcessedReply {
        use crate::error::Error;
        let content = match err {
            Error::Engine(EngineError::Recoverable(msg)) => msg.clone(),
            Error::Database(DatabaseError::Conflict { .. }) => {
                warn!(user_key, "Conversation write conflict, asking for a resend");
                "I got two messages at once — mind sending that again?".to_string()
            }
            Error::Classifier(_) | Error::Transport(_) => {
                warn!(user_key, error = %err, "External dependency failure");
                "Sorry, something went wrong on my end. Please try again in a moment."
                    .to_string()
            }
            _ => {
                error!(user_key, error = %err, "Unexpected processing failure");
                "Sorry, something went wrong on my end. Please try again in a moment."
                    .to_string()
            }
        };
        ProcessedReply {
            action: "error".to_string(),
            content,
            confidence: 0.0,
            structured: false,
            user_key: user_key.to_string(),
        }
    }

    async fn log_outbound(&self, to: &str, body: &str) {
        if let Err(e) = self.db.log_message(to, Direction::Outbound, body).await {
            warn!(to, error = %e, "Failed to log outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::classifier::{Action, Classification};
    use crate::config::SchedulerConfig;
    use crate::error::ClassifierError;
    use crate::engine::slots::SlotValues;
    use crate::store::model::{Group, PollOption, PollRecipient, PollStatus, SchedulingPoll};
    use crate::store::LibSqlBackend;
    use crate::transport::NoopTransport;

    /// Classifier that replays a scripted sequence of results.
    struct ScriptedClassifier {
        script: Mutex<VecDeque<Classification>>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn new(script: Vec<Classification>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IntentClassifier for ScriptedClassifier {
        async fn classify(
            &self,
            _request: ClassifyRequest<'_>,
        ) -> Result<Classification, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ClassifierError::InvalidResponse("script exhausted".into()))
        }
    }

    fn classification(action: Action, slots: SlotValues) -> Classification {
        Classification {
            action: Some(action),
            slots,
            confidence: 0.92,
            raw_action: action.label().to_string(),
        }
    }

    async fn processor(
        script: Vec<Classification>,
    ) -> (MessageProcessor, Arc<dyn Database>, Arc<ScriptedClassifier>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let classifier = Arc::new(ScriptedClassifier::new(script));
        let engine = Engine::new(db.clone(), SchedulerConfig::default());
        let processor = MessageProcessor::new(
            db.clone(),
            classifier.clone(),
            engine,
            Arc::new(NoopTransport),
        );
        (processor, db, classifier)
    }

    fn owner_msg(phone: &str, text: &str) -> InboundMessage {
        InboundMessage {
            phone: phone.into(),
            message: text.into(),
            role: None,
            model: None,
        }
    }

    fn member_msg(phone: &str, text: &str) -> InboundMessage {
        InboundMessage {
            phone: phone.into(),
            message: text.into(),
            role: Some("member".into()),
            model: None,
        }
    }

    #[tokio::test]
    async fn create_group_moves_to_member_adding() {
        let slots = SlotValues {
            name: Some("Tennis".into()),
            ..Default::default()
        };
        let (processor, db, _) = processor(vec![classification(Action::CreateGroup, slots)]).await;
        let owner = "+15550001111";
        db.upsert_contact(owner, "Riley").await.unwrap();

        let reply = processor.process(owner_msg(owner, "create group Tennis")).await;
        assert_eq!(reply.action, "create_group");
        assert!(reply.content.contains("Tennis"));
        assert!(reply.content.contains("Invite code"), "{}", reply.content);
        assert!(reply.structured);

        // The saved record is waiting for member entries.
        let state = db.get_conversation(owner).await.unwrap().unwrap();
        assert_eq!(
            state.waiting_for,
            Some(crate::conversation::WaitingFor::MemberEntries)
        );
        assert_eq!(db.list_groups(owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_confirmation_skips_the_classifier() {
        let slots = SlotValues {
            message: Some("Practice moved to 8".into()),
            audience: Some("everyone".into()),
            ..Default::default()
        };
        let (processor, db, classifier) =
            processor(vec![classification(Action::Broadcast, slots)]).await;
        let owner = "+15550002222";
        db.upsert_contact(owner, "Riley").await.unwrap();
        db.insert_group(&crate::store::model::Group {
            id: Uuid::new_v4(),
            owner_key: owner.into(),
            name: "Tennis".into(),
            invite_code: "abc123".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let reply = processor
            .process(owner_msg(owner, "tell the group practice moved to 8"))
            .await;
        assert!(reply.content.contains("Send it?"), "{}", reply.content);
        assert_eq!(classifier.calls(), 1);

        // "no" resolves on the priority ladder; the classifier never runs.
        let reply = processor.process(owner_msg(owner, "no")).await;
        assert_eq!(reply.action, "confirmation");
        assert!(reply.content.contains("cancelled"));
        assert_eq!(classifier.calls(), 1);

        let state = db.get_conversation(owner).await.unwrap().unwrap();
        assert!(state.waiting_for.is_none());
    }

    #[tokio::test]
    async fn duplicate_command_never_duplicates_rows() {
        let slots = SlotValues {
            name: Some("Tennis".into()),
            ..Default::default()
        };
        let script = vec![
            classification(Action::CreateGroup, slots.clone()),
            classification(Action::CreateGroup, slots),
        ];
        let (processor, db, _) = processor(script).await;
        let owner = "+15550003333";
        db.upsert_contact(owner, "Riley").await.unwrap();

        processor.process(owner_msg(owner, "create group Tennis")).await;
        let replay = processor.process(owner_msg(owner, "create group Tennis")).await;
        assert!(replay.content.contains("already have a group"), "{}", replay.content);
        assert_eq!(db.list_groups(owner).await.unwrap().len(), 1);

        // The stored record stayed at the member-adding step.
        let state = db.get_conversation(owner).await.unwrap().unwrap();
        assert_eq!(
            state.waiting_for,
            Some(crate::conversation::WaitingFor::MemberEntries)
        );
    }

    #[tokio::test]
    async fn unknown_owner_is_onboarded_first() {
        let (processor, db, classifier) = processor(vec![]).await;
        let owner = "+15550004444";

        let reply = processor.process(owner_msg(owner, "hi there")).await;
        assert_eq!(reply.action, "onboarding");
        assert!(reply.content.contains("your name"));
        assert_eq!(classifier.calls(), 0);

        // Gibberish re-prompts without losing the onboarding step.
        let reply = processor.process(owner_msg(owner, "555-1234")).await;
        assert!(reply.content.contains("didn't catch a name"));

        let reply = processor.process(owner_msg(owner, "I'm Riley")).await;
        assert!(reply.content.contains("Riley"));
        let contact = db.get_contact_by_phone(owner).await.unwrap().unwrap();
        assert_eq!(contact.name, "Riley");
        let state = db.get_conversation(owner).await.unwrap().unwrap();
        assert_eq!(state.onboarding_step, Some(OnboardingStep::Complete));
    }

    #[tokio::test]
    async fn member_poll_reply_is_recorded_without_classification() {
        let (processor, db, classifier) = processor(vec![]).await;
        let owner = "+15550005555";
        let invitee = "+15550006666";

        let group = Group {
            id: Uuid::new_v4(),
            owner_key: owner.into(),
            name: "Game Night Crew".into(),
            invite_code: Uuid::new_v4().simple().to_string()[..6].to_string(),
            created_at: Utc::now(),
        };
        db.insert_group(&group).await.unwrap();
        let poll = SchedulingPoll {
            id: Uuid::new_v4(),
            owner_key: owner.into(),
            group_id: group.id,
            event_name: "Game night".into(),
            status: PollStatus::Running,
            created_at: Utc::now(),
            paused_at: None,
            stopped_at: None,
        };
        let start = Utc::now() + Duration::days(1);
        let options = vec![
            PollOption {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                idx: 0,
                label: "Fri 7pm".into(),
                starts_at: start,
                ends_at: start + Duration::hours(2),
            },
            PollOption {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                idx: 1,
                label: "Sat 2pm".into(),
                starts_at: start + Duration::hours(19),
                ends_at: start + Duration::hours(21),
            },
        ];
        let recipients = vec![PollRecipient {
            poll_id: poll.id,
            phone: invitee.into(),
            name: "Ana".into(),
            responded_at: None,
        }];
        db.insert_poll(&poll, &options, &recipients).await.unwrap();

        let reply = processor.process(member_msg(invitee, "1")).await;
        assert_eq!(reply.action, "poll_reply");
        assert_eq!(classifier.calls(), 0);
        assert_eq!(db.poll_stats(poll.id).await.unwrap().responded, 1);

        // A member with nothing pending gets the restricted help text.
        let reply = processor.process(member_msg("+15550007777", "hello")).await;
        assert_eq!(reply.action, "member_help");
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn chat_with_nothing_pending_is_clarified() {
        let (processor, db, _) = processor(vec![Classification {
            action: Some(Action::Chat),
            slots: SlotValues::default(),
            confidence: 0.4,
            raw_action: "chat".into(),
        }])
        .await;
        let owner = "+15550008888";
        db.upsert_contact(owner, "Riley").await.unwrap();

        let reply = processor.process(owner_msg(owner, "hmm interesting")).await;
        assert_eq!(reply.action, "chat");
        assert!(reply.content.contains("help"));
        // Nothing was persisted for the clarification.
        assert!(db.get_conversation(owner).await.unwrap().is_none());
    }
}
