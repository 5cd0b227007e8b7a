//! Deferred job scheduler — reminders, pause checks, auto-end.
//!
//! A ticker scans the queue on a fixed cadence. Every scan is idempotent:
//! jobs are claimed with a conditional pending→processing update, so a
//! duplicate or concurrent scan loses the claim and skips the job with no
//! side effect. After a claim the target poll's status is re-read; a job
//! whose kind no longer matches it is marked skipped rather than forcing
//! a transition.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{debug, error, info, warn};

use crate::config::{Cadence, SchedulerConfig};
use crate::conversation::{ConversationManager, WaitingFor};
use crate::engine::poll;
use crate::error::{DatabaseError, SchedulerError};
use crate::store::model::{DeferredJob, JobKind, JobStatus, PollStatus, SchedulingPoll};
use crate::store::Database;
use crate::transport::Transport;

/// Drains due jobs and drives poll lifecycle transitions.
pub struct Scheduler {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    conversations: ConversationManager,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            conversations: ConversationManager::new(db.clone()),
            db,
            transport,
            config,
        }
    }

    /// Run forever on the configured cadence. Scan failures are logged and
    /// the ticker keeps going.
    pub async fn run_forever(self) -> Result<(), SchedulerError> {
        match self.config.cadence.clone() {
            Cadence::Interval(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = self.run(Utc::now()).await {
                        error!(error = %e, "Scheduler scan failed");
                    }
                }
            }
            Cadence::Cron(expr) => {
                let schedule = Schedule::from_str(&expr)
                    .map_err(|e| SchedulerError::InvalidCadence(e.to_string()))?;
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        return Err(SchedulerError::InvalidCadence(
                            "schedule yields no upcoming fire times".into(),
                        ));
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                    if let Err(e) = self.run(Utc::now()).await {
                        error!(error = %e, "Scheduler scan failed");
                    }
                }
            }
        }
    }

    /// One scan: claim and process every due job. Idempotent under
    /// duplicate or concurrent invocation.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let due = self.db.due_jobs(now, self.config.claim_batch).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "Due jobs found");

        for job in due {
            if !self.db.claim_job(job.id).await? {
                debug!(job = %job.id, "Job claimed elsewhere, skipping");
                continue;
            }
            match self.process(&job, now).await {
                Ok(status) => {
                    self.db.finish_job(job.id, status).await?;
                    info!(job = %job.id, kind = %job.kind, status = %status, "Job finished");
                }
                Err(e) => {
                    error!(job = %job.id, kind = %job.kind, error = %e, "Job failed");
                    self.db.finish_job(job.id, JobStatus::Skipped).await?;
                }
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        job: &DeferredJob,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, SchedulerError> {
        // Authoritative status read after the claim. Stale jobs never
        // force a transition.
        let Some(poll) = self.db.get_poll(job.poll_id).await? else {
            return Err(SchedulerError::MissingPoll {
                id: job.id.to_string(),
                poll_id: job.poll_id.to_string(),
            });
        };

        match job.kind {
            JobKind::Reminder => {
                if poll.status != PollStatus::Running {
                    return Ok(JobStatus::Skipped);
                }
                self.send_reminders(&poll).await?;
                // The pause check follows the reminder; the pending-row
                // uniqueness constraint absorbs any duplicate.
                self.db
                    .enqueue_job(poll.id, JobKind::PauseCheck, now + self.config.pause_offset)
                    .await?;
                Ok(JobStatus::Processed)
            }
            JobKind::PauseCheck => {
                if poll.status != PollStatus::Running {
                    return Ok(JobStatus::Skipped);
                }
                if !self
                    .db
                    .transition_poll(poll.id, PollStatus::Running, PollStatus::Paused)
                    .await?
                {
                    return Ok(JobStatus::Skipped);
                }
                self.notify_owner_paused(&poll).await?;
                Ok(JobStatus::Processed)
            }
            JobKind::AutoEndCheck => {
                if poll.status == PollStatus::Stopped {
                    return Ok(JobStatus::Skipped);
                }
                let options = self.db.poll_options(poll.id).await?;
                // Still-open windows: wake again at the earliest one
                // instead of polling on a fixed interval.
                if let Some(next_end) = options
                    .iter()
                    .map(|o| o.ends_at)
                    .filter(|end| *end > now)
                    .min()
                {
                    self.db
                        .enqueue_job(poll.id, JobKind::AutoEndCheck, next_end)
                        .await?;
                    return Ok(JobStatus::Processed);
                }
                if !self
                    .db
                    .transition_poll(poll.id, poll.status, PollStatus::Stopped)
                    .await?
                {
                    return Ok(JobStatus::Skipped);
                }
                info!(poll = %poll.event_name, "Poll auto-ended");
                let stats = self.db.poll_stats(poll.id).await?;
                let body = format!(
                    "All suggested times for \"{}\" have passed, so I closed the poll.\n{}",
                    poll.event_name,
                    poll::render_stats(&poll, &options, &stats)
                );
                self.send(&poll.owner_key, &body).await;
                Ok(JobStatus::Processed)
            }
        }
    }

    /// Reminder text to everyone who has not answered yet.
    async fn send_reminders(&self, poll: &SchedulingPoll) -> Result<(), DatabaseError> {
        let pending = self.db.non_responders(poll.id).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let options = self.db.poll_options(poll.id).await?;
        let mut lines = vec![format!(
            "Reminder — still finding a time for \"{}\". What works?",
            poll.event_name
        )];
        for option in &options {
            lines.push(format!("{}. {}", option.idx + 1, option.label));
        }
        lines.push("Reply with the numbers that work (e.g. \"1 3\"), or \"none\".".to_string());
        let body = lines.join("\n");

        info!(poll = %poll.event_name, pending = pending.len(), "Sending reminders");
        for recipient in &pending {
            self.send(&recipient.phone, &body).await;
        }
        Ok(())
    }

    /// Stats plus the paused-poll menu to the owner, with the owner's
    /// conversation record tagged so their numbered reply resolves.
    async fn notify_owner_paused(&self, poll: &SchedulingPoll) -> Result<(), DatabaseError> {
        let options = self.db.poll_options(poll.id).await?;
        let stats = self.db.poll_stats(poll.id).await?;
        let body = format!(
            "{}\n{}",
            poll::render_stats(poll, &options, &stats),
            poll::paused_menu(poll)
        );

        let mut state = self.conversations.load(&poll.owner_key).await?;
        state.waiting_for = Some(WaitingFor::PollPausedMenu);
        state.touch("poll_paused");
        match self.conversations.save(&mut state).await {
            Ok(()) => {}
            // A concurrent inbound message won the record; the owner can
            // still say "check poll" to get back here.
            Err(DatabaseError::Conflict { .. }) => {
                warn!(owner = %poll.owner_key, "Lost the paused-menu record race");
            }
            Err(e) => return Err(e),
        }

        self.send(&poll.owner_key, &body).await;
        Ok(())
    }

    async fn send(&self, to: &str, body: &str) {
        if let Err(e) = self.transport.send(to, body).await {
            warn!(to, error = %e, "Scheduler send failed");
        }
    }
}
