//! Per-session actor owning the tracker state machine.
//!
//! Every mutation of one session flows through its actor's mailbox, so
//! control actions and timer-driven poll cycles are serialized without
//! locks. A poll cycle always runs to completion and persists before the
//! next wake-up is armed, so cycles for one session never overlap.

use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::services::{poll_service, view_service};
use crate::state::session::ViewFingerprint;
use crate::state::{SessionAction, SessionStatus, SharedState, TrackerSession, next_status};
use crate::upstream::models::PlayerSkill;

const MAILBOX_CAPACITY: usize = 16;

/// Snapshot reply to a lifecycle command, with the freshly rendered
/// message body when the visible state moved.
pub struct ControlReply {
    pub session: Box<TrackerSession>,
    pub embed_data: Option<Value>,
}

/// What a forced refresh did.
pub enum RefreshOutcome {
    /// The cycle ran cleanly.
    Refreshed(Box<TrackerSession>),
    /// The request landed inside the cooldown window; nothing was mutated.
    Cooldown { retry_in: Duration },
    /// The cycle ran and failed; the snapshot carries the error state.
    Failed(Box<TrackerSession>),
}

/// Result of relocating the live message.
pub struct RepostOutcome {
    pub old_message_id: Option<String>,
    pub new_message_id: String,
}

/// Control messages a session actor accepts.
pub enum TrackerCommand {
    Pause {
        reply: oneshot::Sender<Result<ControlReply, ServiceError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<ControlReply, ServiceError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<ControlReply, ServiceError>>,
    },
    Refresh {
        match_completed: bool,
        reply: oneshot::Sender<Result<RefreshOutcome, ServiceError>>,
    },
    Substitute {
        player_out: String,
        player_in: String,
        display_name: Option<String>,
        reply: oneshot::Sender<Result<usize, ServiceError>>,
    },
    Repost {
        new_message_id: String,
        reply: oneshot::Sender<RepostOutcome>,
    },
    Status {
        reply: oneshot::Sender<Box<TrackerSession>>,
    },
}

/// Cloneable mailbox handle registered under `guild_id:queue_number`.
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerCommand>,
}

impl TrackerHandle {
    /// Queue a command for the actor. The command comes back when the
    /// actor has already exited.
    pub async fn send(&self, command: TrackerCommand) -> Result<(), TrackerCommand> {
        self.sender.send(command).await.map_err(|rejected| rejected.0)
    }

    /// Whether the actor behind this handle is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawn the actor owning `session` and return the handle to register.
pub fn spawn(state: SharedState, session: TrackerSession) -> TrackerHandle {
    let (sender, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(TrackerActor::new(state, session, mailbox).run());
    TrackerHandle { sender }
}

struct TrackerActor {
    state: SharedState,
    session: TrackerSession,
    mailbox: mpsc::Receiver<TrackerCommand>,
    next_wake: Option<Instant>,
    last_rendered: Option<ViewFingerprint>,
}

/// Sleep until the armed wake-up, or forever when none is armed.
async fn wake_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl TrackerActor {
    fn new(
        state: SharedState,
        session: TrackerSession,
        mailbox: mpsc::Receiver<TrackerCommand>,
    ) -> Self {
        let next_wake = (session.status == SessionStatus::Active && !session.is_paused)
            .then(|| Instant::now() + poll_delay(&state, &session));
        // The start flow renders the first message before spawning, so
        // the current fingerprint counts as already pushed.
        let last_rendered = Some(session.fingerprint());
        Self {
            state,
            session,
            mailbox,
            next_wake,
            last_rendered,
        }
    }

    async fn run(mut self) {
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            status = %self.session.status,
            "session actor started"
        );
        loop {
            tokio::select! {
                command = self.mailbox.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                _ = wake_timer(self.next_wake) => {
                    self.next_wake = None;
                    self.run_poll().await;
                }
            }
        }
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            "session actor exited"
        );
    }

    /// Apply one control command. Returns `false` when the actor should
    /// shut down.
    async fn handle_command(&mut self, command: TrackerCommand) -> bool {
        match command {
            TrackerCommand::Pause { reply } => {
                let _ = reply.send(self.handle_pause().await);
            }
            TrackerCommand::Resume { reply } => {
                let _ = reply.send(self.handle_resume().await);
            }
            TrackerCommand::Stop { reply } => {
                let result = self.handle_stop().await;
                let terminal = result.is_ok();
                let _ = reply.send(result);
                if terminal {
                    return false;
                }
            }
            TrackerCommand::Refresh {
                match_completed,
                reply,
            } => {
                let _ = reply.send(self.handle_refresh(match_completed).await);
            }
            TrackerCommand::Substitute {
                player_out,
                player_in,
                display_name,
                reply,
            } => {
                let _ = reply.send(
                    self.handle_substitute(player_out, player_in, display_name)
                        .await,
                );
            }
            TrackerCommand::Repost {
                new_message_id,
                reply,
            } => {
                let _ = reply.send(self.handle_repost(new_message_id).await);
            }
            TrackerCommand::Status { reply } => {
                let _ = reply.send(Box::new(self.session.clone()));
            }
        }
        true
    }

    async fn handle_pause(&mut self) -> Result<ControlReply, ServiceError> {
        self.session.status = next_status(self.session.status, SessionAction::Pause)?;
        self.session.is_paused = true;
        self.session.last_update_time = OffsetDateTime::now_utc();
        self.next_wake = None;
        self.persist().await;
        let embed_data = self.push_view(false).await;
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            "session paused"
        );
        Ok(ControlReply {
            session: Box::new(self.session.clone()),
            embed_data,
        })
    }

    async fn handle_resume(&mut self) -> Result<ControlReply, ServiceError> {
        self.session.status = next_status(self.session.status, SessionAction::Resume)?;
        self.session.is_paused = false;
        self.session.last_update_time = OffsetDateTime::now_utc();
        self.persist().await;
        let embed_data = self.push_view(false).await;
        self.next_wake = Some(Instant::now() + poll_delay(&self.state, &self.session));
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            "session resumed"
        );
        Ok(ControlReply {
            session: Box::new(self.session.clone()),
            embed_data,
        })
    }

    async fn handle_stop(&mut self) -> Result<ControlReply, ServiceError> {
        self.session.status = next_status(self.session.status, SessionAction::Stop)?;
        self.session.last_update_time = OffsetDateTime::now_utc();
        self.next_wake = None;

        // Final view gets the per-player rank decoration when the
        // provider can serve it.
        let skills = self.final_skills().await;
        let embed = self.render(skills.as_deref());
        self.persist().await;
        view_service::broadcast_state(&self.state, &self.session).await;
        self.edit_message(embed.clone()).await;
        self.last_rendered = Some(self.session.fingerprint());

        self.state
            .feeds()
            .remove(&self.session.guild_id, self.session.queue_number);
        self.state.trackers().remove(&self.session.storage_key());
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            matches = self.session.matches.len(),
            score = %self.session.render_series_score(),
            "session stopped"
        );
        Ok(ControlReply {
            session: Box::new(self.session.clone()),
            embed_data: Some(embed),
        })
    }

    async fn handle_refresh(&mut self, match_completed: bool) -> Result<RefreshOutcome, ServiceError> {
        next_status(self.session.status, SessionAction::Refresh)?;
        let now = OffsetDateTime::now_utc();
        if !match_completed {
            if let Some(retry_in) = self.cooldown_remaining(now) {
                debug!(
                    guild_id = %self.session.guild_id,
                    queue_number = self.session.queue_number,
                    retry_in = ?retry_in,
                    "refresh rejected by cooldown"
                );
                return Ok(RefreshOutcome::Cooldown { retry_in });
            }
        }
        self.session.last_refresh_attempt = Some(now);

        let outcome = poll_service::run_cycle(&self.state, &mut self.session).await;
        self.persist().await;
        self.push_view(false).await;
        if self.session.status == SessionStatus::Active {
            self.next_wake = Some(Instant::now() + outcome.next_delay);
        }

        let snapshot = Box::new(self.session.clone());
        Ok(match outcome.error {
            None => RefreshOutcome::Refreshed(snapshot),
            Some(_) => RefreshOutcome::Failed(snapshot),
        })
    }

    async fn handle_substitute(
        &mut self,
        player_out: String,
        player_in: String,
        display_name: Option<String>,
    ) -> Result<usize, ServiceError> {
        next_status(self.session.status, SessionAction::Substitute)?;
        let team_index = self
            .session
            .substitute(
                &player_out,
                &player_in,
                display_name,
                OffsetDateTime::now_utc(),
            )
            .map_err(|rejected| ServiceError::InvalidInput(rejected.to_string()))?;
        self.persist().await;
        self.push_view(false).await;
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            %player_out,
            %player_in,
            team_index,
            "substitution applied"
        );
        Ok(team_index)
    }

    async fn handle_repost(&mut self, new_message_id: String) -> RepostOutcome {
        let old_message_id = self.session.live_message_id.replace(new_message_id.clone());
        // The fresh handle gets a fresh permission probe.
        self.session.channel_manage_permission = None;
        self.persist().await;
        // Same fingerprint, but the replacement message starts empty.
        self.push_view(true).await;
        info!(
            guild_id = %self.session.guild_id,
            queue_number = self.session.queue_number,
            %new_message_id,
            "live message reposted"
        );
        RepostOutcome {
            old_message_id,
            new_message_id,
        }
    }

    /// One timer-driven poll cycle. A wake-up that raced a status change
    /// is a no-op and does not re-arm.
    async fn run_poll(&mut self) {
        if self.session.status != SessionStatus::Active || self.session.is_paused {
            return;
        }
        let outcome = poll_service::run_cycle(&self.state, &mut self.session).await;
        self.persist().await;
        self.push_view(false).await;
        if self.session.status == SessionStatus::Active {
            self.next_wake = Some(Instant::now() + outcome.next_delay);
        }
    }

    /// Push the view to the feed and the live message when the
    /// fingerprint moved. Returns the rendered embed when it did.
    async fn push_view(&mut self, force: bool) -> Option<Value> {
        let fingerprint = self.session.fingerprint();
        if !force && self.last_rendered == Some(fingerprint) {
            return None;
        }
        view_service::broadcast_state(&self.state, &self.session).await;
        let embed = self.render(None);
        self.edit_message(embed.clone()).await;
        self.last_rendered = Some(fingerprint);
        Some(embed)
    }

    /// Edit the live message, memoizing the relay's permission verdict.
    /// A memoized denial suppresses further edits until a repost clears it.
    async fn edit_message(&mut self, embed: Value) {
        let Some(message_id) = self.session.live_message_id.clone() else {
            return;
        };
        if self.session.channel_manage_permission == Some(false) {
            return;
        }
        let payload = view_service::message_payload(embed);
        match self
            .state
            .messenger()
            .edit(self.session.channel_id.clone(), message_id, payload)
            .await
        {
            Ok(()) => {
                if self.session.channel_manage_permission != Some(true) {
                    self.session.channel_manage_permission = Some(true);
                    self.persist().await;
                }
            }
            Err(error) if error.is_permission_denied() => {
                warn!(
                    guild_id = %self.session.guild_id,
                    queue_number = self.session.queue_number,
                    channel_id = %self.session.channel_id,
                    "relay denied the message edit; suspending edits"
                );
                self.session.channel_manage_permission = Some(false);
                self.persist().await;
            }
            Err(error) => {
                warn!(
                    guild_id = %self.session.guild_id,
                    queue_number = self.session.queue_number,
                    %error,
                    "failed to edit live message"
                );
            }
        }
    }

    fn render(&self, skills: Option<&[PlayerSkill]>) -> Value {
        view_service::render_embed(&self.session, skills, &self.state.config().tracker)
    }

    async fn persist(&self) {
        match serde_json::to_value(&self.session) {
            Ok(value) => {
                self.state
                    .writes()
                    .enqueue(self.session.storage_key(), value, None)
                    .await;
            }
            Err(error) => warn!(
                key = %self.session.storage_key(),
                %error,
                "failed to serialize session for persistence"
            ),
        }
    }

    fn cooldown_remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        let last = self.session.last_refresh_attempt?;
        let cooldown = self.state.config().tracker.refresh_cooldown.as_secs() as i64;
        let elapsed = (now - last).whole_seconds().max(0);
        (elapsed < cooldown).then(|| Duration::from_secs((cooldown - elapsed) as u64))
    }

    async fn final_skills(&self) -> Option<Vec<PlayerSkill>> {
        let last = self.session.matches.last()?;
        let roster = self.session.roster();
        match self
            .state
            .match_source()
            .match_skill(last.match_id, roster)
            .await
        {
            Ok(skills) if !skills.is_empty() => Some(skills),
            Ok(_) => None,
            Err(error) => {
                debug!(error = %error, "skill fetch for the final view failed");
                None
            }
        }
    }
}

/// Delay until the next poll, longer while the session is in backoff.
fn poll_delay(state: &SharedState, session: &TrackerSession) -> Duration {
    state
        .config()
        .tracker
        .backoff_delay(session.error_state.consecutive_errors)
}
