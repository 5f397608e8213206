//! Session registry and control dispatch.
//!
//! The registry maps `tracker:<guild_id>:<queue_number>` to the live
//! actor's mailbox. Control requests are forwarded there; sessions that
//! have no actor anymore (stopped, or persisted before a restart) are
//! answered from the key-value record instead.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::dao::kv_store::decode_value;
use crate::dao::storage::StorageError;
use crate::dto::control::StartRequest;
use crate::dto::view::SessionSummary;
use crate::error::ServiceError;
use crate::services::tracker_actor::{
    self, ControlReply, RefreshOutcome, RepostOutcome, TrackerCommand, TrackerHandle,
};
use crate::services::view_service;
use crate::state::session::{PlayerInfo, TRACKER_KEY_PREFIX, TeamSlot, storage_key};
use crate::state::{DEFAULT_DISPATCH_TIMEOUT, SessionStatus, SharedState, TrackerSession};

use indexmap::IndexMap;

/// Create a session, post (or adopt) its live message and spawn its actor.
pub async fn start(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    request: StartRequest,
) -> Result<TrackerSession, ServiceError> {
    if let Some(echoed) = request.queue_number {
        if echoed != queue_number {
            return Err(ServiceError::InvalidInput(format!(
                "queue number {echoed} in the body does not match {queue_number} in the path"
            )));
        }
    }

    let key = storage_key(guild_id, queue_number);
    if live_handle(state, &key).is_some() {
        return Err(ServiceError::InvalidState(format!(
            "queue {queue_number} is already being tracked"
        )));
    }

    let mut players = IndexMap::new();
    for player in &request.players {
        players.insert(
            player.id.clone(),
            PlayerInfo {
                display_name: player
                    .display_name
                    .clone()
                    .unwrap_or_else(|| player.id.clone()),
            },
        );
    }
    let teams = request
        .teams
        .iter()
        .enumerate()
        .map(|(index, team)| TeamSlot {
            name: team
                .name
                .clone()
                .unwrap_or_else(|| default_team_name(index)),
            player_ids: team.player_ids.clone(),
        })
        .collect();

    let mut session = TrackerSession::new(
        guild_id.to_owned(),
        queue_number,
        request.channel_id,
        request.user_id,
        request.guild_name,
        players,
        teams,
        OffsetDateTime::now_utc(),
        request.queue_start_time,
    );
    session.live_message_id = request.live_message_id;

    if session.live_message_id.is_none() {
        let embed = view_service::render_embed(&session, None, &state.config().tracker);
        let payload = view_service::message_payload(embed);
        match state
            .messenger()
            .post(session.channel_id.clone(), payload)
            .await
        {
            Ok(message_id) => {
                if message_id.is_some() {
                    session.channel_manage_permission = Some(true);
                }
                session.live_message_id = message_id;
            }
            Err(error) => {
                if error.is_permission_denied() {
                    session.channel_manage_permission = Some(false);
                }
                warn!(
                    guild_id = %session.guild_id,
                    queue_number,
                    %error,
                    "failed to post the live message; tracking without one"
                );
            }
        }
    }

    persist_session(state, &key, &session).await?;
    let handle = tracker_actor::spawn(state.clone(), session.clone());
    state.trackers().insert(key, handle);
    info!(
        guild_id = %session.guild_id,
        queue_number,
        players = session.players.len(),
        "session started"
    );
    Ok(session)
}

/// Pause the session's polling.
pub async fn pause(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
) -> Result<ControlReply, ServiceError> {
    dispatch(state, guild_id, queue_number, |reply| TrackerCommand::Pause {
        reply,
    })
    .await?
}

/// Resume a paused session.
pub async fn resume(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
) -> Result<ControlReply, ServiceError> {
    dispatch(state, guild_id, queue_number, |reply| {
        TrackerCommand::Resume { reply }
    })
    .await?
}

/// Stop the session for good.
pub async fn stop(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
) -> Result<ControlReply, ServiceError> {
    dispatch(state, guild_id, queue_number, |reply| TrackerCommand::Stop {
        reply,
    })
    .await?
}

/// Force an out-of-band poll, subject to the refresh cooldown.
pub async fn refresh(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    match_completed: bool,
) -> Result<RefreshOutcome, ServiceError> {
    dispatch(state, guild_id, queue_number, |reply| {
        TrackerCommand::Refresh {
            match_completed,
            reply,
        }
    })
    .await?
}

/// Swap a roster player, returning the affected team index.
pub async fn substitute(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    player_out: String,
    player_in: String,
    display_name: Option<String>,
) -> Result<usize, ServiceError> {
    dispatch(state, guild_id, queue_number, |reply| {
        TrackerCommand::Substitute {
            player_out,
            player_in,
            display_name,
            reply,
        }
    })
    .await?
}

/// Move the live message to a new handle. Works on stopped sessions too,
/// where only the stored record is updated.
pub async fn repost(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    new_message_id: String,
) -> Result<RepostOutcome, ServiceError> {
    let result = dispatch(state, guild_id, queue_number, |reply| {
        TrackerCommand::Repost {
            new_message_id: new_message_id.clone(),
            reply,
        }
    })
    .await;
    match result {
        Ok(outcome) => Ok(outcome),
        Err(ServiceError::InvalidState(_)) => {
            repost_stored(state, guild_id, queue_number, new_message_id).await
        }
        Err(error) => Err(error),
    }
}

/// Current session snapshot, from the actor when one is live, otherwise
/// from storage.
pub async fn status(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
) -> Result<Box<TrackerSession>, ServiceError> {
    let key = storage_key(guild_id, queue_number);
    if let Some(handle) = live_handle(state, &key) {
        let (tx, rx) = oneshot::channel();
        if handle.send(TrackerCommand::Status { reply: tx }).await.is_ok() {
            match timeout(DEFAULT_DISPATCH_TIMEOUT, rx).await {
                Ok(Ok(snapshot)) => return Ok(snapshot),
                Ok(Err(_)) => {}
                Err(_) => return Err(ServiceError::Timeout),
            }
        }
    }

    match load_session(state, &key).await? {
        Some(session) => Ok(Box::new(session)),
        None => Err(missing_session_error(state, guild_id, queue_number).await),
    }
}

/// Summaries of every known session, stored and live.
pub async fn list(state: &SharedState) -> Result<Vec<SessionSummary>, ServiceError> {
    let mut summaries: BTreeMap<String, SessionSummary> = BTreeMap::new();

    if let Some(store) = state.kv_store().await {
        let keys = store
            .keys_with_prefix(TRACKER_KEY_PREFIX.to_owned())
            .await?;
        for key in keys {
            let Some(value) = state.writes().read_through(&key).await? else {
                continue;
            };
            match decode_value::<TrackerSession>(&key, value) {
                Ok(session) => {
                    summaries.insert(key, SessionSummary::from(&session));
                }
                Err(error) => warn!(%key, %error, "skipping undecodable session record"),
            }
        }
    }

    let live: Vec<(String, TrackerHandle)> = state
        .trackers()
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    for (key, handle) in live {
        let (tx, rx) = oneshot::channel();
        if handle.send(TrackerCommand::Status { reply: tx }).await.is_err() {
            continue;
        }
        if let Ok(Ok(snapshot)) = timeout(DEFAULT_DISPATCH_TIMEOUT, rx).await {
            summaries.insert(key, SessionSummary::from(snapshot.as_ref()));
        }
    }

    Ok(summaries.into_values().collect())
}

/// Respawn actors for persisted sessions that are still live.
pub async fn restore_sessions(state: &SharedState) -> Result<usize, ServiceError> {
    let Some(store) = state.kv_store().await else {
        return Err(ServiceError::Degraded);
    };
    let keys = store
        .keys_with_prefix(TRACKER_KEY_PREFIX.to_owned())
        .await?;

    let mut restored = 0;
    for key in keys {
        if live_handle(state, &key).is_some() {
            continue;
        }
        let Some(value) = store.get(key.clone()).await? else {
            continue;
        };
        let session = match decode_value::<TrackerSession>(&key, value) {
            Ok(session) => session,
            Err(error) => {
                warn!(%key, %error, "skipping undecodable session record");
                continue;
            }
        };
        if !session.is_live() {
            continue;
        }
        let handle = tracker_actor::spawn(state.clone(), session);
        state.trackers().insert(key, handle);
        restored += 1;
    }
    if restored > 0 {
        info!(restored, "restored persisted sessions");
    }
    Ok(restored)
}

/// Background task: run the restore pass once storage first comes up.
pub async fn restore_on_storage_ready(state: SharedState) {
    let mut watcher = state.degraded_watcher();
    loop {
        if !*watcher.borrow_and_update() {
            match restore_sessions(&state).await {
                Ok(_) => return,
                Err(error) => warn!(%error, "session restore failed; waiting for storage"),
            }
        }
        if watcher.changed().await.is_err() {
            return;
        }
    }
}

/// Live actor handle under `key`, dropping dead registry entries on the way.
fn live_handle(state: &SharedState, key: &str) -> Option<TrackerHandle> {
    let handle = state.trackers().get(key).map(|entry| entry.value().clone())?;
    if handle.is_closed() {
        state.trackers().remove(key);
        return None;
    }
    Some(handle)
}

/// Forward one command to the session's actor and await its reply.
async fn dispatch<T>(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    build: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand,
) -> Result<T, ServiceError> {
    let key = storage_key(guild_id, queue_number);
    let Some(handle) = live_handle(state, &key) else {
        return Err(missing_session_error(state, guild_id, queue_number).await);
    };

    let (tx, rx) = oneshot::channel();
    if handle.send(build(tx)).await.is_err() {
        return Err(missing_session_error(state, guild_id, queue_number).await);
    }
    match timeout(DEFAULT_DISPATCH_TIMEOUT, rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(missing_session_error(state, guild_id, queue_number).await),
        Err(_) => Err(ServiceError::Timeout),
    }
}

/// Classify a session that has no live actor.
async fn missing_session_error(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
) -> ServiceError {
    let key = storage_key(guild_id, queue_number);
    match load_session(state, &key).await {
        Ok(Some(session)) if session.status == SessionStatus::Stopped => {
            ServiceError::InvalidState(format!("queue {queue_number} is already stopped"))
        }
        Ok(Some(_)) => {
            ServiceError::InvalidState(format!("queue {queue_number} is not running"))
        }
        Ok(None) => {
            if state.is_degraded().await {
                ServiceError::Degraded
            } else {
                ServiceError::NotFound(format!(
                    "no session for guild `{guild_id}` queue {queue_number}"
                ))
            }
        }
        Err(error) => error,
    }
}

async fn load_session(
    state: &SharedState,
    key: &str,
) -> Result<Option<TrackerSession>, ServiceError> {
    let Some(value) = state.writes().read_through(key).await? else {
        return Ok(None);
    };
    let session = decode_value::<TrackerSession>(key, value)?;
    Ok(Some(session))
}

async fn persist_session(
    state: &SharedState,
    key: &str,
    session: &TrackerSession,
) -> Result<(), ServiceError> {
    let value = serde_json::to_value(session)
        .map_err(|source| ServiceError::from(StorageError::corrupt(key, source)))?;
    state.writes().enqueue(key.to_owned(), value, None).await;
    Ok(())
}

async fn repost_stored(
    state: &SharedState,
    guild_id: &str,
    queue_number: u32,
    new_message_id: String,
) -> Result<RepostOutcome, ServiceError> {
    let key = storage_key(guild_id, queue_number);
    let Some(mut session) = load_session(state, &key).await? else {
        return Err(missing_session_error(state, guild_id, queue_number).await);
    };
    let old_message_id = session.live_message_id.replace(new_message_id.clone());
    persist_session(state, &key, &session).await?;
    info!(
        guild_id,
        queue_number,
        %new_message_id,
        "live message of a stored session reposted"
    );
    Ok(RepostOutcome {
        old_message_id,
        new_message_id,
    })
}

fn default_team_name(index: usize) -> String {
    format!("Team {}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use serde_json::Value;
    use uuid::Uuid;

    use crate::config::AppConfig;
    use crate::dao::kv_store::memory::MemoryKvStore;
    use crate::dao::kv_store::SharedKv;
    use crate::dao::messenger::{Messenger, MessengerResult};
    use crate::dao::write_coalescer::WriteCoalescer;
    use crate::dto::control::{PlayerInput, TeamInput};
    use crate::state::AppState;
    use crate::upstream::client::{MatchSource, UpstreamError};
    use crate::upstream::models::{MatchRecord, MatchStub, PlayerSkill};

    struct SilentSource;

    impl MatchSource for SilentSource {
        fn recent_matches(
            &self,
            _player_id: String,
            _count: u32,
        ) -> BoxFuture<'static, Result<Vec<MatchStub>, UpstreamError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn match_stats(
            &self,
            _match_id: Uuid,
        ) -> BoxFuture<'static, Result<MatchRecord, UpstreamError>> {
            Box::pin(async {
                Err(UpstreamError::Status {
                    status: reqwest::StatusCode::NOT_FOUND,
                    path: "stats".to_owned(),
                    detail: None,
                })
            })
        }

        fn match_skill(
            &self,
            _match_id: Uuid,
            _player_ids: Vec<String>,
        ) -> BoxFuture<'static, Result<Vec<PlayerSkill>, UpstreamError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn medal_metadata(&self) -> BoxFuture<'static, Result<Value, UpstreamError>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[derive(Default)]
    struct PostingMessenger {
        posts: Mutex<Vec<String>>,
    }

    impl Messenger for PostingMessenger {
        fn post(
            &self,
            channel_id: String,
            _payload: Value,
        ) -> BoxFuture<'static, MessengerResult<Option<String>>> {
            self.posts.lock().unwrap().push(channel_id);
            Box::pin(async { Ok(Some("m-1".to_owned())) })
        }

        fn edit(
            &self,
            _channel_id: String,
            _message_id: String,
            _payload: Value,
        ) -> BoxFuture<'static, MessengerResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        state: SharedState,
        messenger: Arc<PostingMessenger>,
    }

    async fn harness(with_store: bool) -> Harness {
        let messenger = Arc::new(PostingMessenger::default());
        let kv = SharedKv::new();
        let writes = Arc::new(WriteCoalescer::new(kv.clone(), 64));
        let state = AppState::new(
            AppConfig::default(),
            kv,
            writes,
            Arc::new(SilentSource),
            messenger.clone(),
        );
        if with_store {
            state.install_kv_store(Arc::new(MemoryKvStore::new())).await;
        }
        Harness { state, messenger }
    }

    fn request() -> StartRequest {
        StartRequest {
            user_id: "user-1".to_owned(),
            channel_id: "channel-1".to_owned(),
            guild_name: Some("Guild One".to_owned()),
            queue_number: None,
            interaction_token: None,
            live_message_id: None,
            players: vec![
                PlayerInput {
                    id: "alpha".to_owned(),
                    display_name: Some("ALPHA".to_owned()),
                },
                PlayerInput {
                    id: "bravo".to_owned(),
                    display_name: None,
                },
            ],
            teams: vec![
                TeamInput {
                    name: None,
                    player_ids: vec!["alpha".to_owned()],
                },
                TeamInput {
                    name: Some("Cobra".to_owned()),
                    player_ids: vec!["bravo".to_owned()],
                },
            ],
            queue_start_time: OffsetDateTime::from_unix_timestamp(1_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn start_posts_a_message_and_registers_the_actor() {
        let h = harness(true).await;

        let session = start(&h.state, "guild-1", 7, request()).await.unwrap();

        assert_eq!(session.live_message_id.as_deref(), Some("m-1"));
        assert_eq!(session.teams[0].name, "Team 1");
        assert_eq!(session.teams[1].name, "Cobra");
        assert_eq!(session.players["bravo"].display_name, "bravo");
        assert_eq!(h.messenger.posts.lock().unwrap().len(), 1);
        assert!(live_handle(&h.state, "tracker:guild-1:7").is_some());

        let stored = h
            .state
            .writes()
            .read_through("tracker:guild-1:7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["status"], "active");
    }

    #[tokio::test]
    async fn starting_a_live_queue_twice_conflicts() {
        let h = harness(true).await;
        start(&h.state, "guild-1", 7, request()).await.unwrap();

        let rejected = start(&h.state, "guild-1", 7, request()).await;
        assert!(matches!(rejected, Err(ServiceError::InvalidState(_))));

        // A stopped queue can be started again.
        stop(&h.state, "guild-1", 7).await.unwrap();
        start(&h.state, "guild-1", 7, request()).await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_queue_echo_is_rejected() {
        let h = harness(true).await;
        let mut payload = request();
        payload.queue_number = Some(9);

        let rejected = start(&h.state, "guild-1", 7, payload).await;
        assert!(matches!(rejected, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn status_of_a_stopped_session_comes_from_storage() {
        let h = harness(true).await;
        start(&h.state, "guild-1", 7, request()).await.unwrap();
        stop(&h.state, "guild-1", 7).await.unwrap();

        let snapshot = status(&h.state, "guild-1", 7).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Stopped);

        let rejected = pause(&h.state, "guild-1", 7).await.unwrap_err();
        assert!(matches!(&rejected, ServiceError::InvalidState(m) if m.contains("stopped")));
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_found() {
        let h = harness(true).await;
        let missing = status(&h.state, "guild-1", 7).await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn reads_without_storage_report_degraded() {
        let h = harness(false).await;
        let missing = status(&h.state, "guild-1", 7).await;
        assert!(matches!(missing, Err(ServiceError::Degraded)));
    }

    #[tokio::test]
    async fn restore_respawns_only_live_sessions() {
        let h = harness(true).await;
        let store = h.state.kv_store().await.unwrap();

        let live = start(&h.state, "guild-1", 1, request()).await.unwrap();
        h.state.writes().flush_now().await;
        let mut stopped = live.clone();
        stopped.queue_number = 2;
        stopped.status = SessionStatus::Stopped;
        store
            .put(
                "tracker:guild-1:2".to_owned(),
                serde_json::to_value(&stopped).unwrap(),
                None,
            )
            .await
            .unwrap();
        let mut paused = live.clone();
        paused.queue_number = 3;
        paused.status = SessionStatus::Paused;
        store
            .put(
                "tracker:guild-1:3".to_owned(),
                serde_json::to_value(&paused).unwrap(),
                None,
            )
            .await
            .unwrap();

        // Queue 1 already has its actor; 2 is terminal; 3 must respawn.
        let restored = restore_sessions(&h.state).await.unwrap();
        assert_eq!(restored, 1);
        assert!(live_handle(&h.state, "tracker:guild-1:3").is_some());
        assert!(live_handle(&h.state, "tracker:guild-1:2").is_none());

        let reply = resume(&h.state, "guild-1", 3).await.unwrap();
        assert_eq!(reply.session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn repost_on_a_stopped_session_updates_the_record() {
        let h = harness(true).await;
        start(&h.state, "guild-1", 7, request()).await.unwrap();
        stop(&h.state, "guild-1", 7).await.unwrap();

        let outcome = repost(&h.state, "guild-1", 7, "m-2".to_owned())
            .await
            .unwrap();
        assert_eq!(outcome.old_message_id.as_deref(), Some("m-1"));
        assert_eq!(outcome.new_message_id, "m-2");

        let snapshot = status(&h.state, "guild-1", 7).await.unwrap();
        assert_eq!(snapshot.live_message_id.as_deref(), Some("m-2"));
    }

    #[tokio::test]
    async fn list_merges_stored_and_live_sessions() {
        let h = harness(true).await;
        let store = h.state.kv_store().await.unwrap();

        start(&h.state, "guild-1", 1, request()).await.unwrap();
        let mut stopped = start(&h.state, "guild-1", 2, request()).await.unwrap();
        stop(&h.state, "guild-1", 2).await.unwrap();
        stopped.status = SessionStatus::Stopped;
        store
            .put(
                "tracker:guild-1:2".to_owned(),
                serde_json::to_value(&stopped).unwrap(),
                None,
            )
            .await
            .unwrap();

        let summaries = list(&h.state).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].queue_number, 1);
        assert_eq!(summaries[0].status, SessionStatus::Active);
        assert_eq!(summaries[1].queue_number, 2);
        assert_eq!(summaries[1].status, SessionStatus::Stopped);
    }
}
