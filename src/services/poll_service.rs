use std::collections::{HashMap, HashSet};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{SharedState, TrackerSession, session::MatchSummary};

/// What one poll cycle did and when the next one should run.
#[derive(Debug)]
pub struct CycleOutcome {
    /// Matches inserted into the series by this cycle.
    pub new_matches: usize,
    /// Delay until the next timer wake-up.
    pub next_delay: Duration,
    /// Set when the cycle failed and entered backoff.
    pub error: Option<String>,
}

/// Run one poll cycle against the stats provider.
///
/// Discovery is quorum-gated: a candidate match must show up in the
/// recent history of enough roster players before its details are
/// fetched. Already-known matches are never refetched.
pub async fn run_cycle(state: &SharedState, session: &mut TrackerSession) -> CycleOutcome {
    let tracker = &state.config().tracker;
    let client = state.match_source();
    let now = OffsetDateTime::now_utc();
    let roster = session.roster();

    let mut appearances: HashMap<Uuid, usize> = HashMap::new();
    let mut candidates: HashMap<Uuid, OffsetDateTime> = HashMap::new();
    let mut successful_fetches = 0usize;
    let mut first_error: Option<String> = None;

    for player_id in &roster {
        match client
            .recent_matches(player_id.clone(), tracker.history_page_size)
            .await
        {
            Ok(stubs) => {
                successful_fetches += 1;
                let mut seen = HashSet::new();
                for stub in stubs {
                    if stub.started_at <= session.search_start_time {
                        continue;
                    }
                    if !seen.insert(stub.id) {
                        continue;
                    }
                    *appearances.entry(stub.id).or_insert(0) += 1;
                    candidates.entry(stub.id).or_insert(stub.started_at);
                }
            }
            Err(err) => {
                warn!(player = %player_id, error = %err, "recent history fetch failed");
                if first_error.is_none() {
                    first_error = Some(err.to_string());
                }
            }
        }
    }

    if successful_fetches == 0 && !roster.is_empty() {
        let message = first_error.unwrap_or_else(|| "recent history unavailable".to_owned());
        return fail_cycle(session, message, now, state);
    }

    let needed = quorum_count(roster.len(), tracker.discovery_quorum);
    let mut qualifying: Vec<(Uuid, OffsetDateTime)> = candidates
        .into_iter()
        .filter(|(id, _)| appearances.get(id).copied().unwrap_or(0) >= needed)
        .filter(|(id, _)| !session.matches.iter().any(|known| &known.match_id == id))
        .collect();
    qualifying.sort_by_key(|(_, started)| *started);
    let attempted = qualifying.len();

    let mut discovered = Vec::new();
    for (match_id, _) in qualifying {
        match client.match_stats(match_id).await {
            Ok(record) => {
                discovered.push((MatchSummary::from_stats(&record.stats), record.raw));
            }
            Err(err) => {
                warn!(%match_id, error = %err, "match detail fetch failed; retrying next cycle");
                if first_error.is_none() {
                    first_error = Some(err.to_string());
                }
            }
        }
    }

    // Every attempted detail fetch failing is an upstream outage, not a
    // partial cycle.
    if attempted > 0 && discovered.is_empty() {
        if let Some(message) = first_error {
            return fail_cycle(session, message, now, state);
        }
    }

    let new_matches = session.record_matches(discovered);
    if new_matches > 0 {
        info!(
            guild_id = %session.guild_id,
            queue_number = session.queue_number,
            new_matches,
            score = %session.render_series_score(),
            "discovered new matches"
        );
    }

    session.note_success(now);
    CycleOutcome {
        new_matches,
        next_delay: tracker.check_interval,
        error: None,
    }
}

fn fail_cycle(
    session: &mut TrackerSession,
    message: String,
    now: OffsetDateTime,
    state: &SharedState,
) -> CycleOutcome {
    session.note_error(message.clone(), now);
    let next_delay = state
        .config()
        .tracker
        .backoff_delay(session.error_state.consecutive_errors);
    warn!(
        guild_id = %session.guild_id,
        queue_number = session.queue_number,
        consecutive_errors = session.error_state.consecutive_errors,
        retry_in = ?next_delay,
        "poll cycle failed"
    );
    CycleOutcome {
        new_matches: 0,
        next_delay,
        error: Some(message),
    }
}

/// Number of roster players that must report a candidate match.
fn quorum_count(roster_size: usize, quorum: f64) -> usize {
    let needed = (roster_size as f64 * quorum).ceil() as usize;
    needed.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use reqwest::StatusCode;
    use serde_json::{Value, json};

    use crate::config::AppConfig;
    use crate::dao::kv_store::SharedKv;
    use crate::dao::messenger::NullMessenger;
    use crate::dao::write_coalescer::WriteCoalescer;
    use crate::state::AppState;
    use crate::state::session::{PlayerInfo, TeamSlot};
    use crate::upstream::client::{MatchSource, UpstreamError};
    use crate::upstream::models::{
        MatchRecord, MatchStats, MatchStub, NamedAsset, PlayerSkill, TeamStats,
    };
    use indexmap::IndexMap;

    #[derive(Default)]
    struct ScriptedSource {
        histories: HashMap<String, Vec<MatchStub>>,
        failing_players: HashSet<String>,
        stats: HashMap<Uuid, MatchStats>,
        failing_stats: HashSet<Uuid>,
        history_calls: Mutex<Vec<String>>,
        stats_calls: Mutex<Vec<Uuid>>,
    }

    fn upstream_down() -> UpstreamError {
        UpstreamError::Status {
            status: StatusCode::BAD_GATEWAY,
            path: "stats".to_owned(),
            detail: None,
        }
    }

    impl MatchSource for ScriptedSource {
        fn recent_matches(
            &self,
            player_id: String,
            _count: u32,
        ) -> BoxFuture<'static, Result<Vec<MatchStub>, UpstreamError>> {
            self.history_calls.lock().unwrap().push(player_id.clone());
            let result = if self.failing_players.contains(&player_id) {
                Err(upstream_down())
            } else {
                Ok(self.histories.get(&player_id).cloned().unwrap_or_default())
            };
            Box::pin(async move { result })
        }

        fn match_stats(
            &self,
            match_id: Uuid,
        ) -> BoxFuture<'static, Result<MatchRecord, UpstreamError>> {
            self.stats_calls.lock().unwrap().push(match_id);
            let result = if self.failing_stats.contains(&match_id) {
                Err(upstream_down())
            } else {
                match self.stats.get(&match_id) {
                    Some(stats) => Ok(MatchRecord {
                        stats: stats.clone(),
                        raw: json!({"id": match_id}),
                    }),
                    None => Err(upstream_down()),
                }
            };
            Box::pin(async move { result })
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

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(seconds).unwrap()
    }

    fn stub(id: u128, started: i64) -> MatchStub {
        MatchStub {
            id: Uuid::from_u128(id),
            started_at: at(started),
        }
    }

    fn stats(id: u128, started: i64, winner: usize) -> MatchStats {
        MatchStats {
            id: Uuid::from_u128(id),
            started_at: at(started),
            duration_ms: 600_000,
            map: NamedAsset {
                name: "Aquarius".to_owned(),
            },
            mode: NamedAsset {
                name: "Slayer".to_owned(),
            },
            teams: vec![
                TeamStats {
                    id: 0,
                    score: 50,
                    outcome: (winner == 0).then(|| "won".to_owned()),
                },
                TeamStats {
                    id: 1,
                    score: 48,
                    outcome: (winner == 1).then(|| "won".to_owned()),
                },
            ],
        }
    }

    fn session() -> TrackerSession {
        let ids = ["alpha", "bravo", "charlie", "delta"];
        let mut players = IndexMap::new();
        for id in ids {
            players.insert(
                id.to_owned(),
                PlayerInfo {
                    display_name: id.to_uppercase(),
                },
            );
        }
        TrackerSession::new(
            "guild-1".to_owned(),
            7,
            "channel-1".to_owned(),
            "user-1".to_owned(),
            None,
            players,
            vec![
                TeamSlot {
                    name: "Eagle".to_owned(),
                    player_ids: vec!["alpha".to_owned(), "bravo".to_owned()],
                },
                TeamSlot {
                    name: "Cobra".to_owned(),
                    player_ids: vec!["charlie".to_owned(), "delta".to_owned()],
                },
            ],
            at(1_000),
            at(1_000),
        )
    }

    fn test_state(source: ScriptedSource) -> (SharedState, Arc<ScriptedSource>) {
        let source = Arc::new(source);
        let kv = SharedKv::new();
        let writes = Arc::new(WriteCoalescer::new(kv.clone(), 64));
        let state = AppState::new(
            AppConfig::default(),
            kv,
            writes,
            source.clone(),
            Arc::new(NullMessenger),
        );
        (state, source)
    }

    #[tokio::test]
    async fn quorum_gates_discovery() {
        let mut source = ScriptedSource::default();
        // Match 1 shows up for half the roster, match 2 for one player only.
        source
            .histories
            .insert("alpha".to_owned(), vec![stub(1, 1_100), stub(2, 1_200)]);
        source.histories.insert("bravo".to_owned(), vec![stub(1, 1_100)]);
        source.stats.insert(Uuid::from_u128(1), stats(1, 1_100, 0));
        source.stats.insert(Uuid::from_u128(2), stats(2, 1_200, 1));
        let (state, source) = test_state(source);

        let mut session = session();
        let outcome = run_cycle(&state, &mut session).await;

        assert_eq!(outcome.new_matches, 1);
        assert_eq!(session.matches.len(), 1);
        assert_eq!(session.matches[0].match_id, Uuid::from_u128(1));
        assert_eq!(source.stats_calls.lock().unwrap().as_slice(), &[
            Uuid::from_u128(1)
        ]);
    }

    #[tokio::test]
    async fn known_matches_are_not_refetched() {
        let mut source = ScriptedSource::default();
        for player in ["alpha", "bravo", "charlie", "delta"] {
            source.histories.insert(player.to_owned(), vec![stub(1, 1_100)]);
        }
        source.stats.insert(Uuid::from_u128(1), stats(1, 1_100, 0));
        let (state, source) = test_state(source);

        let mut session = session();
        run_cycle(&state, &mut session).await;
        let second = run_cycle(&state, &mut session).await;

        assert_eq!(second.new_matches, 0);
        assert_eq!(session.matches.len(), 1);
        assert_eq!(session.check_count, 2);
        assert_eq!(source.stats_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn matches_before_the_search_window_are_ignored() {
        let mut source = ScriptedSource::default();
        for player in ["alpha", "bravo", "charlie", "delta"] {
            source
                .histories
                .insert(player.to_owned(), vec![stub(1, 900), stub(2, 1_000)]);
        }
        let (state, _source) = test_state(source);

        let mut session = session();
        let outcome = run_cycle(&state, &mut session).await;

        assert_eq!(outcome.new_matches, 0);
        assert!(session.matches.is_empty());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn all_history_failures_enter_backoff() {
        let mut source = ScriptedSource::default();
        for player in ["alpha", "bravo", "charlie", "delta"] {
            source.failing_players.insert(player.to_owned());
        }
        let (state, _source) = test_state(source);

        let mut session = session();
        let first = run_cycle(&state, &mut session).await;
        assert!(first.error.is_some());
        assert_eq!(first.next_delay, Duration::from_secs(60));
        assert_eq!(session.error_state.consecutive_errors, 1);
        assert_eq!(session.check_count, 0);

        let second = run_cycle(&state, &mut session).await;
        assert_eq!(second.next_delay, Duration::from_secs(120));
        assert_eq!(session.error_state.consecutive_errors, 2);
    }

    #[tokio::test]
    async fn partial_history_failures_still_discover() {
        let mut source = ScriptedSource::default();
        source.failing_players.insert("charlie".to_owned());
        source.failing_players.insert("delta".to_owned());
        source.histories.insert("alpha".to_owned(), vec![stub(1, 1_100)]);
        source.histories.insert("bravo".to_owned(), vec![stub(1, 1_100)]);
        source.stats.insert(Uuid::from_u128(1), stats(1, 1_100, 0));
        let (state, _source) = test_state(source);

        let mut session = session();
        let outcome = run_cycle(&state, &mut session).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.new_matches, 1);
        assert_eq!(session.error_state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn failed_detail_fetches_back_off_and_recover() {
        let mut source = ScriptedSource::default();
        for player in ["alpha", "bravo", "charlie", "delta"] {
            source.histories.insert(player.to_owned(), vec![stub(1, 1_100)]);
        }
        source.failing_stats.insert(Uuid::from_u128(1));
        let (state, source) = test_state(source);

        let mut session = session();
        let outcome = run_cycle(&state, &mut session).await;
        assert!(outcome.error.is_some());
        assert!(session.matches.is_empty());
        assert_eq!(session.error_state.consecutive_errors, 1);
        assert_eq!(source.stats_calls.lock().unwrap().len(), 1);

        // The provider recovers; the same candidate is retried.
        let mut recovered = ScriptedSource::default();
        for player in ["alpha", "bravo", "charlie", "delta"] {
            recovered
                .histories
                .insert(player.to_owned(), vec![stub(1, 1_100)]);
        }
        recovered.stats.insert(Uuid::from_u128(1), stats(1, 1_100, 0));
        let (state, _recovered) = test_state(recovered);
        let outcome = run_cycle(&state, &mut session).await;

        assert_eq!(outcome.new_matches, 1);
        assert_eq!(session.error_state.consecutive_errors, 0);
    }

    #[test]
    fn quorum_rounds_up_and_never_hits_zero() {
        assert_eq!(quorum_count(8, 0.5), 4);
        assert_eq!(quorum_count(5, 0.5), 3);
        assert_eq!(quorum_count(1, 0.5), 1);
        assert_eq!(quorum_count(4, 0.0), 1);
    }
}
