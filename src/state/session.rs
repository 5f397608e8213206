use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{TimestampMilliSeconds, serde_as};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::state::lifecycle::SessionStatus;
use crate::upstream::models::MatchStats;

/// Storage key prefix shared by every persisted session.
pub const TRACKER_KEY_PREFIX: &str = "tracker:";

/// Emblems used when rendering the series score of a two-team session.
pub const TEAM_EMBLEMS: [&str; 2] = ["\u{1f985}", "\u{1f40d}"];

/// Number of consecutive poll failures after which the error is surfaced
/// on the live view instead of being retried silently.
pub const ERROR_DISPLAY_THRESHOLD: u32 = 2;

/// Build the storage key for a session.
pub fn storage_key(guild_id: &str, queue_number: u32) -> String {
    format!("{TRACKER_KEY_PREFIX}{guild_id}:{queue_number}")
}

/// Display information for a player that appeared on a roster at some
/// point of the series. Entries are never removed so that substituted
/// players keep their display name in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Name shown on the live view.
    pub display_name: String,
}

/// One team slot of the session roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSlot {
    /// Team label shown on the live view.
    pub name: String,
    /// Player identifiers currently on the team.
    pub player_ids: Vec<String>,
}

/// A roster swap recorded during the series.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    /// Index of the team the swap happened on.
    pub team_index: usize,
    /// Player that left the roster.
    pub player_out: String,
    /// Player that took the slot.
    pub player_in: String,
    /// When the swap was recorded.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub at: OffsetDateTime,
}

/// Everything the live view needs about one discovered match.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    /// Provider-side match identifier.
    pub match_id: Uuid,
    /// Map the match was played on.
    pub map_name: String,
    /// Game mode of the match.
    pub mode_name: String,
    /// When the match started.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub started_at: OffsetDateTime,
    /// Match duration in milliseconds.
    pub duration_ms: u64,
    /// Final score per team, ordered by team index.
    pub team_scores: Vec<i64>,
    /// Index of the winning team, `None` for ties and unknown outcomes.
    pub winning_team: Option<usize>,
}

impl MatchSummary {
    /// Condense full provider stats into what the view renders.
    pub fn from_stats(stats: &MatchStats) -> Self {
        let mut teams = stats.teams.clone();
        teams.sort_by_key(|team| team.id);

        let winning_team = teams
            .iter()
            .position(|team| matches!(team.outcome.as_deref(), Some("win" | "won")))
            .or_else(|| {
                let best = teams.iter().enumerate().max_by_key(|(_, team)| team.score)?;
                let tied = teams
                    .iter()
                    .filter(|team| team.score == best.1.score)
                    .count();
                (tied == 1).then_some(best.0)
            });

        Self {
            match_id: stats.id,
            map_name: stats.map.name.clone(),
            mode_name: stats.mode.name.clone(),
            started_at: stats.started_at,
            duration_ms: stats.duration_ms,
            team_scores: teams.iter().map(|team| team.score).collect(),
            winning_team,
        }
    }
}

/// Poll failure bookkeeping for one session.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorState {
    /// Failures since the last successful poll cycle.
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the most recent failure happened.
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub last_error_at: Option<OffsetDateTime>,
}

impl ErrorState {
    /// Whether the failure streak is long enough to surface on the view.
    pub fn should_display(&self) -> bool {
        self.consecutive_errors >= ERROR_DISPLAY_THRESHOLD
    }
}

/// A row of the merged series history, ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    /// A discovered match.
    Match(MatchSummary),
    /// A roster swap.
    Substitution(Substitution),
}

impl TimelineEntry {
    fn at(&self) -> OffsetDateTime {
        match self {
            TimelineEntry::Match(summary) => summary.started_at,
            TimelineEntry::Substitution(substitution) => substitution.at,
        }
    }
}

/// Everything the rendered view depends on, condensed into a comparable
/// value. Messenger edits and feed frames are skipped when the
/// fingerprint did not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewFingerprint {
    /// Lifecycle status shown on the view.
    pub status: SessionStatus,
    /// Number of discovered matches.
    pub match_count: usize,
    /// Number of recorded substitutions.
    pub substitution_count: usize,
    /// Consecutive failures feeding the error footer.
    pub error_streak: u32,
}

/// Reasons a roster swap can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
    /// The outgoing player is not on any team.
    #[error("player {0} is not on a team")]
    PlayerNotOnTeam(String),
    /// The incoming player already occupies a slot.
    #[error("player {0} is already on a team")]
    PlayerAlreadyOnTeam(String),
}

/// The full persisted state of one tracked series.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSession {
    /// Guild the session belongs to.
    pub guild_id: String,
    /// Queue number inside the guild. Together with `guild_id` this
    /// uniquely identifies the session.
    pub queue_number: u32,
    /// Human readable guild name, when the caller provided one.
    #[serde(default)]
    pub guild_name: Option<String>,
    /// Channel the live message lives in.
    pub channel_id: String,
    /// User that started the session.
    pub user_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Pause flag mirrored by `pause`/`resume`. Poll gating consults it
    /// together with `status`.
    #[serde(default)]
    pub is_paused: bool,
    /// When the session was started.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub start_time: OffsetDateTime,
    /// Matches must have started after this instant to count towards
    /// the series.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub search_start_time: OffsetDateTime,
    /// Last time the session state was touched.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub last_update_time: OffsetDateTime,
    /// Completed poll cycles.
    #[serde(default)]
    pub check_count: u32,
    /// Last poll cycle that finished without an error.
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub last_success_time: Option<OffsetDateTime>,
    /// Last manual refresh, used for the cooldown window.
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub last_refresh_attempt: Option<OffsetDateTime>,
    /// Display information for every player that ever appeared on a
    /// roster, keyed by player identifier.
    #[serde(default)]
    pub players: IndexMap<String, PlayerInfo>,
    /// Current team rosters.
    #[serde(default)]
    pub teams: Vec<TeamSlot>,
    /// Roster swaps in the order they were recorded.
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    /// Discovered matches ordered by start time. Append only.
    #[serde(default)]
    pub matches: Vec<MatchSummary>,
    /// Raw provider payload of every discovered match, keyed by match id.
    /// Kept so feed consumers get fields the condensed summary drops.
    #[serde(default)]
    pub raw_matches: IndexMap<String, Value>,
    /// Poll failure bookkeeping.
    #[serde(default)]
    pub error_state: ErrorState,
    /// Messenger-side identifier of the live message, when one exists.
    #[serde(default)]
    pub live_message_id: Option<String>,
    /// Memoized outcome of the last relay permission probe. `Some(false)`
    /// suspends message edits until a repost resets it.
    #[serde(default)]
    pub channel_manage_permission: Option<bool>,
}

impl TrackerSession {
    /// Create a fresh active session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: String,
        queue_number: u32,
        channel_id: String,
        user_id: String,
        guild_name: Option<String>,
        players: IndexMap<String, PlayerInfo>,
        teams: Vec<TeamSlot>,
        start_time: OffsetDateTime,
        search_start_time: OffsetDateTime,
    ) -> Self {
        Self {
            guild_id,
            queue_number,
            guild_name,
            channel_id,
            user_id,
            status: SessionStatus::Active,
            is_paused: false,
            start_time,
            search_start_time,
            last_update_time: start_time,
            check_count: 0,
            last_success_time: None,
            last_refresh_attempt: None,
            players,
            teams,
            substitutions: Vec::new(),
            matches: Vec::new(),
            raw_matches: IndexMap::new(),
            error_state: ErrorState::default(),
            live_message_id: None,
            channel_manage_permission: None,
        }
    }

    /// Storage key of this session.
    pub fn storage_key(&self) -> String {
        storage_key(&self.guild_id, self.queue_number)
    }

    /// Whether the session still reacts to control actions.
    pub fn is_live(&self) -> bool {
        self.status != SessionStatus::Stopped
    }

    /// Player identifiers currently on a team, in team order.
    pub fn roster(&self) -> Vec<String> {
        self.teams
            .iter()
            .flat_map(|team| team.player_ids.iter().cloned())
            .collect()
    }

    /// Index of the team `player_id` currently plays on.
    pub fn team_index_of(&self, player_id: &str) -> Option<usize> {
        self.teams
            .iter()
            .position(|team| team.player_ids.iter().any(|id| id == player_id))
    }

    /// Record newly discovered matches, skipping ones already known.
    /// Returns how many were actually inserted. The match list stays
    /// ordered by start time.
    pub fn record_matches(&mut self, discovered: Vec<(MatchSummary, Value)>) -> usize {
        let mut inserted = 0;
        for (summary, raw) in discovered {
            if self.matches.iter().any(|known| known.match_id == summary.match_id) {
                continue;
            }
            self.raw_matches.insert(summary.match_id.to_string(), raw);
            self.matches.push(summary);
            inserted += 1;
        }
        if inserted > 0 {
            self.matches.sort_by_key(|summary| summary.started_at);
        }
        inserted
    }

    /// Matches won per team, ordered by team index.
    pub fn series_score(&self) -> Vec<u32> {
        let mut score = vec![0u32; self.teams.len()];
        for summary in &self.matches {
            if let Some(winner) = summary.winning_team {
                if let Some(slot) = score.get_mut(winner) {
                    *slot += 1;
                }
            }
        }
        score
    }

    /// Render the series score the way the live view displays it, for
    /// example `🦅 1:1 🐍` for a two-team session.
    pub fn render_series_score(&self) -> String {
        let score = self.series_score();
        if let [left, right] = score[..] {
            return format!(
                "{} {left}:{right} {}",
                TEAM_EMBLEMS[0], TEAM_EMBLEMS[1]
            );
        }
        score
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Swap `player_out` for `player_in` on the team the outgoing player
    /// currently occupies. Returns the team index the swap happened on.
    pub fn substitute(
        &mut self,
        player_out: &str,
        player_in: &str,
        display_name: Option<String>,
        at: OffsetDateTime,
    ) -> Result<usize, SubstitutionError> {
        let team_index = self
            .team_index_of(player_out)
            .ok_or_else(|| SubstitutionError::PlayerNotOnTeam(player_out.to_owned()))?;
        if self.team_index_of(player_in).is_some() {
            return Err(SubstitutionError::PlayerAlreadyOnTeam(player_in.to_owned()));
        }

        let team = &mut self.teams[team_index];
        for slot in &mut team.player_ids {
            if slot == player_out {
                *slot = player_in.to_owned();
                break;
            }
        }

        self.players
            .entry(player_in.to_owned())
            .or_insert_with(|| PlayerInfo {
                display_name: display_name.unwrap_or_else(|| player_in.to_owned()),
            });
        self.substitutions.push(Substitution {
            team_index,
            player_out: player_out.to_owned(),
            player_in: player_in.to_owned(),
            at,
        });
        self.last_update_time = at;

        Ok(team_index)
    }

    /// Matches and substitutions merged into one history, ordered by
    /// timestamp. Rows sharing a timestamp keep their recording order.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = self
            .matches
            .iter()
            .cloned()
            .map(TimelineEntry::Match)
            .chain(
                self.substitutions
                    .iter()
                    .cloned()
                    .map(TimelineEntry::Substitution),
            )
            .collect();
        entries.sort_by_key(TimelineEntry::at);
        entries
    }

    /// Condensed view state, compared across mutations to decide whether
    /// the live message and feed need updating.
    pub fn fingerprint(&self) -> ViewFingerprint {
        ViewFingerprint {
            status: self.status,
            match_count: self.matches.len(),
            substitution_count: self.substitutions.len(),
            error_streak: self.error_state.consecutive_errors,
        }
    }

    /// Record a failed poll cycle.
    pub fn note_error(&mut self, message: String, at: OffsetDateTime) {
        self.error_state.consecutive_errors += 1;
        self.error_state.last_error = Some(message);
        self.error_state.last_error_at = Some(at);
        self.last_update_time = at;
    }

    /// Record a successful poll cycle.
    pub fn note_success(&mut self, at: OffsetDateTime) {
        self.error_state = ErrorState::default();
        self.check_count += 1;
        self.last_success_time = Some(at);
        self.last_update_time = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::models::{NamedAsset, TeamStats};

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(seconds).unwrap()
    }

    fn session() -> TrackerSession {
        let mut players = IndexMap::new();
        for id in ["alpha", "bravo", "charlie", "delta"] {
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
            Some("Test Guild".to_owned()),
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

    fn summary(id: u128, started: i64, winner: Option<usize>) -> MatchSummary {
        MatchSummary {
            match_id: Uuid::from_u128(id),
            map_name: "Aquarius".to_owned(),
            mode_name: "Slayer".to_owned(),
            started_at: at(started),
            duration_ms: 600_000,
            team_scores: vec![50, 48],
            winning_team: winner,
        }
    }

    fn row(id: u128, started: i64, winner: Option<usize>) -> (MatchSummary, Value) {
        (summary(id, started, winner), Value::Null)
    }

    #[test]
    fn recording_a_known_match_again_changes_nothing() {
        let mut session = session();
        assert_eq!(session.record_matches(vec![row(1, 1_100, Some(0))]), 1);
        assert_eq!(session.record_matches(vec![row(1, 1_100, Some(0))]), 0);
        assert_eq!(session.matches.len(), 1);
        assert_eq!(session.raw_matches.len(), 1);
        assert_eq!(session.series_score(), vec![1, 0]);
    }

    #[test]
    fn matches_stay_ordered_by_start_time() {
        let mut session = session();
        session.record_matches(vec![row(2, 1_400, Some(1))]);
        session.record_matches(vec![row(1, 1_100, Some(0))]);

        let order: Vec<_> = session
            .matches
            .iter()
            .map(|summary| summary.match_id)
            .collect();
        assert_eq!(order, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }

    #[test]
    fn series_score_never_decreases_as_matches_arrive() {
        let mut session = session();
        let mut previous = session.series_score();
        for (id, winner) in [(1, Some(0)), (2, Some(1)), (3, None), (4, Some(0))] {
            session.record_matches(vec![row(id, 1_000 + id as i64 * 100, winner)]);
            let current = session.series_score();
            assert!(
                previous
                    .iter()
                    .zip(&current)
                    .all(|(before, after)| after >= before)
            );
            previous = current;
        }
        assert_eq!(previous, vec![2, 1]);
    }

    #[test]
    fn two_team_score_renders_with_emblems() {
        let mut session = session();
        session.record_matches(vec![row(1, 1_100, Some(0)), row(2, 1_200, Some(1))]);
        assert_eq!(session.render_series_score(), "\u{1f985} 1:1 \u{1f40d}");
    }

    #[test]
    fn substitution_swaps_the_slot_and_keeps_history() {
        let mut session = session();
        let team = session
            .substitute("bravo", "echo", Some("ECHO".to_owned()), at(2_000))
            .unwrap();

        assert_eq!(team, 0);
        assert_eq!(
            session.teams[0].player_ids,
            vec!["alpha".to_owned(), "echo".to_owned()]
        );
        // The departed player keeps its display entry.
        assert!(session.players.contains_key("bravo"));
        assert_eq!(session.players["echo"].display_name, "ECHO");
        assert_eq!(session.substitutions.len(), 1);
        assert_eq!(session.substitutions[0].player_out, "bravo");
    }

    #[test]
    fn substitution_rejects_bad_rosters() {
        let mut session = session();
        assert_eq!(
            session.substitute("nobody", "echo", None, at(2_000)),
            Err(SubstitutionError::PlayerNotOnTeam("nobody".to_owned()))
        );
        assert_eq!(
            session.substitute("alpha", "delta", None, at(2_000)),
            Err(SubstitutionError::PlayerAlreadyOnTeam("delta".to_owned()))
        );
    }

    #[test]
    fn timeline_interleaves_matches_and_substitutions() {
        let mut session = session();
        session.record_matches(vec![row(1, 1_100, Some(0))]);
        session
            .substitute("bravo", "echo", None, at(1_200))
            .unwrap();
        session.record_matches(vec![row(2, 1_300, Some(1))]);

        let timeline = session.timeline();
        assert_eq!(timeline.len(), 3);
        assert!(matches!(timeline[0], TimelineEntry::Match(_)));
        assert!(matches!(timeline[1], TimelineEntry::Substitution(_)));
        assert!(matches!(timeline[2], TimelineEntry::Match(_)));
    }

    #[test]
    fn fingerprint_moves_with_visible_state_only() {
        let mut session = session();
        let initial = session.fingerprint();

        // A quiet successful cycle leaves the rendered view untouched.
        session.note_success(at(1_500));
        assert_eq!(session.fingerprint(), initial);

        session.record_matches(vec![row(1, 1_100, Some(0))]);
        let with_match = session.fingerprint();
        assert_ne!(with_match, initial);

        session.note_error("boom".to_owned(), at(1_600));
        let with_error = session.fingerprint();
        assert_ne!(with_error, with_match);

        session.status = SessionStatus::Paused;
        assert_ne!(session.fingerprint(), with_error);
    }

    #[test]
    fn errors_accumulate_until_a_success_resets_them() {
        let mut session = session();
        session.note_error("boom".to_owned(), at(1_100));
        assert!(!session.error_state.should_display());
        session.note_error("boom again".to_owned(), at(1_200));
        assert!(session.error_state.should_display());
        assert_eq!(session.error_state.consecutive_errors, 2);

        session.note_success(at(1_300));
        assert_eq!(session.error_state, ErrorState::default());
        assert_eq!(session.check_count, 1);
    }

    #[test]
    fn winner_comes_from_outcome_then_score() {
        let stats = MatchStats {
            id: Uuid::from_u128(9),
            started_at: at(1_100),
            duration_ms: 540_000,
            map: NamedAsset {
                name: "Recharge".to_owned(),
            },
            mode: NamedAsset {
                name: "CTF".to_owned(),
            },
            teams: vec![
                TeamStats {
                    id: 0,
                    score: 3,
                    outcome: None,
                },
                TeamStats {
                    id: 1,
                    score: 4,
                    outcome: None,
                },
            ],
        };
        assert_eq!(MatchSummary::from_stats(&stats).winning_team, Some(1));

        let mut by_outcome = stats.clone();
        by_outcome.teams[0].outcome = Some("win".to_owned());
        by_outcome.teams[1].outcome = Some("loss".to_owned());
        assert_eq!(MatchSummary::from_stats(&by_outcome).winning_team, Some(0));

        let mut tied = stats;
        tied.teams[1].score = 3;
        assert_eq!(MatchSummary::from_stats(&tied).winning_team, None);
    }
}
