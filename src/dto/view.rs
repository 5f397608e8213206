use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use serde_with::{TimestampMilliSeconds, serde_as};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::{
    SessionStatus, TrackerSession,
    session::{MatchSummary, Substitution},
};

/// One session as served to control clients and pushed to feed subscribers.
#[serde_as]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionView {
    pub guild_id: String,
    pub guild_name: Option<String>,
    pub channel_id: String,
    pub queue_number: u32,
    pub status: SessionStatus,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    #[schema(value_type = i64)]
    pub last_update_time: OffsetDateTime,
    /// Display information keyed by player id, including substituted
    /// players that already left the rosters.
    #[schema(value_type = Object)]
    pub players: IndexMap<String, PlayerView>,
    pub teams: Vec<TeamView>,
    pub substitutions: Vec<SubstitutionView>,
    pub discovered_matches: Vec<MatchView>,
    /// Raw provider payloads keyed by match id.
    #[schema(value_type = Object)]
    pub raw_matches: IndexMap<String, Value>,
    /// Rendered series score, for example `🦅 2:1 🐍`.
    pub series_score: String,
    /// Provider medal metadata, once the process-wide cache is primed.
    #[schema(value_type = Option<Object>)]
    pub medal_metadata: Option<Value>,
}

impl SessionView {
    /// Project a session onto the wire shape.
    pub fn from_session(session: &TrackerSession, medal_metadata: Option<Value>) -> Self {
        Self {
            guild_id: session.guild_id.clone(),
            guild_name: session.guild_name.clone(),
            channel_id: session.channel_id.clone(),
            queue_number: session.queue_number,
            status: session.status,
            last_update_time: session.last_update_time,
            players: session
                .players
                .iter()
                .map(|(id, info)| {
                    (
                        id.clone(),
                        PlayerView {
                            display_name: info.display_name.clone(),
                        },
                    )
                })
                .collect(),
            teams: session
                .teams
                .iter()
                .map(|team| TeamView {
                    name: team.name.clone(),
                    player_ids: team.player_ids.clone(),
                })
                .collect(),
            substitutions: session.substitutions.iter().map(Into::into).collect(),
            discovered_matches: session.matches.iter().map(Into::into).collect(),
            raw_matches: session.raw_matches.clone(),
            series_score: session.render_series_score(),
            medal_metadata,
        }
    }
}

/// Display information of one player.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlayerView {
    pub display_name: String,
}

/// One team roster as currently composed.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TeamView {
    pub name: String,
    pub player_ids: Vec<String>,
}

/// One recorded roster swap.
#[serde_as]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubstitutionView {
    pub team_index: usize,
    pub player_out_id: String,
    pub player_in_id: String,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    #[schema(value_type = i64)]
    pub at: OffsetDateTime,
}

impl From<&Substitution> for SubstitutionView {
    fn from(substitution: &Substitution) -> Self {
        Self {
            team_index: substitution.team_index,
            player_out_id: substitution.player_out.clone(),
            player_in_id: substitution.player_in.clone(),
            at: substitution.at,
        }
    }
}

/// One discovered match, condensed for display.
#[serde_as]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchView {
    pub match_id: Uuid,
    pub map_name: String,
    pub mode_name: String,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    #[schema(value_type = i64)]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub team_scores: Vec<i64>,
    pub winning_team: Option<usize>,
}

impl From<&MatchSummary> for MatchView {
    fn from(summary: &MatchSummary) -> Self {
        Self {
            match_id: summary.match_id,
            map_name: summary.map_name.clone(),
            mode_name: summary.mode_name.clone(),
            started_at: summary.started_at,
            duration_ms: summary.duration_ms,
            team_scores: summary.team_scores.clone(),
            winning_team: summary.winning_team,
        }
    }
}

/// Condensed row of the `GET /trackers` listing.
#[serde_as]
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSummary {
    pub guild_id: String,
    pub queue_number: u32,
    pub status: SessionStatus,
    pub series_score: String,
    pub match_count: usize,
    pub check_count: u32,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    #[schema(value_type = i64)]
    pub last_update_time: OffsetDateTime,
}

impl From<&TrackerSession> for SessionSummary {
    fn from(session: &TrackerSession) -> Self {
        Self {
            guild_id: session.guild_id.clone(),
            queue_number: session.queue_number,
            status: session.status,
            series_score: session.render_series_score(),
            match_count: session.matches.len(),
            check_count: session.check_count,
            last_update_time: session.last_update_time,
        }
    }
}
