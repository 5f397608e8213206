//! Wire types served by the stats provider.
//!
//! Payloads are decoded leniently: collections default to empty and
//! cosmetic fields to blanks, so a provider-side field addition never stops
//! a series mid-flight.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{TimestampMilliSeconds, serde_as};
use time::OffsetDateTime;
use uuid::Uuid;

/// Envelope of a recent-history answer for one player.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchHistory {
    #[serde(default)]
    pub matches: Vec<MatchStub>,
}

/// One recent-history row; just enough to decide series membership.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStub {
    pub id: Uuid,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub started_at: OffsetDateTime,
}

/// Full per-match stats payload.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct MatchStats {
    pub id: Uuid,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub started_at: OffsetDateTime,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub map: NamedAsset,
    #[serde(default)]
    pub mode: NamedAsset,
    #[serde(default)]
    pub teams: Vec<TeamStats>,
}

/// Name wrapper used for maps and modes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedAsset {
    #[serde(default)]
    pub name: String,
}

/// Per-team result inside a match payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TeamStats {
    /// Provider-side team index within the match.
    pub id: usize,
    #[serde(default)]
    pub score: i64,
    /// `won` / `lost` / `tied` when the provider scores outcomes itself.
    #[serde(default)]
    pub outcome: Option<String>,
}

/// Decoded stats paired with the raw payload they were decoded from, for
/// consumers that want fields the condensed form drops.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub stats: MatchStats,
    pub raw: Value,
}

/// Envelope of a per-match skill answer.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillResponse {
    #[serde(default)]
    pub skills: Vec<PlayerSkill>,
}

/// Skill numbers for one player in one match.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSkill {
    pub player_id: String,
    #[serde(default)]
    pub csr: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_rows_decode_epoch_millis() {
        let history: MatchHistory = serde_json::from_value(json!({
            "matches": [
                {"id": "7f3f9063-2c1f-4b62-9e0e-42d3a1a8b1aa", "started_at": 1_700_000_000_000i64}
            ]
        }))
        .unwrap();
        assert_eq!(history.matches.len(), 1);
        assert_eq!(
            history.matches[0].started_at.unix_timestamp(),
            1_700_000_000
        );
    }

    #[test]
    fn match_stats_tolerate_missing_cosmetics() {
        let stats: MatchStats = serde_json::from_value(json!({
            "id": "7f3f9063-2c1f-4b62-9e0e-42d3a1a8b1aa",
            "started_at": 1_700_000_000_000i64,
            "teams": [
                {"id": 0, "score": 50, "outcome": "won"},
                {"id": 1, "score": 49}
            ]
        }))
        .unwrap();
        assert_eq!(stats.map.name, "");
        assert_eq!(stats.duration_ms, 0);
        assert_eq!(stats.teams[0].outcome.as_deref(), Some("won"));
        assert_eq!(stats.teams[1].score, 49);
    }
}
