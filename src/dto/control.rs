use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{TimestampMilliSeconds, serde_as};
use time::OffsetDateTime;
use utoipa::ToSchema;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::dto::{
    validation::{validate_distinct_ids, validate_non_blank},
    view::SessionView,
};

/// Roster entry supplied when starting a session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PlayerInput {
    /// Provider-side player identifier.
    pub id: String,
    /// Optional display name; the id doubles as the name when absent.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Team definition supplied when starting a session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TeamInput {
    /// Team label; a default is derived from the slot index when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Player ids on this team. Every id must appear in `players`.
    pub player_ids: Vec<String>,
}

/// Payload used to start tracking a series.
#[serde_as]
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StartRequest {
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_name: Option<String>,
    /// Optional echo of the path parameter; rejected when they disagree.
    #[serde(default)]
    pub queue_number: Option<u32>,
    /// Accepted for compatibility with interaction-driven clients; the
    /// relay addresses channels directly, so the token is not used.
    #[serde(default)]
    pub interaction_token: Option<String>,
    /// Existing chat message to take over instead of posting a new one.
    #[serde(default)]
    pub live_message_id: Option<String>,
    pub players: Vec<PlayerInput>,
    pub teams: Vec<TeamInput>,
    /// Matches started before this instant never join the series.
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    #[schema(value_type = i64)]
    pub queue_start_time: OffsetDateTime,
}

impl Validate for StartRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_non_blank(&self.user_id, "user_id") {
            errors.add("user_id", e);
        }
        if let Err(e) = validate_non_blank(&self.channel_id, "channel_id") {
            errors.add("channel_id", e);
        }

        if self.players.is_empty() {
            errors.add("players", required("players", "at least one player is required"));
        }
        for player in &self.players {
            if let Err(e) = validate_non_blank(&player.id, "player_id") {
                errors.add("players", e);
            }
        }
        if let Err(e) = validate_distinct_ids(
            self.players.iter().map(|player| player.id.as_str()),
            "players",
        ) {
            errors.add("players", e);
        }

        if self.teams.is_empty() {
            errors.add("teams", required("teams", "at least one team is required"));
        }
        let known: HashSet<&str> = self.players.iter().map(|player| player.id.as_str()).collect();
        for team in &self.teams {
            if team.player_ids.is_empty() {
                errors.add("teams", required("teams", "teams must not be empty"));
            }
            for id in &team.player_ids {
                if !known.contains(id.as_str()) {
                    let mut e = ValidationError::new("unknown_player");
                    e.message = Some(format!("team references unknown player `{id}`").into());
                    errors.add("teams", e);
                }
            }
        }
        if let Err(e) = validate_distinct_ids(
            self.teams
                .iter()
                .flat_map(|team| team.player_ids.iter().map(String::as_str)),
            "teams",
        ) {
            errors.add("teams", e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Payload of a manual refresh.
#[derive(Debug, Clone, Default, Deserialize, ToSchema, Validate)]
pub struct RefreshRequest {
    /// Set when the caller knows a match just finished; bypasses the
    /// refresh cooldown.
    #[serde(default)]
    pub match_completed: bool,
}

/// Payload of a roster swap.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubstitutionRequest {
    pub player_out_id: String,
    pub player_in_id: String,
    /// Display name of the incoming player; the id doubles as the name
    /// when absent.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Validate for SubstitutionRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_non_blank(&self.player_out_id, "player_out_id") {
            errors.add("player_out_id", e);
        }
        if let Err(e) = validate_non_blank(&self.player_in_id, "player_in_id") {
            errors.add("player_in_id", e);
        }
        if !self.player_out_id.trim().is_empty() && self.player_out_id == self.player_in_id {
            let mut e = ValidationError::new("same_player");
            e.message = Some("a player cannot replace itself".into());
            errors.add("player_in_id", e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Payload moving the live message to a new chat message.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RepostRequest {
    pub new_message_id: String,
}

impl Validate for RepostRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(e) = validate_non_blank(&self.new_message_id, "new_message_id") {
            errors.add("new_message_id", e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn required(code: &'static str, message: &'static str) -> ValidationError {
    let mut e = ValidationError::new(code);
    e.message = Some(message.into());
    e
}

/// Envelope returned by control mutations.
#[derive(Debug, Serialize, ToSchema)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub embed_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    /// Successful action with the resulting session view.
    pub fn ok(state: SessionView) -> Self {
        Self {
            success: true,
            state: Some(state),
            embed_data: None,
            error: None,
            message: None,
        }
    }

    /// Successful action that also re-rendered the chat embed.
    pub fn ok_with_embed(state: SessionView, embed_data: Option<Value>) -> Self {
        Self {
            success: true,
            state: Some(state),
            embed_data,
            error: None,
            message: None,
        }
    }

    /// A refresh bounced off the cooldown window; state is untouched.
    pub fn cooldown(message: String) -> Self {
        Self {
            success: false,
            state: None,
            embed_data: None,
            error: Some("cooldown".to_owned()),
            message: Some(message),
        }
    }

    /// A refresh ran but the poll cycle failed; the view still moves.
    pub fn failed(state: SessionView) -> Self {
        Self {
            success: false,
            state: Some(state),
            embed_data: None,
            error: None,
            message: None,
        }
    }
}

/// Body of a successful substitution.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubstitutionResponse {
    pub success: bool,
    pub substitution: SubstitutionResult,
}

/// The applied roster swap.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubstitutionResult {
    pub player_out_id: String,
    pub player_in_id: String,
    pub team_index: usize,
}

/// Body of a successful repost.
#[derive(Debug, Serialize, ToSchema)]
pub struct RepostResponse {
    pub success: bool,
    pub old_message_id: Option<String>,
    pub new_message_id: String,
}

/// Body of a status read.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub state: SessionView,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_request(value: Value) -> StartRequest {
        serde_json::from_value(value).unwrap()
    }

    fn valid_start() -> Value {
        json!({
            "user_id": "user-1",
            "channel_id": "channel-1",
            "players": [
                {"id": "alpha"},
                {"id": "bravo", "display_name": "Bravo"}
            ],
            "teams": [
                {"name": "Eagle", "player_ids": ["alpha"]},
                {"player_ids": ["bravo"]}
            ],
            "queue_start_time": 1_700_000_000_000i64
        })
    }

    #[test]
    fn full_start_payload_passes_validation() {
        let request = start_request(valid_start());
        assert!(request.validate().is_ok());
        assert_eq!(request.queue_start_time.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn team_membership_must_reference_known_players() {
        let mut payload = valid_start();
        payload["teams"][0]["player_ids"] = json!(["alpha", "ghost"]);
        assert!(start_request(payload).validate().is_err());
    }

    #[test]
    fn one_player_cannot_sit_on_two_teams() {
        let mut payload = valid_start();
        payload["teams"][1]["player_ids"] = json!(["alpha"]);
        assert!(start_request(payload).validate().is_err());
    }

    #[test]
    fn substitution_requires_two_distinct_players() {
        let request = SubstitutionRequest {
            player_out_id: "alpha".to_owned(),
            player_in_id: "alpha".to_owned(),
            display_name: None,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn cooldown_response_has_the_distinct_shape() {
        let response = ControlResponse::cooldown("retry in 12s".to_owned());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"], json!("cooldown"));
        assert!(value.get("state").is_none());
    }
}
