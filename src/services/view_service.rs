use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, warn};

use crate::{
    config::TrackerConfig,
    dto::{feed::FeedOutbound, view::SessionView},
    state::{SessionStatus, SharedState, TrackerSession, session::TimelineEntry},
    upstream::models::PlayerSkill,
};

/// Build the wire view of a session, priming the medal cache on first use.
pub async fn session_view(state: &SharedState, session: &TrackerSession) -> SessionView {
    let medals = ensure_medal_cache(state).await.map(|m| (*m).clone());
    SessionView::from_session(session, medals)
}

/// Medal metadata, fetched once per process and cached. A failed fetch is
/// logged and retried on the next call.
pub async fn ensure_medal_cache(state: &SharedState) -> Option<Arc<Value>> {
    {
        let cache = state.medal_cache().read().await;
        if let Some(medals) = cache.as_ref() {
            return Some(Arc::clone(medals));
        }
    }

    match state.match_source().medal_metadata().await {
        Ok(metadata) => {
            let medals = Arc::new(metadata);
            let mut cache = state.medal_cache().write().await;
            let entry = cache.get_or_insert_with(|| Arc::clone(&medals));
            Some(Arc::clone(entry))
        }
        Err(err) => {
            debug!(error = %err, "medal metadata fetch failed; serving views without it");
            None
        }
    }
}

/// Serialize one state frame for the session's feed.
pub async fn state_frame(state: &SharedState, session: &TrackerSession) -> Option<String> {
    let view = session_view(state, session).await;
    let frame = FeedOutbound::State {
        timestamp: epoch_ms(OffsetDateTime::now_utc()),
        data: view,
    };
    match serde_json::to_string(&frame) {
        Ok(serialized) => Some(serialized),
        Err(err) => {
            warn!(error = %err, "failed to serialize feed frame");
            None
        }
    }
}

/// Serialize one state frame and fan it out to the session's feed.
pub async fn broadcast_state(state: &SharedState, session: &TrackerSession) {
    if let Some(serialized) = state_frame(state, session).await {
        state
            .feeds()
            .broadcast(&session.guild_id, session.queue_number, serialized.into());
    }
}

/// Wrap a rendered embed into the message body the relay expects.
pub fn message_payload(embed: Value) -> Value {
    json!({ "embeds": [embed] })
}

/// Render the chat embed hosted by the messenger relay.
///
/// Matches and substitutions are interleaved by timestamp, not by the
/// order they were recorded in.
pub fn render_embed(
    session: &TrackerSession,
    skills: Option<&[PlayerSkill]>,
    tracker: &TrackerConfig,
) -> Value {
    let mut fields = Vec::new();
    let mut game_number = 0usize;

    for entry in session.timeline() {
        match entry {
            TimelineEntry::Match(summary) => {
                game_number += 1;
                let scores = summary
                    .team_scores
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(" : ");
                fields.push(json!({
                    "name": format!("Game {game_number}: {}", summary.map_name),
                    "value": format!(
                        "{} | {scores} | {}",
                        summary.mode_name,
                        format_duration(summary.duration_ms)
                    ),
                    "inline": false,
                }));
            }
            TimelineEntry::Substitution(substitution) => {
                fields.push(json!({
                    "name": "Substitution",
                    "value": format!(
                        "{} in for {}",
                        display_name(session, &substitution.player_in),
                        display_name(session, &substitution.player_out)
                    ),
                    "inline": false,
                }));
            }
        }
    }

    if let Some(skills) = skills {
        if !skills.is_empty() {
            let lines = skills
                .iter()
                .map(|skill| {
                    let rank = skill
                        .csr
                        .map(|csr| csr.to_string())
                        .unwrap_or_else(|| "unranked".to_owned());
                    format!("{}: {rank}", display_name(session, &skill.player_id))
                })
                .collect::<Vec<_>>()
                .join("\n");
            fields.push(json!({"name": "Ranks", "value": lines, "inline": false}));
        }
    }

    let title = match &session.guild_name {
        Some(name) => format!("Queue #{} | {name}", session.queue_number),
        None => format!("Queue #{}", session.queue_number),
    };

    json!({
        "title": title,
        "description": session.render_series_score(),
        "color": status_color(session.status),
        "fields": fields,
        "footer": {"text": footer_text(session, tracker)},
        "timestamp": format_timestamp(session.last_update_time),
    })
}

fn footer_text(session: &TrackerSession, tracker: &TrackerConfig) -> String {
    let mut footer = format!("{} | checks: {}", session.status, session.check_count);
    let errors = &session.error_state;
    if errors.consecutive_errors == 0 {
        return footer;
    }

    if !errors.should_display() {
        footer.push_str(" | last check hit a snag; retrying");
        return footer;
    }

    let minutes = tracker
        .backoff_delay(errors.consecutive_errors)
        .as_secs()
        .div_ceil(60);
    footer.push_str(&format!(
        " | {} checks failed, next retry in {minutes}m",
        errors.consecutive_errors
    ));
    if let Some(last_error) = &errors.last_error {
        footer.push_str(&format!(" | {last_error}"));
    }
    footer
}

fn display_name<'a>(session: &'a TrackerSession, player_id: &'a str) -> &'a str {
    session
        .players
        .get(player_id)
        .map(|info| info.display_name.as_str())
        .unwrap_or(player_id)
}

fn status_color(status: SessionStatus) -> i64 {
    match status {
        SessionStatus::Active => 0x57F287,
        SessionStatus::Paused => 0xFEE75C,
        SessionStatus::Stopped => 0xED4245,
    }
}

fn format_duration(duration_ms: u64) -> String {
    let total_seconds = duration_ms / 1_000;
    format!("{}m {:02}s", total_seconds / 60, total_seconds % 60)
}

fn format_timestamp(time: OffsetDateTime) -> String {
    time.format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

fn epoch_ms(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}
