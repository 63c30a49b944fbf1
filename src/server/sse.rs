use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream;
use serde::Serialize;

use crate::db::models::{Interaction, InteractionType};
use crate::server::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct InteractionPayload {
    id: i64,
    interaction_type: InteractionType,
    content: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Interaction> for InteractionPayload {
    fn from(i: &Interaction) -> Self {
        Self {
            id: i.id,
            interaction_type: i.interaction_type,
            content: i.content.clone(),
            created_at: i.created_at,
        }
    }
}

/// Tails one task's interaction log as Server-Sent Events. Polls the
/// database rather than threading a broadcast channel through the executor
/// — interactions are only ever produced by committing a row, so the table
/// itself is already the single source of truth the stream has to agree
/// with (§5: "database rows per task are the single source of truth").
pub async fn task_event_stream(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let last_id = state
        .db
        .list_interactions(&task_id)
        .ok()
        .and_then(|v| v.last().map(|i| i.id))
        .unwrap_or(0);

    let stream = stream::unfold((state, task_id, last_id), |(state, task_id, last_id)| async move {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let fresh: Vec<Interaction> = state
                .db
                .list_interactions(&task_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|i| i.id > last_id)
                .collect();
            if let Some(next_id) = fresh.last().map(|i| i.id) {
                let events: Vec<Result<Event, Infallible>> = fresh
                    .iter()
                    .map(|i| {
                        let payload = InteractionPayload::from(i);
                        Ok(Event::default()
                            .event("interaction")
                            .data(serde_json::to_string(&payload).unwrap_or_default()))
                    })
                    .collect();
                return Some((stream::iter(events), (state, task_id, next_id)));
            }
        }
    })
    .flatten();

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}
