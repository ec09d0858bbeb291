//! SSE pour suivre les évènements de génération (morceaux + playlists).
//!
//! Route type : `GET /api/events?playlist_id=foo`

use axum::{
    extract::Query,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Router,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct EventsQuery {
    /// Filtrer sur une playlist précise (optionnel).
    #[serde(default)]
    pub playlist_id: Option<String>,
}

/// Handler SSE : diffuse les évènements du store.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "events",
    params(EventsQuery),
    responses(
        (status = 200, description = "Flux SSE des évènements de génération", content_type = "text/event-stream")
    )
)]
pub async fn generation_events_sse(Query(params): Query<EventsQuery>) -> impl IntoResponse {
    let mut rx = itnstore::get_store().subscribe();

    let stream = async_stream::stream! {
        while let Ok(event) = rx.recv().await {
            if let Some(filter) = &params.playlist_id {
                if event.playlist_id() != Some(filter.as_str()) {
                    continue;
                }
            }

            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok::<_, axum::Error>(Event::default().event("generation").data(json));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Router prêt à être monté (`/api/events`).
pub fn generation_events_router() -> Router {
    use axum::routing::get;

    Router::new().route("/api/events", get(generation_events_sse))
}
