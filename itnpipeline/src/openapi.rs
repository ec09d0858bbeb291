use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Infinitune Generation API",
        version = "0.1.0",
        description = "API REST du pipeline de génération (playlists, morceaux, files)",
    ),
    paths(
        crate::api::list_playlists,
        crate::api::create_playlist,
        crate::api::get_playlist,
        crate::api::delete_playlist,
        crate::api::steer_playlist,
        crate::api::heartbeat_playlist,
        crate::api::close_playlist,
        crate::api::playlist_queue,
        crate::api::update_position,
        crate::api::inject_interrupt,
        crate::api::rate_song,
        crate::api::retry_song,
        crate::api::song_played,
        crate::api::song_audio,
        crate::api::song_cover,
        crate::api::queue_snapshots,
        crate::sse::generation_events_sse,
    ),
    components(
        schemas(
            crate::api::PlaylistSummaryResponse,
            crate::api::PlaylistDetailResponse,
            crate::api::SongResponse,
            crate::api::CreatePlaylistRequest,
            crate::api::SteerRequest,
            crate::api::SteerResponse,
            crate::api::RateRequest,
            crate::api::PositionRequest,
            crate::api::InterruptRequest,
            crate::api::ErrorResponse,
        )
    ),
    tags(
        (name = "playlists", description = "Gestion des playlists générées"),
        (name = "songs", description = "Opérations sur les morceaux"),
        (name = "queues", description = "Diagnostics des files d'endpoints"),
        (name = "events", description = "Flux d'évènements")
    )
)]
pub struct ApiDoc;
