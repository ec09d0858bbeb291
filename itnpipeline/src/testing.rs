//! Fixtures partagées par les tests du pipeline.

use chrono::Utc;
use itnstore::{Song, SongMetadata, SongStatus};

/// Morceau de test minimal.
pub fn song_fixture(id: &str, order_index: i64) -> Song {
    Song {
        id: id.to_string(),
        playlist_id: "pl-1".to_string(),
        order_index,
        prompt_epoch: 0,
        is_interrupt: false,
        status: SongStatus::Pending,
        prompt: None,
        ace_task_id: None,
        ace_submitted_at: None,
        metadata: SongMetadata {
            title: Some("Neon Rain".to_string()),
            artist: Some("Static Veil".to_string()),
            ..SongMetadata::default()
        },
        audio_url: None,
        storage_path: None,
        cover_url: None,
        user_rating: None,
        persona_extract: None,
        error_message: None,
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
