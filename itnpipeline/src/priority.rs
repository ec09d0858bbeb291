//! Calcul des priorités des files d'endpoints.
//!
//! Priorité croissante : plus petite = plus urgente. Les interrupts
//! passent devant tout ; ensuite l'écart entre l'order_index du morceau
//! et le pointeur de consommation de la playlist ; les playlists en
//! fermeture et les epochs périmés sont repoussés sans être abandonnés.

use itnstore::{Playlist, PlaylistStatus, Song};

/// Priorité des reprises de polling audio.
pub const PRIORITY_RESUME: i64 = 0;

/// Priorité plancher des morceaux ordinaires.
pub const PRIORITY_BASE: i64 = 10;

/// Pénalité des playlists en fermeture.
pub const PRIORITY_CLOSING_PENALTY: i64 = 50;

/// Pénalité des epochs périmés (déprioritisés, jamais abandonnés en file).
pub const PRIORITY_STALE_EPOCH_PENALTY: i64 = 1000;

/// Priorité des tâches de fond (extraction de persona).
pub const PRIORITY_BACKGROUND: i64 = 1000;

/// Priorité d'un morceau pour les trois files.
pub fn compute_priority(song: &Song, playlist: &Playlist) -> i64 {
    if song.is_interrupt {
        return 1;
    }

    let gap = (song.order_index - playlist.current_order_index).max(0);
    let mut priority = PRIORITY_BASE + gap;

    if playlist.status == PlaylistStatus::Closing {
        priority += PRIORITY_CLOSING_PENALTY;
    }
    if song.prompt_epoch != playlist.prompt_epoch {
        priority += PRIORITY_STALE_EPOCH_PENALTY;
    }

    priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use itnstore::{PlaylistMode, SongMetadata, SongStatus};

    fn playlist(status: PlaylistStatus, epoch: i64, pointer: i64) -> Playlist {
        Playlist {
            id: "pl-1".into(),
            playlist_key: "k".into(),
            name: "Test".into(),
            mode: PlaylistMode::Endless,
            status,
            prompt: "prompt".into(),
            prompt_epoch: epoch,
            current_order_index: pointer,
            last_seen_at: Utc::now(),
            manager_brief: None,
            manager_plan: None,
            manager_epoch: 0,
            generated_count: 0,
            created_at: Utc::now(),
        }
    }

    fn song(order_index: i64, epoch: i64, interrupt: bool) -> Song {
        Song {
            id: "song-1".into(),
            playlist_id: "pl-1".into(),
            order_index,
            prompt_epoch: epoch,
            is_interrupt: interrupt,
            status: SongStatus::Pending,
            prompt: None,
            ace_task_id: None,
            ace_submitted_at: None,
            metadata: SongMetadata::default(),
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

    #[test]
    fn interrupts_beat_everything() {
        let pl = playlist(PlaylistStatus::Active, 3, 10);
        let interrupt = song(50, 0, true);
        let near = song(11, 3, false);

        assert!(compute_priority(&interrupt, &pl) < compute_priority(&near, &pl));
    }

    #[test]
    fn nearer_songs_are_more_urgent() {
        let pl = playlist(PlaylistStatus::Active, 0, 5);
        assert!(compute_priority(&song(6, 0, false), &pl) < compute_priority(&song(9, 0, false), &pl));
    }

    #[test]
    fn stale_epoch_is_deprioritized_not_dropped() {
        let pl = playlist(PlaylistStatus::Active, 2, 0);
        let fresh = song(8, 2, false);
        let stale = song(1, 1, false);

        // Le périmé reste calculable (pas d'abandon), mais passe derrière.
        assert!(compute_priority(&stale, &pl) > compute_priority(&fresh, &pl));
    }

    #[test]
    fn closing_playlist_is_penalized() {
        let active = playlist(PlaylistStatus::Active, 0, 0);
        let closing = playlist(PlaylistStatus::Closing, 0, 0);
        let s = song(1, 0, false);

        assert!(compute_priority(&s, &closing) > compute_priority(&s, &active));
    }
}
