//! Évènements publiés par le store sur chaque transition.

use crate::model::{PlaylistStatus, SongStatus};
use serde::{Deserialize, Serialize};

/// Évènement de transition du service de données.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    SongCreated {
        song_id: String,
        playlist_id: String,
    },
    SongStatusChanged {
        song_id: String,
        playlist_id: String,
        from: SongStatus,
        to: SongStatus,
    },
    PlaylistCreated {
        playlist_id: String,
    },
    PlaylistSteered {
        playlist_id: String,
        new_epoch: i64,
    },
    PlaylistHeartbeat {
        playlist_id: String,
    },
    PlaylistUpdated {
        playlist_id: String,
    },
    PlaylistDeleted {
        playlist_id: String,
    },
    PlaylistStatusChanged {
        playlist_id: String,
        from: PlaylistStatus,
        to: PlaylistStatus,
    },
    SettingsChanged,
}

impl StoreEvent {
    /// Playlist concernée par l'évènement, s'il y en a une.
    pub fn playlist_id(&self) -> Option<&str> {
        match self {
            StoreEvent::SongCreated { playlist_id, .. }
            | StoreEvent::SongStatusChanged { playlist_id, .. }
            | StoreEvent::PlaylistCreated { playlist_id }
            | StoreEvent::PlaylistSteered { playlist_id, .. }
            | StoreEvent::PlaylistHeartbeat { playlist_id }
            | StoreEvent::PlaylistUpdated { playlist_id }
            | StoreEvent::PlaylistDeleted { playlist_id }
            | StoreEvent::PlaylistStatusChanged { playlist_id, .. } => Some(playlist_id),
            StoreEvent::SettingsChanged => None,
        }
    }
}
