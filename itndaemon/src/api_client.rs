//! Client HTTP du service de génération (mode local du daemon).

use crate::error::{Error, Result};
use crate::state::QueueEntry;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Vue minimale d'une playlist côté daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistView {
    pub id: String,
    pub playlist_key: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct SongView {
    id: String,
    order_index: i64,
    title: Option<String>,
    artist: Option<String>,
    audio_url: Option<String>,
    audio_duration: Option<f64>,
}

/// Client de l'API de génération.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Résout une playlist par id ; 404 → session périmée.
    pub async fn get_playlist(&self, playlist_id: &str) -> Result<PlaylistView> {
        let url = format!("{}/api/playlists/{}", self.base_url, playlist_id);
        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Err(Error::StaleRoomSession(format!(
                "playlist {} no longer exists",
                playlist_id
            )));
        }
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Résout une playlist par clé externe ; absente → session périmée.
    pub async fn get_playlist_by_key(&self, key: &str) -> Result<PlaylistView> {
        let url = format!("{}/api/playlists?key={}", self.base_url, key);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let playlists: Vec<PlaylistView> = response.json().await?;
        playlists.into_iter().next().ok_or_else(|| {
            Error::StaleRoomSession(format!("playlist key '{}' no longer resolves", key))
        })
    }

    /// File consommable (morceaux ready après le pointeur).
    pub async fn fetch_queue(&self, playlist_id: &str) -> Result<Vec<QueueEntry>> {
        let url = format!("{}/api/playlists/{}/queue", self.base_url, playlist_id);
        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Err(Error::StaleRoomSession(format!(
                "playlist {} no longer exists",
                playlist_id
            )));
        }
        let songs: Vec<SongView> = response.error_for_status()?.json().await?;
        Ok(songs
            .into_iter()
            .map(|s| QueueEntry {
                song_id: s.id,
                order_index: s.order_index,
                title: s.title,
                artist: s.artist,
                audio_url: s.audio_url,
                duration: s.audio_duration,
            })
            .collect())
    }

    /// Heartbeat de playlist (mode local, toutes les 30 s).
    pub async fn heartbeat(&self, playlist_id: &str) -> Result<()> {
        let url = format!("{}/api/playlists/{}/heartbeat", self.base_url, playlist_id);
        self.client.post(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Avance le pointeur de consommation.
    pub async fn report_position(&self, playlist_id: &str, order_index: i64) -> Result<()> {
        let url = format!("{}/api/playlists/{}/position", self.base_url, playlist_id);
        self.client
            .post(&url)
            .json(&serde_json::json!({"order_index": order_index}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Marque un morceau consommé.
    pub async fn report_played(&self, song_id: &str) -> Result<()> {
        let url = format!("{}/api/songs/{}/played", self.base_url, song_id);
        debug!(song_id = %song_id, "Reporting song played");
        self.client.post(&url).send().await?.error_for_status()?;
        Ok(())
    }
}
