//! Entités du domaine : morceaux, playlists et agrégats de travail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Statut d'un morceau dans le pipeline de génération.
///
/// Les transitions légales forment un DAG strict : voir le worker de
/// génération. `Played` est terminal et posé par la room quand la
/// consommation est confirmée.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SongStatus {
    Pending,
    GeneratingMetadata,
    MetadataReady,
    SubmittingToAce,
    GeneratingAudio,
    Saving,
    Ready,
    Error,
    RetryPending,
    Played,
}

impl SongStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SongStatus::Pending => "pending",
            SongStatus::GeneratingMetadata => "generating_metadata",
            SongStatus::MetadataReady => "metadata_ready",
            SongStatus::SubmittingToAce => "submitting_to_ace",
            SongStatus::GeneratingAudio => "generating_audio",
            SongStatus::Saving => "saving",
            SongStatus::Ready => "ready",
            SongStatus::Error => "error",
            SongStatus::RetryPending => "retry_pending",
            SongStatus::Played => "played",
        }
    }

    /// Statuts transitoires : du travail est encore dû pour ce morceau.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SongStatus::Pending
                | SongStatus::GeneratingMetadata
                | SongStatus::MetadataReady
                | SongStatus::SubmittingToAce
                | SongStatus::GeneratingAudio
                | SongStatus::Saving
                | SongStatus::RetryPending
        )
    }

    /// Statuts concernés par la réconciliation au démarrage.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            SongStatus::SubmittingToAce | SongStatus::GeneratingAudio | SongStatus::Saving
        )
    }
}

impl fmt::Display for SongStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SongStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SongStatus::Pending),
            "generating_metadata" => Ok(SongStatus::GeneratingMetadata),
            "metadata_ready" => Ok(SongStatus::MetadataReady),
            "submitting_to_ace" => Ok(SongStatus::SubmittingToAce),
            "generating_audio" => Ok(SongStatus::GeneratingAudio),
            "saving" => Ok(SongStatus::Saving),
            "ready" => Ok(SongStatus::Ready),
            "error" => Ok(SongStatus::Error),
            "retry_pending" => Ok(SongStatus::RetryPending),
            "played" => Ok(SongStatus::Played),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Statut d'une playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistStatus {
    Active,
    Closing,
    Closed,
}

impl PlaylistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistStatus::Active => "active",
            PlaylistStatus::Closing => "closing",
            PlaylistStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PlaylistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaylistStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PlaylistStatus::Active),
            "closing" => Ok(PlaylistStatus::Closing),
            "closed" => Ok(PlaylistStatus::Closed),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Mode de génération d'une playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistMode {
    Endless,
    Oneshot,
}

impl PlaylistMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistMode::Endless => "endless",
            PlaylistMode::Oneshot => "oneshot",
        }
    }
}

impl FromStr for PlaylistMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "endless" => Ok(PlaylistMode::Endless),
            "oneshot" => Ok(PlaylistMode::Oneshot),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Vote utilisateur sur un morceau.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRating {
    Up,
    Down,
}

impl UserRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRating::Up => "up",
            UserRating::Down => "down",
        }
    }
}

impl FromStr for UserRating {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(UserRating::Up),
            "down" => Ok(UserRating::Down),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// Métadonnées musicales produites par le LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub caption: Option<String>,
    pub bpm: Option<f64>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub audio_duration: Option<f64>,
    pub mood: Option<String>,
    pub energy: Option<String>,
}

/// Un morceau généré (ou en cours de génération).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub playlist_id: String,
    pub order_index: i64,
    pub prompt_epoch: i64,
    pub is_interrupt: bool,
    pub status: SongStatus,
    /// Prompt propre au morceau (toujours présent pour les interrupts).
    pub prompt: Option<String>,
    pub ace_task_id: Option<String>,
    pub ace_submitted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metadata: SongMetadata,
    pub audio_url: Option<String>,
    pub storage_path: Option<String>,
    pub cover_url: Option<String>,
    pub user_rating: Option<UserRating>,
    pub persona_extract: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Song {
    /// Libellé court pour les logs.
    pub fn label(&self) -> String {
        match (&self.metadata.title, &self.metadata.artist) {
            (Some(t), Some(a)) => format!("{} - {}", a, t),
            (Some(t), None) => t.clone(),
            _ => self.id.clone(),
        }
    }
}

/// Un slot du plan de gestion d'une playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSlot {
    /// Intention de transition avec le morceau précédent.
    pub transition: Option<String>,
    pub topic: Option<String>,
    pub lyrical_theme: Option<String>,
    pub energy_target: Option<String>,
}

/// Plan de gestion couvrant une fenêtre de morceaux à venir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerPlan {
    pub start_order_index: i64,
    pub window_size: i64,
    /// 3 à 8 slots.
    pub slots: Vec<ManagerSlot>,
}

impl ManagerPlan {
    /// Teste si un order_index tombe dans la fenêtre couverte.
    pub fn covers(&self, order_index: i64) -> bool {
        order_index >= self.start_order_index
            && order_index < self.start_order_index + self.window_size
    }

    /// Slot correspondant à un order_index, si couvert.
    pub fn slot_for(&self, order_index: i64) -> Option<&ManagerSlot> {
        if !self.covers(order_index) {
            return None;
        }
        self.slots.get((order_index - self.start_order_index) as usize)
    }
}

/// Une playlist générée.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    /// Nom externe non opaque, utilisé par les rooms pour se lier.
    pub playlist_key: String,
    pub name: String,
    pub mode: PlaylistMode,
    pub status: PlaylistStatus,
    pub prompt: String,
    pub prompt_epoch: i64,
    pub current_order_index: i64,
    pub last_seen_at: DateTime<Utc>,
    pub manager_brief: Option<String>,
    pub manager_plan: Option<ManagerPlan>,
    pub manager_epoch: i64,
    pub generated_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Paire (titre, artiste) récente, utilisée pour le dédoublonnage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentDescription {
    pub title: String,
    pub artist: String,
}

/// Agrégat de travail d'une playlist, calculé en une passe par le store.
///
/// C'est la vue unique que consulte le superviseur pour décider quoi
/// lancer : listes de morceaux actionnables, compteurs et fenêtre de
/// dédoublonnage.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    pub pending: Vec<Song>,
    pub metadata_ready: Vec<Song>,
    pub needs_cover: Vec<Song>,
    pub generating_audio: Vec<Song>,
    pub retry_pending: Vec<Song>,
    pub needs_recovery: Vec<Song>,
    /// Nombre de morceaux manquants pour atteindre la cible de buffer.
    pub buffer_deficit: i64,
    pub max_order_index: i64,
    pub total_songs: i64,
    pub transient_count: i64,
    pub recent_completed: Vec<Song>,
    pub recent_descriptions: Vec<RecentDescription>,
    pub stale_songs: Vec<Song>,
    pub current_epoch: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SongStatus::Pending,
            SongStatus::GeneratingMetadata,
            SongStatus::MetadataReady,
            SongStatus::SubmittingToAce,
            SongStatus::GeneratingAudio,
            SongStatus::Saving,
            SongStatus::Ready,
            SongStatus::Error,
            SongStatus::RetryPending,
            SongStatus::Played,
        ] {
            assert_eq!(status.as_str().parse::<SongStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("bogus".parse::<SongStatus>().is_err());
        assert!("bogus".parse::<PlaylistStatus>().is_err());
    }

    #[test]
    fn transient_statuses() {
        assert!(SongStatus::Pending.is_transient());
        assert!(SongStatus::Saving.is_transient());
        assert!(!SongStatus::Ready.is_transient());
        assert!(!SongStatus::Error.is_transient());
        assert!(!SongStatus::Played.is_transient());
    }

    #[test]
    fn manager_plan_window() {
        let plan = ManagerPlan {
            start_order_index: 10,
            window_size: 4,
            slots: vec![
                ManagerSlot {
                    transition: None,
                    topic: Some("intro".into()),
                    lyrical_theme: None,
                    energy_target: None,
                },
                ManagerSlot {
                    transition: Some("build".into()),
                    topic: None,
                    lyrical_theme: None,
                    energy_target: Some("high".into()),
                },
            ],
        };

        assert!(plan.covers(10));
        assert!(plan.covers(13));
        assert!(!plan.covers(14));
        assert_eq!(plan.slot_for(10).unwrap().topic.as_deref(), Some("intro"));
        assert!(plan.slot_for(12).is_none()); // fenêtre couverte mais slot absent
    }
}
