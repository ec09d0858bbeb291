//! Réglages du pipeline (tous adossés à la configuration).

use std::path::PathBuf;
use std::time::Duration;

/// Réglages de génération.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Nombre de morceaux à venir visés par playlist.
    pub buffer_target: i64,
    /// Fenêtre de dédoublonnage titre/artiste.
    pub dedup_window: i64,
    /// Âge au-delà duquel un morceau transitoire est purgé.
    pub stale_after_secs: i64,
    /// Délai d'inactivité avant fermeture d'une playlist.
    pub heartbeat_timeout_secs: i64,
    /// Nombre maximum d'auto-retries par morceau.
    pub auto_retry_limit: i64,
    /// Répertoire de stockage des fichiers audio.
    pub storage_dir: PathBuf,
    /// URL de base servie aux players (audio_url, cover_url).
    pub base_url: String,
    /// Intervalle du ticker de polling audio.
    pub audio_poll_interval: Duration,
    /// Grâce accordée aux tâches audio not_found.
    pub not_found_grace: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            buffer_target: 3,
            dedup_window: 12,
            stale_after_secs: 900,
            heartbeat_timeout_secs: 90,
            auto_retry_limit: 2,
            storage_dir: PathBuf::from("songs"),
            base_url: "http://127.0.0.1:8080".to_string(),
            audio_poll_interval: Duration::from_secs(2),
            not_found_grace: Duration::from_secs(120),
        }
    }
}

impl GenerationSettings {
    /// Charge les réglages depuis la configuration
    #[cfg(feature = "itnconfig")]
    pub fn from_config() -> Self {
        let config = itnconfig::get_config();
        let storage_dir = config
            .get_managed_dir(&["generation", "storage_dir"], "songs")
            .unwrap_or_else(|_| "songs".to_string());

        Self {
            buffer_target: config.get_u64_or(&["generation", "buffer_target"], 3) as i64,
            dedup_window: config.get_u64_or(&["generation", "dedup_window"], 12) as i64,
            stale_after_secs: config.get_u64_or(&["generation", "stale_after_secs"], 900) as i64,
            heartbeat_timeout_secs: config
                .get_u64_or(&["generation", "heartbeat_timeout_secs"], 90)
                as i64,
            auto_retry_limit: config.get_u64_or(&["generation", "auto_retry_limit"], 2) as i64,
            storage_dir: PathBuf::from(storage_dir),
            base_url: config.get_base_url(),
            audio_poll_interval: Duration::from_secs(
                config.get_u64_or(&["generation", "audio_poll_interval_secs"], 2),
            ),
            not_found_grace: Duration::from_secs(
                config.get_u64_or(&["generation", "audio_not_found_grace_secs"], 120),
            ),
        }
    }

    pub fn work_queue_params(&self) -> itnstore::WorkQueueParams {
        itnstore::WorkQueueParams {
            buffer_target: self.buffer_target,
            dedup_window: self.dedup_window,
            stale_after_secs: self.stale_after_secs,
        }
    }
}
