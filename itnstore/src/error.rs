//! Types d'erreurs pour itnstore

/// Erreurs du service de données
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Playlist not found: {0}")]
    PlaylistNotFound(String),

    #[error("Song not found: {0}")]
    SongNotFound(String),

    #[error("Playlist is closing, no new songs admitted: {0}")]
    PlaylistClosing(String),

    #[error("Playlist is closed, no song mutation admitted: {0}")]
    PlaylistClosed(String),

    #[error("Invalid status value: {0}")]
    InvalidStatus(String),

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::PersistenceError(e.to_string())
    }
}

/// Type Result spécialisé pour itnstore
pub type Result<T> = std::result::Result<T, Error>;
