//! Types d'erreurs pour itnroom

/// Erreurs du runtime de rooms
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room inbox closed: {0}")]
    RoomClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] itnstore::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type Result spécialisé pour itnroom
pub type Result<T> = std::result::Result<T, Error>;
