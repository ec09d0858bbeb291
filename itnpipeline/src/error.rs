//! Types d'erreurs pour itnpipeline

/// Erreurs du pipeline de génération
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Claim lost for song {0}")]
    ClaimLost(String),

    #[error("Worker cancelled for song {0}")]
    Cancelled(String),

    #[error(transparent)]
    Store(#[from] itnstore::Error),

    #[error(transparent)]
    Provider(#[from] itnproviders::ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] itnqueue::QueueError),

    #[error("Save error: {0}")]
    Save(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type Result spécialisé pour itnpipeline
pub type Result<T> = std::result::Result<T, Error>;
