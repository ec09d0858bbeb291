//! Gestion des erreurs pour les clients providers

use thiserror::Error;

/// Type Result personnalisé pour itnproviders
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Erreurs possibles lors d'un appel provider
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Appel annulé par le token de cancellation
    #[error("Provider call cancelled")]
    Cancelled,

    /// Délai dépassé
    #[error("Provider call timed out after {0} seconds")]
    Timeout(u64),

    /// Erreur HTTP transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Erreur de parsing JSON
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Erreur renvoyée par le provider
    #[error("Provider API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Réponse inattendue (champ manquant, format invalide)
    #[error("Unexpected provider response: {0}")]
    UnexpectedResponse(String),

    /// Provider inconnu du registre
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Erreur générique
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Crée une erreur API depuis un statut HTTP et un corps de réponse
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Vrai si l'erreur mérite un retry (5xx, timeout, transport)
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::ApiError { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
