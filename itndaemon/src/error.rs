//! Types d'erreurs pour itndaemon

/// Erreurs du daemon de lecture
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Un daemon vivant détient déjà le socket de contrôle.
    #[error("Daemon already running (socket in use{})", pid_hint(.pid))]
    SocketInUse { pid: Option<u32> },

    /// La playlist/room demandée n'existe plus côté serveur.
    #[error("stale_room_session: {0}")]
    StaleRoomSession(String),

    #[error("Daemon is not connected")]
    NotConnected,

    #[error("Room connection failed: {0}")]
    RoomConnection(String),

    #[error("Audio engine error: {0}")]
    Engine(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Unknown IPC action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classe d'erreur exposée sur le fil IPC.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SocketInUse { .. } => "socket_in_use",
            Error::StaleRoomSession(_) => "stale_room_session",
            Error::NotConnected => "not_connected",
            Error::RoomConnection(_) => "room_connection",
            Error::Engine(_) => "engine",
            Error::Ipc(_) => "ipc",
            Error::UnknownAction(_) => "unknown_action",
            Error::InvalidPayload(_) => "invalid_payload",
            Error::Http(_) => "http",
            Error::Io(_) => "io",
            Error::Other(_) => "internal",
        }
    }
}

fn pid_hint(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(", pid {}", pid),
        None => String::new(),
    }
}

/// Type Result spécialisé pour itndaemon
pub type Result<T> = std::result::Result<T, Error>;
