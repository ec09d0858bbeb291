//! `itn` : plan de contrôle en ligne de commande.
//!
//! Stateless : chaque commande parle au daemon par le socket de contrôle
//! (en le démarrant au besoin) et sort avec 0 en cas de succès, 1 sinon.

mod commands;
mod ipc_client;

use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "itn", about = "Infinitune command line", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Démarre (ou reprend) la lecture
    Play {
        /// Room à rejoindre
        #[arg(long)]
        room: Option<String>,
        /// Playlist à jouer en mode local
        #[arg(long)]
        playlist: Option<String>,
    },
    /// Arrête la lecture et quitte la session
    Stop,
    /// Passe au morceau suivant
    Skip,
    /// Met en pause / reprend
    Toggle,
    /// Saute à une position (secondes)
    Seek { time: f64 },
    /// Règle le volume
    Volume {
        #[command(subcommand)]
        direction: VolumeDirection,
    },
    /// Coupe / rétablit le son
    Mute,
    /// Opérations sur les morceaux
    Song {
        #[command(subcommand)]
        action: SongAction,
    },
    /// État du daemon
    Status,
    /// File de lecture vue par le daemon
    Queue,
    /// Gestion des rooms
    Room {
        #[command(subcommand)]
        action: RoomAction,
    },
    /// Lecture / écriture de la configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Gestion du daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Assistant de première configuration (couche d'empaquetage)
    Setup,
    /// Unité de service système (couche d'empaquetage)
    Service {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Installation du binaire (couche d'empaquetage)
    InstallCli,
    /// Installation de la page de manuel (couche d'empaquetage)
    InstallMan,
    /// Page de manuel (couche d'empaquetage)
    Man,
}

#[derive(Subcommand)]
enum VolumeDirection {
    Up {
        #[arg(long)]
        step: Option<f64>,
    },
    Down {
        #[arg(long)]
        step: Option<f64>,
    },
}

#[derive(Subcommand)]
enum SongAction {
    /// Sélectionne un morceau précis de la file
    Pick {
        #[arg(long)]
        song: Option<String>,
    },
}

#[derive(Subcommand)]
enum RoomAction {
    /// Rejoint une room
    Join {
        #[arg(long)]
        room: String,
    },
    /// Quitte la room courante
    Leave,
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { path: String },
    Set { path: String, value: String },
    /// Affiche le chemin du fichier de configuration
    Path,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Exécute le daemon au premier plan
    Run,
    /// Démarre le daemon en arrière-plan
    Start,
    /// Arrête le daemon
    Stop,
    /// Redémarre le daemon
    Restart,
    /// État du daemon
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Play { room, playlist } => commands::play(room, playlist).await,
        Commands::Stop => commands::simple("clearSession", serde_json::Value::Null).await,
        Commands::Skip => commands::simple("skip", serde_json::Value::Null).await,
        Commands::Toggle => commands::simple("toggle", serde_json::Value::Null).await,
        Commands::Seek { time } => commands::simple("seek", json!({"time": time})).await,
        Commands::Volume { direction } => match direction {
            VolumeDirection::Up { step } => commands::volume(true, step).await,
            VolumeDirection::Down { step } => commands::volume(false, step).await,
        },
        Commands::Mute => commands::simple("toggleMute", serde_json::Value::Null).await,
        Commands::Song { action } => match action {
            SongAction::Pick { song } => commands::song_pick(song).await,
        },
        Commands::Status => commands::status().await,
        Commands::Queue => commands::queue().await,
        Commands::Room { action } => match action {
            RoomAction::Join { room } => commands::room_join(room).await,
            RoomAction::Leave => commands::simple("leaveRoom", serde_json::Value::Null).await,
        },
        Commands::Config { action } => match action {
            ConfigAction::Get { path } => commands::config_get(&path),
            ConfigAction::Set { path, value } => commands::config_set(&path, &value),
            ConfigAction::Path => commands::config_path(),
        },
        Commands::Daemon { action } => match action {
            DaemonAction::Run => run_daemon().await,
            DaemonAction::Start => commands::daemon_start().await,
            DaemonAction::Stop => commands::daemon_stop().await,
            DaemonAction::Restart => commands::daemon_restart().await,
            DaemonAction::Status => commands::daemon_status().await,
        },
        Commands::Setup
        | Commands::Service { .. }
        | Commands::InstallCli
        | Commands::InstallMan
        | Commands::Man => {
            eprintln!("this subcommand is provided by the packaging layer, not by the core CLI");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

/// `itn daemon run` : exécute le daemon dans ce processus.
async fn run_daemon() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    itndaemon::run().await.map_err(|e| anyhow::anyhow!(e))
}
