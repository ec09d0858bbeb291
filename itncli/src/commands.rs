//! Implémentation des commandes du CLI.
//!
//! Toutes les commandes sont stateless : elles parlent au daemon via le
//! socket de contrôle et retournent 0 (succès) ou une erreur imprimée
//! sur stderr par `main`.

use crate::ipc_client::IpcClient;
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use std::time::Duration;

/// Cible de lecture résolue : room ou playlist locale.
pub enum PlayTarget {
    Room { room_id: String },
    Playlist { playlist_key: String },
}

/// Résout la cible de `play` : flag explicite > défaut configuré >
/// dernier choix mémorisé. Le picker interactif est un processus externe
/// et n'est pas embarqué ici.
pub fn resolve_target(room: Option<String>, playlist: Option<String>) -> Result<PlayTarget> {
    if let Some(room_id) = room {
        return Ok(PlayTarget::Room { room_id });
    }
    if let Some(playlist_key) = playlist {
        return Ok(PlayTarget::Playlist { playlist_key });
    }

    let config = itnconfig::get_config();
    let default_room = config.get_string_or(&["cli", "default_room"], "");
    if !default_room.is_empty() {
        return Ok(PlayTarget::Room {
            room_id: default_room,
        });
    }
    let default_playlist = config.get_string_or(&["cli", "default_playlist"], "");
    if !default_playlist.is_empty() {
        return Ok(PlayTarget::Playlist {
            playlist_key: default_playlist,
        });
    }

    if let Some(room_id) = config.get_last_room() {
        return Ok(PlayTarget::Room { room_id });
    }
    if let Some(playlist_key) = config.get_last_playlist() {
        return Ok(PlayTarget::Playlist { playlist_key });
    }

    bail!("no target: pass --room or --playlist (or set cli.default_room in the config)")
}

/// `itn play` : démarre (ou reprend) la lecture sur la cible résolue.
pub async fn play(room: Option<String>, playlist: Option<String>) -> Result<()> {
    let client = IpcClient::new()?;
    let target = resolve_target(room, playlist)?;
    let config = itnconfig::get_config();

    // 1. Si le daemon est déjà sur la bonne session, ne pas reconnecter.
    let status = client.request_or_spawn("status", Value::Null).await?;

    match &target {
        PlayTarget::Room { room_id } => {
            let already = status["connected"].as_bool() == Some(true)
                && (status["roomId"].as_str() == Some(room_id)
                    || status["playlistKey"].as_str() == Some(room_id.as_str()));
            if !already {
                client
                    .request("joinRoom", json!({"roomId": room_id}))
                    .await?;
                wait_connected(&client, |s| s["roomId"].as_str() == Some(room_id)).await?;
            }
            let _ = config.set_last_room(room_id);
        }
        PlayTarget::Playlist { playlist_key } => {
            let already = status["connected"].as_bool() == Some(true)
                && status["mode"].as_str() == Some("local")
                && status["playlistKey"].as_str() == Some(playlist_key.as_str());
            if !already {
                client
                    .request("startLocal", json!({"playlistKey": playlist_key}))
                    .await?;
            }
            let _ = config.set_last_playlist(playlist_key);
        }
    }

    // 3. play ; une erreur « not connected » transitoire vaut une
    // reconnexion puis un unique retry.
    match client.request("play", Value::Null).await {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().starts_with("not_connected") => {
            if let PlayTarget::Room { room_id } = &target {
                client
                    .request("joinRoom", json!({"roomId": room_id}))
                    .await?;
            }
            client.request("play", Value::Null).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

async fn wait_connected<F: Fn(&Value) -> bool>(client: &IpcClient, expected: F) -> Result<()> {
    for _ in 0..10 {
        let status = client.request("status", Value::Null).await?;
        if status["connected"].as_bool() == Some(true) && expected(&status) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    bail!("daemon did not reach connected state")
}

/// Commande simple relayée telle quelle au daemon.
pub async fn simple(action: &str, payload: Value) -> Result<()> {
    let client = IpcClient::new()?;
    client.request(action, payload).await?;
    Ok(())
}

/// `itn status` : affiche l'instantané du daemon.
pub async fn status() -> Result<()> {
    let client = IpcClient::new()?;
    match client.request("status", Value::Null).await {
        Ok(data) => {
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Err(_) => {
            println!("daemon: not running");
            Ok(())
        }
    }
}

/// `itn queue`
pub async fn queue() -> Result<()> {
    let client = IpcClient::new()?;
    let data = client.request("queue", Value::Null).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

/// `itn volume up|down [--step]`
pub async fn volume(up: bool, step: Option<f64>) -> Result<()> {
    let config = itnconfig::get_config();
    let step = step.unwrap_or_else(|| config.get_f64_or(&["cli", "volume_step"], 0.05));
    let delta = if up { step } else { -step };
    simple("volumeDelta", json!({"delta": delta})).await
}

/// `itn song pick --song <id>`
pub async fn song_pick(song_id: Option<String>) -> Result<()> {
    let Some(song_id) = song_id else {
        bail!("song pick needs --song <id> (the interactive picker lives in the UI)");
    };
    simple("selectSong", json!({"songId": song_id})).await
}

/// `itn room join --room <id>`
pub async fn room_join(room_id: String) -> Result<()> {
    let client = IpcClient::new()?;
    client
        .request_or_spawn("joinRoom", json!({"roomId": room_id}))
        .await?;
    itnconfig::get_config().set_last_room(&room_id)?;
    Ok(())
}

/// `itn config get|set|path`
pub fn config_get(path: &str) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let value = itnconfig::get_config()
        .get_value(&parts)
        .map_err(|e| anyhow!(e))?;
    println!("{}", serde_yaml_to_display(&value));
    Ok(())
}

pub fn config_set(path: &str, value: &str) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let yaml_value = serde_yaml::from_str(value).unwrap_or(serde_yaml::Value::String(value.to_string()));
    itnconfig::get_config().set_value(&parts, yaml_value)?;
    Ok(())
}

pub fn config_path() -> Result<()> {
    println!("{}", itnconfig::get_config().file_path());
    Ok(())
}

fn serde_yaml_to_display(value: &serde_yaml::Value) -> String {
    serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

// ============================================================================
// Gestion du daemon
// ============================================================================

/// `itn daemon start` : spawn détaché puis attend le socket.
pub async fn daemon_start() -> Result<()> {
    let client = IpcClient::new()?;
    if client.daemon_alive().await {
        println!("daemon already running");
        return Ok(());
    }
    client.spawn_daemon()?;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        if client.daemon_alive().await {
            println!("daemon started");
            return Ok(());
        }
    }
    bail!("daemon did not come up")
}

/// `itn daemon stop`
pub async fn daemon_stop() -> Result<()> {
    let client = IpcClient::new()?;
    match client.request("shutdown", Value::Null).await {
        Ok(_) => {
            println!("daemon stopping");
            Ok(())
        }
        Err(_) => {
            println!("daemon: not running");
            Ok(())
        }
    }
}

/// `itn daemon restart`
pub async fn daemon_restart() -> Result<()> {
    let client = IpcClient::new()?;
    let _ = client.request("shutdown", Value::Null).await;
    for _ in 0..10 {
        if !client.daemon_alive().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    daemon_start().await
}

/// `itn daemon status`.
pub async fn daemon_status() -> Result<()> {
    let client = IpcClient::new()?;
    if client.daemon_alive().await {
        println!("daemon: running");
    } else {
        let pid = itnutils::read_pid_file(&client.config().pid_path);
        match pid.filter(|pid| itnutils::process_alive(*pid)) {
            Some(pid) => println!("daemon: pid {} alive but socket unreachable", pid),
            None => println!("daemon: not running"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flags_win_over_configuration() {
        // Les flags explicites ne consultent jamais la configuration.
        match resolve_target(Some("r1".into()), Some("p1".into())).unwrap() {
            PlayTarget::Room { room_id } => assert_eq!(room_id, "r1"),
            _ => panic!("room flag must win"),
        }

        match resolve_target(None, Some("p1".into())).unwrap() {
            PlayTarget::Playlist { playlist_key } => assert_eq!(playlist_key, "p1"),
            _ => panic!("playlist flag must resolve"),
        }
    }
}
