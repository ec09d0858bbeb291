//! Client du socket de contrôle du daemon.

use anyhow::{anyhow, Context, Result};
use itndaemon::DaemonConfig;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Nombre de tentatives de connexion après spawn du daemon.
const BOOT_ATTEMPTS: u32 = 10;
const BOOT_DELAY: Duration = Duration::from_millis(300);

/// Client IPC, une connexion par requête.
pub struct IpcClient {
    config: DaemonConfig,
}

impl IpcClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            config: DaemonConfig::from_config().map_err(|e| anyhow!(e.to_string()))?,
        })
    }

    /// Envoie une requête ; erreur si le daemon est injoignable.
    pub async fn request(&self, action: &str, payload: Value) -> Result<Value> {
        let stream = UnixStream::connect(&self.config.socket_path)
            .await
            .context("daemon is not running")?;
        self.roundtrip(stream, action, payload).await
    }

    /// Envoie une requête, en démarrant un daemon détaché si nécessaire.
    pub async fn request_or_spawn(&self, action: &str, payload: Value) -> Result<Value> {
        match UnixStream::connect(&self.config.socket_path).await {
            Ok(stream) => self.roundtrip(stream, action, payload).await,
            Err(_) => {
                self.spawn_daemon()?;
                for _ in 0..BOOT_ATTEMPTS {
                    tokio::time::sleep(BOOT_DELAY).await;
                    if let Ok(stream) = UnixStream::connect(&self.config.socket_path).await {
                        return self.roundtrip(stream, action, payload).await;
                    }
                }
                Err(anyhow!("daemon did not come up after spawn"))
            }
        }
    }

    /// Vrai si un daemon répond sur le socket.
    pub async fn daemon_alive(&self) -> bool {
        self.request("status", Value::Null).await.is_ok()
    }

    /// Démarre `itn daemon run` détaché du terminal courant.
    pub fn spawn_daemon(&self) -> Result<()> {
        let exe = std::env::current_exe().context("cannot resolve current executable")?;
        std::process::Command::new(exe)
            .args(["daemon", "run"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("cannot spawn daemon process")?;
        Ok(())
    }

    async fn roundtrip(&self, stream: UnixStream, action: &str, payload: Value) -> Result<Value> {
        let (read_half, mut write_half) = stream.into_split();

        let request = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "action": action,
            "payload": payload,
        });
        let mut encoded = request.to_string();
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;

        let mut lines = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(self.config.ipc_timeout, lines.next_line())
            .await
            .context("daemon did not answer in time")??
            .ok_or_else(|| anyhow!("daemon closed the connection"))?;

        let response: Value = serde_json::from_str(&line).context("malformed daemon response")?;
        if response["id"] != request["id"] {
            return Err(anyhow!("daemon answered with a mismatched request id"));
        }
        if response["ok"].as_bool() != Some(true) {
            return Err(anyhow!(
                "{}",
                response["error"].as_str().unwrap_or("daemon error")
            ));
        }
        Ok(response["data"].clone())
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}
