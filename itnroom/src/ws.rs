//! Handler WebSocket `/ws/room` : couche socket des devices.
//!
//! La socket lit le `join` initial, enregistre le device auprès de sa
//! room (auto-créée depuis la `playlistKey` si besoin), puis relaie les
//! messages. Les messages invalides reçoivent un unique `error` et la
//! connexion reste ouverte. Les sondes `ping` sont répondues ici, sans
//! aller-retour par l'acteur.

use crate::manager::RoomManager;
use crate::protocol::{ClientMessage, DeviceMode, ServerMessage};
use crate::room::{DeviceInfo, RoomMsg};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Handler axum du canal room.
pub async fn room_ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Premier message attendu : join.
    let (room, device_id, device) = loop {
        let Some(Ok(message)) = stream.next().await else {
            return;
        };
        let Message::Text(text) = message else {
            continue;
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Join {
                room_id,
                playlist_key,
                room_name: _,
                device_id,
                device_name,
                role,
                mode,
            }) => {
                let room = RoomManager::get().get_or_create(&room_id, &playlist_key);
                let device = DeviceInfo {
                    device_id: device_id.clone(),
                    name: device_name.unwrap_or_else(|| device_id.clone()),
                    role,
                    mode: mode.unwrap_or(DeviceMode::Default),
                };
                break (room, device_id, device);
            }
            Ok(ClientMessage::Ping { client_time }) => {
                let _ = send_json(
                    &mut sink,
                    &ServerMessage::Pong {
                        client_time,
                        server_time: Utc::now().timestamp_millis(),
                    },
                )
                .await;
            }
            Ok(_) => {
                let _ = send_json(
                    &mut sink,
                    &ServerMessage::Error {
                        message: "expected join".to_string(),
                    },
                )
                .await;
            }
            Err(e) => {
                let _ = send_json(
                    &mut sink,
                    &ServerMessage::Error {
                        message: format!("invalid message: {}", e),
                    },
                )
                .await;
            }
        }
    };

    // Canal sortant du device : un writer dédié préserve l'ordre.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_json(&mut sink, &msg).await.is_err() {
                break;
            }
        }
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    if !room
        .send(RoomMsg::Join {
            device: device.clone(),
            outbound: outbound_tx.clone(),
            reply: reply_tx,
        })
        .await
    {
        warn!(device_id = %device_id, "Room inbox closed during join");
        writer.abort();
        return;
    }
    let _ = reply_rx.await;

    info!(room_id = %room.room_id, device_id = %device_id, "Device socket attached");

    // Boucle de lecture.
    while let Some(message) = stream.next().await {
        let Ok(message) = message else { break };
        match message {
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping { client_time }) => {
                        // Réponse immédiate avec le temps serveur.
                        let _ = outbound_tx
                            .send(ServerMessage::Pong {
                                client_time,
                                server_time: Utc::now().timestamp_millis(),
                            })
                            .await;
                    }
                    Ok(ClientMessage::Join { .. }) => {
                        let _ = outbound_tx
                            .send(ServerMessage::Error {
                                message: "already joined".to_string(),
                            })
                            .await;
                    }
                    Ok(client_message) => {
                        let forwarded = room
                            .send(RoomMsg::Client {
                                device_id: device_id.clone(),
                                message: client_message,
                            })
                            .await;
                        if !forwarded {
                            break;
                        }
                    }
                    Err(e) => {
                        // Schéma invalide : un error, la connexion survit.
                        debug!(device_id = %device_id, "Invalid client message: {}", e);
                        let _ = outbound_tx
                            .send(ServerMessage::Error {
                                message: format!("invalid message: {}", e),
                            })
                            .await;
                    }
                }
            }
            Message::Close(_) => break,
            // Ping/Pong transport et frames binaires : ignorés.
            _ => {}
        }
    }

    let _ = room
        .send(RoomMsg::Disconnect {
            device_id: device_id.clone(),
        })
        .await;
    writer.abort();
    debug!(device_id = %device_id, "Device socket closed");
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(msg) else {
        return Err(());
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
