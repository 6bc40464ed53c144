use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, trace, warn};
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::User;

use crate::relay::Relay;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a WebSocket whose credential was already verified at the HTTP
/// upgrade. Runs until the socket closes, errors or stops answering pings,
/// then tears the connection down.
pub async fn handle_connection(socket: WebSocket, relay: Relay, user: User, chat_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before connecting so no presence change slips between the
    // snapshot and the subscription
    let mut global_rx = relay.dispatcher().subscribe();
    let (session, mut outbound_rx) = relay.connect(user, chat_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued + global events -> client, with heartbeat
    let conn_id = session.conn_id;
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                // Targeted events first, so `ready` precedes any broadcast
                biased;

                result = outbound_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                result = global_rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Connection {} lagged by {} global events", conn_id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout on {} (missed {} pongs), dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    // Read commands from client, one at a time, in arrival order
    let recv_relay = relay.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    info!("Connection {} read error: {}", recv_session.conn_id, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    recv_relay.handle_text(&recv_session, text.as_str()).await;
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                Message::Binary(data) => {
                    trace!("Ignoring {} byte binary frame from {}", data.len(), recv_session.conn_id);
                }
                _ => {}
            }
        }
    });

    // Wait for either task to finish, then for the other to actually stop so
    // no command is still in flight when teardown runs
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }

    relay.disconnect(&session).await;
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
