use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::messages::WsMessage;
use crate::state::RelayState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user_id = match wait_for_connect(&mut ws_receiver, &state).await {
        Ok(id) => id,
        Err(reason) => {
            warn!(reason = %reason, "Connection rejected before authentication");
            let rejection = WsMessage::AuthResponse {
                success: false,
                message: reason,
            };
            if let Ok(json) = serde_json::to_string(&rejection) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.add_client(user_id.clone(), tx.clone());
    info!(user_id = %user_id, connections = state.connection_count(), "User connected");

    // Subscribe before acknowledging so no change after the ack is missed.
    // Pings ride the same outbound channel as replies
    let ping_tx = tx.clone();
    let subscription = state.notifier.subscribe(&user_id, move || {
        let changed = WsMessage::Changed {
            at: chrono::Utc::now().timestamp_millis(),
        };
        if let Ok(json) = serde_json::to_string(&changed) {
            let _ = ping_tx.send(json);
        }
    });
    if !subscription.is_live() {
        warn!(user_id = %user_id, "No realtime feed for connection, client must poll");
    }

    let auth_response = WsMessage::AuthResponse {
        success: true,
        message: "Connected to server".to_string(),
    };
    match serde_json::to_string(&auth_response) {
        Ok(json) => {
            if let Err(e) = ws_sender.send(Message::Text(json.into())).await {
                error!(user_id = %user_id, error = %e, "Failed to send auth response");
            }
        }
        Err(e) => error!(user_id = %user_id, error = %e, "Failed to serialize auth response"),
    }

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut send_finished = false;
    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_request(&text, &user_id, &state).await;
                        match serde_json::to_string(&reply) {
                            Ok(json) => {
                                if tx.send(json).is_err() {
                                    break;
                                }
                            }
                            Err(e) => error!(user_id = %user_id, error = %e, "Failed to serialize reply"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(user_id = %user_id, "Client sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(user_id = %user_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        info!(user_id = %user_id, "WebSocket stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                send_finished = true;
                info!(user_id = %user_id, "Send task finished (likely connection lost)");
                break;
            }
        }
    }

    // Cleanup
    subscription.unsubscribe();
    drop(tx);
    if !send_finished {
        send_task.abort();
        // Wait for the receiver to drop so remove_client sees a closed channel
        let _ = send_task.await;
    }
    state.remove_client(&user_id);

    info!(
        user_id = %user_id,
        still_online = state.is_online(&user_id),
        online_users = state.online_users().len(),
        "User disconnected"
    );
}

/// Wait for the Connect frame and check its token.
async fn wait_for_connect(
    receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    state: &RelayState,
) -> Result<String, String> {
    let attempt = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(result) = receiver.next().await {
            let Ok(Message::Text(text)) = result else {
                continue;
            };
            match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::Connect { user_id, token }) => {
                    let user_id = user_id.trim().to_string();
                    if user_id.is_empty() {
                        return Err("Missing user id".to_string());
                    }
                    if let Err(reason) = state.check_token(token.as_deref()) {
                        warn!(user_id = %user_id, reason, "Authentication failed");
                        return Err(reason.to_string());
                    }
                    return Ok(user_id);
                }
                Ok(other) => {
                    debug!(message = ?other, "Ignoring frame before connect");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse Connect message");
                }
            }
        }
        Err("Connection closed before authentication".to_string())
    });

    match attempt.await {
        Ok(result) => result,
        Err(_) => Err("Authentication timeout".to_string()),
    }
}

/// Handle one request from an authenticated connection and build the reply.
///
/// The acting user is always `user_id`, the connection's identity. Request
/// errors come back as `error` frames; they never end the connection.
pub async fn handle_request(text: &str, user_id: &str, state: &RelayState) -> WsMessage {
    let request: WsMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to parse request");
            return WsMessage::error(format!("Malformed request: {}", e));
        }
    };

    let result = match request {
        WsMessage::ListConversations => state
            .aggregator
            .list_conversations(user_id)
            .await
            .map(|conversations| WsMessage::Conversations { conversations }),
        WsMessage::LoadThread { counterpart_id } => state
            .threads
            .load_thread(user_id, &counterpart_id)
            .await
            .map(|thread| WsMessage::Thread { thread }),
        WsMessage::Send {
            counterpart_id,
            body,
            reply_to_id,
        } => state
            .delivery
            .send(user_id, &counterpart_id, &body, reply_to_id.as_deref())
            .await
            .map(|message| WsMessage::Sent { message }),
        WsMessage::MarkRead { message_ids } => state
            .delivery
            .mark_read(&message_ids, user_id)
            .await
            .map(|message_ids| WsMessage::MarkedRead { message_ids }),
        WsMessage::Delete { message_id } => state
            .delivery
            .delete_message(&message_id, user_id)
            .await
            .map(|()| WsMessage::Deleted { message_id }),
        WsMessage::TotalUnread { .. } => state
            .aggregator
            .total_unread(user_id)
            .await
            .map(|count| WsMessage::TotalUnread { count: Some(count) }),
        WsMessage::Connect { .. } => return WsMessage::error("Already connected"),
        other => {
            debug_assert!(other.is_server_only());
            warn!(user_id = %user_id, "Client sent a server-only frame");
            return WsMessage::error("Unexpected message type");
        }
    };

    result.unwrap_or_else(|e| {
        warn!(user_id = %user_id, error = %e, "Request failed");
        WsMessage::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_messaging::models::Profile;
    use hangar_messaging::store::MemoryStore;
    use hangar_messaging::{Directory, MessagingConfig};

    fn state() -> RelayState {
        RelayState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Directory::with_profiles([
                Profile::new("a", "Ahmet"),
                Profile::new("b", "Berk"),
            ])),
            MessagingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_malformed_request_yields_error_frame() {
        let state = state();
        let reply = handle_request("{not json", "a", &state).await;
        assert!(matches!(reply, WsMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_send_uses_connection_identity() {
        let state = state();
        let json = r#"{"type":"send","sender_id":"b","counterpart_id":"b","body":"Merhaba"}"#;
        match handle_request(json, "a", &state).await {
            WsMessage::Sent { message } => {
                assert_eq!(message.sender_id, "a");
                assert_eq!(message.receiver_id, "b");
            }
            other => panic!("Expected Sent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_domain_errors_carry_codes() {
        let state = state();
        let reply = handle_request(r#"{"type":"send","counterpart_id":"b","body":"  "}"#, "a", &state).await;
        match reply {
            WsMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("empty_message")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_only_frames_are_rejected() {
        let state = state();
        let reply = handle_request(r#"{"type":"changed","at":1}"#, "a", &state).await;
        assert!(matches!(reply, WsMessage::Error { .. }));
        let reply = handle_request(r#"{"type":"connect","user_id":"b"}"#, "a", &state).await;
        assert!(matches!(reply, WsMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_total_unread_reply() {
        let state = state();
        handle_request(r#"{"type":"send","counterpart_id":"a","body":"selam"}"#, "b", &state).await;
        match handle_request(r#"{"type":"total_unread"}"#, "a", &state).await {
            WsMessage::TotalUnread { count } => assert_eq!(count, Some(1)),
            other => panic!("Expected TotalUnread, got {:?}", other),
        }
    }
}
