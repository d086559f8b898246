//! WebSocket transport for the event relay.
//!
//! Each socket is one relay connection. Clients subscribe to sessions with
//! JSON frames and receive every event the relay publishes for them.

use axum::{
    extract::State,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agentrelay_core::StreamEvent;
use agentrelay_stream::EventRelay;

use crate::api_v1::SharedApiState;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    SubscribeStream {
        session_id: String,
        #[serde(default)]
        execution_id: Option<String>,
    },
    UnsubscribeStream {
        session_id: String,
        #[serde(default)]
        execution_id: Option<String>,
    },
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Connected {
        connection_id: String,
    },
    StreamSubscribed {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    StreamUnsubscribed {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    StreamEvent {
        event: StreamEvent,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Apply one client frame to the relay and produce the acknowledgement.
pub fn handle_frame(relay: &EventRelay, connection_id: &str, frame: ClientFrame) -> ServerFrame {
    match frame {
        ClientFrame::SubscribeStream {
            session_id,
            execution_id,
        } => {
            if relay.subscribe(connection_id, &session_id, execution_id.as_deref()) {
                ServerFrame::StreamSubscribed {
                    session_id,
                    execution_id,
                }
            } else {
                ServerFrame::Error {
                    message: format!("Connection {connection_id} is not registered"),
                }
            }
        }
        ClientFrame::UnsubscribeStream {
            session_id,
            execution_id,
        } => {
            let removed = relay.unsubscribe(connection_id, &session_id, execution_id.as_deref());
            match execution_id {
                Some(execution_id) if !removed => ServerFrame::Error {
                    message: format!("No subscription to {session_id} for execution {execution_id}"),
                },
                execution_id => ServerFrame::StreamUnsubscribed {
                    session_id,
                    execution_id,
                },
            }
        }
        ClientFrame::Ping => ServerFrame::Pong,
    }
}

/// Decode a text frame; malformed input becomes an `error` frame.
pub fn handle_text(relay: &EventRelay, connection_id: &str, text: &str) -> ServerFrame {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => handle_frame(relay, connection_id, frame),
        Err(e) => ServerFrame::Error {
            message: format!("Invalid message: {e}"),
        },
    }
}

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedApiState) {
    let relay = state.relay.clone();
    let (connection_id, mut events) = relay.connect();
    info!(connection_id = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let _ = reply_tx.send(ServerFrame::Connected {
        connection_id: connection_id.clone(),
    });

    // Single writer: acknowledgements and relayed events share the socket.
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = reply_rx.recv() => frame,
                Some(event) = events.recv() => ServerFrame::StreamEvent { event },
                else => break,
            };
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode server frame: {e}");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let reply = match msg {
            WsMessage::Text(text) => handle_text(&relay, &connection_id, text.as_str()),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if reply_tx.send(reply).is_err() {
            break;
        }
    }

    relay.disconnect(&connection_id);
    writer.abort();
    debug!(connection_id = %connection_id, "WebSocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_core::StreamPayload;
    use agentrelay_stream::EventSink;

    #[test]
    fn client_frames_decode() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe_stream","sessionId":"s1","executionId":"e1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SubscribeStream {
                session_id: "s1".into(),
                execution_id: Some("e1".into()),
            }
        );

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping);
    }

    #[test]
    fn subscribe_is_acknowledged() {
        let relay = EventRelay::new();
        let (conn, _rx) = relay.connect();

        let reply = handle_text(&relay, &conn, r#"{"type":"subscribe_stream","sessionId":"s1"}"#);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "stream_subscribed");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("executionId").is_none());
        assert_eq!(relay.subscriber_count("s1"), 1);
    }

    #[test]
    fn unsubscribe_is_acknowledged() {
        let relay = EventRelay::new();
        let (conn, _rx) = relay.connect();
        relay.subscribe(&conn, "s1", None);

        let reply = handle_text(&relay, &conn, r#"{"type":"unsubscribe_stream","sessionId":"s1"}"#);
        assert_eq!(
            reply,
            ServerFrame::StreamUnsubscribed {
                session_id: "s1".into(),
                execution_id: None,
            }
        );
        assert_eq!(relay.subscriber_count("s1"), 0);
    }

    #[test]
    fn unsubscribe_honours_execution_filter() {
        let relay = EventRelay::new();
        let (conn, _rx) = relay.connect();
        relay.subscribe(&conn, "s1", Some("e1"));

        let reply = handle_text(
            &relay,
            &conn,
            r#"{"type":"unsubscribe_stream","sessionId":"s1","executionId":"e2"}"#,
        );
        assert!(matches!(reply, ServerFrame::Error { .. }));
        assert_eq!(relay.subscriber_count("s1"), 1);

        let reply = handle_text(
            &relay,
            &conn,
            r#"{"type":"unsubscribe_stream","sessionId":"s1","executionId":"e1"}"#,
        );
        assert_eq!(
            reply,
            ServerFrame::StreamUnsubscribed {
                session_id: "s1".into(),
                execution_id: Some("e1".into()),
            }
        );
        assert_eq!(relay.subscriber_count("s1"), 0);
    }

    #[test]
    fn ping_gets_pong() {
        let relay = EventRelay::new();
        let reply = handle_text(&relay, "c1", r#"{"type":"ping"}"#);
        assert_eq!(serde_json::to_value(&reply).unwrap(), serde_json::json!({"type": "pong"}));
    }

    #[test]
    fn unknown_connection_cannot_subscribe() {
        let relay = EventRelay::new();
        let reply = handle_text(&relay, "ghost", r#"{"type":"subscribe_stream","sessionId":"s1"}"#);
        assert!(matches!(reply, ServerFrame::Error { .. }));
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let relay = EventRelay::new();
        let reply = handle_text(&relay, "c1", r#"{"type":"shout"}"#);
        match reply {
            ServerFrame::Error { message } => assert!(message.starts_with("Invalid message")),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relayed_event_wraps_in_stream_event_frame() {
        let relay = EventRelay::new();
        let (conn, mut rx) = relay.connect();
        relay.subscribe(&conn, "s1", None);

        relay.publish(&StreamEvent::new(
            "s1",
            "e1",
            StreamPayload::Chunk {
                chunk: "Hi".into(),
                accumulated: Some("Hi".into()),
                tokens: None,
            },
        ));

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(ServerFrame::StreamEvent { event }).unwrap();
        assert_eq!(json["type"], "stream_event");
        assert_eq!(json["event"]["type"], "stream_chunk");
        assert_eq!(json["event"]["sessionId"], "s1");
        assert_eq!(json["event"]["data"]["chunk"], "Hi");
    }
}
