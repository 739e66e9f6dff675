//! WebSocket chat: ticket-gated upgrade, token streaming, heartbeat.
//!
//! Connection lifecycle:
//! 1. Client calls `POST /auth/ws-ticket` for a one-time ticket.
//! 2. Client opens `GET /ws/chat?ticket=...`; ticket validated, upgraded.
//! 3. Each `prompt` message streams back `token` events in generation
//!    order, ending with `done` (usage) or `cancelled`.
//! 4. Heartbeat every 30 s; 3 missed pongs disconnect; session max 1 h.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::audit;
use crate::core_state::CoreState;
use crate::inference::{GenerateRequest, InferKind, InferenceError, StreamEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_MAX: Duration = Duration::from_secs(3600);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const CHAT_DEADLINE: Duration = Duration::from_secs(180);

#[derive(Deserialize)]
pub struct WsAuthQuery {
    ticket: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsIncoming {
    Prompt {
        prompt: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    Pong {},
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutgoing {
    Welcome { username: String },
    Token { token: String },
    Done { usage: crate::inference::Usage },
    Cancelled {},
    Refusal { message: String },
    Error { code: String, message: String, retry_after: Option<u64> },
    Heartbeat { server_time: String },
}

/// A prompt the assistant must refuse: requests for legal advice rather
/// than bookkeeping assistance.
fn is_legal_advice(prompt: &str) -> bool {
    let lowered = prompt.to_lowercase();
    [
        "pravni savjet",
        "mogu li tužiti",
        "trebam li tužiti",
        "hoću li dobiti spor",
        "zastupaj me",
        "legal advice",
        "should i sue",
    ]
    .iter()
    .any(|marker| lowered.contains(marker))
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<WsAuthQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let username = {
        let mut tickets = ctx
            .ws_tickets
            .lock()
            .map_err(|_| ApiError::Internal("ticket lock".into()))?;
        tickets.consume(&query.ticket).ok_or(ApiError::Unauthorized)?
    };

    tracing::info!(user = %username, "WebSocket upgrade accepted");
    let core = ctx.core.clone();
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, core, username)))
}

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

async fn send_msg(sink: &mut WsSink, msg: &WsOutgoing) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).expect("outgoing serializes");
    sink.send(Message::Text(json.into())).await
}

async fn handle_ws(socket: WebSocket, core: Arc<CoreState>, username: String) {
    let (mut sink, mut stream) = socket.split();

    if send_msg(&mut sink, &WsOutgoing::Welcome { username: username.clone() })
        .await
        .is_err()
    {
        return;
    }

    let session_start = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // consume the immediate tick
    let mut missed_heartbeats: u32 = 0;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(ref text))) => {
                        let parsed = serde_json::from_str::<WsIncoming>(text);
                        match parsed {
                            Ok(WsIncoming::Pong {}) => {
                                missed_heartbeats = 0;
                            }
                            Ok(WsIncoming::Prompt { prompt, client_id }) => {
                                if handle_prompt(&core, &username, &prompt, client_id, &mut sink)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(_) => {
                                let _ = send_msg(&mut sink, &WsOutgoing::Error {
                                    code: "BAD_REQUEST".into(),
                                    message: "unrecognized message".into(),
                                    retry_after: None,
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if session_start.elapsed() >= SESSION_MAX {
                    break;
                }
                if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                    tracing::info!(user = %username, "Missed heartbeats, disconnecting");
                    break;
                }
                if send_msg(&mut sink, &WsOutgoing::Heartbeat {
                    server_time: chrono::Utc::now().to_rfc3339(),
                }).await.is_err() {
                    break;
                }
                missed_heartbeats += 1;
            }
        }
    }

    let _ = sink.close().await;
    tracing::info!(user = %username, "WebSocket disconnected");
}

async fn handle_prompt(
    core: &Arc<CoreState>,
    username: &str,
    prompt: &str,
    client_id: Option<String>,
    sink: &mut WsSink,
) -> Result<(), ()> {
    if prompt.trim().is_empty() {
        let _ = send_msg(sink, &WsOutgoing::Error {
            code: "BAD_REQUEST".into(),
            message: "empty prompt".into(),
            retry_after: None,
        })
        .await;
        return Ok(());
    }

    // Legal advice is refused and the refusal is recorded; no state
    // progresses.
    if is_legal_advice(prompt) {
        if let Ok(conn) = core.db.open() {
            let _ = audit::append(
                &conn,
                username,
                audit::kind::SAFETY_REFUSAL,
                username,
                serde_json::json!({ "reason": "legal_advice_prompt" }),
            );
        }
        let _ = send_msg(sink, &WsOutgoing::Refusal {
            message: "Mogu pomoći s knjigovodstvom, ali ne smijem davati pravne savjete. \
                      Za pravno mišljenje obratite se odvjetniku."
                .into(),
        })
        .await;
        return Ok(());
    }

    let system = match &client_id {
        Some(client) => format!(
            "Ti si računovodstveni asistent ureda. Radni kontekst: klijent {client}."
        ),
        None => "Ti si računovodstveni asistent ureda.".to_string(),
    };

    let outcome = core
        .orchestrator
        .infer_stream(
            GenerateRequest {
                kind: InferKind::Chat,
                system,
                prompt: prompt.to_string(),
                max_tokens: 1024,
            },
            CHAT_DEADLINE,
        )
        .await;

    let mut active = match outcome {
        Ok(stream) => stream,
        Err(InferenceError::Overloaded { retry_after_secs }) => {
            let _ = send_msg(sink, &WsOutgoing::Error {
                code: "OVERLOADED".into(),
                message: "inference queue full".into(),
                retry_after: Some(retry_after_secs),
            })
            .await;
            return Ok(());
        }
        Err(e) => {
            let _ = send_msg(sink, &WsOutgoing::Error {
                code: "INFERENCE_FAILED".into(),
                message: e.to_string(),
                retry_after: None,
            })
            .await;
            return Ok(());
        }
    };

    let mut response_text = String::new();
    loop {
        match active.next_event().await {
            StreamEvent::Token(token) => {
                response_text.push_str(&token);
                if send_msg(sink, &WsOutgoing::Token { token }).await.is_err() {
                    // Client disconnected; dropping the stream releases
                    // the inference slot.
                    return Err(());
                }
            }
            StreamEvent::Done(usage) => {
                // Completed exchanges land in the L1 episodic journal.
                if let Ok(conn) = core.db.open() {
                    let _ = crate::memory::journal(
                        &conn,
                        username,
                        "ws",
                        "chat",
                        serde_json::json!({
                            "prompt": prompt,
                            "response": response_text,
                            "client_id": client_id,
                        }),
                    );
                }
                let _ = send_msg(sink, &WsOutgoing::Done { usage }).await;
                return Ok(());
            }
            StreamEvent::Cancelled => {
                let _ = send_msg(sink, &WsOutgoing::Cancelled {}).await;
                return Ok(());
            }
            StreamEvent::Failed(reason) => {
                let _ = send_msg(sink, &WsOutgoing::Error {
                    code: "INFERENCE_FAILED".into(),
                    message: reason,
                    retry_after: None,
                })
                .await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_advice_markers_detected() {
        assert!(is_legal_advice("Trebam pravni savjet oko ugovora"));
        assert!(is_legal_advice("Mogu li tužiti dobavljača?"));
        assert!(is_legal_advice("Should I sue my supplier?"));

        assert!(!is_legal_advice("Na koji konto knjižim uredski materijal?"));
        assert!(!is_legal_advice("Koja je stopa PDV-a na smještaj?"));
    }

    #[test]
    fn outgoing_messages_serialize_with_type_tag() {
        let msg = WsOutgoing::Token { token: "konto".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"token\""));

        let msg = WsOutgoing::Error {
            code: "OVERLOADED".into(),
            message: "full".into(),
            retry_after: Some(5),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"retry_after\":5"));
    }

    #[test]
    fn incoming_prompt_parses() {
        let msg: WsIncoming =
            serde_json::from_str(r#"{"type":"prompt","prompt":"pozdrav","client_id":"K1"}"#)
                .unwrap();
        assert!(matches!(msg, WsIncoming::Prompt { .. }));

        let msg: WsIncoming = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(msg, WsIncoming::Pong {}));
    }
}
