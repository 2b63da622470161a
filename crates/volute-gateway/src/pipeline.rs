//! The message pipeline: persist inbound content, gate it on the token
//! budget, forward it to the mind's HTTP endpoint, and proxy the mind's
//! NDJSON stream back to the caller while persisting what flows through.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use volute_budget::{BudgetStatus, QueuedMessage};
use volute_core::types::{volute_conversation, ContentBlock, MessageRole, MindEvent};
use volute_supervisor::MindTarget;

/// Cap on the concatenated text blocks of one request.
const MAX_TEXT_BYTES: usize = 1024 * 1024;
/// Cap on the full serialized content, inline images included.
const MAX_CONTENT_BYTES: usize = 5 * 1024 * 1024;

const CONSERVE_PROMPT: &str = "Your token budget for this period is nearly exhausted. \
Keep your responses brief and avoid expensive tool use until the period rolls over.";

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: Vec<ContentBlock>,
    pub channel: String,
    #[serde(default)]
    pub sender: Option<String>,
}

/// POST /api/minds/{name}/message.
pub async fn message_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<MessageRequest>,
) -> ApiResult<Response> {
    let target = state.supervisor.resolve_target(&name)?;
    check_size(&body.content)?;

    // Conversation-backed channels require membership, except for the
    // daemon identity and admins.
    if let Some(conversation_id) = volute_conversation(&body.channel) {
        let conversation = state
            .store
            .get_conversation(conversation_id)?
            .ok_or_else(|| ApiError::not_found("conversation not found"))?;
        if !user.bypasses_participant_checks()
            && !state.store.is_participant(&conversation.id, user.0.id)?
        {
            return Err(ApiError::forbidden("not a participant"));
        }
    }

    let sender = body
        .sender
        .clone()
        .or_else(|| Some(user.0.username.clone()));
    let conversation_id = persist_inbound(
        &state,
        &target.name,
        &body.channel,
        sender.as_deref(),
        &body.content,
    )?;

    match state.budget.check_budget(&target.name) {
        BudgetStatus::Exceeded => {
            state.budget.enqueue(
                &target.name,
                QueuedMessage {
                    content: body.content,
                    channel: body.channel,
                    sender,
                },
            );
            info!(mind = %target.name, "budget exceeded, message queued");
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "queued": true, "reason": "budget-exceeded" })),
            )
                .into_response());
        }
        BudgetStatus::Warning => {
            state.budget.acknowledge_warning(&target.name);
            spawn_conserve_prompt(state.clone(), target.clone());
        }
        BudgetStatus::Ok => {}
    }

    let upstream = open_mind_stream(
        &state,
        &target,
        &body.content,
        &body.channel,
        sender.as_deref(),
    )
    .await?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(pump(
        state.clone(),
        target.name.clone(),
        body.channel.clone(),
        conversation_id,
        upstream,
        Some(tx),
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Deliver a daemon-originated message (scheduler fire, budget drain, wake,
/// delivery replay) through the same pipeline, draining the mind's stream
/// without a waiting client.
pub async fn deliver_internal(
    state: &Arc<AppState>,
    name: &str,
    content: &[ContentBlock],
    channel: &str,
    sender: Option<&str>,
) -> ApiResult<()> {
    let target = state.supervisor.resolve_target(name)?;
    let conversation_id = persist_inbound(state, &target.name, channel, sender, content)?;

    match state.budget.check_budget(&target.name) {
        BudgetStatus::Exceeded => {
            state.budget.enqueue(
                &target.name,
                QueuedMessage {
                    content: content.to_vec(),
                    channel: channel.to_string(),
                    sender: sender.map(String::from),
                },
            );
            return Ok(());
        }
        BudgetStatus::Warning => {
            state.budget.acknowledge_warning(&target.name);
            spawn_conserve_prompt(state.clone(), target.clone());
        }
        BudgetStatus::Ok => {}
    }

    let upstream = open_mind_stream(state, &target, content, channel, sender).await?;
    pump(
        state.clone(),
        target.name.clone(),
        channel.to_string(),
        conversation_id,
        upstream,
        None,
    )
    .await;
    Ok(())
}

fn check_size(content: &[ContentBlock]) -> ApiResult<()> {
    let text_bytes: usize = content
        .iter()
        .filter_map(|b| b.as_text())
        .map(str::len)
        .sum();
    if text_bytes > MAX_TEXT_BYTES {
        return Err(ApiError::payload_too_large("text content exceeds 1 MiB"));
    }
    let total = serde_json::to_vec(content).map(|v| v.len()).unwrap_or(0);
    if total > MAX_CONTENT_BYTES {
        return Err(ApiError::payload_too_large("content exceeds 5 MiB"));
    }
    Ok(())
}

/// Record the inbound message in the mind's history, and in the referenced
/// conversation when the channel names one. Returns the conversation id for
/// the response side of the exchange.
fn persist_inbound(
    state: &Arc<AppState>,
    mind: &str,
    channel: &str,
    sender: Option<&str>,
    content: &[ContentBlock],
) -> ApiResult<Option<String>> {
    let encoded = serde_json::to_string(content).unwrap_or_default();
    state.store.append_history(
        mind,
        Some(channel),
        None,
        sender,
        None,
        "inbound",
        Some(&encoded),
        None,
    )?;

    let Some(conversation_id) = volute_conversation(channel) else {
        return Ok(None);
    };
    let Some(conversation) = state.store.get_conversation(conversation_id)? else {
        warn!(mind, channel, "channel references a missing conversation");
        return Ok(None);
    };
    let message =
        state
            .store
            .add_message(&conversation.id, MessageRole::User, sender, content)?;
    state.bus.publish(
        "message",
        json!({ "conversation_id": conversation.id, "message": message }),
    );
    Ok(Some(conversation.id))
}

/// Open the streaming POST to the mind. Connection refused maps to 503 and
/// an upstream error status is propagated as-is.
async fn open_mind_stream(
    state: &Arc<AppState>,
    target: &MindTarget,
    content: &[ContentBlock],
    channel: &str,
    sender: Option<&str>,
) -> ApiResult<reqwest::Response> {
    let url = format!("http://127.0.0.1:{}/message", target.port);
    let body = json!({ "content": content, "channel": channel, "sender": sender });

    let response = state
        .http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() {
                ApiError::upstream("mind not running")
            } else {
                ApiError::upstream(format!("mind request failed: {}", e))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let status =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return Err(ApiError::new(status, body));
    }
    Ok(response)
}

/// Push the budget warning into the mind as a system message, off the
/// request path. Failures are logged only.
fn spawn_conserve_prompt(state: Arc<AppState>, target: MindTarget) {
    tokio::spawn(async move {
        let url = format!("http://127.0.0.1:{}/message", target.port);
        let body = json!({
            "content": [{"type": "text", "text": CONSERVE_PROMPT}],
            "channel": "system:budget",
            "sender": "volute",
        });
        if let Err(e) = state.http.post(&url).json(&body).send().await {
            warn!(mind = %target.name, error = %e, "failed to inject budget warning");
        }
    });
}

/// Read the mind's NDJSON stream to completion: forward each line verbatim
/// to the caller (when one is attached), accumulate text for persistence,
/// record usage, and drive the activity tracker. A caller disconnect aborts
/// the upstream read; whatever already arrived is still persisted.
async fn pump(
    state: Arc<AppState>,
    mind: String,
    channel: String,
    conversation_id: Option<String>,
    upstream: reqwest::Response,
    client: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
) {
    let mut client = client;
    let mut buf: Vec<u8> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut first_event = true;
    let mut saw_done = false;

    let mut stream = upstream.bytes_stream();
    'read: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(mind = %mind, error = %e, "mind stream broke mid-response");
                break;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();

            if let Some(tx) = &client {
                if tx.send(Ok(Bytes::from(line.clone()))).await.is_err() {
                    info!(mind = %mind, "caller disconnected, aborting mind stream");
                    client = None;
                    break 'read;
                }
            }

            let Ok(trimmed) = std::str::from_utf8(&line).map(str::trim) else {
                continue;
            };
            if trimmed.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<MindEvent>(trimmed) else {
                // Unknown lines are forwarded verbatim but not bookkept.
                continue;
            };

            if first_event {
                state.activity.signal(&mind, "session_start");
                first_event = false;
            }
            match event {
                MindEvent::Text { content } => text_parts.push(content),
                MindEvent::Thinking { .. } => state.activity.signal(&mind, "thinking"),
                MindEvent::ToolUse { .. } => state.activity.signal(&mind, "tool_use"),
                MindEvent::Image { .. } => state.activity.signal(&mind, "image"),
                MindEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => state.budget.record_usage(&mind, input_tokens, output_tokens),
                MindEvent::Done => {
                    saw_done = true;
                    state.activity.signal(&mind, "done");
                    break 'read;
                }
            }
        }
    }

    // A trailing partial line still belongs to the caller.
    if let Some(tx) = &client {
        if !buf.is_empty() {
            let _ = tx.send(Ok(Bytes::from(std::mem::take(&mut buf)))).await;
        }
    }

    if !text_parts.is_empty() {
        let text = text_parts.concat();
        if let Some(conversation_id) = &conversation_id {
            let blocks = vec![ContentBlock::text(text.clone())];
            match state.store.add_message(
                conversation_id,
                MessageRole::Assistant,
                Some(&mind),
                &blocks,
            ) {
                Ok(message) => {
                    state.bus.publish(
                        "message",
                        json!({ "conversation_id": conversation_id, "message": message }),
                    );
                }
                Err(e) => {
                    warn!(mind = %mind, error = %e, "failed to persist assistant message")
                }
            }
        }
        if let Err(e) = state.store.append_history(
            &mind,
            Some(&channel),
            None,
            Some(&mind),
            None,
            "outbound",
            Some(&text),
            None,
        ) {
            warn!(mind = %mind, error = %e, "failed to persist outbound history");
        }
    }

    if !saw_done {
        warn!(mind = %mind, "mind stream ended without a done event");
    }
}
