//! Anthropic-compatible `POST /v1/messages`, including its named-event SSE
//! streaming form.

use std::convert::Infallible;
use std::time::Duration;

use axum::{Extension, Json, extract::State, response::IntoResponse, response::sse::{Event, KeepAlive, Sse}};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::api::{dispatch, dispatch_streaming, invalid, resolve_session, with_disconnect_guard};
use crate::core::types::{RunOptions, StreamChunk};
use crate::middleware::auth::Credential;
use crate::models::anthropic::{InputMessage, MessagesRequest, MessagesResponse, ResponseBlock};
use crate::models::error::ApiResult;
use crate::state::AppState;

pub async fn messages(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Json(req): Json<MessagesRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(model = %req.model, "messages request received");

    if req.messages.is_empty() {
        return Err(invalid("messages cannot be empty"));
    }

    let session = resolve_session(&state, &credential, req.session_id.as_deref()).await?;
    let prompt = format_prompt(req.system.as_deref(), &req.messages);

    let mut opts = RunOptions::new(
        prompt,
        Duration::from_millis(state.settings.dispatch.request_timeout_millis),
        CancellationToken::new(),
    );
    opts.model = Some(req.model.clone());
    opts.max_turns = req.max_turns;

    let model = req.model;
    let id = format!("msg-{}", Uuid::new_v4());

    if req.stream.unwrap_or(false) {
        let (rx, cancel) = dispatch_streaming(state, credential, session, opts);
        let body = with_disconnect_guard(anthropic_stream(rx), cancel).map(Ok::<_, Infallible>);
        Ok(Sse::new(body).keep_alive(KeepAlive::new()).into_response())
    } else {
        let (result, session_id) = dispatch(&state, &credential, session, opts).await?;
        let response = MessagesResponse {
            id,
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: result.model.unwrap_or(model),
            content: vec![ResponseBlock::Text { text: result.result }],
            stop_reason: Some("end_turn".to_string()),
            session_id,
        };
        Ok(Json(response).into_response())
    }
}

fn format_prompt(system: Option<&str>, messages: &[InputMessage]) -> String {
    let mut conversation = String::new();
    if let Some(system) = system {
        conversation.push_str(&format!("System: {system}\n"));
    }
    for (i, message) in messages.iter().enumerate() {
        if i == messages.len() - 1 {
            conversation.push_str(&message.content);
        } else {
            match message.role.as_str() {
                "user" => conversation.push_str(&format!("User: {}\n", message.content)),
                "assistant" => conversation.push_str(&format!("Assistant: {}\n", message.content)),
                _ => {},
            }
        }
    }
    conversation
}

fn anthropic_stream(mut rx: tokio::sync::mpsc::Receiver<StreamChunk>) -> impl Stream<Item = Event> {
    async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Delta { text } => {
                    let data = serde_json::json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": { "type": "text_delta", "text": text },
                    });
                    yield Event::default().event("content_block_delta").data(data.to_string());
                },
                StreamChunk::End { stop_reason } => {
                    let data = serde_json::json!({ "type": "message_delta", "delta": { "stop_reason": stop_reason } });
                    yield Event::default().event("message_delta").data(data.to_string());
                    yield Event::default().event("message_stop").data(serde_json::json!({ "type": "message_stop" }).to_string());
                },
            }
        }
    }
}
