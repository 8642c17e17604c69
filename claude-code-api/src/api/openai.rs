//! OpenAI-compatible `POST /v1/chat/completions`.

use std::convert::Infallible;
use std::time::Duration;

use axum::{Extension, Json, extract::State, response::IntoResponse, response::sse::{Event, KeepAlive, Sse}};
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::api::{dispatch, dispatch_streaming, invalid, resolve_session, with_disconnect_guard};
use crate::core::types::{RunOptions, StreamChunk};
use crate::middleware::auth::Credential;
use crate::models::openai::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatCompletionStreamResponse,
    ChatMessage, DeltaMessage, MessageContent, StreamChoice, Usage,
};
use crate::models::error::ApiResult;
use crate::state::AppState;
use crate::utils::streaming::create_done_event;

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(Credential(credential)): Extension<Credential>,
    Json(req): Json<ChatCompletionRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(model = %req.model, "chat completion request received");

    if req.messages.is_empty() {
        return Err(invalid("messages cannot be empty"));
    }

    let session = resolve_session(&state, &credential, req.session_id.as_deref()).await?;
    let prompt = format_prompt(&req.messages);

    let mut opts = RunOptions::new(
        prompt,
        Duration::from_millis(state.settings.dispatch.request_timeout_millis),
        CancellationToken::new(),
    );
    opts.model = Some(req.model.clone());

    let model = req.model;
    let created = Utc::now().timestamp();
    let id = format!("chatcmpl-{}", Uuid::new_v4());

    if req.stream.unwrap_or(false) {
        let (rx, cancel) = dispatch_streaming(state, credential, session, opts);
        let chunks = with_disconnect_guard(openai_stream(rx, id, created, model), cancel);
        let body = chunks
            .map(|chunk| Ok::<_, Infallible>(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())))
            .chain(futures::stream::once(async { Ok(create_done_event()) }));
        Ok(Sse::new(body).keep_alive(KeepAlive::new()).into_response())
    } else {
        let (result, session_id) = dispatch(&state, &credential, session, opts).await?;
        let token_count = result.result.split_whitespace().count() as i32;

        let response = ChatCompletionResponse {
            id,
            object: "chat.completion".to_string(),
            created,
            model: result.model.unwrap_or(model),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(result.result)),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: token_count,
                total_tokens: token_count,
            },
            session_id,
        };
        Ok(Json(response).into_response())
    }
}

/// Flattens a chat history into the CLI's single-prompt input: prior turns
/// are prefixed by role, the final (current) turn is passed through raw.
fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut conversation = String::new();
    for (i, message) in messages.iter().enumerate() {
        let content = message.content.as_ref().map(MessageContent::as_text).unwrap_or_default();
        if i == messages.len() - 1 {
            conversation.push_str(&content);
        } else {
            match message.role.as_str() {
                "user" => conversation.push_str(&format!("User: {content}\n")),
                "assistant" => conversation.push_str(&format!("Assistant: {content}\n")),
                "system" => conversation.push_str(&format!("System: {content}\n")),
                _ => {},
            }
        }
    }
    conversation
}

fn openai_stream(
    mut rx: tokio::sync::mpsc::Receiver<StreamChunk>,
    id: String,
    created: i64,
    model: String,
) -> impl Stream<Item = ChatCompletionStreamResponse> {
    async_stream::stream! {
        let mut sent_role = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Delta { text } => {
                    let delta = DeltaMessage {
                        role: if sent_role { None } else { Some("assistant".to_string()) },
                        content: Some(text),
                    };
                    sent_role = true;
                    yield ChatCompletionStreamResponse {
                        id: id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: model.clone(),
                        choices: vec![StreamChoice { index: 0, delta, finish_reason: None }],
                    };
                },
                StreamChunk::End { stop_reason } => {
                    yield ChatCompletionStreamResponse {
                        id: id.clone(),
                        object: "chat.completion.chunk".to_string(),
                        created,
                        model: model.clone(),
                        choices: vec![StreamChoice {
                            index: 0,
                            delta: DeltaMessage::default(),
                            finish_reason: Some(stop_reason),
                        }],
                    };
                },
            }
        }
    }
}
