use crate::models::{BotReply, ChatReply, ChatRequest, ChunkPayload};
use crate::orchestrator::{
    authorize, extend_history, resolve_models, run_turn, BufferedSink, ChatDeps, ChatError,
    EventSink, StreamEvent,
};
use crate::utils::error::ApiError;
use axum::{
    extract::{Extension, Path},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

const API_KEY_HEADER: &str = "x-api-key";

/// The in-band answer a one-shot request gets when model resolution fails.
const FALLBACK_TEXT: &str = "There was an error processing your request.";

/// POST /api/bots/{public_id}/chat — one endpoint, two delivery protocols
/// selected by the request's `stream` flag.
pub async fn chat_handler(
    Extension(deps): Extension<ChatDeps>,
    Path(public_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let request_id = uuid::Uuid::new_v4();
    let span = info_span!("chat", %request_id, bot = %public_id);

    info!(
        parent: &span,
        stream = request.stream,
        message_len = request.message.len(),
        history_len = request.history.len(),
        "Chat request"
    );

    if request.stream {
        chat_stream(deps, public_id, api_key, request)
            .instrument(span)
            .await
            .into_response()
    } else {
        chat_once(deps, public_id, api_key, request)
            .instrument(span)
            .await
            .into_response()
    }
}

/// One-shot protocol: auth failures are HTTP errors; resolution failures are
/// a soft in-band payload; everything downstream of a successful resolution
/// either succeeds (persist, then 200) or collapses to a 500.
async fn chat_once(
    deps: ChatDeps,
    public_id: String,
    api_key: String,
    request: ChatRequest,
) -> Result<Json<ChatReply>, ApiError> {
    let bot = authorize(deps.registry.as_ref(), &public_id, &api_key).await?;

    let models = match resolve_models(deps.catalog.as_ref(), &bot).await {
        Ok(models) => models,
        Err(ChatError::MissingModel(kind)) => {
            warn!(%kind, "model resolution failed, returning fallback payload");
            return Ok(Json(fallback_reply(&request)));
        }
        Err(err) => return Err(err.into()),
    };

    let mut sink = BufferedSink::default();
    run_turn(
        &deps,
        &bot,
        &models,
        &request.message,
        &request.history,
        &mut sink,
    )
    .await?;

    let reply = sink
        .into_reply()
        .ok_or_else(|| ApiError::Internal("turn completed without a reply".to_string()))?;

    Ok(Json(reply))
}

/// Streaming protocol: any failure before the stream opens is an HTTP
/// error; after that the turn runs in its own task feeding the SSE channel,
/// and dropping the stream (client disconnect) cancels it.
async fn chat_stream(
    deps: ChatDeps,
    public_id: String,
    api_key: String,
    request: ChatRequest,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let bot = authorize(deps.registry.as_ref(), &public_id, &api_key).await?;
    let models = resolve_models(deps.catalog.as_ref(), &bot).await?;

    let (tx, mut rx) = mpsc::channel(16);
    let task = async move {
        let mut sink = EventSink::new(tx);
        match run_turn(
            &deps,
            &bot,
            &models,
            &request.message,
            &request.history,
            &mut sink,
        )
        .await
        {
            Ok(()) | Err(ChatError::ClientDisconnected) => {}
            // The stream is already open; a 500 is no longer representable.
            // Closing without a result event is all the client can observe.
            Err(err) => error!(error = %err, "chat stream failed after start"),
        }
    };
    tokio::spawn(task.instrument(tracing::Span::current()));

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<_, Infallible>(event_to_sse(event));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn fallback_reply(request: &ChatRequest) -> ChatReply {
    ChatReply {
        bot: BotReply {
            text: FALLBACK_TEXT.to_string(),
            source_documents: Vec::new(),
        },
        history: extend_history(&request.history, &request.message, FALLBACK_TEXT),
    }
}

fn event_to_sse(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Chunk(message) => sse_event("chunk", &ChunkPayload { message }),
        StreamEvent::Result(reply) => sse_event("result", &reply),
    }
}

fn sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Event {
    Event::default()
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}
