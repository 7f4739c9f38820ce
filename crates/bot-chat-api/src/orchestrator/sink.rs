//! Response delivery abstraction. The pipeline is written once against
//! [`ResponseSink`]; the two transports differ only in their sink: a
//! buffered single payload for one-shot requests, an event channel feeding
//! the SSE stream for streaming requests.

use crate::models::ChatReply;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving side went away (streaming: the client disconnected).
#[derive(Debug, Error)]
#[error("response channel closed")]
pub struct SinkClosed;

#[async_trait]
pub trait ResponseSink: Send {
    /// Whether tokens should be delivered incrementally. Decides how many
    /// model clients the pipeline builds.
    fn is_streaming(&self) -> bool;

    /// Pushes one model token, in generation order.
    async fn push_token(&mut self, token: String) -> Result<(), SinkClosed>;

    /// Delivers the terminal payload.
    async fn deliver(&mut self, reply: ChatReply) -> Result<(), SinkClosed>;
}

/// One-shot delivery: holds the reply for the handler to return as JSON.
#[derive(Default)]
pub struct BufferedSink {
    reply: Option<ChatReply>,
}

impl BufferedSink {
    pub fn into_reply(self) -> Option<ChatReply> {
        self.reply
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn is_streaming(&self) -> bool {
        false
    }

    async fn push_token(&mut self, _token: String) -> Result<(), SinkClosed> {
        // One-shot requests run a non-streaming client; nothing to forward.
        Ok(())
    }

    async fn deliver(&mut self, reply: ChatReply) -> Result<(), SinkClosed> {
        self.reply = Some(reply);
        Ok(())
    }
}

/// One event of the SSE protocol.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Result(ChatReply),
}

/// Streaming delivery into the handler's SSE channel. Send failure means
/// the client closed the stream.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResponseSink for EventSink {
    fn is_streaming(&self) -> bool {
        true
    }

    async fn push_token(&mut self, token: String) -> Result<(), SinkClosed> {
        self.tx
            .send(StreamEvent::Chunk(token))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn deliver(&mut self, reply: ChatReply) -> Result<(), SinkClosed> {
        self.tx
            .send(StreamEvent::Result(reply))
            .await
            .map_err(|_| SinkClosed)
    }
}
