use serde::{Deserialize, Serialize};

// ===== REQUEST MODELS =====

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub stream: bool,
}

/// One prior turn of the conversation, caller-supplied. Wire shape is
/// `{"type": "human"|"ai", "text": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(rename = "type")]
    pub role: TurnRole,
    pub text: String,
}

impl ChatTurn {
    pub fn human(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Human,
            text: text.into(),
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Ai,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Human,
    Ai,
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub bot: BotReply,
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotReply {
    pub text: String,
    #[serde(rename = "sourceDocuments")]
    pub source_documents: Vec<SourceDocument>,
}

/// A retrieved document as returned to the client: opaque content plus
/// whatever metadata the search backend attached. Never mutated past
/// retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Payload of one SSE `chunk` event: a single model token.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPayload {
    pub message: String,
}

// ===== LLM WIRE MODELS =====

/// One message of a chat-completion request against the model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_turn_wire_shape() {
        let turn = ChatTurn::human("What is the refund policy?");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "human", "text": "What is the refund policy?"})
        );

        let back: ChatTurn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn chat_request_defaults() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(request.message, "hi");
        assert!(request.history.is_empty());
        assert!(!request.stream);
    }

    #[test]
    fn reply_serializes_source_documents_key() {
        let reply = ChatReply {
            bot: BotReply {
                text: "answer".to_string(),
                source_documents: vec![],
            },
            history: vec![ChatTurn::human("hi"), ChatTurn::ai("answer")],
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert!(json["bot"]["sourceDocuments"].is_array());
        assert_eq!(json["history"][1]["type"], "ai");
    }
}
