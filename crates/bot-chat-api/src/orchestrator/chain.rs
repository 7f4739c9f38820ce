//! The retrieval-augmented generation procedure for one turn: condense the
//! question against the history, retrieve, then answer over the retrieved
//! context. The answering and condensing models are separate so a streaming
//! answer client never leaks condensation tokens.

use super::{ChatModel, Retriever};
use crate::models::{ChatMessage, SourceDocument};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

const CONTEXT_SLOT: &str = "{{context}}";
const QUESTION_SLOT: &str = "{{question}}";
const CHAT_HISTORY_SLOT: &str = "{{chat_history}}";

pub struct ConversationChain {
    answer_llm: Arc<dyn ChatModel>,
    question_llm: Arc<dyn ChatModel>,
    question_generator_prompt: String,
    qa_prompt: String,
    retriever: Arc<dyn Retriever>,
}

impl ConversationChain {
    pub fn new(
        answer_llm: Arc<dyn ChatModel>,
        question_llm: Arc<dyn ChatModel>,
        question_generator_prompt: String,
        qa_prompt: String,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            answer_llm,
            question_llm,
            question_generator_prompt,
            qa_prompt,
            retriever,
        }
    }

    /// Runs the full turn and returns the answer text. Consumes the chain so
    /// every collaborator (and with it the capture handle and any token
    /// sink) is dropped once the call settles.
    pub async fn invoke(self, question: &str, chat_history: Vec<ChatMessage>) -> Result<String> {
        let standalone = if chat_history.is_empty() {
            question.to_string()
        } else {
            self.condense_question(question, &chat_history).await?
        };

        let documents = self.retriever.retrieve(&standalone).await?;
        debug!(count = documents.len(), "retrieved context documents");

        let system = self
            .qa_prompt
            .replace(CONTEXT_SLOT, &build_context(&documents));

        let mut messages = Vec::with_capacity(chat_history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(chat_history);
        messages.push(ChatMessage::user(question));

        self.answer_llm.complete(messages).await
    }

    async fn condense_question(
        &self,
        question: &str,
        chat_history: &[ChatMessage],
    ) -> Result<String> {
        let transcript = chat_history
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = self
            .question_generator_prompt
            .replace(CHAT_HISTORY_SLOT, &transcript)
            .replace(QUESTION_SLOT, question);

        let condensed = self
            .question_llm
            .complete(vec![ChatMessage::user(prompt)])
            .await?;

        let condensed = condensed.trim();
        // A degenerate condensation falls back to the literal question.
        if condensed.is_empty() {
            Ok(question.to_string())
        } else {
            Ok(condensed.to_string())
        }
    }
}

fn build_context(documents: &[SourceDocument]) -> String {
    if documents.is_empty() {
        return "No relevant context found.".to_string();
    }

    documents
        .iter()
        .map(|d| d.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedModel {
        reply: String,
        calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
            self.calls.lock().push(messages);
            Ok(self.reply.clone())
        }
    }

    struct RecordingRetriever {
        queries: Arc<Mutex<Vec<String>>>,
        documents: Vec<SourceDocument>,
    }

    #[async_trait]
    impl Retriever for RecordingRetriever {
        async fn retrieve(&self, query: &str) -> Result<Vec<SourceDocument>> {
            self.queries.lock().push(query.to_string());
            Ok(self.documents.clone())
        }
    }

    fn doc(content: &str) -> SourceDocument {
        SourceDocument {
            content: content.to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn chain_parts() -> (
        Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        Arc<Mutex<Vec<String>>>,
        ConversationChain,
    ) {
        let answer_calls = Arc::new(Mutex::new(Vec::new()));
        let question_calls = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));

        let chain = ConversationChain::new(
            Arc::new(ScriptedModel {
                reply: "final answer".to_string(),
                calls: answer_calls.clone(),
            }),
            Arc::new(ScriptedModel {
                reply: "standalone question".to_string(),
                calls: question_calls.clone(),
            }),
            "History:\n{{chat_history}}\nRephrase: {{question}}".to_string(),
            "Answer from context:\n{{context}}".to_string(),
            Arc::new(RecordingRetriever {
                queries: queries.clone(),
                documents: vec![doc("ctx one"), doc("ctx two")],
            }),
        );

        (answer_calls, question_calls, queries, chain)
    }

    #[tokio::test]
    async fn empty_history_skips_condensation() {
        let (answer_calls, question_calls, queries, chain) = chain_parts();

        let answer = chain.invoke("What is the refund policy?", vec![]).await.unwrap();
        assert_eq!(answer, "final answer");

        assert!(question_calls.lock().is_empty());
        assert_eq!(queries.lock().as_slice(), &["What is the refund policy?"]);

        let calls = answer_calls.lock();
        let system = &calls[0][0];
        assert_eq!(system.role, "system");
        assert!(system.content.contains("ctx one\n\nctx two"));
    }

    #[tokio::test]
    async fn history_condenses_before_retrieval() {
        let (answer_calls, question_calls, queries, chain) = chain_parts();

        let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")];
        chain.invoke("and then?", history).await.unwrap();

        let condense = question_calls.lock();
        assert_eq!(condense.len(), 1);
        assert!(condense[0][0].content.contains("user: earlier"));
        assert!(condense[0][0].content.contains("Rephrase: and then?"));

        // Retrieval runs on the condensed question, not the raw one.
        assert_eq!(queries.lock().as_slice(), &["standalone question"]);

        // The answer call still sees the raw question and the history.
        let calls = answer_calls.lock();
        let messages = &calls[0];
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("and then?"));
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn empty_retrieval_still_answers() {
        let answer_calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ConversationChain::new(
            Arc::new(ScriptedModel {
                reply: "no sources answer".to_string(),
                calls: answer_calls.clone(),
            }),
            Arc::new(ScriptedModel {
                reply: String::new(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
            "{{question}}".to_string(),
            "{{context}}".to_string(),
            Arc::new(RecordingRetriever {
                queries: Arc::new(Mutex::new(Vec::new())),
                documents: vec![],
            }),
        );

        let answer = chain.invoke("anything", vec![]).await.unwrap();
        assert_eq!(answer, "no sources answer");

        let calls = answer_calls.lock();
        assert!(calls[0][0].content.contains("No relevant context found."));
    }
}
