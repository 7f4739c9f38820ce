//! The request pipeline: Authorizing → Resolving → Retrieving+Generating →
//! Persisting → Responding. Written once and parameterized by the response
//! sink; the two transports differ only at their handler edge.

use super::{
    document_capture, group_turns, extend_history, BotRegistry, ChatDeps, ChatError,
    ChatModelSpec, ConversationChain, HistoryRecord, ModelCatalog, ModelKind, ResolvedModels,
    ResponseSink, RetrieverKind, TokenSink,
};
use crate::database::models::{Bot, ModelInfo, ModelProvider};
use crate::models::{BotReply, ChatReply, ChatTurn};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Looks the bot up and checks the caller's key. No side effects.
pub async fn authorize(
    registry: &dyn BotRegistry,
    public_id: &str,
    api_key: &str,
) -> Result<Bot, ChatError> {
    let bot = registry
        .resolve_bot(public_id)
        .await?
        .ok_or(ChatError::BotNotFound)?;

    if bot.bot_api_key != api_key {
        return Err(ChatError::Forbidden);
    }

    Ok(bot)
}

/// Resolves the bot's embedding and chat models. No side effects; every
/// failure here is still safe to surface in-band.
pub async fn resolve_models(
    catalog: &dyn ModelCatalog,
    bot: &Bot,
) -> Result<ResolvedModels, ChatError> {
    let embedding = catalog
        .resolve_model_info(&bot.embedding, ModelKind::Embedding)
        .await?
        .ok_or(ChatError::MissingModel(ModelKind::Embedding))?;

    let chat = catalog
        .resolve_model_info(&bot.model, ModelKind::Chat)
        .await?
        .ok_or(ChatError::MissingModel(ModelKind::Chat))?;

    Ok(ResolvedModels { embedding, chat })
}

/// Runs one authorized, resolved turn to completion: retrieval + generation
/// with document capture, then the history write, then delivery. The
/// history write always precedes the terminal payload; a sink that reports
/// closure during generation cancels the turn (the chain future is dropped)
/// and skips persistence.
pub async fn run_turn<S: ResponseSink>(
    deps: &ChatDeps,
    bot: &Bot,
    models: &ResolvedModels,
    message: &str,
    history: &[ChatTurn],
    sink: &mut S,
) -> Result<(), ChatError> {
    info!(
        bot = %bot.public_id,
        provider = %bot.provider,
        hybrid = bot.use_hybrid_search,
        streaming = sink.is_streaming(),
        "starting chat turn"
    );

    let (capture_handle, capture) = document_capture();

    let kind = if bot.use_hybrid_search {
        RetrieverKind::Hybrid
    } else {
        RetrieverKind::Vector
    };
    let retriever = deps
        .retrievers
        .build(kind, &models.embedding, bot.id, capture_handle);

    let api_key = bot_model_credential(bot, models.chat.model_provider);

    // Streaming builds two clients from the same model: the answering one
    // bound to the token sink and a silent one for question condensation.
    // One-shot uses a single silent client for both roles.
    let (answer_llm, question_llm, token_rx) = if sink.is_streaming() {
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let answer = deps
            .chat_models
            .build(model_spec(bot, &models.chat, api_key.clone(), Some(token_tx)));
        let question = deps
            .chat_models
            .build(model_spec(bot, &models.chat, api_key, None));
        (answer, question, Some(token_rx))
    } else {
        let model = deps
            .chat_models
            .build(model_spec(bot, &models.chat, api_key, None));
        (model.clone(), model, None)
    };

    let chain = ConversationChain::new(
        answer_llm,
        question_llm,
        bot.question_generator_prompt.clone(),
        bot.qa_prompt.clone(),
        retriever,
    );
    let chat_history = group_turns(history);

    let answer = match token_rx {
        Some(mut token_rx) => {
            let chain_fut = chain.invoke(message, chat_history);
            tokio::pin!(chain_fut);

            let answer = loop {
                tokio::select! {
                    result = &mut chain_fut => break result?,
                    Some(token) = token_rx.recv() => {
                        if sink.push_token(token).await.is_err() {
                            info!(bot = %bot.public_id, "client disconnected, cancelling generation");
                            return Err(ChatError::ClientDisconnected);
                        }
                    }
                }
            };

            // Tokens queued before the chain settled; flush them in order.
            while let Ok(token) = token_rx.try_recv() {
                if sink.push_token(token).await.is_err() {
                    info!(bot = %bot.public_id, "client disconnected, cancelling generation");
                    return Err(ChatError::ClientDisconnected);
                }
            }

            answer
        }
        None => chain.invoke(message, chat_history).await?,
    };

    // The chain has settled, so the retriever has already resolved (or
    // never ran); this await does not block on in-flight work.
    let documents = capture.wait().await;

    deps.history
        .append(&HistoryRecord {
            api_key: bot.bot_api_key.clone(),
            bot_id: bot.id,
            human: message.to_string(),
            bot: answer.clone(),
        })
        .await?;
    debug!(bot_id = bot.id, "exchange recorded");

    let reply = ChatReply {
        bot: BotReply {
            text: answer.clone(),
            source_documents: documents,
        },
        history: extend_history(history, message, &answer),
    };

    if sink.deliver(reply).await.is_err() {
        // The exchange is already durable; the client just never saw it.
        info!(bot = %bot.public_id, "client disconnected before the result was delivered");
    }

    Ok(())
}

/// The per-bot model credential, when the provider supports the override
/// and the bot carries a non-empty one.
fn bot_model_credential(bot: &Bot, provider: ModelProvider) -> Option<String> {
    if !provider.supports_bot_credential() {
        return None;
    }

    bot.bot_model_api_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn model_spec(
    bot: &Bot,
    chat: &ModelInfo,
    api_key: Option<String>,
    token_sink: Option<TokenSink>,
) -> ChatModelSpec {
    ChatModelSpec {
        provider: chat.model_provider,
        model: chat.model_id.clone(),
        temperature: bot.temperature,
        config: chat.config.clone(),
        api_key,
        token_sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, SourceDocument};
    use crate::orchestrator::{
        BufferedSink, CaptureHandle, ChatModel, ChatModelProvider, EventSink, HistoryStore,
        MockBotRegistry, MockModelCatalog, Retriever, RetrieverFactory, SinkClosed, StreamEvent,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn bot() -> Bot {
        Bot {
            id: 7,
            public_id: "support-bot".to_string(),
            name: "Support".to_string(),
            provider: "openai-compatible".to_string(),
            model: "answer-model".to_string(),
            embedding: "embed-model".to_string(),
            temperature: 0.2,
            use_hybrid_search: false,
            question_generator_prompt: "{{chat_history}}\n{{question}}".to_string(),
            qa_prompt: "{{context}}".to_string(),
            bot_api_key: "secret-key".to_string(),
            bot_model_api_key: None,
        }
    }

    fn chat_info(provider: ModelProvider) -> ModelInfo {
        ModelInfo {
            model_provider: provider,
            model_id: "answer-model-v2".to_string(),
            config: serde_json::json!({"base_url": "http://llm:8080"}),
        }
    }

    fn embedding_info() -> ModelInfo {
        ModelInfo {
            model_provider: ModelProvider::LlamaServer,
            model_id: "embed-model-v2".to_string(),
            config: serde_json::json!({}),
        }
    }

    fn resolved(provider: ModelProvider) -> ResolvedModels {
        ResolvedModels {
            embedding: embedding_info(),
            chat: chat_info(provider),
        }
    }

    fn doc(content: &str) -> SourceDocument {
        SourceDocument {
            content: content.to_string(),
            metadata: serde_json::json!({"similarity": 0.9}),
        }
    }

    struct FakeRetriever {
        documents: Vec<SourceDocument>,
        capture: CaptureHandle,
    }

    #[async_trait]
    impl Retriever for FakeRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<SourceDocument>> {
            self.capture.resolve(self.documents.clone());
            Ok(self.documents.clone())
        }
    }

    struct FakeRetrieverFactory {
        kinds: Arc<Mutex<Vec<RetrieverKind>>>,
        documents: Vec<SourceDocument>,
    }

    impl FakeRetrieverFactory {
        fn new(documents: Vec<SourceDocument>) -> Self {
            Self {
                kinds: Arc::new(Mutex::new(Vec::new())),
                documents,
            }
        }
    }

    impl RetrieverFactory for FakeRetrieverFactory {
        fn build(
            &self,
            kind: RetrieverKind,
            _embedding: &ModelInfo,
            _bot_id: i32,
            capture: CaptureHandle,
        ) -> Arc<dyn Retriever> {
            self.kinds.lock().push(kind);
            Arc::new(FakeRetriever {
                documents: self.documents.clone(),
                capture,
            })
        }
    }

    struct FakeModel {
        sink: Option<TokenSink>,
        tokens: Vec<String>,
        answer: String,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String> {
            if self.fail {
                anyhow::bail!("model backend unavailable");
            }
            if let Some(sink) = &self.sink {
                for token in &self.tokens {
                    let _ = sink.send(token.clone());
                }
            }
            Ok(self.answer.clone())
        }
    }

    #[derive(Clone)]
    struct BuiltSpec {
        has_sink: bool,
        api_key: Option<String>,
        model: String,
    }

    struct FakeModelProvider {
        built: Arc<Mutex<Vec<BuiltSpec>>>,
        tokens: Vec<String>,
        answer: String,
        fail: bool,
    }

    impl FakeModelProvider {
        fn new(answer: &str, tokens: &[&str]) -> Self {
            Self {
                built: Arc::new(Mutex::new(Vec::new())),
                tokens: tokens.iter().map(|t| t.to_string()).collect(),
                answer: answer.to_string(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                built: Arc::new(Mutex::new(Vec::new())),
                tokens: vec![],
                answer: String::new(),
                fail: true,
            }
        }
    }

    impl ChatModelProvider for FakeModelProvider {
        fn build(&self, spec: ChatModelSpec) -> Arc<dyn ChatModel> {
            self.built.lock().push(BuiltSpec {
                has_sink: spec.token_sink.is_some(),
                api_key: spec.api_key.clone(),
                model: spec.model.clone(),
            });
            Arc::new(FakeModel {
                sink: spec.token_sink,
                tokens: self.tokens.clone(),
                answer: self.answer.clone(),
                fail: self.fail,
            })
        }
    }

    struct RecordingHistory {
        records: Arc<Mutex<Vec<HistoryRecord>>>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingHistory {
        fn new(log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                records: Arc::new(Mutex::new(Vec::new())),
                log,
            }
        }
    }

    #[async_trait]
    impl HistoryStore for RecordingHistory {
        async fn append(&self, record: &HistoryRecord) -> Result<()> {
            self.records.lock().push(record.clone());
            self.log.lock().push("persist");
            Ok(())
        }
    }

    /// A one-shot sink that also records delivery order.
    struct OrderedSink {
        log: Arc<Mutex<Vec<&'static str>>>,
        reply: Option<ChatReply>,
    }

    #[async_trait]
    impl ResponseSink for OrderedSink {
        fn is_streaming(&self) -> bool {
            false
        }

        async fn push_token(&mut self, _token: String) -> Result<(), SinkClosed> {
            Ok(())
        }

        async fn deliver(&mut self, reply: ChatReply) -> Result<(), SinkClosed> {
            self.log.lock().push("deliver");
            self.reply = Some(reply);
            Ok(())
        }
    }

    struct Harness {
        deps: ChatDeps,
        kinds: Arc<Mutex<Vec<RetrieverKind>>>,
        built: Arc<Mutex<Vec<BuiltSpec>>>,
        records: Arc<Mutex<Vec<HistoryRecord>>>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    fn harness(provider: FakeModelProvider, documents: Vec<SourceDocument>) -> Harness {
        let factory = FakeRetrieverFactory::new(documents);
        let kinds = factory.kinds.clone();
        let built = provider.built.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let history = RecordingHistory::new(log.clone());
        let records = history.records.clone();

        Harness {
            deps: ChatDeps {
                registry: Arc::new(MockBotRegistry::new()),
                catalog: Arc::new(MockModelCatalog::new()),
                retrievers: Arc::new(factory),
                chat_models: Arc::new(provider),
                history: Arc::new(history),
            },
            kinds,
            built,
            records,
            log,
        }
    }

    #[tokio::test]
    async fn authorize_rejects_unknown_bot() {
        let mut registry = MockBotRegistry::new();
        registry.expect_resolve_bot().returning(|_| Ok(None));

        let err = authorize(&registry, "ghost", "any").await.unwrap_err();
        assert!(matches!(err, ChatError::BotNotFound));
    }

    #[tokio::test]
    async fn authorize_rejects_key_mismatch() {
        let mut registry = MockBotRegistry::new();
        registry
            .expect_resolve_bot()
            .returning(|_| Ok(Some(bot())));

        let err = authorize(&registry, "support-bot", "wrong-key")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden));
    }

    #[tokio::test]
    async fn authorize_accepts_exact_key() {
        let mut registry = MockBotRegistry::new();
        registry
            .expect_resolve_bot()
            .returning(|_| Ok(Some(bot())));

        let authorized = authorize(&registry, "support-bot", "secret-key")
            .await
            .unwrap();
        assert_eq!(authorized.id, 7);
    }

    #[tokio::test]
    async fn resolve_reports_missing_embedding() {
        let mut catalog = MockModelCatalog::new();
        catalog
            .expect_resolve_model_info()
            .returning(|_, _| Ok(None));

        let err = resolve_models(&catalog, &bot()).await.unwrap_err();
        assert!(matches!(err, ChatError::MissingModel(ModelKind::Embedding)));
    }

    #[tokio::test]
    async fn resolve_reports_missing_chat_model() {
        let mut catalog = MockModelCatalog::new();
        catalog
            .expect_resolve_model_info()
            .returning(|_, kind| match kind {
                ModelKind::Embedding => Ok(Some(embedding_info())),
                ModelKind::Chat => Ok(None),
            });

        let err = resolve_models(&catalog, &bot()).await.unwrap_err();
        assert!(matches!(err, ChatError::MissingModel(ModelKind::Chat)));
    }

    #[tokio::test]
    async fn one_shot_turn_persists_before_delivery() {
        let h = harness(
            FakeModelProvider::new("the answer", &[]),
            vec![doc("ctx")],
        );
        let history = vec![ChatTurn::human("earlier"), ChatTurn::ai("reply")];
        let mut sink = OrderedSink {
            log: h.log.clone(),
            reply: None,
        };

        run_turn(
            &h.deps,
            &bot(),
            &resolved(ModelProvider::OpenaiCompatible),
            "What is the refund policy?",
            &history,
            &mut sink,
        )
        .await
        .unwrap();

        // Exactly one record, with the message and the generated answer.
        let records = h.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].human, "What is the refund policy?");
        assert_eq!(records[0].bot, "the answer");
        assert_eq!(records[0].bot_id, 7);
        assert_eq!(records[0].api_key, "secret-key");

        // Persistence strictly precedes the terminal payload.
        assert_eq!(h.log.lock().as_slice(), &["persist", "deliver"]);

        let reply = sink.reply.unwrap();
        assert_eq!(reply.bot.text, "the answer");
        assert_eq!(reply.bot.source_documents, vec![doc("ctx")]);
        assert_eq!(reply.history.len(), 4);
        assert_eq!(reply.history[2], ChatTurn::human("What is the refund policy?"));
        assert_eq!(reply.history[3], ChatTurn::ai("the answer"));

        // One-shot builds a single silent client for both roles.
        let built = h.built.lock();
        assert_eq!(built.len(), 1);
        assert!(!built[0].has_sink);
        assert_eq!(built[0].model, "answer-model-v2");
    }

    #[tokio::test]
    async fn streaming_turn_emits_chunks_then_one_result() {
        let h = harness(
            FakeModelProvider::new("Hello", &["Hel", "lo"]),
            vec![doc("ctx")],
        );
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        run_turn(
            &h.deps,
            &bot(),
            &resolved(ModelProvider::OpenaiCompatible),
            "hi",
            &[],
            &mut sink,
        )
        .await
        .unwrap();
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Chunk(t) if t == "Hel"));
        assert!(matches!(&events[1], StreamEvent::Chunk(t) if t == "lo"));
        match &events[2] {
            StreamEvent::Result(reply) => {
                assert_eq!(reply.bot.text, "Hello");
                assert_eq!(reply.history.len(), 2);
            }
            other => panic!("expected result event, got {:?}", other),
        }

        // Two clients: the streaming answerer and the silent condenser.
        let built = h.built.lock();
        assert_eq!(built.len(), 2);
        assert!(built[0].has_sink);
        assert!(!built[1].has_sink);

        // Streaming still records exactly one exchange.
        assert_eq!(h.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_client_cancels_without_persisting() {
        let h = harness(
            FakeModelProvider::new("Hello", &["Hel", "lo"]),
            vec![doc("ctx")],
        );
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        drop(rx);
        let mut sink = EventSink::new(tx);

        let err = run_turn(
            &h.deps,
            &bot(),
            &resolved(ModelProvider::OpenaiCompatible),
            "hi",
            &[],
            &mut sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::ClientDisconnected));
        assert!(h.records.lock().is_empty());
    }

    #[tokio::test]
    async fn upstream_model_failure_skips_history() {
        let h = harness(FakeModelProvider::failing(), vec![doc("ctx")]);
        let mut sink = BufferedSink::default();

        let err = run_turn(
            &h.deps,
            &bot(),
            &resolved(ModelProvider::OpenaiCompatible),
            "hi",
            &[],
            &mut sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::Upstream(_)));
        assert!(h.records.lock().is_empty());
    }

    #[tokio::test]
    async fn hybrid_flag_selects_retriever_kind() {
        for (use_hybrid, expected) in [(true, RetrieverKind::Hybrid), (false, RetrieverKind::Vector)]
        {
            let h = harness(FakeModelProvider::new("a", &[]), vec![]);
            let mut sink = BufferedSink::default();
            let mut bot = bot();
            bot.use_hybrid_search = use_hybrid;

            run_turn(
                &h.deps,
                &bot,
                &resolved(ModelProvider::OpenaiCompatible),
                "hi",
                &[],
                &mut sink,
            )
            .await
            .unwrap();

            assert_eq!(h.kinds.lock().as_slice(), &[expected]);
        }
    }

    #[tokio::test]
    async fn bot_credential_overrides_for_capable_provider() {
        let h = harness(FakeModelProvider::new("a", &[]), vec![]);
        let mut sink = BufferedSink::default();
        let mut bot = bot();
        bot.bot_model_api_key = Some("per-bot-key".to_string());

        run_turn(
            &h.deps,
            &bot,
            &resolved(ModelProvider::OpenaiCompatible),
            "hi",
            &[],
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(
            h.built.lock()[0].api_key.as_deref(),
            Some("per-bot-key")
        );
    }

    #[tokio::test]
    async fn bot_credential_ignored_for_incapable_provider() {
        let h = harness(FakeModelProvider::new("a", &[]), vec![]);
        let mut sink = BufferedSink::default();
        let mut bot = bot();
        bot.bot_model_api_key = Some("per-bot-key".to_string());

        run_turn(
            &h.deps,
            &bot,
            &resolved(ModelProvider::LlamaServer),
            "hi",
            &[],
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(h.built.lock()[0].api_key, None);
    }

    #[tokio::test]
    async fn empty_bot_credential_means_default() {
        let mut bot = bot();
        bot.bot_model_api_key = Some(String::new());
        assert_eq!(
            bot_model_credential(&bot, ModelProvider::OpenaiCompatible),
            None
        );
    }

    #[tokio::test]
    async fn repeated_requests_append_independent_records() {
        let h = harness(FakeModelProvider::new("a", &[]), vec![]);

        for _ in 0..2 {
            let mut sink = BufferedSink::default();
            run_turn(
                &h.deps,
                &bot(),
                &resolved(ModelProvider::OpenaiCompatible),
                "same question",
                &[],
                &mut sink,
            )
            .await
            .unwrap();
        }

        assert_eq!(h.records.lock().len(), 2);
    }
}
