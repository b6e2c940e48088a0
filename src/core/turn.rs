//! One-turn orchestration: feed the completion stream into the reducer,
//! then resolve any tool calls the model produced.
//!
//! Turns are serialized: a submission while another turn is in flight is
//! rejected outright rather than interleaved (see DESIGN.md). Detached
//! purchase fulfillments run outside this engine and may land between
//! turns in either order.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::ChatRequest;
use crate::core::chat_stream::{
    accumulate_tool_call_delta, CompletionBackend, PendingToolCall, StreamEvent,
};
use crate::core::conversation::Conversation;
use crate::core::tools::{self, ModelQuirks, ToolRegistry};

/// Brief hold between showing a tool's skeleton and committing its result,
/// mirroring the staged reveal of the original flow.
const TOOL_REVEAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub enum TurnError {
    /// A turn is already streaming; the submission was not queued.
    Busy,
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Busy => write!(f, "a turn is already in flight"),
        }
    }
}

impl StdError for TurnError {}

#[derive(Clone)]
pub struct TurnEngine {
    backend: Arc<dyn CompletionBackend>,
    registry: Arc<ToolRegistry>,
    busy: Arc<AtomicBool>,
}

impl TurnEngine {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            registry: Arc::new(ToolRegistry::new()),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run one full user-submission-to-committed-response cycle as a
    /// spawned task. Fails fast when a turn is already running.
    pub fn submit(
        &self,
        conversation: Arc<Mutex<Conversation>>,
        content: String,
        model: String,
    ) -> Result<tokio::task::JoinHandle<()>, TurnError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(TurnError::Busy);
        }

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let busy = Arc::clone(&self.busy);
        let handle = tokio::spawn(async move {
            run_turn(backend, registry, conversation, content, model).await;
            busy.store(false, Ordering::SeqCst);
        });
        Ok(handle)
    }
}

async fn run_turn(
    backend: Arc<dyn CompletionBackend>,
    registry: Arc<ToolRegistry>,
    conversation: Arc<Mutex<Conversation>>,
    content: String,
    model: String,
) {
    let api_messages = {
        let mut guard = conversation.lock().await;
        guard.begin_user_turn(&content)
    };
    let request = ChatRequest {
        model: model.clone(),
        messages: api_messages,
        stream: true,
        tools: Some(registry.definitions()),
    };

    let quirks = ModelQuirks::for_model(&model);
    let mut rx = backend.begin(request).await;
    let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Chunk(delta) => {
                conversation.lock().await.append_text_delta(&delta);
            }
            StreamEvent::ToolCall(delta) => {
                accumulate_tool_call_delta(&mut pending, delta);
            }
            StreamEvent::Error(message) => {
                debug!(model = %model, "completion stream errored");
                let mut guard = conversation.lock().await;
                guard.discard_open_text();
                guard.record_error(&message);
                return;
            }
            StreamEvent::End => break,
        }
    }

    conversation.lock().await.commit_open_text();

    for (_, call) in pending {
        let name = call.name.as_deref().unwrap_or_default();
        match registry.validate_named(name, &call.arguments) {
            Ok(invocation) => {
                let tool = invocation.name();
                conversation.lock().await.begin_tool(tool);
                tokio::time::sleep(TOOL_REVEAL_DELAY).await;

                let outcome = tools::evaluate(&invocation);
                let args: Value =
                    serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                conversation
                    .lock()
                    .await
                    .apply_tool_outcome(tool, args, outcome, quirks);
            }
            Err(err) => {
                debug!(tool = name, error = %err, "tool call rejected");
                conversation.lock().await.record_error(&err.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::DisplayBlock;
    use crate::core::message::Role;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Replays one scripted event list per `begin` call and records the
    /// requests it saw.
    struct ScriptedBackend {
        scripts: std::sync::Mutex<Vec<Vec<StreamEvent>>>,
        requests: std::sync::Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: std::sync::Mutex::new(scripts),
                requests: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn begin(&self, request: ChatRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
            self.requests.lock().expect("requests lock").push(request);
            let script = {
                let mut scripts = self.scripts.lock().expect("scripts lock");
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let (tx, rx) = mpsc::unbounded_channel();
            for event in script {
                let _ = tx.send(event);
            }
            rx
        }
    }

    /// Keeps the stream open until released, for probing the busy guard.
    struct HeldBackend {
        release: std::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl CompletionBackend for HeldBackend {
        async fn begin(&self, _request: ChatRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
            let release = self
                .release
                .lock()
                .expect("release lock")
                .take()
                .expect("begin called once");
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let _ = release.await;
                let _ = tx.send(StreamEvent::End);
            });
            rx
        }
    }

    fn shared_conversation() -> Arc<Mutex<Conversation>> {
        Arc::new(Mutex::new(Conversation::new()))
    }

    #[tokio::test]
    async fn text_turn_commits_one_assistant_message() {
        let backend = ScriptedBackend::new(vec![vec![
            StreamEvent::Chunk("Hel".to_string()),
            StreamEvent::Chunk("lo".to_string()),
            StreamEvent::End,
        ]]);
        let engine = TurnEngine::new(backend.clone());
        let conversation = shared_conversation();

        engine
            .submit(
                Arc::clone(&conversation),
                "hi".to_string(),
                "anthropic/claude-3.5-sonnet".to_string(),
            )
            .expect("submit")
            .await
            .expect("turn task");

        let guard = conversation.lock().await;
        assert_eq!(guard.messages().len(), 2);
        assert_eq!(guard.messages()[1].text(), Some("Hello"));
        assert_eq!(guard.streaming_text(), None);

        let request = &backend.requests.lock().expect("requests")[0];
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.tools.as_ref().expect("tools").len(), 4);
        assert!(request.stream);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_turn_resolves_split_deltas_into_an_atomic_append() {
        let backend = ScriptedBackend::new(vec![vec![
            StreamEvent::ToolCall(crate::core::chat_stream::ToolCallDelta {
                index: 0,
                id: Some("upstream-id".to_string()),
                name: Some("showStockPrice".to_string()),
                arguments: Some("{\"symbol\":\"AAPL\",".to_string()),
            }),
            StreamEvent::ToolCall(crate::core::chat_stream::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: Some("\"price\":150.0,\"delta\":1.5}".to_string()),
            }),
            StreamEvent::End,
        ]]);
        let engine = TurnEngine::new(backend);
        let conversation = shared_conversation();

        engine
            .submit(
                Arc::clone(&conversation),
                "price of AAPL?".to_string(),
                "anthropic/claude-3.5-sonnet".to_string(),
            )
            .expect("submit")
            .await
            .expect("turn task");

        let guard = conversation.lock().await;
        let messages = guard.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[2].role, Role::Tool);

        let calls = messages[1].tool_calls().expect("calls");
        let results = messages[2].tool_results_content().expect("results");
        assert_eq!(calls[0].tool_call_id, results[0].tool_call_id);
        assert_eq!(results[0].result["symbol"], "AAPL");
        assert!(guard.pending_tool().is_none());
    }

    #[tokio::test]
    async fn stream_error_becomes_a_banner_not_history() {
        let backend = ScriptedBackend::new(vec![vec![
            StreamEvent::Chunk("part".to_string()),
            StreamEvent::Error("model overloaded".to_string()),
            StreamEvent::End,
        ]]);
        let engine = TurnEngine::new(backend);
        let conversation = shared_conversation();

        engine
            .submit(
                Arc::clone(&conversation),
                "hi".to_string(),
                "anthropic/claude-3.5-sonnet".to_string(),
            )
            .expect("submit")
            .await
            .expect("turn task");

        let guard = conversation.lock().await;
        assert_eq!(guard.messages().len(), 1);
        assert_eq!(guard.messages()[0].role, Role::User);
        assert_eq!(guard.error_banner(), Some("model overloaded"));
        let entries = guard.ui_state();
        assert!(matches!(
            entries.last().expect("error entry").display,
            DisplayBlock::Error(_)
        ));
    }

    #[tokio::test]
    async fn invalid_tool_arguments_reject_the_turn() {
        let backend = ScriptedBackend::new(vec![vec![
            StreamEvent::ToolCall(crate::core::chat_stream::ToolCallDelta {
                index: 0,
                id: Some("upstream-id".to_string()),
                name: Some("showStockPrice".to_string()),
                arguments: Some("{\"symbol\":\"AAPL\"}".to_string()),
            }),
            StreamEvent::End,
        ]]);
        let engine = TurnEngine::new(backend);
        let conversation = shared_conversation();

        engine
            .submit(
                Arc::clone(&conversation),
                "price of AAPL?".to_string(),
                "anthropic/claude-3.5-sonnet".to_string(),
            )
            .expect("submit")
            .await
            .expect("turn task");

        let guard = conversation.lock().await;
        assert_eq!(guard.messages().len(), 1);
        assert!(guard
            .error_banner()
            .expect("banner")
            .contains("invalid arguments for showStockPrice"));
    }

    #[tokio::test]
    async fn concurrent_submissions_are_rejected_while_busy() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let backend = Arc::new(HeldBackend {
            release: std::sync::Mutex::new(Some(release_rx)),
        });
        let engine = TurnEngine::new(backend);
        let conversation = shared_conversation();

        let handle = engine
            .submit(
                Arc::clone(&conversation),
                "first".to_string(),
                "anthropic/claude-3.5-sonnet".to_string(),
            )
            .expect("first submit");
        tokio::task::yield_now().await;
        assert!(engine.is_busy());

        let second = engine.submit(
            Arc::clone(&conversation),
            "second".to_string(),
            "anthropic/claude-3.5-sonnet".to_string(),
        );
        assert!(matches!(second, Err(TurnError::Busy)));

        release_tx.send(()).expect("release");
        handle.await.expect("turn task");
        assert!(!engine.is_busy());

        // Once the turn resolves, submissions work again.
        let backend = ScriptedBackend::new(vec![vec![StreamEvent::End]]);
        let engine = TurnEngine::new(backend);
        engine
            .submit(conversation, "third".to_string(), "m".to_string())
            .expect("post-turn submit")
            .await
            .expect("turn task");
    }

    #[tokio::test(start_paused = true)]
    async fn quirky_model_gets_a_filler_turn_after_tools() {
        let backend = ScriptedBackend::new(vec![vec![
            StreamEvent::ToolCall(crate::core::chat_stream::ToolCallDelta {
                index: 0,
                id: Some("upstream-id".to_string()),
                name: Some("listStocks".to_string()),
                arguments: Some("{\"stocks\":[]}".to_string()),
            }),
            StreamEvent::End,
        ]]);
        let engine = TurnEngine::new(backend);
        let conversation = shared_conversation();

        engine
            .submit(
                Arc::clone(&conversation),
                "trending?".to_string(),
                "mistralai/mistral-large".to_string(),
            )
            .expect("submit")
            .await
            .expect("turn task");

        let guard = conversation.lock().await;
        let last = guard.messages().last().expect("filler");
        assert_eq!(
            last.text(),
            Some(crate::core::constants::WAITING_FOR_USER_INPUT)
        );
        // Mistral tool-call ids use the nine-character alphanumeric form.
        let calls = guard.messages()[1].tool_calls().expect("calls");
        assert_eq!(calls[0].tool_call_id.len(), 9);
    }
}
