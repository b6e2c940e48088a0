//! Conversation state reducer.
//!
//! Owns the append-only message history and everything transient around
//! it: the open streaming-text cell, the pending tool placeholder, and the
//! error banner for a failed turn. Committed history is never rolled back;
//! a failed turn only ever replaces its own attempt with an error entry.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction};
use crate::core::constants::{DEFAULT_ERROR_MESSAGE, SYSTEM_PROMPT, WAITING_FOR_USER_INPUT};
use crate::core::ids;
use crate::core::message::{Message, MessageContent, Role, ToolCallRecord, ToolResultRecord};
use crate::core::tools::{
    self, MarketEvent, ModelQuirks, PurchaseSummary, StockQuote, ToolName, ToolOutcome,
};

const PURCHASE_STAGE_DELAY: Duration = Duration::from_secs(1);

pub struct Conversation {
    chat_id: String,
    messages: Vec<Message>,
    /// Two-phase streaming buffer: opened on the first delta, finalized
    /// into an immutable assistant message on completion. Never handed out
    /// mutably.
    open_text: Option<String>,
    /// Skeleton placeholder while a tool computes its result.
    pending_tool: Option<ToolName>,
    /// Rendered error for the failed turn; not part of history.
    error_banner: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            chat_id: ids::message_id(),
            messages: Vec::new(),
            open_text: None,
            pending_tool: None,
            error_banner: None,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append the user message and assemble the API request history: the
    /// fixed system prompt followed by every committed message.
    pub fn begin_user_turn(&mut self, content: &str) -> Vec<ChatMessage> {
        self.error_banner = None;
        self.messages.push(Message::user(content));
        self.api_messages()
    }

    fn api_messages(&self) -> Vec<ChatMessage> {
        let mut api_messages = vec![ChatMessage::plain("system", SYSTEM_PROMPT)];

        for message in &self.messages {
            match &message.content {
                MessageContent::Text(text) => {
                    api_messages.push(ChatMessage::plain(message.role.as_str(), text.clone()));
                }
                MessageContent::ToolCalls(calls) => {
                    api_messages.push(ChatMessage {
                        role: "assistant".to_string(),
                        content: String::new(),
                        tool_call_id: None,
                        tool_calls: Some(
                            calls
                                .iter()
                                .map(|call| ChatToolCall {
                                    id: call.tool_call_id.clone(),
                                    kind: "function".to_string(),
                                    function: ChatToolCallFunction {
                                        name: call.tool_name.as_str().to_string(),
                                        arguments: call.args.to_string(),
                                    },
                                })
                                .collect(),
                        ),
                    });
                }
                MessageContent::ToolResults(results) => {
                    for result in results {
                        api_messages.push(ChatMessage {
                            role: "tool".to_string(),
                            content: result.result.to_string(),
                            tool_call_id: Some(result.tool_call_id.clone()),
                            tool_calls: None,
                        });
                    }
                }
            }
        }

        api_messages
    }

    pub fn append_text_delta(&mut self, delta: &str) {
        self.open_text.get_or_insert_with(String::new).push_str(delta);
    }

    pub fn streaming_text(&self) -> Option<&str> {
        self.open_text.as_deref()
    }

    /// Close the streaming cell and commit it as one assistant message.
    /// Idempotent when no cell is open.
    pub fn commit_open_text(&mut self) {
        if let Some(text) = self.open_text.take() {
            self.messages.push(Message::assistant_text(text));
        }
    }

    pub fn discard_open_text(&mut self) {
        self.open_text = None;
    }

    pub fn begin_tool(&mut self, tool: ToolName) {
        self.pending_tool = Some(tool);
    }

    pub fn pending_tool(&self) -> Option<ToolName> {
        self.pending_tool
    }

    /// Commit a completed tool invocation as one atomic append: the
    /// assistant's tool-call record, the matching tool-result record, the
    /// per-model filler turn if required, and the policy-rejection note if
    /// the tool refused.
    pub fn apply_tool_outcome(
        &mut self,
        tool: ToolName,
        args: Value,
        outcome: ToolOutcome,
        quirks: ModelQuirks,
    ) -> String {
        let tool_call_id = tools::new_tool_call_id(quirks.tool_call_id_style);
        debug!(tool = %tool, tool_call_id = %tool_call_id, "committing tool outcome");

        self.messages.push(Message::assistant_tool_calls(vec![
            ToolCallRecord {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool,
                args,
            },
        ]));
        self.messages.push(Message::tool_results(vec![
            ToolResultRecord {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool,
                result: outcome.result,
                is_error: None,
            },
        ]));
        if quirks.needs_turn_filler {
            self.messages
                .push(Message::assistant_text(WAITING_FOR_USER_INPUT));
        }
        if let Some(note) = outcome.rejection {
            self.messages.push(Message::system(note));
        }

        self.pending_tool = None;
        tool_call_id
    }

    /// A whole-turn backend failure. History stays as committed; only the
    /// attempted turn is replaced by the banner.
    pub fn record_error(&mut self, detail: &str) {
        let message = if detail.trim().is_empty() {
            DEFAULT_ERROR_MESSAGE.to_string()
        } else {
            detail.trim().to_string()
        };
        self.open_text = None;
        self.pending_tool = None;
        self.error_banner = Some(message);
    }

    pub fn error_banner(&self) -> Option<&str> {
        self.error_banner.as_deref()
    }

    /// Record a completed purchase fill, appended independently of any
    /// in-flight turn.
    pub fn record_purchase_fill(&mut self, symbol: &str, price: f64, amount: f64) {
        let total = amount * price;
        self.messages.push(Message::system(format!(
            "[User has purchased {} shares of {} at {}. Total cost = {}]",
            format_quantity(amount),
            symbol,
            format_quantity(price),
            format_quantity(total),
        )));
    }

    /// Derive the renderable state: committed history minus `system`
    /// entries, tool results mapped to their widgets, then the transient
    /// tail (open stream, tool skeleton, error banner).
    pub fn ui_state(&self) -> Vec<UiEntry> {
        let mut entries = Vec::new();

        let visible = self
            .messages
            .iter()
            .filter(|message| !message.role.is_system());
        for (index, message) in visible.enumerate() {
            let id = format!("{}-{}", self.chat_id, index);
            match (&message.role, &message.content) {
                (Role::User, MessageContent::Text(text)) => entries.push(UiEntry {
                    id,
                    display: DisplayBlock::UserText(text.clone()),
                }),
                (Role::Assistant, MessageContent::Text(text)) => entries.push(UiEntry {
                    id,
                    display: DisplayBlock::AssistantText(text.clone()),
                }),
                (Role::Tool, MessageContent::ToolResults(results)) => {
                    for result in results {
                        if let Some(display) = widget_for_result(result) {
                            entries.push(UiEntry {
                                id: id.clone(),
                                display,
                            });
                        }
                    }
                }
                // Assistant tool-call records carry no rendering of their
                // own; the adjacent tool message supplies the widget.
                _ => {}
            }
        }

        if let Some(text) = &self.open_text {
            entries.push(UiEntry {
                id: format!("{}-streaming", self.chat_id),
                display: DisplayBlock::StreamingText(text.clone()),
            });
        }
        if let Some(tool) = self.pending_tool {
            entries.push(UiEntry {
                id: format!("{}-pending", self.chat_id),
                display: DisplayBlock::PendingTool(tool),
            });
        }
        if let Some(error) = &self.error_banner {
            entries.push(UiEntry {
                id: format!("{}-error", self.chat_id),
                display: DisplayBlock::Error(error.clone()),
            });
        }

        entries
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UiEntry {
    pub id: String,
    pub display: DisplayBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayBlock {
    UserText(String),
    AssistantText(String),
    StreamingText(String),
    PendingTool(ToolName),
    Stock(StockQuote),
    Stocks(Vec<StockQuote>),
    Purchase(PurchaseSummary),
    Events(Vec<MarketEvent>),
    Error(String),
}

fn widget_for_result(result: &ToolResultRecord) -> Option<DisplayBlock> {
    match result.tool_name {
        ToolName::ListStocks => serde_json::from_value(result.result.clone())
            .ok()
            .map(DisplayBlock::Stocks),
        ToolName::ShowStockPrice => serde_json::from_value(result.result.clone())
            .ok()
            .map(DisplayBlock::Stock),
        ToolName::ShowStockPurchase => serde_json::from_value(result.result.clone())
            .ok()
            .map(DisplayBlock::Purchase),
        ToolName::GetEvents => serde_json::from_value(result.result.clone())
            .ok()
            .map(DisplayBlock::Events),
    }
}

/// Progress of a detached purchase fulfillment.
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseUpdate {
    Working {
        symbol: String,
        amount: f64,
    },
    StillWorking {
        symbol: String,
        amount: f64,
    },
    Done {
        symbol: String,
        price: f64,
        amount: f64,
        total: f64,
    },
}

/// Kick off the simulated two-stage fulfillment as a detached task. It
/// reports progress over the channel and does not block the turn cycle;
/// on `Done` the caller records the fill in the conversation.
pub fn confirm_purchase(
    updates: mpsc::UnboundedSender<PurchaseUpdate>,
    symbol: String,
    price: f64,
    amount: f64,
) {
    tokio::spawn(async move {
        let _ = updates.send(PurchaseUpdate::Working {
            symbol: symbol.clone(),
            amount,
        });
        tokio::time::sleep(PURCHASE_STAGE_DELAY).await;
        let _ = updates.send(PurchaseUpdate::StillWorking {
            symbol: symbol.clone(),
            amount,
        });
        tokio::time::sleep(PURCHASE_STAGE_DELAY).await;
        let _ = updates.send(PurchaseUpdate::Done {
            symbol,
            price,
            amount,
            total: amount * price,
        });
    });
}

fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{PurchaseStatus, ToolInvocation};
    use serde_json::json;

    fn quirks_default() -> ModelQuirks {
        ModelQuirks::for_model("anthropic/claude-3.5-sonnet")
    }

    fn purchase_invocation(shares: Option<f64>) -> (Value, ToolOutcome) {
        let args = match shares {
            Some(n) => json!({"symbol": "AAPL", "price": 150.0, "numberOfShares": n}),
            None => json!({"symbol": "AAPL", "price": 150.0}),
        };
        let invocation = ToolInvocation::ShowStockPurchase(
            serde_json::from_value(args.clone()).expect("args decode"),
        );
        (args, tools::evaluate(&invocation))
    }

    #[test]
    fn streaming_buffer_commits_one_immutable_message() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("hi");

        conversation.append_text_delta("Hel");
        conversation.append_text_delta("lo");
        assert_eq!(conversation.streaming_text(), Some("Hello"));
        // Nothing is committed while the cell is open.
        assert_eq!(conversation.messages().len(), 1);

        conversation.commit_open_text();
        assert_eq!(conversation.streaming_text(), None);
        let last = conversation.messages().last().expect("assistant message");
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), Some("Hello"));

        // Idempotent once closed.
        conversation.commit_open_text();
        assert_eq!(conversation.messages().len(), 2);
    }

    #[test]
    fn tool_outcome_appends_call_and_result_atomically() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("price of AAPL?");

        let args = json!({"symbol": "AAPL", "price": 150.0, "delta": 1.5});
        let invocation =
            ToolInvocation::ShowStockPrice(serde_json::from_value(args.clone()).expect("decode"));
        let outcome = tools::evaluate(&invocation);
        let id = conversation.apply_tool_outcome(
            ToolName::ShowStockPrice,
            args,
            outcome,
            quirks_default(),
        );

        let messages = conversation.messages();
        assert_eq!(messages.len(), 3);
        let calls = messages[1].tool_calls().expect("tool call message");
        let results = messages[2].tool_results_content().expect("tool results");
        assert_eq!(calls[0].tool_call_id, id);
        assert_eq!(results[0].tool_call_id, id);
        assert_eq!(results[0].tool_name, ToolName::ShowStockPrice);
    }

    #[test]
    fn filler_turn_is_appended_for_quirky_models() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("trending stocks");

        let args = json!({"stocks": []});
        let invocation =
            ToolInvocation::ListStocks(serde_json::from_value(args.clone()).expect("decode"));
        conversation.apply_tool_outcome(
            ToolName::ListStocks,
            args,
            tools::evaluate(&invocation),
            ModelQuirks::for_model("mistralai/mistral-large"),
        );

        let last = conversation.messages().last().expect("filler");
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), Some(WAITING_FOR_USER_INPUT));
    }

    #[test]
    fn expired_purchase_records_a_system_note() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("buy 1001 AAPL");

        let (args, outcome) = purchase_invocation(Some(1001.0));
        conversation.apply_tool_outcome(
            ToolName::ShowStockPurchase,
            args,
            outcome,
            quirks_default(),
        );

        let messages = conversation.messages();
        let result = messages[2].tool_results_content().expect("results");
        assert_eq!(result[0].result["status"], "expired");
        let note = messages.last().expect("system note");
        assert_eq!(note.role, Role::System);
        assert_eq!(note.text(), Some(tools::INVALID_AMOUNT_NOTE));
    }

    #[test]
    fn in_range_purchase_requires_action_without_note() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("buy 500 AAPL");

        let (args, outcome) = purchase_invocation(Some(500.0));
        conversation.apply_tool_outcome(
            ToolName::ShowStockPurchase,
            args,
            outcome,
            quirks_default(),
        );

        let messages = conversation.messages();
        assert_eq!(messages.len(), 3);
        let result = messages[2].tool_results_content().expect("results");
        assert_eq!(result[0].result["status"], "requires_action");
    }

    #[test]
    fn error_banner_leaves_history_untouched() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("hello");
        conversation.append_text_delta("partial");

        let before: Vec<_> = conversation.messages().to_vec();
        conversation.discard_open_text();
        conversation.record_error("model overloaded");

        assert_eq!(conversation.messages(), before.as_slice());
        assert_eq!(conversation.error_banner(), Some("model overloaded"));
        assert_eq!(conversation.streaming_text(), None);

        // The next turn clears the banner.
        conversation.begin_user_turn("retry");
        assert_eq!(conversation.error_banner(), None);
    }

    #[test]
    fn empty_error_detail_falls_back_to_the_default_message() {
        let mut conversation = Conversation::new();
        conversation.record_error("   ");
        assert_eq!(conversation.error_banner(), Some(DEFAULT_ERROR_MESSAGE));
    }

    #[test]
    fn ui_state_omits_system_and_renders_tool_widgets() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("price of AAPL?");

        let args = json!({"symbol": "AAPL", "price": 150.0, "delta": 1.5});
        let invocation =
            ToolInvocation::ShowStockPrice(serde_json::from_value(args.clone()).expect("decode"));
        conversation.apply_tool_outcome(
            ToolName::ShowStockPrice,
            args,
            tools::evaluate(&invocation),
            quirks_default(),
        );
        conversation.record_purchase_fill("AAPL", 150.0, 10.0);

        let entries = conversation.ui_state();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].display, DisplayBlock::UserText(_)));
        match &entries[1].display {
            DisplayBlock::Stock(quote) => {
                assert_eq!(quote.symbol, "AAPL");
                assert_eq!(quote.price, 150.0);
            }
            other => panic!("expected stock widget, got {other:?}"),
        }
        assert!(entries
            .iter()
            .all(|entry| entry.id.starts_with(conversation.chat_id())));
    }

    #[test]
    fn ui_state_renders_purchase_and_events_widgets() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("buy AAPL, then show events");

        let (purchase_args, purchase_outcome) = purchase_invocation(Some(10.0));
        conversation.apply_tool_outcome(
            ToolName::ShowStockPurchase,
            purchase_args,
            purchase_outcome,
            quirks_default(),
        );

        let events_args = json!({"events": [
            {"date": "2024-05-01", "headline": "Doge barks", "description": "Markets wag"}
        ]});
        let invocation =
            ToolInvocation::GetEvents(serde_json::from_value(events_args.clone()).expect("decode"));
        conversation.apply_tool_outcome(
            ToolName::GetEvents,
            events_args,
            tools::evaluate(&invocation),
            quirks_default(),
        );

        let entries = conversation.ui_state();
        let purchase = entries
            .iter()
            .find_map(|entry| match &entry.display {
                DisplayBlock::Purchase(summary) => Some(summary),
                _ => None,
            })
            .expect("purchase widget");
        assert_eq!(purchase.status, PurchaseStatus::RequiresAction);
        assert_eq!(purchase.number_of_shares, Some(10.0));

        let events = entries
            .iter()
            .find_map(|entry| match &entry.display {
                DisplayBlock::Events(events) => Some(events),
                _ => None,
            })
            .expect("events widget");
        assert_eq!(events[0].headline, "Doge barks");
    }

    #[test]
    fn transient_entries_follow_committed_history() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("hello");
        conversation.append_text_delta("thinking");
        conversation.begin_tool(ToolName::ListStocks);

        let entries = conversation.ui_state();
        assert!(matches!(
            entries[entries.len() - 2].display,
            DisplayBlock::StreamingText(_)
        ));
        assert!(matches!(
            entries[entries.len() - 1].display,
            DisplayBlock::PendingTool(ToolName::ListStocks)
        ));
    }

    #[test]
    fn api_messages_carry_system_prompt_and_tool_traffic() {
        let mut conversation = Conversation::new();
        conversation.begin_user_turn("price of AAPL?");

        let args = json!({"symbol": "AAPL", "price": 150.0, "delta": 1.5});
        let invocation =
            ToolInvocation::ShowStockPrice(serde_json::from_value(args.clone()).expect("decode"));
        conversation.apply_tool_outcome(
            ToolName::ShowStockPrice,
            args,
            tools::evaluate(&invocation),
            quirks_default(),
        );

        let api_messages = conversation.begin_user_turn("thanks");
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[0].content, SYSTEM_PROMPT);
        assert_eq!(api_messages[1].role, "user");

        let assistant_call = api_messages
            .iter()
            .find(|message| message.tool_calls.is_some())
            .expect("assistant tool-call message");
        let calls = assistant_call.tool_calls.as_ref().expect("calls");
        assert_eq!(calls[0].function.name, "showStockPrice");

        let tool_reply = api_messages
            .iter()
            .find(|message| message.role == "tool")
            .expect("tool message");
        assert_eq!(tool_reply.tool_call_id.as_deref(), Some(calls[0].id.as_str()));
    }

    #[test]
    fn purchase_fill_records_the_computed_total() {
        let mut conversation = Conversation::new();
        conversation.record_purchase_fill("AAPL", 150.0, 10.0);

        let note = conversation.messages().last().expect("system note");
        assert_eq!(note.role, Role::System);
        assert_eq!(
            note.text(),
            Some("[User has purchased 10 shares of AAPL at 150. Total cost = 1500]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_purchase_stages_and_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        confirm_purchase(tx, "AAPL".to_string(), 150.0, 10.0);

        assert_eq!(
            rx.recv().await,
            Some(PurchaseUpdate::Working {
                symbol: "AAPL".to_string(),
                amount: 10.0
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(PurchaseUpdate::StillWorking {
                symbol: "AAPL".to_string(),
                amount: 10.0
            })
        );
        match rx.recv().await {
            Some(PurchaseUpdate::Done { total, .. }) => assert_eq!(total, 1500.0),
            other => panic!("expected completion, got {other:?}"),
        }

        // The fill lands in history only when the caller records it.
        let mut conversation = Conversation::new();
        conversation.record_purchase_fill("AAPL", 150.0, 10.0);
        let note = conversation.messages().last().expect("note");
        assert!(note.text().expect("text").contains("Total cost = 1500"));
    }
}
