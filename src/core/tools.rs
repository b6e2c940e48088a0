//! Tool dispatch: declared schemas, argument validation, outcome
//! computation, and the per-model quirk table.
//!
//! Every tool the model may call is registered here with a JSON Schema.
//! Arguments are validated against the schema before any typed decoding or
//! business logic runs; schema failures never reach dispatch.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{ChatToolDefinition, ChatToolFunction};
use crate::core::ids;

/// Share counts a purchase will accept, exclusive low / inclusive high.
const MAX_PURCHASE_SHARES: f64 = 1000.0;
const DEFAULT_PURCHASE_SHARES: f64 = 100.0;

pub const INVALID_AMOUNT_NOTE: &str = "[User has selected an invalid amount]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolName {
    #[serde(rename = "listStocks")]
    ListStocks,
    #[serde(rename = "showStockPrice")]
    ShowStockPrice,
    #[serde(rename = "showStockPurchase")]
    ShowStockPurchase,
    #[serde(rename = "getEvents")]
    GetEvents,
}

pub const ALL_TOOLS: [ToolName; 4] = [
    ToolName::ListStocks,
    ToolName::ShowStockPrice,
    ToolName::ShowStockPurchase,
    ToolName::GetEvents,
];

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListStocks => "listStocks",
            ToolName::ShowStockPrice => "showStockPrice",
            ToolName::ShowStockPurchase => "showStockPurchase",
            ToolName::GetEvents => "getEvents",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL_TOOLS.into_iter().find(|tool| tool.as_str() == name)
    }

    fn description(self) -> &'static str {
        match self {
            ToolName::ListStocks => "List three imaginary stocks that are trending.",
            ToolName::ShowStockPrice => {
                "Get the current stock price of a given stock or currency. \
                 Use this to show the price to the user."
            }
            ToolName::ShowStockPurchase => {
                "Show price and the UI to purchase a stock or currency. \
                 Use this if the user wants to purchase a stock or currency."
            }
            ToolName::GetEvents => {
                "List funny imaginary events between user highlighted dates \
                 that describe stock activity."
            }
        }
    }

    fn parameters_schema(self) -> Value {
        let stock_properties = json!({
            "symbol": {
                "type": "string",
                "description": "The name or symbol of the stock or currency. e.g. DOGE/AAPL/USD."
            },
            "price": { "type": "number", "description": "The price of the stock." },
            "delta": { "type": "number", "description": "The change in price of the stock" }
        });

        match self {
            ToolName::ListStocks => json!({
                "type": "object",
                "properties": {
                    "stocks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": stock_properties,
                            "required": ["symbol", "price", "delta"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["stocks"],
                "additionalProperties": false
            }),
            ToolName::ShowStockPrice => json!({
                "type": "object",
                "properties": stock_properties,
                "required": ["symbol", "price", "delta"],
                "additionalProperties": false
            }),
            ToolName::ShowStockPurchase => json!({
                "type": "object",
                "properties": {
                    "symbol": {
                        "type": "string",
                        "description": "The name or symbol of the stock or currency. e.g. DOGE/AAPL/USD."
                    },
                    "price": { "type": "number", "description": "The price of the stock." },
                    "numberOfShares": {
                        "type": "number",
                        "description": "The **number of shares** for a stock or currency to purchase. Can be optional if the user did not specify it."
                    }
                },
                "required": ["symbol", "price"],
                "additionalProperties": false
            }),
            ToolName::GetEvents => json!({
                "type": "object",
                "properties": {
                    "events": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "date": {
                                    "type": "string",
                                    "description": "The date of the event, in ISO-8601 format"
                                },
                                "headline": {
                                    "type": "string",
                                    "description": "The headline of the event"
                                },
                                "description": {
                                    "type": "string",
                                    "description": "The description of the event"
                                }
                            },
                            "required": ["date", "headline", "description"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["events"],
                "additionalProperties": false
            }),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub date: String,
    pub headline: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    RequiresAction,
    Completed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseSummary {
    pub symbol: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_shares: Option<f64>,
    pub status: PurchaseStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListStocksArgs {
    pub stocks: Vec<StockQuote>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowStockPriceArgs {
    pub symbol: String,
    pub price: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowStockPurchaseArgs {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub number_of_shares: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetEventsArgs {
    pub events: Vec<MarketEvent>,
}

/// A schema-validated, typed tool call ready for dispatch.
#[derive(Debug, Clone)]
pub enum ToolInvocation {
    ListStocks(ListStocksArgs),
    ShowStockPrice(ShowStockPriceArgs),
    ShowStockPurchase(ShowStockPurchaseArgs),
    GetEvents(GetEventsArgs),
}

impl ToolInvocation {
    pub fn name(&self) -> ToolName {
        match self {
            ToolInvocation::ListStocks(_) => ToolName::ListStocks,
            ToolInvocation::ShowStockPrice(_) => ToolName::ShowStockPrice,
            ToolInvocation::ShowStockPurchase(_) => ToolName::ShowStockPurchase,
            ToolInvocation::GetEvents(_) => ToolName::GetEvents,
        }
    }
}

#[derive(Debug)]
pub enum ToolError {
    UnknownTool(String),
    InvalidArguments { tool: ToolName, detail: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
            ToolError::InvalidArguments { tool, detail } => {
                write!(f, "invalid arguments for {tool}: {detail}")
            }
        }
    }
}

impl StdError for ToolError {}

pub struct ToolRegistry {
    validators: Vec<(ToolName, jsonschema::Validator)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let validators = ALL_TOOLS
            .into_iter()
            .map(|tool| {
                let validator = jsonschema::validator_for(&tool.parameters_schema())
                    .expect("embedded tool schema should compile");
                (tool, validator)
            })
            .collect();
        Self { validators }
    }

    /// Tool definitions in the function-calling shape the completions
    /// request expects.
    pub fn definitions(&self) -> Vec<ChatToolDefinition> {
        ALL_TOOLS
            .into_iter()
            .map(|tool| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: tool.as_str().to_string(),
                    description: Some(tool.description().to_string()),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    pub fn validate(&self, tool: ToolName, args: &Value) -> Result<ToolInvocation, ToolError> {
        let validator = self
            .validators
            .iter()
            .find(|(name, _)| *name == tool)
            .map(|(_, validator)| validator)
            .ok_or_else(|| ToolError::UnknownTool(tool.as_str().to_string()))?;

        validator
            .validate(args)
            .map_err(|err| ToolError::InvalidArguments {
                tool,
                detail: err.to_string(),
            })?;

        let decode = |detail: serde_json::Error| ToolError::InvalidArguments {
            tool,
            detail: detail.to_string(),
        };
        let invocation = match tool {
            ToolName::ListStocks => {
                ToolInvocation::ListStocks(serde_json::from_value(args.clone()).map_err(decode)?)
            }
            ToolName::ShowStockPrice => ToolInvocation::ShowStockPrice(
                serde_json::from_value(args.clone()).map_err(decode)?,
            ),
            ToolName::ShowStockPurchase => ToolInvocation::ShowStockPurchase(
                serde_json::from_value(args.clone()).map_err(decode)?,
            ),
            ToolName::GetEvents => {
                ToolInvocation::GetEvents(serde_json::from_value(args.clone()).map_err(decode)?)
            }
        };
        Ok(invocation)
    }

    /// Resolve a streamed tool call: name lookup, raw JSON parse, schema
    /// validation, typed decode.
    pub fn validate_named(&self, name: &str, raw_args: &str) -> Result<ToolInvocation, ToolError> {
        let tool = ToolName::parse(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args: Value =
            serde_json::from_str(raw_args).map_err(|err| ToolError::InvalidArguments {
                tool,
                detail: err.to_string(),
            })?;
        self.validate(tool, &args)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What a completed invocation feeds back into the conversation: the
/// result payload plus an optional policy-rejection note.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub rejection: Option<String>,
}

pub fn evaluate(invocation: &ToolInvocation) -> ToolOutcome {
    match invocation {
        ToolInvocation::ListStocks(args) => ToolOutcome {
            result: serde_json::json!(args.stocks),
            rejection: None,
        },
        ToolInvocation::ShowStockPrice(args) => ToolOutcome {
            result: serde_json::json!(StockQuote {
                symbol: args.symbol.clone(),
                price: args.price,
                delta: args.delta,
            }),
            rejection: None,
        },
        ToolInvocation::ShowStockPurchase(args) => {
            let shares = args.number_of_shares.unwrap_or(DEFAULT_PURCHASE_SHARES);
            let status = purchase_status(shares);
            let summary = PurchaseSummary {
                symbol: args.symbol.clone(),
                price: args.price,
                number_of_shares: Some(shares),
                status,
            };
            ToolOutcome {
                result: serde_json::json!(summary),
                rejection: (status == PurchaseStatus::Expired)
                    .then(|| INVALID_AMOUNT_NOTE.to_string()),
            }
        }
        ToolInvocation::GetEvents(args) => ToolOutcome {
            result: serde_json::json!(args.events),
            rejection: None,
        },
    }
}

/// Share counts outside `(0, 1000]` expire the purchase instead of
/// reaching the simulated order flow.
pub fn purchase_status(shares: f64) -> PurchaseStatus {
    if shares <= 0.0 || shares > MAX_PURCHASE_SHARES {
        PurchaseStatus::Expired
    } else {
        PurchaseStatus::RequiresAction
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallIdStyle {
    Generic,
    Mistral,
}

/// Per-model compatibility shims, resolved once per turn instead of inline
/// conditionals in the tool handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelQuirks {
    /// The model cannot leave a tool result as the final turn; a filler
    /// assistant message keeps the conversation well-formed.
    pub needs_turn_filler: bool,
    pub tool_call_id_style: ToolCallIdStyle,
}

impl ModelQuirks {
    pub fn for_model(slug: &str) -> Self {
        let mistral = slug == "mistralai/mistral-large";
        let gemini = matches!(slug, "google/gemini-flash-1.5" | "google/gemini-pro-1.5");
        Self {
            needs_turn_filler: mistral || gemini,
            tool_call_id_style: if mistral {
                ToolCallIdStyle::Mistral
            } else {
                ToolCallIdStyle::Generic
            },
        }
    }
}

pub fn new_tool_call_id(style: ToolCallIdStyle) -> String {
    match style {
        ToolCallIdStyle::Generic => ids::message_id(),
        ToolCallIdStyle::Mistral => ids::alphanumeric_short_id(),
    }
}
