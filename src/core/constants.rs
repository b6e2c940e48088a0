//! Shared constants: provider endpoints, storage key names, and the fixed
//! conversation scaffolding used on every turn.

/// OpenRouter's web origin; the PKCE authorization page lives under it.
pub const OPENROUTER_WEB_URL: &str = "https://openrouter.ai";

/// OpenRouter's OpenAI-compatible API base.
pub const OPENROUTER_API_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// The only challenge method the key exchange accepts.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Durable storage key names. These survive restarts and must stay stable.
pub const KEY_OPENROUTER_KEY: &str = "openRouterKey";
pub const KEY_CODE_VERIFIER: &str = "codeVerifier";
pub const KEY_CODE_CHALLENGE: &str = "codeChallenge";
pub const KEY_IS_DIALOG_OPEN: &str = "isDialogOpen";

pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

pub const DEFAULT_ERROR_MESSAGE: &str = "An error occurred while processing your request.";

/// Filler assistant turn for models that cannot end a conversation on a
/// tool result (see `core::tools::ModelQuirks`).
pub const WAITING_FOR_USER_INPUT: &str = "[waiting for user input]";

pub const SYSTEM_PROMPT: &str = "\
You are a stock trading conversation bot and you can help users buy stocks, step by step.
You and the user can discuss stock prices and the user can adjust the amount of stocks they want to buy, or place an order, in the UI.
You are allowed to show imaginary prices and changes in price. This is demonstration purposes only.

If the user requests purchasing a stock, call `showStockPurchaseUI` to show the purchase UI.
If the user just wants the price, call `showStockPrice` to show the price.
If you want to show trending stocks, call `listStocks`.
If you want to show events, call `getEvents`.
If the user wants to sell stock, or complete another impossible task, respond that you are a demo and cannot do that.

Don't forget to provide parameters to each tools.

Besides that, you can also chat with users and do some calculations if needed.";
