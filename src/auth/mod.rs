//! PKCE-based OpenRouter authentication: verifier/challenge generation,
//! durable session state, the key exchange client and relay, and the
//! sign-in state machine tying them together.

pub mod exchange;
pub mod flow;
pub mod pkce;
pub mod relay;
pub mod store;
