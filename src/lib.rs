//! tickertalk is a terminal chat client for OpenRouter's tool-calling
//! models, built around a PKCE sign-in and tool-driven inline widgets.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`auth`] owns the PKCE verifier/challenge pair, the durable auth
//!   session store, the key exchange client and relay, and the sign-in
//!   state machine.
//! - [`core`] owns the conversation reducer, tool dispatch, the streaming
//!   transport, turn orchestration, and chat snapshot persistence.
//! - [`api`] defines chat/model payloads used by the streaming client and
//!   the model catalogue.
//! - [`ui`] renders the transcript and runs the interactive event loop.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::run`].

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod ui;
pub mod utils;
