//! Key exchange client.
//!
//! Trades an authorization code plus the cached verifier for a long-lived
//! OpenRouter API key via the relay endpoint. The relay accepts
//! `{"code", "codeVerifier"}` and answers `{"key"}`; everything else is an
//! error we classify for the caller.

use std::error::Error as StdError;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug)]
pub enum ExchangeError {
    /// Missing code or verifier; detected before any network call.
    InvalidArgument(&'static str),
    /// The relay (or the provider behind it) answered with a non-success
    /// status.
    UpstreamRejected { status: u16 },
    /// The relay answered success but without a usable key.
    MalformedResponse,
    /// The request never completed.
    Transport(reqwest::Error),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::InvalidArgument(field) => {
                write!(f, "key exchange requires a non-empty {field}")
            }
            ExchangeError::UpstreamRejected { status } => {
                write!(f, "key exchange rejected upstream (HTTP {status})")
            }
            ExchangeError::MalformedResponse => {
                write!(f, "key exchange succeeded but returned no key")
            }
            ExchangeError::Transport(err) => write!(f, "key exchange request failed: {err}"),
        }
    }
}

impl StdError for ExchangeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ExchangeError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    #[serde(rename = "codeVerifier")]
    code_verifier: &'a str,
}

#[derive(Clone)]
pub struct KeyExchangeClient {
    client: reqwest::Client,
    relay_url: String,
}

impl KeyExchangeClient {
    pub fn new(client: reqwest::Client, relay_url: impl Into<String>) -> Self {
        Self {
            client,
            relay_url: relay_url.into(),
        }
    }

    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<String, ExchangeError> {
        if code.trim().is_empty() {
            return Err(ExchangeError::InvalidArgument("code"));
        }
        if verifier.trim().is_empty() {
            return Err(ExchangeError::InvalidArgument("verifier"));
        }

        let response = self
            .client
            .post(&self.relay_url)
            .json(&ExchangeRequest {
                code,
                code_verifier: verifier,
            })
            .send()
            .await
            .map_err(ExchangeError::Transport)?;

        if !response.status().is_success() {
            return Err(ExchangeError::UpstreamRejected {
                status: response.status().as_u16(),
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|_| ExchangeError::MalformedResponse)?;
        match body.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(ExchangeError::MalformedResponse),
        }
    }
}
