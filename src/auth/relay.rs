//! Key exchange relay.
//!
//! The browser-facing side of the exchange never talks to OpenRouter
//! directly; it posts `{"code", "codeVerifier"}` to this relay, which
//! forwards to the provider's keys endpoint with the fixed challenge
//! method and narrows every failure to a generic error body. The relay
//! performs no other business logic.

use std::error::Error;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::core::constants::{CODE_CHALLENGE_METHOD, OPENROUTER_API_BASE_URL};
use crate::utils::url::construct_api_url;

const MISSING_FIELDS_ERROR: &str = "Missing code or codeVerifier";
const EXCHANGE_FAILED_ERROR: &str = "Failed to authenticate with OpenRouter";

#[derive(Debug, Deserialize)]
struct RelayRequest {
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "codeVerifier", default)]
    code_verifier: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct RelayReply {
    pub status: u16,
    pub body: Value,
}

#[derive(Clone)]
pub struct KeyRelay {
    client: reqwest::Client,
    upstream_url: String,
}

impl KeyRelay {
    pub fn new(client: reqwest::Client, upstream_url: impl Into<String>) -> Self {
        Self {
            client,
            upstream_url: upstream_url.into(),
        }
    }

    /// Relay targeting OpenRouter's production keys endpoint.
    pub fn openrouter(client: reqwest::Client) -> Self {
        Self::new(client, construct_api_url(OPENROUTER_API_BASE_URL, "auth/keys"))
    }

    /// Map one relay request body to a reply. Exposed separately from the
    /// listener so the status mapping is testable without sockets.
    pub async fn handle(&self, body: &[u8]) -> RelayReply {
        let request = match serde_json::from_slice::<RelayRequest>(body) {
            Ok(request) => request,
            Err(_) => return bad_request(),
        };

        let (code, verifier) = match (
            request.code.as_deref().filter(|value| !value.is_empty()),
            request
                .code_verifier
                .as_deref()
                .filter(|value| !value.is_empty()),
        ) {
            (Some(code), Some(verifier)) => (code, verifier),
            _ => return bad_request(),
        };

        let response = self
            .client
            .post(&self.upstream_url)
            .json(&json!({
                "code": code,
                "code_verifier": verifier,
                "code_challenge_method": CODE_CHALLENGE_METHOD,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(_) | Err(_) => return exchange_failed(),
        };

        let payload = match response.json::<Value>().await {
            Ok(payload) => payload,
            Err(_) => return exchange_failed(),
        };

        match payload.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => RelayReply {
                status: 200,
                body: json!({ "key": key }),
            },
            _ => exchange_failed(),
        }
    }

    /// Serve exactly one relay request on the given listener.
    pub async fn serve_once(&self, listener: TcpListener) -> Result<(), Box<dyn Error>> {
        let (mut stream, _) = listener.accept().await?;
        let mut buffer = vec![0_u8; 16 * 1024];
        let bytes_read = stream.read(&mut buffer).await?;
        if bytes_read == 0 {
            return Err("relay request carried no data".into());
        }

        let body = extract_body(&buffer[..bytes_read]);
        let reply = self.handle(body).await;
        let body_text = reply.body.to_string();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line(reply.status),
            body_text.len(),
            body_text
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn bad_request() -> RelayReply {
    RelayReply {
        status: 400,
        body: json!({ "error": MISSING_FIELDS_ERROR }),
    }
}

fn exchange_failed() -> RelayReply {
    RelayReply {
        status: 500,
        body: json!({ "error": EXCHANGE_FAILED_ERROR }),
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        _ => "500 Internal Server Error",
    }
}

fn extract_body(request: &[u8]) -> &[u8] {
    const SEPARATOR: &[u8] = b"\r\n\r\n";
    request
        .windows(SEPARATOR.len())
        .position(|window| window == SEPARATOR)
        .map(|index| &request[index + SEPARATOR.len()..])
        .unwrap_or_default()
}
