//! Sign-in flow controller.
//!
//! An explicit state machine replaces the effect-retriggered orchestration
//! a browser app would use: discrete events (`sign_in`, callback code,
//! exchange resolution) drive the transitions, and because the only exits
//! from [`AuthPhase::ExchangingCode`] are the resolution events, duplicate
//! concurrent exchanges are impossible by construction.

use std::error::Error;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

use crate::auth::exchange::{ExchangeError, KeyExchangeClient};
use crate::auth::store::AuthStore;
use crate::core::constants::{CODE_CHALLENGE_METHOD, OPENROUTER_WEB_URL};

const GENERIC_SIGN_IN_FAILURE: &str = "Failed to authenticate with OpenRouter";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    SignedOut,
    AwaitingRedirect,
    ExchangingCode,
    SignedIn,
    /// Not terminal; `sign_in` may be retried immediately.
    Failed,
}

/// Observable outcome of a transition, rendered by the caller as a toast
/// or status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    SignedIn,
    SignInFailed(String),
    SignedOut,
}

/// The single exchange a callback code entitles the caller to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    pub code: String,
    pub verifier: String,
}

pub struct AuthFlow {
    phase: AuthPhase,
    store: AuthStore,
}

impl AuthFlow {
    pub fn new(store: AuthStore) -> Result<Self, Box<dyn Error>> {
        let phase = if store.api_key()?.is_some() {
            AuthPhase::SignedIn
        } else {
            AuthPhase::SignedOut
        };
        Ok(Self { phase, store })
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == AuthPhase::ExchangingCode
    }

    pub fn store(&self) -> &AuthStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut AuthStore {
        &mut self.store
    }

    /// Sign-in stays disabled until a challenge exists and no exchange is
    /// running.
    pub fn can_sign_in(&self) -> bool {
        self.store.challenge().is_some_and(|c| !c.is_empty())
            && !matches!(self.phase, AuthPhase::ExchangingCode | AuthPhase::SignedIn)
    }

    /// Build the authorization URL and move to `AwaitingRedirect`. The
    /// caller is responsible for actually navigating there.
    pub fn sign_in(&mut self, callback_url: &str) -> Result<reqwest::Url, Box<dyn Error>> {
        if !self.can_sign_in() {
            return Err("sign-in is not available: no challenge cached or a sign-in is already running".into());
        }
        let challenge = self
            .store
            .challenge()
            .ok_or("sign-in requires an initialized challenge")?;
        let url = build_authorization_url(challenge, callback_url)?;
        debug!(phase = ?self.phase, "sign-in requested, awaiting redirect");
        self.phase = AuthPhase::AwaitingRedirect;
        Ok(url)
    }

    /// A callback code arrived. Returns the exchange to perform iff a
    /// verifier is cached, no key is stored, and no exchange is already in
    /// flight; re-evaluating the same condition yields nothing.
    pub fn on_callback_code(&mut self, code: &str) -> Option<PendingExchange> {
        if code.is_empty() || self.phase == AuthPhase::ExchangingCode {
            return None;
        }
        if matches!(self.store.api_key(), Ok(Some(_))) {
            return None;
        }
        let verifier = self.store.verifier().filter(|v| !v.is_empty())?.to_string();

        debug!("callback code accepted, starting exchange");
        self.phase = AuthPhase::ExchangingCode;
        Some(PendingExchange {
            code: code.to_string(),
            verifier,
        })
    }

    pub fn on_exchange_success(&mut self, key: &str) -> Result<AuthSignal, Box<dyn Error>> {
        self.store.set_api_key(key)?;
        self.phase = AuthPhase::SignedIn;
        Ok(AuthSignal::SignedIn)
    }

    /// Failure detail is logged but never surfaced; the user-facing signal
    /// stays generic.
    pub fn on_exchange_failure(&mut self, error: &ExchangeError) -> AuthSignal {
        debug!(error = %error, "key exchange failed");
        self.phase = AuthPhase::Failed;
        AuthSignal::SignInFailed(GENERIC_SIGN_IN_FAILURE.to_string())
    }

    /// Clears only the stored key; the PKCE pair stays cached.
    pub fn sign_out(&mut self) -> Result<AuthSignal, Box<dyn Error>> {
        self.store.clear_api_key()?;
        self.phase = AuthPhase::SignedOut;
        Ok(AuthSignal::SignedOut)
    }
}

/// Run one callback code through the exchange, resolving the state machine
/// on either path.
pub async fn complete_sign_in(
    flow: &mut AuthFlow,
    exchange: &KeyExchangeClient,
    code: &str,
) -> Result<AuthSignal, Box<dyn Error>> {
    let Some(pending) = flow.on_callback_code(code) else {
        return Err("no exchange is possible in the current state".into());
    };
    match exchange.exchange(&pending.code, &pending.verifier).await {
        Ok(key) => flow.on_exchange_success(&key),
        Err(err) => Ok(flow.on_exchange_failure(&err)),
    }
}

pub fn build_authorization_url(
    challenge: &str,
    callback_url: &str,
) -> Result<reqwest::Url, Box<dyn Error>> {
    let mut url = reqwest::Url::parse(OPENROUTER_WEB_URL)?.join("/auth")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("callback_url", callback_url);
        query.append_pair("code_challenge", challenge);
        query.append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
    }
    Ok(url)
}

/// Wait for the provider to redirect back with an authorization code,
/// serving a small confirmation page to the browser.
pub async fn wait_for_auth_callback(listener: TcpListener) -> Result<String, Box<dyn Error>> {
    let (mut stream, _) = tokio::time::timeout(CALLBACK_TIMEOUT, listener.accept()).await??;
    let mut buffer = vec![0_u8; 16 * 1024];
    let bytes_read = stream.read(&mut buffer).await?;
    if bytes_read == 0 {
        return Err("auth callback received no data".into());
    }
    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let first_line = request
        .lines()
        .next()
        .ok_or("auth callback request line missing")?;
    let mut parts = first_line.split_whitespace();
    let _method = parts.next().ok_or("auth callback method missing")?;
    let target = parts.next().ok_or("auth callback target missing")?;
    let callback_url = reqwest::Url::parse(&format!("http://localhost{target}"))?;

    let mut code = None::<String>;
    let mut error = None::<String>;
    for (key, value) in callback_url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "error" => error = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(error) = error {
        write_callback_response(
            &mut stream,
            "400 Bad Request",
            "Authorization failed",
            "OpenRouter rejected the authorization request. Close this tab and retry in tickertalk.",
        )
        .await?;
        return Err(format!("auth callback error: {error}").into());
    }

    let Some(code) = code else {
        write_callback_response(
            &mut stream,
            "400 Bad Request",
            "Authorization callback missing code",
            "The callback did not include an authorization code. Close this tab and retry in tickertalk.",
        )
        .await?;
        return Err("auth callback missing code".into());
    };

    write_callback_response(
        &mut stream,
        "200 OK",
        "You're signed in to tickertalk",
        "Authorization completed successfully. Close this tab and return to tickertalk.",
    )
    .await?;
    Ok(code)
}

async fn write_callback_response(
    stream: &mut tokio::net::TcpStream,
    status: &str,
    heading: &str,
    detail: &str,
) -> Result<(), Box<dyn Error>> {
    let body = format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>tickertalk</title></head>\
         <body style=\"font-family: sans-serif; margin: 4rem auto; max-width: 32rem;\">\
         <h1>{heading}</h1><p>{detail}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub fn open_in_browser(url: &str) -> Result<(), Box<dyn Error>> {
    #[cfg(target_os = "macos")]
    {
        let status = std::process::Command::new("open").arg(url).status()?;
        if status.success() {
            return Ok(());
        }
        return Err("failed to launch browser with open".into());
    }
    #[cfg(target_os = "windows")]
    {
        let status = std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .status()?;
        if status.success() {
            return Ok(());
        }
        return Err("failed to launch browser with start".into());
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        let status = std::process::Command::new("xdg-open").arg(url).status()?;
        if status.success() {
            return Ok(());
        }
        return Err("failed to launch browser with xdg-open".into());
    }

    #[allow(unreachable_code)]
    Err(format!("no browser launcher configured for URL: {url}").into())
}
