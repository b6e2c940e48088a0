//! Command-line entrypoints: the interactive chat loop plus the `auth`,
//! `deauth`, and `models` subcommands.

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::models::ModelCatalogue;
use crate::auth::exchange::KeyExchangeClient;
use crate::auth::flow::{
    complete_sign_in, open_in_browser, wait_for_auth_callback, AuthFlow, AuthPhase, AuthSignal,
};
use crate::auth::relay::KeyRelay;
use crate::auth::store::AuthStore;
use crate::core::chat_store::ChatStore;
use crate::core::config::Config;
use crate::core::constants::OPENROUTER_API_BASE_URL;
use crate::core::chat_stream::OpenRouterBackend;
use crate::core::conversation::Conversation;
use crate::core::turn::TurnEngine;
use crate::ui::chat_loop::{run_chat, ChatSession};

#[derive(Parser)]
#[command(name = "tickertalk")]
#[command(about = "A terminal chat client for OpenRouter's tool-calling models")]
#[command(
    long_about = "tickertalk is a full-screen terminal chat client for OpenRouter's \
tool-calling models. It signs in with a PKCE key exchange and renders \
tool-driven stock and event widgets inline in the transcript.\n\n\
Run `tickertalk auth` once to sign in, then `tickertalk` to chat.\n\n\
Controls:\n\
  Type              Enter your message in the input field\n\
  Enter             Send the message\n\
  /buy              Confirm the pending stock purchase\n\
  /quit or Ctrl+C   Quit"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[arg(
        short,
        long,
        help = "Model slug to chat with (defaults to the configured model)"
    )]
    pub model: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Sign in to OpenRouter via the PKCE authorization flow
    Auth,
    /// Sign out; clears the stored key and nothing else
    Deauth,
    /// List the tool-capable model catalogue
    Models,
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Auth) => run_auth().await,
        Some(Command::Deauth) => run_deauth(),
        Some(Command::Models) => run_models().await,
        None => run_interactive(cli.model).await,
    }
}

async fn run_auth() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let mut store = AuthStore::open()?;
    store.ensure_pkce()?;
    let mut flow = AuthFlow::new(store)?;

    if flow.phase() == AuthPhase::SignedIn {
        println!("Already signed in. Run `tickertalk deauth` first to start over.");
        return Ok(());
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let callback_url = format!("http://{}", listener.local_addr()?);
    let url = flow.sign_in(&callback_url)?;

    println!("Opening your browser for OpenRouter authorization...");
    println!("If nothing opens, visit:\n  {url}");
    if let Err(err) = open_in_browser(url.as_str()) {
        debug!(error = %err, "browser launch failed");
    }

    let code = wait_for_auth_callback(listener).await?;

    let client = reqwest::Client::new();
    let relay_url = match config.relay_url.clone() {
        Some(url) => url,
        None => spawn_local_relay(client.clone()).await?,
    };
    let exchange = KeyExchangeClient::new(client, relay_url);

    match complete_sign_in(&mut flow, &exchange, &code).await? {
        AuthSignal::SignedIn => {
            println!("Successfully authenticated with OpenRouter");
            Ok(())
        }
        AuthSignal::SignInFailed(message) => Err(message.into()),
        AuthSignal::SignedOut => Ok(()),
    }
}

/// Serve the key exchange relay for exactly one request on a local port.
async fn spawn_local_relay(client: reqwest::Client) -> Result<String, Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_url = format!("http://{}/api/auth", listener.local_addr()?);
    let relay = KeyRelay::openrouter(client);
    tokio::spawn(async move {
        if let Err(err) = relay.serve_once(listener).await {
            debug!(error = %err, "local relay failed");
        }
    });
    Ok(relay_url)
}

fn run_deauth() -> Result<(), Box<dyn Error>> {
    let store = AuthStore::open()?;
    let mut flow = AuthFlow::new(store)?;
    flow.sign_out()?;
    println!("Signed out successfully");
    Ok(())
}

async fn run_models() -> Result<(), Box<dyn Error>> {
    let catalogue = ModelCatalogue::new();
    let models = catalogue
        .load(&reqwest::Client::new(), OPENROUTER_API_BASE_URL)
        .await?;
    for model in models {
        println!("{:<48} {}", model.id, model.name);
    }
    Ok(())
}

async fn run_interactive(model_override: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let store = AuthStore::open()?;
    let Some(api_key) = store.api_key()? else {
        return Err("Not signed in. Run `tickertalk auth` first.".into());
    };

    let model = model_override.unwrap_or_else(|| config.model().to_string());
    let backend = OpenRouterBackend::new(
        reqwest::Client::new(),
        OPENROUTER_API_BASE_URL,
        api_key,
    );

    let session = ChatSession {
        conversation: Arc::new(Mutex::new(Conversation::new())),
        engine: TurnEngine::new(Arc::new(backend)),
        model,
        user_id: config.user_id().to_string(),
        chat_store: Some(ChatStore::open()),
    };
    run_chat(session).await
}
