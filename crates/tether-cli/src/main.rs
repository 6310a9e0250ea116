mod logging;
mod settings;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use settings::{Overrides, Settings};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tether_client::{load_or_create_identity, GatewayClient};
use tether_runtime::driver::DEFAULT_HISTORY_METHOD;
use tether_runtime::history::{entries_from_history, parse_history};
use tether_runtime::{EngineConfig, ReconcilerRuntime, RuntimeConfig, RuntimeUpdate};
use tether_storage::{AuthTokenStore, SqliteDeviceStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Gateway protocol client and run reconciler", long_about = None)]
struct Cli {
    /// Gateway websocket url (TETHER_GATEWAY_URL)
    #[arg(long, global = true)]
    url: Option<String>,
    /// Shared gateway token (TETHER_GATEWAY_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,
    /// Gateway password (TETHER_GATEWAY_PASSWORD)
    #[arg(long, global = true)]
    password: Option<String>,
    /// Directory holding the device identity store (TETHER_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    log_stdout: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Print the device id, public key and cached tokens
    Identity,
    /// Follow sessions and print transcript, status and live changes as JSON lines
    Watch(WatchArgs),
    /// Print a session's history as transcript entries
    History(HistoryArgs),
    /// Call a gateway method and print the response payload
    Call(CallArgs),
    /// Send a chat message to a session
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long = "session", required = true)]
    sessions: Vec<String>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long)]
    session: String,
    #[arg(long, default_value_t = 200)]
    limit: usize,
}

#[derive(Args, Debug)]
struct CallArgs {
    method: String,
    /// JSON params; defaults to {}
    #[arg(long)]
    params: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    session: String,
    message: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            token: self.token.clone(),
            password: self.password.clone(),
            state_dir: self.state_dir.clone(),
            log_dir: self.log_dir.clone(),
            log_stdout: self.log_stdout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli.overrides(), |key| env::var(key).ok())?;
    let _log_guard = logging::init_logging(&settings);

    match cli.command {
        Command::Identity => identity(&settings),
        Command::Watch(args) => watch(&settings, args).await,
        Command::History(args) => history(&settings, args).await,
        Command::Call(args) => call(&settings, args).await,
        Command::Send(args) => send(&settings, args).await,
    }
}

fn open_store(settings: &Settings) -> Result<Arc<SqliteDeviceStore>> {
    std::fs::create_dir_all(&settings.state_dir)
        .with_context(|| format!("create state dir {}", settings.state_dir.display()))?;
    let path = settings.store_path();
    let store = SqliteDeviceStore::open(&path)
        .with_context(|| format!("open device store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn connect(settings: &Settings) -> Result<GatewayClient> {
    let store = open_store(settings)?;
    let client = GatewayClient::with_store(settings.client_config(), store)
        .context("initialize gateway client")?;
    let hello = client
        .connect()
        .await
        .with_context(|| format!("connect to {}", settings.gateway_url))?;
    info!(
        event = "cli_connected",
        url = %settings.gateway_url,
        device_id = client.device_id(),
        protocol = hello.protocol
    );
    Ok(client)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn identity(settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let identity = load_or_create_identity(store.as_ref()).context("load device identity")?;
    let record = store
        .device_record(identity.device_id())
        .context("read cached device tokens")?;
    let tokens = record
        .tokens
        .iter()
        .map(|(key, token)| json!({"key": key, "scopes": token.scopes, "updatedAtMs": token.updated_at_ms}))
        .collect::<Vec<_>>();
    let output = json!({
        "deviceId": identity.device_id(),
        "publicKey": identity.public_key_base64(),
        "createdAtMs": identity.created_at_ms(),
        "tokens": tokens,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn history(settings: &Settings, args: HistoryArgs) -> Result<()> {
    let client = connect(settings).await?;
    let payload = client
        .request_value(
            DEFAULT_HISTORY_METHOD,
            json!({"sessionKey": args.session, "limit": args.limit}),
        )
        .await
        .context("fetch history")?;
    for entry in entries_from_history(&parse_history(&payload)) {
        print_json(&serde_json::to_value(&entry)?)?;
    }
    client.disconnect().await;
    Ok(())
}

async fn call(settings: &Settings, args: CallArgs) -> Result<()> {
    let params = match args.params.as_deref() {
        Some(raw) => serde_json::from_str::<Value>(raw).context("parse --params as JSON")?,
        None => json!({}),
    };
    let client = connect(settings).await?;
    let result = client
        .request_value(&args.method, params)
        .await
        .with_context(|| format!("call {}", args.method));
    client.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn send(settings: &Settings, args: SendArgs) -> Result<()> {
    let client = connect(settings).await?;
    let runtime = ReconcilerRuntime::spawn(client.clone(), EngineConfig::default(), RuntimeConfig::default());
    let result = runtime
        .send_message(&args.session, &args.message)
        .await
        .context("send message");
    runtime.shutdown().await;
    client.disconnect().await;
    print_json(&json!({"session": args.session, "entryId": result?}))
}

async fn watch(settings: &Settings, args: WatchArgs) -> Result<()> {
    let client = connect(settings).await?;
    let runtime = ReconcilerRuntime::spawn(client.clone(), EngineConfig::default(), RuntimeConfig::default());
    let mut updates = runtime.subscribe();
    let mut live = runtime.live();
    let mut status = client.subscribe_status();
    for session in &args.sessions {
        runtime.track(session).context("track session")?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(RuntimeUpdate::Transcript { agent, entries }) => {
                    print_json(&json!({"type": "transcript", "agent": agent, "entries": entries}))?;
                }
                Ok(RuntimeUpdate::Status { agent, status }) => {
                    print_json(&json!({"type": "status", "agent": agent, "status": status}))?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "cli_updates_lagged", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            changed = live.changed() => {
                if changed.is_err() {
                    break;
                }
                let streams = live.borrow_and_update().values().cloned().collect::<Vec<_>>();
                print_json(&json!({"type": "live", "streams": streams}))?;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                print_json(&json!({"type": "connection", "status": current.as_str()}))?;
            }
        }
    }

    runtime.shutdown().await;
    client.disconnect().await;
    Ok(())
}
