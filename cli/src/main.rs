use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use session_guard::memory::{MemoryNavigator, MemoryProfiles, MemoryProvider, MemoryStorage};
use session_guard::profile::ProfileSync;
use session_guard::session::{Clock, SystemClock};
use session_guard::{
    FileStorage, Guard, GuardConfig, GuardStatus, IdentityProvider, Navigator, RouteClass, Session,
    SessionStore, classify,
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("--state-dir (or GUARD_STATE_DIR) is required for session commands")]
    MissingStateDir,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "guard-cli", about = "Session guard route checks and mount simulator")]
struct Cli {
    /// Directory for durable session storage. In-memory when omitted.
    #[arg(long, env = "GUARD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify paths against the configured public routes.
    Classify { paths: Vec<String> },
    /// One-shot check: where a request for a path would be redirected.
    Check(CheckArgs),
    /// Mount a guard against in-memory collaborators and trace what it does.
    Simulate(SimulateArgs),
    Session(SessionCommand),
}

#[derive(Args, Debug)]
struct ProviderArgs {
    /// The provider reports a live session.
    #[arg(long)]
    signed_in: bool,

    #[arg(long)]
    email: Option<String>,

    /// Delay applied to every provider call.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
}

#[derive(Args, Debug)]
struct CheckArgs {
    path: String,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "/")]
    path: String,

    #[command(flatten)]
    provider: ProviderArgs,

    /// When the navigation layer reports ready.
    #[arg(long, default_value_t = 0)]
    ready_after_ms: u64,

    /// Sign out through the provider after this long.
    #[arg(long)]
    sign_out_after_ms: Option<u64>,

    /// How long to observe before unmounting.
    #[arg(long, default_value_t = 3_000)]
    duration_ms: u64,
}

#[derive(Args, Debug)]
struct SessionCommand {
    #[command(subcommand)]
    command: SessionSubcommand,
}

#[derive(Subcommand, Debug)]
enum SessionSubcommand {
    /// Print the stored session, if it is still valid.
    Show,
    /// Remove the stored session.
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = GuardConfig::from_env();

    match cli.command {
        Command::Classify { paths } => run_classify(&config, &paths),
        Command::Check(args) => run_check(config, cli.state_dir.as_deref(), args).await,
        Command::Simulate(args) => run_simulate(config, cli.state_dir.as_deref(), args).await,
        Command::Session(session) => run_session(&config, cli.state_dir.as_deref(), session).await,
    }
}

fn run_classify(config: &GuardConfig, paths: &[String]) -> Result<(), CliError> {
    for path in paths {
        let class = match classify(path, &config.public_routes) {
            RouteClass::Public => "public",
            RouteClass::Protected => "protected",
        };
        print_json(&json!({ "path": path, "class": class }))?;
    }
    Ok(())
}

async fn run_check(config: GuardConfig, state_dir: Option<&Path>, args: CheckArgs) -> Result<(), CliError> {
    let provider = Arc::new(build_provider(&args.provider));
    let navigator = Arc::new(MemoryNavigator::new(&args.path));
    let guard = Guard::new(provider, navigator, open_store(state_dir), config);

    let redirect = guard.check(&args.path).await;
    print_json(&json!({ "path": args.path, "redirect": redirect }))
}

async fn run_simulate(config: GuardConfig, state_dir: Option<&Path>, args: SimulateArgs) -> Result<(), CliError> {
    let provider = Arc::new(build_provider(&args.provider));
    let navigator = Arc::new(MemoryNavigator::new(&args.path));
    let profiles = Arc::new(MemoryProfiles::new());
    let guard = Guard::new(provider.clone(), navigator.clone(), open_store(state_dir), config);

    let handle = guard.mount();
    let mut status = handle.watch();
    let mut location = navigator.location();
    let _profile_sync = ProfileSync::spawn(profiles.clone(), handle.watch());

    let ready = navigator.clone();
    let ready_after = Duration::from_millis(args.ready_after_ms);
    tokio::spawn(async move {
        tokio::time::sleep(ready_after).await;
        ready.mark_ready();
    });
    if let Some(delay_ms) = args.sign_out_after_ms {
        let provider = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Err(e) = provider.sign_out().await {
                tracing::warn!(error = %e, "simulated sign-out failed");
            }
        });
    }

    let initial = status_line(&status.borrow_and_update());
    print_json(&initial)?;

    let deadline = tokio::time::sleep(Duration::from_millis(args.duration_ms));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status_line(&status.borrow_and_update());
                print_json(&line)?;
            }
            changed = location.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = location.borrow_and_update().clone();
                print_json(&json!({ "event": "location", "path": current.path, "ready": current.ready }))?;
            }
        }
    }

    let summary = json!({
        "event": "summary",
        "status": status_line(&handle.status()),
        "redirects": navigator.redirects(),
        "provider_calls": provider.get_calls(),
        "profiles": profiles.len(),
    });
    handle.unmount().await;
    print_json(&summary)
}

async fn run_session(config: &GuardConfig, state_dir: Option<&Path>, session: SessionCommand) -> Result<(), CliError> {
    let dir = state_dir.ok_or(CliError::MissingStateDir)?;
    let store = SessionStore::new(Arc::new(FileStorage::new(dir)));

    match session.command {
        SessionSubcommand::Show => {
            let stored = store.get_session(&config.storage_key).await;
            let value = match stored {
                Some(session) => session_json(&session),
                None => Value::Null,
            };
            print_json(&value)
        }
        SessionSubcommand::Clear => {
            store.remove(&config.storage_key).await;
            println!("cleared");
            Ok(())
        }
    }
}

fn build_provider(args: &ProviderArgs) -> MemoryProvider {
    let session = args
        .signed_in
        .then(|| demo_session(args.email.clone(), SystemClock.now()));
    MemoryProvider::new(session).with_latency(Duration::from_millis(args.latency_ms))
}

fn open_store(state_dir: Option<&Path>) -> SessionStore {
    match state_dir {
        Some(dir) => SessionStore::layered(Arc::new(FileStorage::new(dir)), Arc::new(MemoryStorage::new())),
        None => SessionStore::new(Arc::new(MemoryStorage::new())),
    }
}

fn demo_session(email: Option<String>, now: i64) -> Session {
    Session {
        subject_id: "demo-user".to_owned(),
        access_token: Uuid::new_v4().to_string(),
        refresh_token: Uuid::new_v4().to_string(),
        expires_at: now + 3_600,
        email,
    }
}

fn status_line(status: &GuardStatus) -> Value {
    match status {
        GuardStatus::Initializing => json!({ "event": "status", "status": "initializing" }),
        GuardStatus::Authenticated(session) => {
            json!({ "event": "status", "status": "authenticated", "session": session_json(session) })
        }
        GuardStatus::Unauthenticated => json!({ "event": "status", "status": "unauthenticated" }),
        GuardStatus::Failed(message) => json!({ "event": "status", "status": "failed", "message": message }),
    }
}

fn session_json(session: &Session) -> Value {
    json!({
        "subject_id": session.subject_id,
        "email": session.email,
        "expires_at": session.expires_at,
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
