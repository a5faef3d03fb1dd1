use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::error::ErrorKind;
use clap::parser::ValueSource;
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use fitbit_auth::Config;
use fitbit_auth::auth::browser::{Launcher, NoBrowser, SystemBrowser};
use fitbit_auth::auth::{self, CredentialStore, LoginFlow, TokenStore};
use fitbit_auth::banner::{print_banner, print_login_summary, print_status};
use fitbit_auth::consts::{REDIRECT_URI, default_data_dir};
use fitbit_auth::events::Event;
use fitbit_auth::spinner::Spinner;

#[derive(Parser)]
#[command(
    name = "fitbit-auth",
    version,
    about = "Authorize a Fitbit app and keep its tokens on disk."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// `login` options, accepted without the subcommand too
    #[command(flatten)]
    login: LoginArgs,

    /// Directory holding credentials.json and fitbit_tokens.json
    #[arg(short, long, env = "FITBIT_AUTH_DIR", global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize an app in the browser and store its tokens (default)
    Login(LoginArgs),
    /// List stored clients and token expiry
    Status,
    /// Remove a client's secret and tokens
    Logout {
        /// Client ID to forget
        client_id: String,
    },
}

#[derive(Args)]
struct LoginArgs {
    /// Fitbit app client ID (prompted if missing)
    #[arg(long, env = "FITBIT_CLIENT_ID")]
    client_id: Option<String>,

    /// Fitbit app client secret (prompted if missing)
    #[arg(long, env = "FITBIT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Redirect URI registered with the app; must be a loopback http URL
    #[arg(long, default_value = REDIRECT_URI)]
    redirect_uri: String,

    /// Seconds to wait for the browser redirect
    #[arg(short, long, default_value_t = 300)]
    timeout: u64,

    /// Print the authorization URL instead of opening a browser
    #[arg(long, default_value_t = false)]
    no_browser: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stderr keeps stdout for user-facing output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FITBIT_AUTH_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = parse_cli(std::env::args_os()).unwrap_or_else(|e| e.exit());

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir().context("cannot determine home directory")?,
    };
    let config = Config::new(&data_dir);

    match cli.command {
        Some(Command::Login(args)) => handle_login(config, args).await,
        None => handle_login(config, cli.login).await,
        Some(Command::Status) => handle_status(&config),
        Some(Command::Logout { client_id }) => handle_logout(&config, &client_id),
    }
}

/// Parse the command line. Top-level `login` flags only apply when no
/// subcommand is given, so passing them before one is an error.
fn parse_cli<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = Cli::command().try_get_matches_from(args)?;
    if matches.subcommand().is_some() {
        let login = LoginArgs::augment_args(clap::Command::new("login"));
        let misplaced = login
            .get_arguments()
            .find(|arg| matches.value_source(arg.get_id().as_str()) == Some(ValueSource::CommandLine));
        if let Some(arg) = misplaced {
            return Err(Cli::command().error(
                ErrorKind::ArgumentConflict,
                format!(
                    "--{} must come after the subcommand",
                    arg.get_long().unwrap_or(arg.get_id().as_str())
                ),
            ));
        }
    }
    Cli::from_arg_matches(&matches)
}

async fn handle_login(config: Config, args: LoginArgs) -> anyhow::Result<()> {
    let config = config
        .with_redirect_uri(args.redirect_uri)
        .with_timeout(Duration::from_secs(args.timeout));
    print_banner(&config);

    let client_id = match args.client_id {
        Some(id) => id,
        None => prompt("Client ID: ")?,
    };
    let client_secret = match args.client_secret {
        Some(secret) => secret,
        None => prompt("Client Secret: ")?,
    };
    if client_id.trim().is_empty() || client_secret.trim().is_empty() {
        bail!("both a client ID and a client secret are required");
    }

    let launcher: Box<dyn Launcher> = if args.no_browser {
        Box::new(NoBrowser)
    } else {
        Box::new(SystemBrowser)
    };
    let flow = LoginFlow::new(config, launcher)?;
    let progress = render_progress(flow.events().subscribe());

    let result = flow.run(&client_id, &client_secret).await;

    // closing the bus ends the progress task
    drop(flow);
    finish_progress(progress).await;

    let tokens = result?;
    println!();
    print_login_summary(&tokens);
    Ok(())
}

fn handle_status(config: &Config) -> anyhow::Result<()> {
    let credentials = CredentialStore::new(&config.credentials_path).load()?;
    let tokens = TokenStore::new(&config.tokens_path).load()?;
    print_status(&credentials, &tokens);
    Ok(())
}

fn handle_logout(config: &Config, client_id: &str) -> anyhow::Result<()> {
    if auth::logout(config, client_id)? {
        println!("✓ Removed {client_id}.");
    } else {
        println!("{client_id} is not stored.");
    }
    Ok(())
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Wait for the progress printer, logging it if it died. Returns whether it
/// ended cleanly.
async fn finish_progress(progress: JoinHandle<()>) -> bool {
    match progress.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "progress display task failed");
            false
        }
    }
}

/// Print flow events as they arrive, with a countdown while waiting.
fn render_progress(mut rx: broadcast::Receiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut spinner: Option<Spinner> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let Some(active) = spinner.take() {
                active.stop().await;
            }
            match event {
                Event::ListenerStarted { addr } => {
                    println!("Listening for the redirect on {addr}");
                }
                Event::AuthorizeUrl { url, opened } => {
                    if opened {
                        println!("Opened the browser. If nothing appeared, visit:\n");
                    } else {
                        println!("Open this URL to authorize:\n");
                    }
                    println!("  {url}\n");
                }
                Event::WaitingForRedirect { timeout } => {
                    spinner = Some(Spinner::start("waiting for authorization", timeout));
                }
                Event::RedirectReceived => println!("✓ Authorization code received"),
                Event::ExchangingCode => println!("Exchanging code for tokens..."),
                Event::Saved { client_id } => println!("✓ Saved credentials and tokens for {client_id}"),
            }
        }
        if let Some(active) = spinner {
            active.stop().await;
        }
    })
}
