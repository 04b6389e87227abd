use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mingle_client_core::config::ClientConfig;
use mingle_client_core::pipeline::{RequestDescriptor, RequestError};
use mingle_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use mingle_client_core::transport::Method;
use mingle_client_core::{MingleClient, RestoreOutcome};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mingle", about = "Mingle realtime client")]
struct Cli {
    #[arg(long, value_enum, env = "MINGLE_LOG_LEVEL", default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    #[arg(long, env = "MINGLE_LOG_FILE", help = "Write logs to a file instead of stderr", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store credentials
    Login(LoginArgs),
    /// Revoke and forget the stored session
    Logout,
    /// Show whether a session is stored and still usable
    Status,
    /// Send one authenticated API request and print the response body
    Request(RequestArgs),
    /// Connect and print presence updates until interrupted
    Watch,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, env = "MINGLE_EMAIL")]
    email: String,
    #[arg(long, env = "MINGLE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct RequestArgs {
    method: Method,
    path: String,
    #[arg(long, help = "JSON request body")]
    body: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = ClientConfig::from_env()?;
    let client = MingleClient::from_config(config)?;

    match cli.command {
        Command::Login(args) => {
            client
                .sign_in(&args.email, &args.password)
                .await
                .context("sign in failed")?;
            client.disconnect();
            println!("Signed in as {}", args.email);
        }
        Command::Logout => {
            client.logout().await?;
            println!("Signed out");
        }
        Command::Status => match client.restore().await? {
            RestoreOutcome::SignedOut => println!("Not signed in"),
            RestoreOutcome::Expired => println!("Session expired; run `mingle login`"),
            RestoreOutcome::Resumed => {
                println!("Signed in ({:?})", client.connection().state());
                client.disconnect();
            }
        },
        Command::Request(args) => {
            let mut descriptor = RequestDescriptor::new(args.method, args.path);
            if let Some(raw) = args.body {
                let body = serde_json::from_str(&raw).context("--body is not valid JSON")?;
                descriptor = descriptor.with_body(body);
            }
            match client.request(descriptor).await {
                Ok(response) => println!("{}", response.text()),
                Err(RequestError::SessionExpired) => {
                    bail!("Your session has expired; run `mingle login`")
                }
                Err(err) => bail!("{} ({err})", err.user_message()),
            }
        }
        Command::Watch => watch(&client).await?,
    }
    Ok(())
}

async fn watch(client: &MingleClient) -> Result<()> {
    if client.restore().await? != RestoreOutcome::Resumed {
        bail!("no usable session; run `mingle login` first");
    }

    let mut presence = client.watch_presence();
    let mut connection = client.watch_connection();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                eprintln!("connection: {state:?}");
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = presence.borrow_and_update().clone();
                println!("{}", serde_json::to_string(&view)?);
            }
        }
    }
    client.disconnect();
    Ok(())
}
