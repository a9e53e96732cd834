use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use sitepod_console_core::config::{resolve_endpoint, resolve_state_dir};
use sitepod_console_core::{
    ConsoleClient, ConsoleClientConfig, FileStore, HttpMethod, RequestOptions, SessionSnapshot,
    User,
};

#[derive(Parser, Debug)]
#[command(name = "sitepod-console")]
#[command(about = "SitePod console session client")]
pub struct SitepodConsoleCli {
    /// API endpoint. Falls back to SITEPOD_ENDPOINT, then http://localhost:8080
    #[arg(long, global = true)]
    pub endpoint: Option<String>,
    /// Directory holding the persisted session token
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sign in with email and password
    Login(LoginArgs),
    /// Start an anonymous session
    Anonymous,
    /// Install a token obtained elsewhere
    UseToken(UseTokenArgs),
    /// Sign out and forget the stored token
    Logout,
    /// Validate the stored token and print the session
    Whoami,
    /// Send one request through the gateway and print the JSON result
    Request(RequestArgs),
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    #[arg(long)]
    pub email: String,
    #[arg(long, env = "SITEPOD_PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Use the admin login endpoint
    #[arg(long)]
    pub admin: bool,
}

#[derive(Args, Debug)]
pub struct UseTokenArgs {
    pub token: String,
    #[arg(long)]
    pub user_id: String,
    #[arg(long, default_value = "")]
    pub email: String,
    #[arg(long)]
    pub admin: bool,
    #[arg(long)]
    pub anonymous: bool,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    #[arg(value_parser = parse_method)]
    pub method: HttpMethod,
    pub path: String,
    /// JSON request body
    #[arg(long)]
    pub body: Option<String>,
}

fn parse_method(raw: &str) -> Result<HttpMethod, String> {
    HttpMethod::parse(raw).ok_or_else(|| format!("unsupported method `{raw}`"))
}

pub async fn run() -> Result<()> {
    let cli = SitepodConsoleCli::parse();
    execute(cli, &mut std::io::stdout()).await
}

pub async fn execute(cli: SitepodConsoleCli, out: &mut impl Write) -> Result<()> {
    let (endpoint, source) = resolve_endpoint(cli.endpoint.as_deref())?;
    let state_dir = resolve_state_dir(cli.state_dir)?;
    tracing::debug!(endpoint = %endpoint, source, state_dir = %state_dir.display(), "resolved console config");

    let mut config = ConsoleClientConfig::new(&endpoint)?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_request_timeout_ms(timeout_ms);
    }
    let store = Arc::new(FileStore::in_dir(&state_dir));
    let console = ConsoleClient::with_reqwest(config, store);

    match cli.command {
        Commands::Login(args) => {
            let user = if args.admin {
                console.session.login_as_admin(&args.email, &args.password).await?
            } else {
                console
                    .session
                    .login_with_password(&args.email, &args.password)
                    .await?
            };
            write_json(out, &json!({ "user": user }))
        }
        Commands::Anonymous => {
            let user = console.session.login_anonymous().await?;
            let expires_at = console.session.snapshot().expires_at;
            write_json(out, &json!({ "user": user, "expires_at": expires_at }))
        }
        Commands::UseToken(args) => {
            let user = User {
                id: args.user_id,
                email: args.email,
                is_anonymous: args.anonymous,
                is_admin: args.admin,
            };
            console.session.set_token(&args.token, user)?;
            write_json(out, &session_json(&console.session.snapshot()))
        }
        Commands::Logout => {
            console.session.ready().await;
            console.session.logout();
            write_json(out, &session_json(&console.session.snapshot()))
        }
        Commands::Whoami => {
            let snapshot = console.session.ready().await;
            write_json(out, &session_json(&snapshot))
        }
        Commands::Request(args) => {
            console.session.ready().await;
            let mut options = RequestOptions::method(args.method);
            if let Some(raw) = args.body.as_deref() {
                let body: Value =
                    serde_json::from_str(raw).context("--body must be valid JSON")?;
                options = options.with_body(&body)?;
            }
            let data = console.gateway.request_value(&args.path, options).await?;
            write_json(out, &data)
        }
    }
}

pub fn session_json(snapshot: &SessionSnapshot) -> Value {
    json!({
        "phase": snapshot.phase.as_str(),
        "authenticated": snapshot.is_authenticated(),
        "user": snapshot.user,
        "expires_at": snapshot.expires_at,
    })
}

fn write_json(out: &mut impl Write, value: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    writeln!(out, "{rendered}")?;
    Ok(())
}
