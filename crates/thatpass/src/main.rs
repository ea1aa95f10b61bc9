use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "thatpass", about = "Share passwords through expiring links", version)]
struct Cli {
    /// thatpass server URL (default: http://localhost:8080 or $TP_SERVER)
    #[arg(long, env = "TP_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: $TP_PORT or 8080)
        #[arg(long, env = "TP_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $TP_HOST or 127.0.0.1)
        #[arg(long, env = "TP_HOST", default_value = "127.0.0.1")]
        host: String,
    },
    /// Store a password and print its link. Reads stdin when PASSWORD is omitted.
    Create {
        password: Option<String>,
        /// Number of views before the link is destroyed
        #[arg(long)]
        views: Option<u32>,
        /// Number of days before the link is destroyed
        #[arg(long)]
        days: Option<u32>,
        /// Only reveal to this client address
        #[arg(long)]
        ip: Option<String>,
    },
    /// Reveal the password behind a link (counts as a view)
    Open {
        /// Full link URL or bare link id
        link: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TP_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create {
            password,
            views,
            days,
            ip,
        } => {
            let password = match password {
                Some(p) => p,
                None => read_stdin()?,
            };
            cmd_create(&cli.server, &password, views, days, ip.as_deref()).await
        }
        Commands::Open { link } => cmd_open(&cli.server, &link).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let mut cfg = thatpass_server::ServerConfig::from_env()?;
    cfg.host = host;
    cfg.port = port;
    thatpass_server::run(cfg).await
}

async fn cmd_create(
    server: &str,
    password: &str,
    views: Option<u32>,
    days: Option<u32>,
    ip: Option<&str>,
) -> Result<()> {
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    let client = Client::new();
    let body = serde_json::json!({
        "password": password,
        "views": views,
        "days": days,
        "ip": ip,
    });

    let resp = client
        .post(format!("{}/passwords", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }

    let url = json["url"].as_str().context("response is missing url")?;
    println!("{url}");
    Ok(())
}

async fn cmd_open(server: &str, link: &str) -> Result<()> {
    let url = reveal_url(server, link);
    let client = Client::new();
    let resp = client
        .post(&url)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if status.is_success() {
        let password = json["password"].as_str().unwrap_or("");
        println!("{password}");
        Ok(())
    } else {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{error}");
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Accept either a full link or a bare id.
fn reveal_url(server: &str, link: &str) -> String {
    let link = link.trim();
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_owned()
    } else {
        format!("{}/password/{}", server.trim_end_matches('/'), link)
    }
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read password from stdin")?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_owned())
}
