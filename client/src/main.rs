use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mirrorgate_shared::{FrameCodec, FrameKind, Obfuscator, TunnelMessage, TunnelResult};
use tracing::info;

mod batch;
mod config;
mod tunnel;

use config::ClientConfig;
use tunnel::TunnelClient;

#[derive(Parser)]
#[command(name = "mirrorgate")]
#[command(author = "Mirrorgate Team")]
#[command(version = "0.1.0")]
#[command(about = "Fetch URLs through a Mirrorgate relay tunnel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay tunnel URL (overrides the config file)
    #[arg(short, long)]
    relay: Option<String>,

    /// Config file (defaults to mirrorgate-client.yml in the current or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Obfuscation key, decimal or 0x-prefixed hex
    #[arg(short, long, value_parser = parse_key)]
    key: Option<u8>,

    /// Use binary frames instead of base64 text frames
    #[arg(long)]
    binary: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one URL with GET
    Get {
        url: String,

        /// Write the body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Send one request with an explicit method, headers and body
    Request {
        url: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Header as 'Name: value', repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[arg(short, long)]
        data: Option<String>,

        /// Write the body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch every URL listed in a file over one connection
    Batch {
        file: PathBuf,

        /// Requests in flight at once
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
    },
}

fn parse_key(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid key '{}': {}", s, e))
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header '{}' is not in 'Name: value' form", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header '{}' has an empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = match cli.config.clone().or_else(ClientConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ClientConfig::load(&path)?
        }
        None => ClientConfig::default(),
    };
    if let Some(relay) = cli.relay {
        config.relay = relay;
    }
    if let Some(key) = cli.key {
        config.obfuscation_key = key;
    }
    config.validate()?;

    let codec = FrameCodec::new(Obfuscator::new(config.obfuscation_key));
    let kind = if cli.binary { FrameKind::Binary } else { FrameKind::Text };
    let client = TunnelClient::connect(&config.relay, codec, kind, config.timeout()).await?;

    let outcome = match cli.command {
        Commands::Get { url, output } => {
            let mut message = TunnelMessage::get(0, url);
            message.headers = config.headers.clone();
            fetch_one(&client, message, output).await
        }
        Commands::Request {
            url,
            method,
            headers,
            data,
            output,
        } => {
            let mut merged: BTreeMap<String, String> = config.headers.clone();
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                merged.insert(name, value);
            }
            let message = TunnelMessage {
                id: 0,
                url,
                method: method.to_ascii_uppercase(),
                headers: merged,
                body: data.map(String::into_bytes),
            };
            fetch_one(&client, message, output).await
        }
        Commands::Batch { file, concurrency } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let urls = batch::read_urls(&content);
            if urls.is_empty() {
                anyhow::bail!("No URLs in {}", file.display());
            }
            let entries = batch::run(&client, urls, &config.headers, concurrency).await;
            println!("{}", batch::summary(&entries, chrono::Utc::now()));
            Ok(())
        }
    };

    client.close().await;
    outcome
}

async fn fetch_one(client: &TunnelClient, message: TunnelMessage, output: Option<PathBuf>) -> Result<()> {
    let url = message.url.clone();
    let result = client
        .send(message)
        .await
        .with_context(|| format!("Request for {} failed", url))?;
    print_head(&result);

    if let Some(err) = &result.error {
        anyhow::bail!("Relay reported {}: {}", result.status, err);
    }

    match output {
        Some(path) => {
            tokio::fs::write(&path, &result.body)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} bytes to {}", result.body.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&result.body)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Status line and headers go to stderr so stdout carries only the body
fn print_head(result: &TunnelResult) {
    eprintln!("{} {}", result.status, result.url);
    for (name, value) in &result.headers {
        eprintln!("{}: {}", name, value);
    }
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("90"), Ok(0x5A));
        assert_eq!(parse_key("0x5A"), Ok(0x5A));
        assert!(parse_key("0x100").is_err());
        assert!(parse_key("key").is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept:  text/html ").unwrap(),
            ("Accept".to_string(), "text/html".to_string())
        );
        assert_eq!(
            parse_header("X-Time: 12:30").unwrap(),
            ("X-Time".to_string(), "12:30".to_string())
        );
        assert!(parse_header("no colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_cli_parses_request() {
        let cli = Cli::try_parse_from([
            "mirrorgate",
            "--binary",
            "--key",
            "0x33",
            "request",
            "-X",
            "post",
            "-H",
            "Content-Type: application/json",
            "-d",
            "{}",
            "http://a.test/api",
        ])
        .unwrap();
        assert!(cli.binary);
        assert_eq!(cli.key, Some(0x33));
        match cli.command {
            Commands::Request { method, headers, data, .. } => {
                assert_eq!(method, "post");
                assert_eq!(headers.len(), 1);
                assert_eq!(data.as_deref(), Some("{}"));
            }
            _ => panic!("expected request"),
        }
    }
}
