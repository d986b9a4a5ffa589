//! Token Bridge
//!
//! Exchanges identity tokens issued by trusted external OIDC providers for
//! tokens signed by this service, and publishes the key set relying parties
//! use to verify them.

mod cache;
mod config;
mod error;
mod exchange;
mod oidc;
mod publish;
mod retry;
mod signer;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::BridgeConfig;
use exchange::{parse_exchange_request, ExchangeService, TokenIssuer};
use oidc::{TokenVerifier, TrustAnchorResolver};
use publish::KeySetPublisher;
use signer::KeySigner;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "token-bridge")]
#[command(about = "OIDC token bridge: exchange trusted identity tokens for service-signed tokens")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short, default_value = "/etc/token-bridge/config.json", env = "TOKEN_BRIDGE_CONFIG")]
    config: PathBuf,

    /// This service's issuer URL (overrides `issuer`)
    #[arg(long, env = "TOKEN_BRIDGE_ISSUER")]
    issuer: Option<String>,

    /// Signing key id (overrides `signing.key_id`)
    #[arg(long, env = "TOKEN_BRIDGE_KEY_ID")]
    key_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, env = "TOKEN_BRIDGE_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange one request body (stdin by default) and print the response
    Exchange {
        /// Read the request body from this file
        #[arg(long)]
        request: Option<PathBuf>,

        /// Content type of the request body
        #[arg(long)]
        content_type: Option<String>,

        /// The body is base64-encoded
        #[arg(long)]
        base64: bool,
    },

    /// Print the published key set
    Jwks,

    /// Print the discovery document for a base URL
    Discovery {
        #[arg(long)]
        base_url: String,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

impl Args {
    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(issuer) = &self.issuer {
            config.issuer = issuer.clone();
        }
        if let Some(key_id) = &self.key_id {
            config.signing.key_id = key_id.clone();
        }
    }
}

/// The wired exchange engine.
struct Bridge {
    exchange: ExchangeService,
    publisher: KeySetPublisher,
}

impl Bridge {
    fn from_config(config: &BridgeConfig) -> Result<Self> {
        let resolver = TrustAnchorResolver::new(&config.trust, &config.trust_anchor)
            .context("Failed to build trust anchor resolver")?;
        let verifier = TokenVerifier::new(Arc::new(resolver), config.exchange.clock_skew_secs);

        let signer = Arc::new(
            KeySigner::from_config(&config.signing).map_err(|e| anyhow!("Failed to build signer: {}", e))?,
        );

        Ok(Self {
            exchange: ExchangeService::new(
                &config.issuer,
                config.exchange.clone(),
                config.trust.clone(),
                verifier,
                TokenIssuer::new(signer.clone()),
            ),
            publisher: KeySetPublisher::new(signer, &config.key_set, config.signing.public_key_budget()),
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to encode output")?);
    Ok(())
}

fn read_body(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display())),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("Failed to read request from stdin")?;
            Ok(body)
        }
    }
}

/// Print the exchange response or error body. Returns whether it succeeded.
async fn run_exchange(bridge: &Bridge, body: &str, content_type: Option<&str>, is_base64: bool) -> Result<bool> {
    let result = match parse_exchange_request(content_type, body, is_base64) {
        Ok(request) => bridge.exchange.exchange(request).await,
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "Rejected exchange request body");
            Err(e)
        }
    };

    match result {
        Ok(response) => {
            print_json(&response)?;
            Ok(true)
        }
        Err(e) => {
            print_json(&e.to_response())?;
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing; stdout carries command output.
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let mut config = BridgeConfig::load(&args.config)?;
    args.apply_overrides(&mut config);
    config.check()?;

    info!(
        issuer = %config.issuer,
        trusted_issuers = config.trust.len(),
        key_id = %config.signing.key_id,
        "Configuration loaded"
    );

    if let Command::CheckConfig = args.command {
        println!("configuration OK");
        return Ok(ExitCode::SUCCESS);
    }

    let bridge = Bridge::from_config(&config)?;

    match &args.command {
        Command::Exchange {
            request,
            content_type,
            base64,
        } => {
            let body = read_body(request.as_ref())?;
            let ok = run_exchange(&bridge, &body, content_type.as_deref(), *base64).await?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Jwks => {
            let jwks = bridge.publisher.publish().await.context("Failed to publish key set")?;
            print_json(&*jwks)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Discovery { base_url } => {
            let document = bridge
                .publisher
                .discovery(base_url)
                .await
                .context("Failed to render discovery document")?;
            print_json(&document)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => Ok(ExitCode::SUCCESS),
    }
}
