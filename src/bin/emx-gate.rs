//! emx-gate binary
//!
//! Multi-tenant OpenAI-compatible gateway in front of OpenAI, Anthropic,
//! Azure OpenAI and Gemini.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emx_gate::gate::{start_server, GatewayConfig, LogFormat};
use emx_gate::keys::parse_legacy_keys;
use emx_gate::{
    AllowedModels, CredentialStore, Error, KeyLog, ProbeResult, Prober, ProviderDocument,
    ProviderRegistry,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// emx-gate: multi-tenant LLM gateway
#[derive(Parser, Debug)]
#[command(name = "emx-gate", version)]
#[command(about = "Multi-tenant OpenAI-compatible LLM gateway", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host to listen on
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Directory holding the key log and provider document
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway (default)
    Serve,

    /// Manage gateway API keys
    Keys {
        #[command(subcommand)]
        action: KeysCommand,
    },

    /// Inspect the provider document
    Providers {
        #[command(subcommand)]
        action: ProvidersCommand,
    },

    /// Send a test request to one or all configured models
    Probe {
        /// Model to probe; every model when omitted
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Issue a key for an instance
    Create {
        /// Instance name
        instance: String,

        /// Comma-separated model allow-list, or "all"
        #[arg(long, default_value = "all")]
        models: String,
    },

    /// List issued keys
    List,

    /// Revoke a key
    Revoke {
        key: String,
    },

    /// Import keys from a legacy JSON key file
    Import {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ProvidersCommand {
    /// List configured models
    List,

    /// Validate the provider document
    Check,
}

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match format {
        LogFormat::Text => fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI arguments
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let command = cli.command.unwrap_or(Command::Serve);
    let default_level = if matches!(command, Command::Serve) { "info" } else { "warn" };
    init_tracing(config.log_format, default_level);

    match command {
        Command::Serve => start_server(config).await,
        Command::Keys { action } => run_keys(&config, action),
        Command::Providers { action } => run_providers(&config, action),
        Command::Probe { model } => run_probe(&config, model.as_deref()).await,
    }
}

fn open_keys(config: &GatewayConfig) -> Result<CredentialStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    CredentialStore::open(KeyLog::new(config.keys_path()))
        .with_context(|| format!("failed to open key log {}", config.keys_path().display()))
}

fn run_keys(config: &GatewayConfig, action: KeysCommand) -> Result<()> {
    let store = open_keys(config)?;
    match action {
        KeysCommand::Create { instance, models } => {
            let record = store.issue(&instance, AllowedModels::parse(&models))?;
            println!("{}", record.key);
        }
        KeysCommand::List => {
            if store.is_empty() {
                println!("No API keys issued");
            }
            for record in store.list() {
                let models: Vec<String> = record.allowed_models.into();
                println!(
                    "{}  {}  [{}]  {}  {}",
                    record.key,
                    record.instance_name,
                    models.join(","),
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.description.as_deref().unwrap_or("")
                );
            }
        }
        KeysCommand::Revoke { key } => {
            store.revoke(&key)?;
            println!("Revoked");
        }
        KeysCommand::Import { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let records = parse_legacy_keys(&text).context("invalid legacy key file")?;
            let (mut imported, mut skipped) = (0, 0);
            for record in records {
                match store.import(record) {
                    Ok(()) => imported += 1,
                    Err(Error::DuplicateKey) => skipped += 1,
                    Err(e) => return Err(e.into()),
                }
            }
            println!("Imported {} key(s), skipped {} already present", imported, skipped);
        }
    }
    Ok(())
}

fn run_providers(config: &GatewayConfig, action: ProvidersCommand) -> Result<()> {
    let path = config.providers_path();
    let document = match ProviderDocument::load(&path)? {
        Some(document) => document,
        None => {
            println!("No provider document at {}; using environment credentials", path.display());
            ProviderDocument::from_env()
        }
    };

    match action {
        ProvidersCommand::List => {
            for model in &document.models {
                println!(
                    "{:<24} {:<10} {}",
                    model.model_name,
                    model.provider_type.config_key(),
                    model.api_base()
                );
            }
        }
        ProvidersCommand::Check => {
            let count = document.models.len();
            ProviderRegistry::new()
                .reload(document.models)
                .context("provider document is invalid")?;
            println!("✓ {} model(s) valid", count);
        }
    }
    Ok(())
}

async fn run_probe(config: &GatewayConfig, model: Option<&str>) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let registry = ProviderRegistry::open(config.providers_path(), ProviderDocument::from_env)?;
    let prober = Prober::new(config.probe_timeout())?;

    let results = match model {
        Some(model) => vec![prober.probe_model(&registry, model).await?],
        None => prober.probe_all(&registry).await,
    };

    if results.is_empty() {
        println!("No models configured");
        return Ok(());
    }
    for result in &results {
        print_probe(result);
    }

    let failed = results.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} model(s) failed", failed, results.len());
    }
    Ok(())
}

fn print_probe(result: &ProbeResult) {
    let mark = if result.is_ok() { "✓" } else { "✗" };
    println!(
        "{} {:<24} {:<18} {:>6}ms  {}",
        mark,
        result.model,
        result.status.to_string(),
        result.latency_ms,
        result.raw_message.replace('\n', " ")
    );
}
