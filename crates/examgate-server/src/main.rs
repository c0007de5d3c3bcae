use std::env;

use anyhow::Context;
use examgate_config::{AppConfig, load_config};
use examgate_server::{Services, init_tracing};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From EXAMGATE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (examgate.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (EXAMGATE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    // The subscriber's format comes from the config, so load errors go to stderr
    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&cfg.logging);
    tracing::info!(
        path = %config_path,
        source = %source,
        format = ?cfg.logging.format,
        "Configuration loaded"
    );
    examgate_server::prometheus::init_metrics();

    if let Err(err) = run(cfg).await {
        tracing::error!("Server error: {err:#}");
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let addr = cfg.addr();
    let services = Services::init(&cfg)
        .await
        .context("service initialization failed")?;
    examgate_server::server::run(services, addr).await?;
    Ok(())
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: EXAMGATE_CONFIG
/// 3. Default: examgate.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("EXAMGATE_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    (
        examgate_config::loader::DEFAULT_CONFIG_FILE.to_string(),
        ConfigSource::Default,
    )
}
