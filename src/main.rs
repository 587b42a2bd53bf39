//! rservlet: serve the servlets listed in a configuration file.
//!
//! ```text
//! rservlet --config rservlet.toml --listen 0.0.0.0:8080 --log-format json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rservlet::adapter::rhai::RhaiAdapter;
use rservlet::adapter::scheme::SchemeAdapter;
use rservlet::config::{Config, LogFormat};
use rservlet::{AdapterRegistry, MountTable, Server};

const DEFAULT_CONFIG: &str = "rservlet.toml";

#[derive(Parser)]
#[command(name = "rservlet", version, about = "Host for HTTP servlets in embedded guest languages")]
struct Cli {
    /// Configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `server.listen`.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Log output format, overriding `logging.format`.
    #[arg(long, value_enum)]
    log_format: Option<CliLogFormat>,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, config_found) = load_config(cli.config.as_ref())?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    config.validate()?;

    init_tracing(&config)?;
    if !config_found {
        warn!(path = DEFAULT_CONFIG, "no configuration file found, serving nothing");
    }

    let registry = adapters(&config);
    let mounts = mount_servlets(&config, &registry)?;

    let server = Server::bind(&config.server.listen)
        .await?
        .with_settings(config.server.settings());
    info!(address = %server.local_addr(), "rservlet ready");

    let served = server.run_until(mounts, shutdown_signal()).await;
    registry.shutdown();
    served?;
    Ok(())
}

/// Reads `path`, or the default file if it exists, or falls back to defaults.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, bool)> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            Ok((config, true))
        }
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                let config = Config::from_file(&default)
                    .with_context(|| format!("loading {DEFAULT_CONFIG}"))?;
                Ok((config, true))
            } else {
                Ok((Config::default(), false))
            }
        }
    }
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("invalid logging.level {:?}", config.logging.level))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn adapters(config: &Config) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(
        RhaiAdapter::new().with_max_operations(config.rhai.max_operations),
    ));
    registry.register(Arc::new(SchemeAdapter::new()));
    #[cfg(feature = "python")]
    registry.register(Arc::new(rservlet::adapter::python::PythonAdapter::new()));
    #[cfg(feature = "ruby")]
    registry.register(Arc::new(rservlet::adapter::ruby::RubyAdapter::new()));
    registry
}

fn mount_servlets(config: &Config, registry: &AdapterRegistry) -> anyhow::Result<MountTable> {
    let mut mounts = MountTable::new();
    for servlet in &config.servlets {
        mounts
            .mount(
                registry,
                &servlet.mount,
                &servlet.source,
                servlet.adapter.as_deref(),
            )
            .with_context(|| format!("mounting {}", servlet.mount))?;
    }
    Ok(mounts)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C"),
        Err(e) => {
            error!(error = %e, "cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
