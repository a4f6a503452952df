//! meteod — the meteogrid database daemon.
//!
//! Loads `meteogrid.toml`, applies environment overrides, builds one
//! connection pool per configured database and serves the operator API
//! until Ctrl-C. On shutdown every pool is closed exactly once.
//!
//! # Usage
//!
//! ```text
//! meteod serve --config meteogrid.toml --bind 0.0.0.0:8085
//! meteod check --config meteogrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meteo_core::MeteoConfig;
use meteo_pool::{ConnectionFactory, MySqlBackend, MySqlFactory, PoolRegistry};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meteod", about = "meteogrid database daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the database pools and serve the operator API.
    Serve {
        /// Path to meteogrid.toml.
        #[arg(long, default_value = "meteogrid.toml")]
        config: PathBuf,

        /// Listen address, overriding `[server] bind`.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Open every pool once, print connection statistics as JSON, and exit.
    Check {
        /// Path to meteogrid.toml.
        #[arg(long, default_value = "meteogrid.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meteod=debug,meteo_pool=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind } => run_serve(&config, bind).await,
        Command::Check { config } => run_check(&config).await,
    }
}

/// Read the config file, then let the process environment override it.
fn load_config(path: &Path) -> anyhow::Result<MeteoConfig> {
    let mut config = MeteoConfig::from_file(path)?;
    config.apply_process_env()?;
    config.validate()?;
    info!(
        path = %path.display(),
        databases = config.databases.len(),
        pooling = config.pooling.enabled,
        "configuration loaded"
    );
    Ok(config)
}

fn build_registry(config: &MeteoConfig) -> anyhow::Result<Arc<PoolRegistry<MySqlBackend>>> {
    let factory: Arc<dyn ConnectionFactory<MySqlBackend>> = Arc::new(MySqlFactory::new());
    let registry = PoolRegistry::from_config(config, factory).context("invalid database configuration")?;
    Ok(Arc::new(registry))
}

async fn run_serve(config_path: &Path, bind: Option<String>) -> anyhow::Result<()> {
    info!("meteogrid daemon starting");

    let config = load_config(config_path)?;
    let registry = build_registry(&config)?;
    registry.warm_up().await?;
    info!(pooling = registry.pooling_enabled(), "database registry ready");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background maintenance ─────────────────────────────────

    let interval = config.pooling.maintenance_interval_seconds;
    let maintenance = (registry.pooling_enabled() && interval > 0)
        .then(|| registry.spawn_maintenance(Duration::from_secs(interval), shutdown_rx));

    // ── Operator API ───────────────────────────────────────────

    let router = meteo_api::build_router(Arc::clone(&registry));
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server starting");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let served = server.await;

    if let Some(handle) = maintenance {
        let _ = handle.await;
    }
    registry.close_all().await;

    served?;
    info!("meteogrid daemon stopped");
    Ok(())
}

async fn run_check(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let registry = build_registry(&config)?;
    let warmed = registry.warm_up().await;

    let stats = registry.connection_stats();
    registry.close_all().await;
    warmed?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from(["meteod", "serve", "--config", "/etc/meteo.toml", "--bind", "127.0.0.1:9000"])
            .unwrap();
        match cli.command {
            Command::Serve { config, bind } => {
                assert_eq!(config, PathBuf::from("/etc/meteo.toml"));
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9000"));
            }
            Command::Check { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn cli_check_defaults_config_path() {
        let cli = Cli::try_parse_from(["meteod", "check"]).unwrap();
        assert!(matches!(cli.command, Command::Check { config } if config == Path::new("meteogrid.toml")));
    }

    #[test]
    fn load_config_rejects_missing_file() {
        let err = load_config(Path::new("/nonexistent/meteogrid.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn build_registry_from_file() {
        let file = write_config(
            r#"
            [pooling]
            min_connections = 0
            max_connections = 4

            [databases.local]
            host = "127.0.0.1"
            database = "meteo_local"

            [databases.global]
            host = "127.0.0.1"
            database = "meteo_global"
            "#,
        );
        let config = MeteoConfig::from_file(file.path()).unwrap();
        let registry = build_registry(&config).unwrap();
        assert!(registry.pooling_enabled());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["global", "local"]);
    }

    #[test]
    fn build_registry_rejects_zero_capacity() {
        let config = MeteoConfig::from_toml(
            r#"
            [databases.local]
            host = "127.0.0.1"
            database = "meteo_local"
            max_connections = 0
            min_connections = 0
            "#,
        )
        .unwrap();
        assert!(build_registry(&config).is_err());
    }

    #[tokio::test]
    async fn check_with_no_databases_prints_empty_stats() {
        let file = write_config("[pooling]\nenabled = true\n");
        run_check(file.path()).await.unwrap();
    }
}
