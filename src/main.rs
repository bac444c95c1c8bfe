mod cli;

use linkmirror::{config, maintenance, service::Service};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from --verbose.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "linkmirror=trace,lm_db=debug,lm_core=debug,tower_http=debug".to_string()
        } else {
            "linkmirror=info,lm_db=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { port, no_server } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_service(cli.config.as_deref(), port, no_server))
        }
        Commands::Sync { json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(sync_once(cli.config.as_deref(), json))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Backup => backup(cli.config.as_deref()),
        Commands::Snapshot => snapshot(cli.config.as_deref()),
        Commands::Version => {
            println!("linkmirror {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_service(config_path: Option<&Path>, port: Option<u16>, no_server: bool) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if no_server {
        config.server.enabled = false;
    }

    tracing::info!(
        source = %config.source.root.display(),
        target = %config.target.base.display(),
        "Starting linkmirror"
    );

    let resolved = config::locate_config(config_path);
    let service = Service::build(config, resolved)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        linkmirror::server::shutdown_signal().await;
        signal_cancel.cancel();
    });

    service.run(cancel).await
}

async fn sync_once(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let service = Service::build(config, None)?;
    let report = service.run_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Operations planned: {}", report.operations);
        println!("Applied: {}", report.queue.applied);
        println!("Retried: {}", report.queue.retried);
        println!("Dead-lettered: {}", report.queue.dead_lettered);
        println!("Sections refreshed: {}", report.notifications.sections.len());
        if !report.notifications.failed.is_empty() {
            println!("Sections failed: {}", report.notifications.failed.join(", "));
        }
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let Some(path) = config::locate_config(path) else {
        anyhow::bail!("No config file found (searched {})", config::DEFAULT_CONFIG_PATHS.join(", "));
    };

    println!("Validating config: {}", path.display());
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let (config, warnings) = config::parse_config(&contents)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    println!("✓ Configuration is valid");
    println!("  Source: {}", config.source.root.display());
    println!("  Target: {}", config.target.base.display());
    println!("  Watch enabled: {}", config.watch.enabled);
    println!("  Remote polling: {}", config.remote.enabled);
    println!("  Notifications: {}", config.notify.enabled);
    println!("  Workers: {}", config.queue.max_workers);
    for warning in warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn backup(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let db = linkmirror::service::open_database(&config)?;
    let path = maintenance::backup_database(&db, &config).context("Backup failed")?;
    println!("{}", path.display());
    Ok(())
}

fn snapshot(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let db = linkmirror::service::open_database(&config)?;
    let path = maintenance::write_snapshot(&db, &config).context("Snapshot failed")?;
    println!("{}", path.display());
    Ok(())
}
