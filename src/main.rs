use anyhow::{Context, Result};
use clap::Parser;

use dmsrs::cli::Cli;
use dmsrs::config::Config;
use dmsrs::service::Dms;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        print!("{}", Config::generate_sample());
        return Ok(());
    }

    cli.validate()?;
    let mut config = Config::load(&cli.config_path)
        .with_context(|| format!("loading {}", cli.config_path.display()))?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    if let Some(level) = cli.effective_log_level() {
        config.logging.level = level.to_string();
    }
    if let Some(addr) = &cli.listen_addr {
        config.application.listen_addr = addr.clone();
    }

    let _log_guard = dmsrs::logging::init_tracing(&config.logging)?;
    tracing::info!(version = dmsrs::APPLICATION_VERSION, "starting dmsrs");

    let dms = Dms::new(&config)?;

    if cli.init_db {
        // Opening the control plane already ran the schema
        tracing::info!(url = %config.database.url, "database schema initialized");
        return Ok(());
    }

    if let Some(username) = &cli.bootstrap_admin {
        let credential = std::env::var("DMS_BOOTSTRAP_CREDENTIAL")
            .context("DMS_BOOTSTRAP_CREDENTIAL must be set for --bootstrap-admin")?;
        let admin = dms.principals.bootstrap_admin(username, &credential)?;
        tracing::info!(username = %admin.username, "bootstrapped admin principal");
        return Ok(());
    }

    if cli.sweep_locks {
        let swept = dms.locks.sweep_expired()?;
        tracing::info!(swept, "expired edit locks deleted");
        return Ok(());
    }

    let addr: std::net::SocketAddr = config
        .application
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.application.listen_addr))?;
    tracing::info!(%addr, "serving HTTP surface");

    axum::Server::bind(&addr)
        .serve(dmsrs::api::router(dms).into_make_service())
        .await
        .context("HTTP server failed")?;

    Ok(())
}
