use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod archive;
mod browser;
mod cli;
mod config;
mod error;
mod purge;
mod session;
mod telemetry;
mod vault;

use archive::ArchiveStore;
use browser::CdpDriver;
use cli::{Cli, Command};
use config::Config;
use purge::PurgeExecutor;
use session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let config = cli.apply(Config::load()?);
    config.validate()?;
    let config = Arc::new(config);

    match cli.command {
        Command::Optimize {
            auto,
            once,
            dry_run,
            visible,
            ..
        } => {
            let manager = SessionManager::new(Arc::new(CdpDriver::new()), Arc::clone(&config));
            let result = optimize(&manager, &config, auto && !once, dry_run, !visible).await;
            manager.stop().await;
            result
        }
        Command::Tabs { visible } => {
            let manager = SessionManager::new(Arc::new(CdpDriver::new()), Arc::clone(&config));
            let result = list_tabs(&manager, !visible).await;
            manager.stop().await;
            result
        }
        Command::Vault {
            mount,
            unmount,
            panic,
            ..
        } => {
            let vault = vault::platform_vault(&config);
            let ok = if panic {
                vault.panic()
            } else if mount {
                vault.mount(&config.vault_size, &config.vault_mount_point)
            } else if unmount {
                vault.unmount(&config.vault_mount_point)
            } else {
                false
            };
            if !ok {
                anyhow::bail!("vault operation failed");
            }
            Ok(())
        }
        Command::Panic => {
            panic_protocol(&config).await;
            Ok(())
        }
    }
}

async fn optimize(
    manager: &SessionManager,
    config: &Arc<Config>,
    continuous: bool,
    dry_run: bool,
    headless: bool,
) -> Result<()> {
    let session = tokio::select! {
        session = manager.start(headless) => session?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted while connecting");
            return Ok(());
        }
    };
    tracing::info!(state = ?manager.state().await, "optimizer ready");

    let archive = Arc::new(ArchiveStore::new(config.archive_dir.clone()));
    tracing::debug!(
        dir = %config.archive_dir.display(),
        batches = archive.load_index().await.len(),
        "archive opened"
    );
    let executor = PurgeExecutor::new(Arc::clone(config), archive);

    if !continuous {
        executor.scan(&session, dry_run).await?;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stopping after the current scan");
            trigger.cancel();
        }
    });

    purge::run_loop(&executor, &session, config.scan_interval(), dry_run, cancel).await;
    Ok(())
}

async fn list_tabs(manager: &SessionManager, headless: bool) -> Result<()> {
    let session = manager.start(headless).await?;
    for tab in session.open_tabs().await? {
        println!("{}\t{}", tab.title, tab.url);
    }
    Ok(())
}

/// Close every tab without archiving, then detach the vault. Never fails.
async fn panic_protocol(config: &Arc<Config>) {
    tracing::warn!("panic protocol initiated");

    let manager = SessionManager::new(Arc::new(CdpDriver::new()), Arc::clone(config));
    match manager.start(true).await {
        Ok(session) => match session.pages().await {
            Ok(pages) => {
                let timeout = config.page_timeout();
                let mut closed = 0;
                for page in pages {
                    match tokio::time::timeout(timeout, page.close()).await {
                        Ok(Ok(())) => closed += 1,
                        Ok(Err(e)) => tracing::warn!(url = %page.url(), error = %e, "could not close tab"),
                        Err(_) => tracing::warn!(url = %page.url(), "timed out closing tab"),
                    }
                }
                tracing::info!(closed, "tabs closed");
            }
            Err(e) => tracing::error!(error = %e, "could not enumerate tabs"),
        },
        Err(e) => tracing::error!(error = %e, "tab purge failed"),
    }
    manager.stop().await;

    if !vault::platform_vault(config).panic() {
        tracing::error!("vault detach failed");
    }
}
