// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use braid_bash::BashManager;
use braid_config::ConfigManager;
use braid_core::tools::ToolRegistry;
use braid_core::{AgentLibrary, AppContext, AskRegistry, StreamCoordinator};
use braid_events::Broker;
use braid_model::ProviderRegistry;
use braid_store::{MemoryStore, SqliteStore, Store};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .context("no config directory on this platform")?
            .join("braid"),
    };
    let registry = ProviderRegistry::standard();
    let config = Arc::new(ConfigManager::open(&config_dir, registry)?);

    match cli.command {
        Commands::Serve {
            addr,
            data_dir,
            ephemeral,
        } => {
            let store = open_store(data_dir, ephemeral)?;
            let broker = Broker::new(store.events.clone());
            let app = AppContext {
                store,
                broker: broker.clone(),
                bash: BashManager::new(broker),
                config,
                tools: ToolRegistry::standard(),
                agents: Arc::new(AgentLibrary::new()),
                asks: Arc::new(AskRegistry::new()),
                streams: Arc::new(StreamCoordinator::new()),
            };
            app.broker
                .publish(
                    braid_events::channels::APP,
                    "app-started",
                    serde_json::json!({ "addr": addr.to_string() }),
                )
                .await?;
            let router = braid_api::build_router(app);
            braid_server::serve(addr, router).await
        }
        Commands::CheckConfig => {
            let sanitized = config.sanitized();
            println!("{}", serde_json::to_string_pretty(&sanitized)?);
            Ok(())
        }
        Commands::ListProviders => {
            for provider in config.registry().list() {
                let resolved = config.resolved_provider_config(provider.id());
                let configured = if provider.is_configured(&resolved) {
                    "configured"
                } else {
                    "not configured"
                };
                println!(
                    "{:<12} {:<20} [{configured}] {}",
                    provider.id(),
                    provider.name(),
                    provider.description()
                );
            }
            Ok(())
        }
    }
}

fn open_store(data_dir: Option<PathBuf>, ephemeral: bool) -> anyhow::Result<Store> {
    if ephemeral {
        return Ok(MemoryStore::new().into_store());
    }
    let dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("no data directory on this platform")?
            .join("braid"),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let store = SqliteStore::open(dir.join("braid.db"))?;
    Ok(store.into_store())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
