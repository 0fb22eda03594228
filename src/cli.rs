// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// braid — server-side runtime core for AI coding assistants.
#[derive(Parser, Debug)]
#[command(name = "braid", version, about)]
pub struct Cli {
    /// Directory holding config.yaml and credentials.yaml.
    /// Defaults to ~/.config/braid.
    #[arg(long, short = 'c', global = true)]
    pub config_dir: Option<PathBuf>,

    /// Verbose logging to stderr (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the braid server (HTTP + SSE + WebSocket).
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:4180")]
        addr: SocketAddr,

        /// Directory for the SQLite database and blobs.
        /// Defaults to ~/.local/share/braid.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep everything in memory; nothing touches disk.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Validate the configuration and print the sanitized result.
    CheckConfig,

    /// List the registered model providers.
    ListProviders,
}
