// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Group Communication Server
//!
//! # Usage
//!
//! ```bash
//! # Start server on default port (8888)
//! hdds-groupcomm
//!
//! # Custom port and config
//! hdds-groupcomm --port 9000 --config groupcomm.json
//!
//! # Aggressive failure detection
//! hdds-groupcomm --ping-interval 2 --timeout 5
//! ```
//!
//! Command-line values override the configuration file.

use clap::Parser;
use hdds_groupcomm::{GroupServer, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HDDS Group Communication Server - membership, coordinator election and messaging
#[derive(Parser, Debug)]
#[command(name = "hdds-groupcomm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on [default: 8888]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between heartbeat pings [default: 20]
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Seconds of silence before a member is removed [default: 40]
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum number of group members [default: 1000]
    #[arg(long)]
    max_members: Option<usize>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = if let Some(ref config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(config_path)?
    } else {
        ServerConfig::default()
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ping_interval) = args.ping_interval {
        config.ping_interval_secs = ping_interval;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(max_members) = args.max_members {
        config.max_members = max_members;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = build_config(&args)?;
    let addr = SocketAddr::new(config.bind_address, config.port);

    info!("+----------------------------------------------------+");
    info!(
        "|       HDDS Group Server v{}                    |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:40} |", addr);
    info!(
        "|  Ping:    {:40} |",
        format!("every {}s", config.ping_interval_secs)
    );
    info!("|  Timeout: {:40} |", format!("{}s", config.timeout_secs));
    info!("|  Members: {:40} |", format!("max {}", config.max_members));
    info!("+----------------------------------------------------+");

    // Create and run server
    let server = GroupServer::new(config).await?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Group server stopped");
    Ok(())
}
