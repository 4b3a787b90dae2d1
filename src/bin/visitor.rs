//! STCP visitor endpoint
//!
//! Binds the configured local listener, relays every accepted connection
//! through the rendezvous server, and keeps running until interrupted.
//! Each session opens its own control stream to the server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::io;
use std::sync::Arc;
use stcp_visitor::tunnel::{ControlHandle, ControlStream};
use stcp_visitor::{Config, Visitor};
use tokio::net::TcpStream;
use tracing::info;

/// STCP visitor - expose a secret-TCP service to local clients
#[derive(Parser, Debug)]
#[command(name = "stcp-visitor")]
#[command(about = "Local proxy endpoint for a secret-TCP relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "visitor.toml")]
    config: String,

    /// Rendezvous server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Per-session TCP dial to the rendezvous server.
struct TcpControlHandle {
    server_addr: String,
    run_id: String,
}

#[async_trait]
impl ControlHandle for TcpControlHandle {
    async fn connect_server(&self) -> io::Result<ControlStream> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();
        Ok(ControlStream {
            io: Box::new(stream),
            local_addr,
        })
    }

    fn run_id(&self) -> String {
        self.run_id.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    config.visitor.complete();

    let level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(level).init();

    if let Some(server) = args.server {
        config.server_addr = server;
    }
    let run_id = config
        .run_id
        .clone()
        .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()));

    info!("stcp-visitor v{}", stcp_visitor::VERSION);
    info!("rendezvous server: {}", config.server_addr);
    info!("target proxy: {}", config.visitor.server_name);

    let handle = Arc::new(TcpControlHandle {
        server_addr: config.server_addr.clone(),
        run_id,
    });

    let visitor = Visitor::new(config.visitor, handle).context("Invalid visitor configuration")?;
    let running = visitor.run().await.context("Failed to start visitor")?;

    if let Some(addr) = running.bind_addr() {
        info!("accepting clients on {addr}");
    } else {
        info!("no external listener; internal connections only");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    running.close();

    Ok(())
}
