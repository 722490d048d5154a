//! Demo binding server with a static user table.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use gust::{init_logging, Server};

#[derive(Parser)]
#[command(name = "gust-server", version, about = "STUN binding server with long-term credentials")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8022)]
    port: u16,

    /// Authentication realm
    #[arg(long, default_value = "gust.example")]
    realm: String,

    /// Disable authentication (every binding request succeeds)
    #[arg(long)]
    open: bool,

    /// Log level (trace/debug/info/warn/error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let users: HashMap<String, String> = [
        ("user", "password"),
        ("user2", "password"),
        ("admin", "password"),
    ]
    .into_iter()
    .map(|(u, p)| (u.to_owned(), p.to_owned()))
    .collect();

    let (tx, mut rx) = mpsc::channel(10);
    let mut server = Server::new(args.realm, tx);
    if !args.open {
        server = server.with_authenticator(Arc::new(users));
    }

    // Drain completed connections; an application would promote these to
    // its own session logic.
    tokio::spawn(async move {
        while let Some(conn) = rx.recv().await {
            info!(peer = %conn.peer, authenticated = conn.authenticated, "connection completed");
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    Arc::new(server).serve(listener).await?;
    Ok(())
}
