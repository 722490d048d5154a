//! Demo binding client: one exchange, prints the reflexive address.

use anyhow::Result;
use clap::Parser;

use gust::{init_logging, Client, Credentials};

#[derive(Parser)]
#[command(name = "gust-client", version, about = "STUN binding client")]
struct Args {
    /// Server to query
    #[arg(long, default_value = "localhost:8022")]
    server: String,

    /// Username for long-term credentials
    #[arg(long)]
    username: Option<String>,

    /// Password for long-term credentials
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Log level (trace/debug/info/warn/error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut client = Client::new();
    if let (Some(username), Some(password)) = (args.username, args.password) {
        client = client.with_credentials(Credentials::new(username, password));
    }

    let mapped = client.connect_tcp(&args.server).await?;
    println!("{mapped}");
    Ok(())
}
