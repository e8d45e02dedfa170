//! Reference gateway binary.

use clap::Parser;
use conclave::gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave-gateway", version, about = "Conclave relay gateway")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:8009")]
    listen: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.listen).await?;
    Gateway::new().serve(listener).await
}
