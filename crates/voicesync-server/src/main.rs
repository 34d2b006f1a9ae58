//! Signaling server binary.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voicesync_server::SignalingServer;

#[derive(Parser)]
#[command(name = "voicesync-server", about = "VoiceSync signaling server")]
struct Args {
    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 3000)]
    port: u16,

    /// Address to bind.
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "signaling server listening");

    if let Err(err) = SignalingServer::new().serve(listener).await {
        error!(%err, "server error");
        std::process::exit(1);
    }
}
