use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use rowboat_server::{
    app,
    auth::SharedSecretVerifier,
    config::Config,
    store::MemoryStore,
    AppState,
};

#[derive(Parser, Debug)]
#[command(name = "rowboat-server")]
#[command(about = "Rowboat document synchronization server")]
struct Cli {
    /// Override the listen port from the environment.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let port = config.port;
    info!("Starting Rowboat sync server on port {}", port);

    let store = Arc::new(MemoryStore::new());
    let verifier = Arc::new(SharedSecretVerifier::new(&config.shared_secret));
    let state = Arc::new(AppState::new(config, store, verifier));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
