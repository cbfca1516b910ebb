mod api;
mod bootstrap;
mod coins;
mod config;
mod error;
mod escrow;
mod events;
mod notify;
mod server;
mod settlement;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,escrow_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting Escrow Settlement Backend");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let (state, scheduler) = bootstrap::initialize_app(&config).await?;

    // Settlement runs in the background for the lifetime of the server
    scheduler.start();

    let app = server::create_app(state).await;
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
