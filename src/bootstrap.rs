use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::AppState,
    coins::{CoinRegistry, CoinRpcClient, CoinRpcConfig},
    config::Config,
    error::AppResult,
    escrow::EscrowRepository,
    events::{EscrowEvent, EventBus},
    notify::EmailNotifier,
    settlement::{Reconciler, ReconcilerConfig, SettlementConfig, SettlementScheduler},
};

pub async fn initialize_app(config: &Config) -> AppResult<(AppState, SettlementScheduler)> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let repository = Arc::new(EscrowRepository::new(pool));
    let ledgers = Arc::new(initialize_coin_registry(config)?);

    let notifier = Arc::new(EmailNotifier::new(
        config.resend_api_key.clone(),
        config.resend_from_email.clone(),
    ));

    let events = EventBus::default();
    spawn_audit_subscriber(&events);

    let reconciler = Arc::new(Reconciler::new(
        repository.clone(),
        repository.clone(),
        ledgers.clone(),
        notifier,
        events,
        ReconcilerConfig {
            settlement: SettlementConfig {
                commission_rate_percent: config.commission_rate_percent,
                expire_days: config.escrow_expire_days,
            },
            concurrency: config.reconciler_concurrency,
            time_budget: Duration::from_secs(config.reconciler_time_budget_seconds),
        },
    ));

    let scheduler = SettlementScheduler::new(
        reconciler,
        Duration::from_secs(config.tick_interval_seconds),
    );

    let state = AppState {
        repository,
        ledgers,
    };

    info!("✓ Application components initialized");
    Ok((state, scheduler))
}

fn initialize_coin_registry(config: &Config) -> AppResult<CoinRegistry> {
    let mut registry = CoinRegistry::new();

    for coin in crate::escrow::models::Coin::all() {
        let Some(node) = config.coin_node(coin) else {
            warn!("⚠️  No node configured for {} - escrows on it disabled", coin);
            continue;
        };

        let client = CoinRpcClient::new(
            coin,
            CoinRpcConfig {
                url: node.rpc_url.clone(),
                rpc_user: node.rpc_user.clone(),
                rpc_password: node.rpc_password.clone(),
                timeout: Duration::from_secs(config.rpc_timeout_seconds),
            },
        )?;

        registry.register(coin, Arc::new(client), node.min_confirmations);
        info!("✅ {} node registered", coin);
    }

    info!(
        "🔗 Coin registry initialized with: {:?}",
        registry.registered_coins()
    );
    Ok(registry)
}

/// Log every terminal transition the reconciler publishes
fn spawn_audit_subscriber(events: &EventBus) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            match event {
                EscrowEvent::Completed(id) => info!("Escrow {} completed", id),
                EscrowEvent::Failed(id) => warn!("Escrow {} failed", id),
            }
        }
    });
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database pool configured and migrations applied");
    Ok(pool)
}
