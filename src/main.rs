//! bank_ledger - Funds Transfer Backend API
//!
//! Moves money between accounts with double-entry bookkeeping. Every
//! transfer is one atomic unit of work over a PostgreSQL ledger, or an
//! in-memory ledger when no database is configured.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bank_ledger::api::{self, AppState};
use bank_ledger::domain::CreateAccountParams;
use bank_ledger::handlers::{ChannelNotifier, TransferNotification};
use bank_ledger::store::{LedgerTx, MemoryLedgerStore, PgLedgerStore, UnitOfWork};
use bank_ledger::{db, Config, TransferHandler};

/// Capacity of the transfer notification queue
const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bank_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    let addr: SocketAddr = config.bind_addr().parse()?;

    tracing::info!("Starting bank_ledger server");

    match config.database_url.clone() {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&database_url)
                .await?;

            db::verify_connection(&pool).await?;
            db::run_migrations(&pool).await?;

            // Verify database schema
            if !db::check_schema(&pool).await? {
                tracing::error!("Database schema is not complete. Please run migrations.");
                return Err(anyhow::anyhow!("Database schema incomplete"));
            }

            tracing::info!("Database connected successfully");

            let store = PgLedgerStore::new(pool.clone(), config.lock_timeout);
            serve(store, &config, addr).await?;

            // Cleanup
            pool.close().await;
            tracing::info!("Database connections closed. Goodbye!");
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory ledger (data is lost on exit)");

            let store = MemoryLedgerStore::with_lock_timeout(config.lock_timeout);
            seed_demo_accounts(&store).await?;
            serve(store, &config, addr).await?;
        }
    }

    Ok(())
}

/// Run the HTTP server until a shutdown signal arrives
async fn serve<S: UnitOfWork + 'static>(
    store: S,
    config: &Config,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let (notifier, notifications) = ChannelNotifier::new(NOTIFICATION_QUEUE_CAPACITY);
    let consumer = tokio::spawn(consume_notifications(notifications));

    let handler = TransferHandler::new(store)
        .with_max_attempts(config.transfer_max_attempts)
        .with_hook(Arc::new(notifier));
    let app = api::build_router(AppState::new(handler, config.transfer_timeout));

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutting down...");

    // The router held the last sender; the consumer drains and exits
    if let Err(e) = consumer.await {
        tracing::warn!("Notification consumer ended abnormally: {}", e);
    }

    Ok(())
}

/// Deliver transfer notifications. Delivery here is a structured log line.
async fn consume_notifications(mut notifications: mpsc::Receiver<TransferNotification>) {
    while let Some(notification) = notifications.recv().await {
        tracing::info!(
            transfer_id = notification.transfer_id,
            from_owner = %notification.from_owner,
            to_owner = %notification.to_owner,
            amount = notification.amount,
            currency = %notification.currency,
            correlation_id = ?notification.correlation_id,
            "Transfer notification"
        );
    }
}

/// Open two funded accounts so the in-memory server has something to move
async fn seed_demo_accounts(store: &MemoryLedgerStore) -> anyhow::Result<()> {
    let mut tx = store.begin().await?;
    for owner in ["alice", "bob"] {
        let account = tx
            .create_account(&CreateAccountParams::new(owner, 1_000, "USD"))
            .await?;
        tracing::info!(
            account_id = account.id,
            owner = %account.owner,
            balance = account.balance,
            "Demo account opened"
        );
    }
    tx.commit().await?;
    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
