use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use prize_payout::api::{self, AppState};
use prize_payout::clock::{Clock, SystemClock};
use prize_payout::config::AppConfig;
use prize_payout::logging::init_tracing;
use prize_payout::payouts::{MemoryLedger, PayoutLedger, PayoutStateMachine};
use prize_payout::providers::{AmountLimits, PayoutGateway, SimulatedGateway, WeChatPayGateway};
use prize_payout::queue::{JobQueue, MemoryQueue};
use prize_payout::services::{InitiatorConfig, PayoutInitiator, WebhookReconciler};
use prize_payout::workers::{
    PayoutProcessor, PayoutProcessorConfig, RetryPolicy, RetryScheduler, RetrySchedulerConfig,
};

const QUEUE_KEY: &str = "prize_payout:jobs";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(
        bind = %config.bind_address(),
        max_attempts = config.payout.max_attempts,
        concurrency = config.payout.concurrency,
        "Starting prize payout service"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let ledger = build_ledger(&config).await?;
    let queue = build_queue(&config).await?;
    let gateway = build_gateway(&config, clock.clone())?;

    let machine = PayoutStateMachine::new(
        ledger,
        clock,
        RetryPolicy::from_settings(&config.payout),
    );

    let initiator = Arc::new(PayoutInitiator::new(
        machine.clone(),
        gateway.clone(),
        queue.clone(),
        InitiatorConfig::from(&config.payout),
    ));
    let reconciler = Arc::new(WebhookReconciler::new(machine.clone(), gateway.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = Arc::new(PayoutProcessor::new(
        machine.clone(),
        gateway.clone(),
        queue.clone(),
        PayoutProcessorConfig::from(&config.payout),
    ));
    let processor_handle = tokio::spawn(processor.run(shutdown_rx.clone()));

    let scheduler = RetryScheduler::new(
        machine,
        gateway,
        queue,
        RetrySchedulerConfig::from(&config.payout),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let app = api::router(AppState {
        initiator,
        reconciler,
    });
    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped, shutting down workers");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(processor_handle, scheduler_handle);

    info!("Prize payout service stopped");
    Ok(())
}

async fn build_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn PayoutLedger>> {
    #[cfg(feature = "database")]
    if let Some(url) = &config.database_url {
        let pool = prize_payout::payouts::postgres::init_pool(url, 10)
            .await
            .context("failed to connect to PostgreSQL")?;
        info!("Using PostgreSQL payout ledger");
        return Ok(Arc::new(prize_payout::payouts::postgres::PgPayoutLedger::new(pool)));
    }

    let _ = config;
    warn!("No database configured, using in-memory ledger (development only)");
    Ok(Arc::new(MemoryLedger::new()))
}

async fn build_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    #[cfg(feature = "cache")]
    if let Some(url) = &config.redis_url {
        let queue = prize_payout::queue::redis::RedisQueue::connect(url, QUEUE_KEY)
            .await
            .context("failed to connect to Redis")?;
        return Ok(Arc::new(queue));
    }

    let _ = config;
    warn!(queue_key = QUEUE_KEY, "No Redis configured, using in-memory queue (development only)");
    Ok(Arc::new(MemoryQueue::new()))
}

fn build_gateway(config: &AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn PayoutGateway>> {
    let limits = AmountLimits::new(
        config.payout.min_amount.clone(),
        config.payout.max_amount.clone(),
    );

    if config.provider.dev_mode {
        warn!("Provider dev mode enabled, transfers are simulated");
        return Ok(Arc::new(SimulatedGateway::new(limits)));
    }

    let gateway = WeChatPayGateway::new(
        &config.provider,
        limits,
        clock,
        config.payout.job_timeout(),
    )
    .context("failed to initialise payment provider")?;
    Ok(Arc::new(gateway))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
