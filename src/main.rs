use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use propdesk::api::{build_router, AppState};
use propdesk::application::locks::ChallengeLocks;
use propdesk::application::price_feed::{PriceFeed, PriceFeedRunner};
use propdesk::application::push::PushHub;
use propdesk::application::risk_evaluator::RiskEvaluator;
use propdesk::config::Settings;
use propdesk::infrastructure::exchange::ExchangeRestClient;
use propdesk::persistence::init_database;

const PUSH_BUFFER_CAPACITY: usize = 256;
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "propdesk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("propdesk engine starting...");

    let settings = Arc::new(Settings::from_env());
    let pool = init_database(&settings.db_url).await?;

    let feed = Arc::new(PriceFeed::new(
        settings.symbols.clone(),
        settings.price_stale_after(),
    ));
    let push = Arc::new(PushHub::new(PUSH_BUFFER_CAPACITY));
    let locks = Arc::new(ChallengeLocks::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Long-lived feed tasks: REST seeder + stream consumer.
    let runner = PriceFeedRunner::new(
        feed.clone(),
        ExchangeRestClient::new(&settings.exchange_rest_url),
        settings.exchange_stream_url.clone(),
    );
    let feed_task = tokio::spawn(runner.run(shutdown_rx.clone()));

    let state = AppState::new(
        settings.clone(),
        pool.clone(),
        feed.clone(),
        push.clone(),
        locks.clone(),
    );

    let evaluator = Arc::new(RiskEvaluator::new(
        pool,
        &settings,
        state.trades.clone(),
        locks,
        feed,
        push,
    ));
    let evaluator_task = tokio::spawn(evaluator.run(shutdown_rx));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("listening on {}", settings.bind_addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received Ctrl+C"),
                Err(e) => error!("failed to install Ctrl+C handler: {e}"),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("received SIGTERM");
                }
                Err(e) => error!("failed to install SIGTERM handler: {e}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("server stopped, draining background tasks...");
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = feed_task.await;
        let _ = evaluator_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        error!("background tasks did not drain within {SHUTDOWN_DRAIN:?}");
    }

    info!("shutdown complete");
    Ok(())
}
