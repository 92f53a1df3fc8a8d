use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::SignalKind;

mod broker_factory;
mod config;

use broker_factory::LiveBrokerFactory;
use config::AgentSettings;
use manager::{AccountStore, InMemoryAccountStore, Manager};
use news_blackout::{EmptyCalendarFeed, NewsBlackoutOracle};
use notification::{Broadcaster, DiscordSink, LoggingSink, NotificationSink};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = AgentSettings::from_env();
    if settings.json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("starting trading orchestrator");

    let accounts = config::load_accounts(&settings)?;
    tracing::info!(count = accounts.len(), "accounts loaded");

    let store = Arc::new(InMemoryAccountStore::new());
    for account in accounts {
        tracing::info!(account_id = %account.id, broker_type = %account.broker_type, enabled = account.enabled, "registering account");
        store.insert(account);
    }

    let notifications: Arc<dyn NotificationSink> = Arc::new(Broadcaster::new(vec![
        Arc::new(LoggingSink),
        Arc::new(DiscordSink::new(settings.discord_webhook_url.clone())),
    ]));

    let oracle: Arc<dyn ai_oracle::AiOracle> = Arc::new(ai_oracle::MockOracle::new(vec!["mock".to_string()]));
    let news = Arc::new(NewsBlackoutOracle::new(Box::new(EmptyCalendarFeed)));

    let manager = Arc::new(Manager::new(
        store.clone(),
        Arc::new(LiveBrokerFactory),
        oracle,
        news,
        notifications,
    ));

    // Startup connectivity check: touch every account's broker before handing
    // control to the scheduler so a bad credential surfaces immediately
    // instead of silently failing the bot's first tick.
    for account in store.load_accounts().await?.into_iter().filter(|a| a.enabled) {
        match manager.account_info(&account.id).await {
            Ok(info) => tracing::info!(
                account_id = %account.id,
                balance = %info.balance,
                currency = %info.currency,
                "broker connectivity check passed"
            ),
            Err(err) => tracing::warn!(account_id = %account.id, %err, "broker connectivity check failed"),
        }
    }

    let result = manager.start_all_enabled().await;
    tracing::info!(started = ?result.succeeded, "accounts started");
    for (account_id, reason) in &result.failed {
        tracing::error!(account_id = %account_id, %reason, "account failed to start");
    }

    tracing::info!("orchestrator running, press Ctrl+C to stop");

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
    }

    tracing::info!("shutting down, stopping every running bot");
    let stop_result = manager.stop_all().await;
    tracing::info!(stopped = ?stop_result.succeeded, "accounts stopped");
    for (account_id, reason) in &stop_result.failed {
        tracing::error!(account_id = %account_id, %reason, "account failed to stop cleanly");
    }

    Ok(())
}
