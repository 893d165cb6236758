mod analytics;
mod bot;
mod candles;
mod error;
mod exchange;
mod find_tickers;
mod funding;
mod indicators;
mod klines;
mod report;
mod scheduler;
mod storage_utils;
mod worker;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bot::{Bot, BotSettings, ConsoleSink, ConversationKey, Dispatcher, MessageSink};
use crate::exchange::{BybitClient, MarketData};
use crate::funding::FundingMonitor;
use crate::scheduler::{ScanScheduler, ScanSettings};
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use crate::worker::WorkerPool;

fn init_tracing() {
    // keep HTTP client chatter out of the console
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // Step 1: Configuration
    let storage = AsyncStorageManager::new_relative("storage").await?;
    let config = AppConfig::load(&storage).await?;
    info!(
        scan_interval_secs = config.scan.interval_secs,
        funding_threshold = config.scan.funding_threshold,
        workers = config.worker_pool_size,
        "configuration loaded"
    );

    // Step 2: Collaborators
    let market: Arc<dyn MarketData> = Arc::new(BybitClient::new(
        config.exchange.base_url.clone(),
        config.klines.limit,
    )?);
    let sink: Arc<dyn MessageSink> = Arc::new(ConsoleSink);
    let pool = WorkerPool::new(config.worker_pool_size);

    // Step 3: Background scanning, optional
    let scheduler = match ScanScheduler::new(
        pool.clone(),
        Arc::new(FundingMonitor::new(market.clone())),
        sink.clone(),
        ScanSettings {
            first_delay: config.first_delay(),
            threshold: config.scan.funding_threshold,
        },
    ) {
        Ok(scheduler) => Some(Arc::new(scheduler)),
        Err(e) => {
            warn!(error = %e, "background scanning disabled");
            None
        }
    };

    let bot = Arc::new(Bot::new(
        market,
        scheduler.clone(),
        sink,
        pool,
        BotSettings {
            default_scan_interval: config.scan_interval(),
            quote_asset: config.exchange.quote_asset.clone(),
            kline_interval: config.klines.interval.clone(),
            top_funding_count: config.scan.top_funding_count,
        },
    ));

    // Step 4: Dispatch loop, requests of one conversation stay in order
    let key = ConversationKey(config.console_chat_id);
    let mut dispatcher = Dispatcher::new(bot);
    println!("Volatility Bot ready. Type a ticker (e.g. PEPE) or /help, Ctrl-D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        dispatcher.submit(key, line).await;
    }
    dispatcher.shutdown().await;

    let jobs = scheduler.as_ref().map_or(0, |s| s.job_count());
    info!(jobs, "input closed, shutting down");
    Ok(())
}
