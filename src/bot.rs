//! Conversation front end: turns incoming text into commands, runs them and
//! replies through a [`MessageSink`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::analytics::compute_report;
use crate::exchange::MarketData;
use crate::funding::FundingMonitor;
use crate::report;
use crate::scheduler::ScanScheduler;
use crate::worker::WorkerPool;

static TICKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{1,20}$").expect("valid ticker regex"));

const WELCOME: &str = "👋 I am the Volatility Bot.\n\
Send me a ticker (e.g., PEPE) to analyze.\n\n\
Commands:\n\
/funding — top negative funding rates\n\
/frequency <min> — set background scan interval\n\
/help — list all commands";

const HELP: &str = "🤖 Volatility Bot — Available Commands\n\n\
/start — Initialize the bot and start background funding scan\n\
/funding — Fetch the most negative funding rates right now\n\
/frequency <min> — Change how often the background scan runs (e.g. /frequency 30 = every 30 min)\n\
/stop — Stop the background funding scan\n\
/help — Show this help message\n\n\
💬 Ticker analysis\n\
Send any coin name (e.g. BTC, PEPE) to receive a full volatility report \
with ATR, pump/dump extremes, and DCA levels.";

/// One week. Longer intervals are rejected before any arithmetic on them.
const MAX_FREQUENCY_MINUTES: u64 = 7 * 24 * 60;

const FREQUENCY_USAGE: &str =
    "⚠️ Usage: /frequency <minutes>\nExample: /frequency 30  →  scan every 30 minutes";

/// Identifies the chat a reply or scan report goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(pub i64);

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound delivery to a conversation. Called from worker tasks, must not
/// block the caller's runtime thread.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, key: ConversationKey, text: String) -> anyhow::Result<()>;
}

/// Prints every message to stdout, tagged with its conversation.
pub struct ConsoleSink;

#[async_trait]
impl MessageSink for ConsoleSink {
    async fn send_message(&self, key: ConversationKey, text: String) -> anyhow::Result<()> {
        println!("\n[chat {key}]\n{text}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Funding,
    Stop,
    /// Minutes, or `None` when the argument is missing or not all digits.
    Frequency(Option<u64>),
    Ticker(String),
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some(rest) = text.strip_prefix('/') else {
            return Command::Ticker(text.to_string());
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        // "/help@SomeBot" addresses a specific bot in group chats
        let name = name.split('@').next().unwrap_or_default().to_lowercase();

        match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "funding" => Command::Funding,
            "stop" => Command::Stop,
            "frequency" => Command::Frequency(
                parts
                    .next()
                    .filter(|arg| !arg.is_empty() && arg.chars().all(|c| c.is_ascii_digit()))
                    .and_then(|arg| arg.parse().ok()),
            ),
            _ => Command::Unknown(name),
        }
    }
}

/// Uppercases, validates and appends the quote asset when missing.
pub fn normalize_ticker(input: &str, quote_asset: &str) -> Option<String> {
    let ticker = input.trim().to_uppercase();
    if !TICKER_RE.is_match(&ticker) {
        return None;
    }
    if ticker.ends_with(quote_asset) {
        Some(ticker)
    } else {
        Some(format!("{ticker}{quote_asset}"))
    }
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub default_scan_interval: Duration,
    pub quote_asset: String,
    pub kline_interval: String,
    pub top_funding_count: usize,
}

pub struct Bot {
    market: Arc<dyn MarketData>,
    funding: Arc<FundingMonitor>,
    scheduler: Option<Arc<ScanScheduler>>,
    sink: Arc<dyn MessageSink>,
    pool: WorkerPool,
    settings: BotSettings,
    requests: AtomicU64,
}

impl Bot {
    pub fn new(
        market: Arc<dyn MarketData>,
        scheduler: Option<Arc<ScanScheduler>>,
        sink: Arc<dyn MessageSink>,
        pool: WorkerPool,
        settings: BotSettings,
    ) -> Self {
        Self {
            funding: Arc::new(FundingMonitor::new(market.clone())),
            market,
            scheduler,
            sink,
            pool,
            settings,
            requests: AtomicU64::new(0),
        }
    }

    async fn reply(&self, key: ConversationKey, text: impl Into<String>) -> anyhow::Result<()> {
        self.sink.send_message(key, text.into()).await
    }

    /// Interval of the conversation's scan job, `None` without a scheduler.
    fn ensure_scanning(&self, key: ConversationKey) -> Option<Duration> {
        let scheduler = self.scheduler.as_ref()?;
        scheduler.ensure_job(key, self.settings.default_scan_interval);
        scheduler.job_interval(key)
    }

    pub async fn handle(&self, key: ConversationKey, text: &str) -> anyhow::Result<()> {
        match Command::parse(text) {
            Command::Start => {
                self.reply(key, WELCOME).await?;
                if let Some(interval) = self.ensure_scanning(key) {
                    let minutes = interval.as_secs() / 60;
                    self.reply(key, format!("🔔 Funding scan runs every {minutes} minute(s)."))
                        .await?;
                }
                Ok(())
            }
            Command::Help => self.reply(key, HELP).await,
            Command::Funding => self.handle_funding(key).await,
            Command::Stop => self.handle_stop(key).await,
            Command::Frequency(minutes) => self.handle_frequency(key, minutes).await,
            Command::Ticker(ticker) => self.handle_ticker(key, &ticker).await,
            Command::Unknown(name) => {
                self.reply(key, format!("Unknown command /{name}. Try /help."))
                    .await
            }
        }
    }

    async fn handle_funding(&self, key: ConversationKey) -> anyhow::Result<()> {
        self.reply(key, "🔍 Fetching funding rates...").await?;

        let funding = self.funding.clone();
        let count = self.settings.top_funding_count;
        let text = match self
            .pool
            .spawn(async move { funding.top_funding_report(count).await })
            .await?
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(chat = %key, error = %e, "funding listing failed");
                "❌ Failed to fetch funding rates.".to_string()
            }
            Err(e) => return Err(e.into()),
        };
        self.reply(key, text).await
    }

    async fn handle_frequency(&self, key: ConversationKey, minutes: Option<u64>) -> anyhow::Result<()> {
        let Some(minutes) = minutes else {
            return self.reply(key, FREQUENCY_USAGE).await;
        };
        if minutes < 1 {
            return self.reply(key, "⚠️ Interval must be at least 1 minute.").await;
        }
        if minutes > MAX_FREQUENCY_MINUTES {
            return self
                .reply(
                    key,
                    format!("⚠️ Interval is too large, the maximum is {MAX_FREQUENCY_MINUTES} minutes."),
                )
                .await;
        }
        let Some(scheduler) = &self.scheduler else {
            return self.reply(key, "⚠️ Background scanning is disabled.").await;
        };

        scheduler.reschedule_job(key, Duration::from_secs(minutes * 60));
        let next = scheduler
            .next_fire_time(key)
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
            .unwrap_or_default();
        self.reply(
            key,
            format!(
                "✅ Background scan interval updated to every {minutes} minute(s). Next scan in {next}s."
            ),
        )
        .await
    }

    async fn handle_stop(&self, key: ConversationKey) -> anyhow::Result<()> {
        let stopped = self
            .scheduler
            .as_ref()
            .is_some_and(|scheduler| scheduler.cancel_job(key));
        let text = if stopped {
            "🛑 Background funding scan stopped. Send /start to resume."
        } else {
            "No background scan is running."
        };
        self.reply(key, text).await
    }

    async fn handle_ticker(&self, key: ConversationKey, input: &str) -> anyhow::Result<()> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.ensure_scanning(key);

        let Some(symbol) = normalize_ticker(input, &self.settings.quote_asset) else {
            return self
                .reply(key, format!("❌ '{}' is not a valid ticker.", input.trim()))
                .await;
        };
        self.reply(key, format!("🔍 Checking {symbol}...")).await?;

        let category = match self.market.validate_ticker(&symbol).await {
            Ok(Some(category)) => category,
            Ok(None) => {
                return self
                    .reply(key, format!("❌ Symbol {symbol} not found on Bybit."))
                    .await;
            }
            Err(e) => {
                warn!(%symbol, error = %e, "ticker validation failed");
                return self
                    .reply(key, format!("❌ Could not look up {symbol} right now."))
                    .await;
            }
        };
        self.reply(key, format!("✅ Found in {category}. Downloading data..."))
            .await?;

        let series = match self
            .market
            .fetch_candles(&symbol, category, &self.settings.kline_interval)
            .await
        {
            Ok(series) if !series.is_empty() => series,
            Ok(_) => return self.reply(key, "❌ Failed to download data.").await,
            Err(e) => {
                warn!(%symbol, error = %e, "kline download failed");
                return self.reply(key, "❌ Failed to download data.").await;
            }
        };
        let candles = series.len();

        let text = match self.pool.run_blocking(move || compute_report(&series)).await? {
            Ok(stats) => report::render_stat_report(&symbol, &stats),
            Err(e) => {
                info!(%symbol, reason = %e, "no report");
                "⚠️ Error: Could not calculate stats. Not enough data?".to_string()
            }
        };
        self.reply(key, text).await?;

        info!("Request #{request}: sent report with {candles} candles.");
        Ok(())
    }
}

/// Logs instead of propagating; a failed request never takes the loop down.
async fn dispatch(bot: Arc<Bot>, key: ConversationKey, text: String) {
    if let Err(e) = bot.handle(key, &text).await {
        error!(chat = %key, error = %e, "request failed");
    }
}

const QUEUE_DEPTH: usize = 64;

struct ConversationQueue {
    tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl ConversationQueue {
    fn spawn(bot: Arc<Bot>, key: ConversationKey) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                dispatch(bot.clone(), key, text).await;
            }
        });
        Self { tx, task }
    }
}

/// One ordered queue per conversation. Requests of a conversation are handled
/// one after another, different conversations run concurrently.
pub struct Dispatcher {
    bot: Arc<Bot>,
    queues: HashMap<ConversationKey, ConversationQueue>,
}

impl Dispatcher {
    pub fn new(bot: Arc<Bot>) -> Self {
        Self {
            bot,
            queues: HashMap::new(),
        }
    }

    pub async fn submit(&mut self, key: ConversationKey, text: String) {
        let queue = self
            .queues
            .entry(key)
            .or_insert_with(|| ConversationQueue::spawn(self.bot.clone(), key));
        let Err(mpsc::error::SendError(text)) = queue.tx.send(text).await else {
            return;
        };

        // the worker died with a panicking request, start over
        warn!(chat = %key, "conversation worker restarted");
        let queue = ConversationQueue::spawn(self.bot.clone(), key);
        if queue.tx.send(text).await.is_err() {
            error!(chat = %key, "conversation worker unavailable, request dropped");
        }
        self.queues.insert(key, queue);
    }

    /// Closes every queue and waits until the requests already queued are done.
    pub async fn shutdown(self) {
        for (key, queue) in self.queues {
            drop(queue.tx);
            if let Err(e) = queue.task.await {
                error!(chat = %key, error = %e, "conversation worker panicked");
            }
        }
    }
}
