use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

// CONFIGURATION STRUCTS

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KlineConfig {
    pub limit: u32,       // e.g., 1000 candles
    pub interval: String, // Bybit interval code, "D" for daily
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub quote_asset: String, // appended to bare tickers, e.g. "USDT"
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub interval_secs: u64,
    pub first_delay_secs: u64,
    pub funding_threshold: f64,
    pub top_funding_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub klines: KlineConfig,
    pub exchange: ExchangeConfig,
    pub scan: ScanConfig,
    pub worker_pool_size: usize,
    /// Conversation key used by the console front end.
    pub console_chat_id: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            klines: KlineConfig {
                limit: 1000,
                interval: "D".to_string(),
            },
            exchange: ExchangeConfig {
                base_url: "https://api.bybit.com".to_string(),
                quote_asset: "USDT".to_string(),
            },
            scan: ScanConfig {
                interval_secs: 1200,
                first_delay_secs: 10,
                funding_threshold: -0.015,
                top_funding_count: 10,
            },
            worker_pool_size: 8,
            console_chat_id: 0,
        }
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

impl AppConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.interval_secs)
    }

    pub fn first_delay(&self) -> Duration {
        Duration::from_secs(self.scan.first_delay_secs)
    }

    /// Environment wins over the config file. `lookup` is `std::env::var`
    /// in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        parse_override(&lookup, "SCAN_INTERVAL", &mut self.scan.interval_secs);
        parse_override(&lookup, "FUNDING_THRESHOLD", &mut self.scan.funding_threshold);
        parse_override(&lookup, "WORKER_POOL_SIZE", &mut self.worker_pool_size);
        parse_override(&lookup, "CONSOLE_CHAT_ID", &mut self.console_chat_id);
        if let Some(url) = lookup("BYBIT_BASE_URL").filter(|u| !u.trim().is_empty()) {
            self.exchange.base_url = url.trim().to_string();
        }
    }

    /// Reads `config.json` from storage, writing the defaults first when it
    /// does not exist yet, then applies environment overrides.
    pub async fn load(storage: &AsyncStorageManager) -> anyhow::Result<Self> {
        let mut config = if storage.exists("config").await {
            storage.load("config").await?
        } else {
            let defaults = AppConfig::default();
            storage.save("config", &defaults).await?;
            info!(path = ?storage.base_dir, "wrote default config.json");
            defaults
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    // Absolute path to the storage directory (e.g., ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Storage directory relative to the running executable, created if missing.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::at(base_dir).await
    }

    pub async fn at(base_dir: PathBuf) -> anyhow::Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    fn path_for(&self, filename: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", filename))
    }

    pub async fn exists(&self, filename: &str) -> bool {
        fs::try_exists(self.path_for(filename)).await.unwrap_or(false)
    }

    /// Atomic write: serialize to `<name>.json.tmp`, then rename over the target.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let final_path = self.path_for(filename);
        let tmp_path = self.base_dir.join(format!("{}.json.tmp", filename));

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(tmp_path, final_path).await?;
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        // serde_json scans the bytes anyway, skip the UTF-8 pass of read_to_string
        let content = fs::read(self.path_for(filename)).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}
