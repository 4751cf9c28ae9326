// ===============================
// src/config.rs
// ===============================
use dotenvy::dotenv;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::time::Duration;

/// How the engine runs: replaying history or trading a live session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Backtest,
    Live,
}

impl RunMode {
    pub fn from_env(key: &str, default_mode: RunMode) -> RunMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "backtest" => RunMode::Backtest,
            "live" => RunMode::Live,
            _ => default_mode,
        }
    }
}

/// Price stream source for live mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            _ => default_mode,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub run_mode: RunMode,
    pub feed_mode: FeedMode,

    /// Currency pairs, e.g. EURUSD,USDJPY
    pub pairs: Vec<String>,

    // files/metrics
    pub record_file: Option<String>,
    pub trade_file: Option<String>,
    pub equity_file: Option<String>,
    pub metrics_port: u16,

    /// Directory of `<PAIR>.csv` tick files for backtests.
    pub data_dir: String,

    /// Session driver cadence (heartbeats, staleness checks).
    pub heartbeat_interval: Duration,
}

/// Account and risk parameters for the ledger.
#[derive(Clone, Debug)]
pub struct AccountConfig {
    pub broker: String,
    pub account_id: String,
    pub base_currency: String,
    pub equity: Decimal,
    pub leverage: Decimal,
    pub risk_per_trade: Decimal,
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

pub fn load() -> (Args, AccountConfig) {
    // make sure .env is read (RECORD_FILE, PAIRS, etc.)
    let _ = dotenv();

    let run_mode = RunMode::from_env("RUN_MODE", RunMode::Backtest);
    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);

    // Multi-pair: PAIRS=EURUSD,USDJPY,GBPUSD
    let pairs: Vec<String> = env::var("PAIRS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["EURUSD".to_string()]);

    let record_file = env::var("RECORD_FILE").ok();
    let trade_file = env::var("TRADE_FILE").ok();
    let equity_file = env::var("EQUITY_FILE").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());

    let heartbeat_secs: u64 = env::var("HEARTBEAT_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    let args = Args {
        run_mode,
        feed_mode,
        pairs,
        record_file,
        trade_file,
        equity_file,
        metrics_port,
        data_dir,
        heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
    };

    let account = AccountConfig {
        broker: env::var("BROKER").unwrap_or_else(|_| "mock".to_string()),
        account_id: env::var("ACCOUNT_ID").unwrap_or_else(|_| "0000".to_string()),
        base_currency: env::var("BASE_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
        equity: env_decimal("EQUITY", dec!(100000)),
        leverage: env_decimal("LEVERAGE", dec!(20)),
        risk_per_trade: env_decimal("RISK_PER_TRADE", dec!(0.02)),
    };

    (args, account)
}
