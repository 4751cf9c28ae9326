// ===============================
// src/main.rs
// ===============================
/*
 # what the engine is doing right now
 curl -s localhost:9898/metrics | egrep '^(ticks_total|signals_total|orders_total)'

 # bus health
 curl -s localhost:9898/metrics | egrep '^events_(dispatched|redelivered|abandoned)'

 # ledger
 curl -s localhost:9898/metrics | egrep '^(account_balance|pnl_)'
*/

use std::error::Error;
use tracing::{error, info};

use fx_bot_rust::alert::LogAlert;
use fx_bot_rust::backtest::{BacktestDriver, CsvTickSource};
use fx_bot_rust::bus::{EventBus, Handler};
use fx_bot_rust::config::{self, AccountConfig, Args, FeedMode, RunMode};
use fx_bot_rust::execution::{ExecutionHandler, SimulatedBroker};
use fx_bot_rust::feed::MockFeed;
use fx_bot_rust::market::ForexWeekSchedule;
use fx_bot_rust::metrics;
use fx_bot_rust::portfolio::{Portfolio, PortfolioConfig};
use fx_bot_rust::recorder::{
    self, EquityWriter, JsonlTradeStore, RecorderHandler, TradeLedgerHandler,
};
use fx_bot_rust::session::{self, Machine, SessionConfig};
use fx_bot_rust::strategy::{MaCrossParams, MaCrossStrategy};
use fx_bot_rust::timeframe::TimeFrameTicker;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config & account ----
    let (args, account) = config::load();

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        mode = ?args.run_mode,
        pairs = ?args.pairs,
        broker = %account.broker,
        equity = %account.equity,
        "starting"
    );

    let result = match args.run_mode {
        RunMode::Backtest => run_backtest(&args, &account).await,
        RunMode::Live => run_live(&args, &account).await,
    };
    if let Err(e) = result {
        error!(error = %e, "engine stopped with error");
        std::process::exit(1);
    }
}

fn portfolio_config(account: &AccountConfig) -> PortfolioConfig {
    PortfolioConfig {
        base_currency: account.base_currency.clone(),
        equity: account.equity,
        leverage: account.leverage,
        risk_per_trade: account.risk_per_trade,
    }
}

fn trade_ledger(
    args: &Args,
    account: &AccountConfig,
) -> Result<Option<TradeLedgerHandler>, Box<dyn Error>> {
    let Some(path) = &args.trade_file else {
        return Ok(None);
    };
    let store = JsonlTradeStore::open(path.as_ref())?;
    Ok(Some(TradeLedgerHandler::new(
        account.broker.clone(),
        account.account_id.clone(),
        Box::new(store),
    )))
}

async fn run_backtest(args: &Args, account: &AccountConfig) -> Result<(), Box<dyn Error>> {
    let mut bus = EventBus::new();

    // journal task, if configured
    let mut journal = None;
    if let Some(path) = &args.record_file {
        let (tx, rx) = tokio::sync::mpsc::channel(8192);
        tokio::spawn(recorder::run(rx, path.clone()));
        journal = Some(RecorderHandler::new(tx));
    }

    let mut portfolio = Portfolio::new(portfolio_config(account));
    if let Some(path) = &args.equity_file {
        let writer = EquityWriter::create(path.as_ref(), args.pairs.clone())?;
        portfolio = portfolio.with_equity_writer(writer);
    }

    let mut timeframe = TimeFrameTicker::all();
    let mut strategy = MaCrossStrategy::new(MaCrossParams::default());
    let mut execution = ExecutionHandler::new(Box::new(SimulatedBroker::new()));
    let mut ledger = trade_ledger(args, account)?;

    let mut handlers: Vec<&mut dyn Handler> = vec![
        &mut timeframe,
        &mut strategy,
        &mut portfolio,
        &mut execution,
    ];
    if let Some(h) = ledger.as_mut() {
        handlers.push(h);
    }
    if let Some(h) = journal.as_mut() {
        handlers.push(h);
    }

    let mut source = CsvTickSource::open(args.data_dir.as_ref(), &args.pairs)?;
    let mut driver = BacktestDriver::new();
    driver.run(&mut bus, &mut handlers, &mut source)?;
    drop(handlers);

    info!(
        ticks = driver.ticks_replayed(),
        balance = %portfolio.balance(),
        equity = %portfolio.equity(),
        wins = portfolio.wins(),
        losses = portfolio.losses(),
        "backtest complete"
    );
    Ok(())
}

async fn run_live(args: &Args, account: &AccountConfig) -> Result<(), Box<dyn Error>> {
    let mut bus = EventBus::new();

    let mut journal = None;
    if let Some(path) = &args.record_file {
        let (tx, rx) = tokio::sync::mpsc::channel(8192);
        tokio::spawn(recorder::run(rx, path.clone()));
        journal = Some(RecorderHandler::new(tx));
    }

    // price session task
    let connector = match args.feed_mode {
        FeedMode::Mock => Box::new(MockFeed::new(account.broker.clone(), args.pairs.clone())),
    };
    let session_cfg = SessionConfig {
        driver_interval: args.heartbeat_interval,
        ..SessionConfig::default()
    };
    let driver_interval = session_cfg.driver_interval;
    tokio::spawn(session::run(
        Machine::new(session_cfg),
        connector,
        Box::new(LogAlert),
        Box::new(ForexWeekSchedule),
        bus.sender(),
        driver_interval,
    ));

    let mut portfolio = Portfolio::new(portfolio_config(account));
    let mut timeframe = TimeFrameTicker::all();
    let mut strategy = MaCrossStrategy::new(MaCrossParams::default());
    let mut execution = ExecutionHandler::new(Box::new(SimulatedBroker::new()));
    let mut ledger = trade_ledger(args, account)?;

    let mut handlers: Vec<&mut dyn Handler> = vec![
        &mut timeframe,
        &mut strategy,
        &mut portfolio,
        &mut execution,
    ];
    if let Some(h) = ledger.as_mut() {
        handlers.push(h);
    }
    if let Some(h) = journal.as_mut() {
        handlers.push(h);
    }

    tokio::select! {
        _ = bus.run(&mut handlers) => {
            info!("dispatch loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    drop(handlers);
    info!(
        balance = %portfolio.balance(),
        wins = portfolio.wins(),
        losses = portfolio.losses(),
        "session closed"
    );
    Ok(())
}
