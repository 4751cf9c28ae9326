// End-to-end replay: the same tick files must produce the same ledger,
// run after run, byte for byte.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use fx_bot_rust::backtest::{BacktestDriver, CsvTickSource, DriverState};
use fx_bot_rust::bus::{EventBus, Handler};
use fx_bot_rust::execution::{ExecutionHandler, SimulatedBroker};
use fx_bot_rust::portfolio::{Portfolio, PortfolioConfig};
use fx_bot_rust::recorder::{JsonlTradeStore, TradeLedgerHandler};
use fx_bot_rust::strategy::{MaCrossParams, MaCrossStrategy};
use fx_bot_rust::timeframe::TimeFrameTicker;
use rust_decimal_macros::dec;

// Three slow triangle waves: every turn flips the fast/slow divergence,
// so the crossover strategy trades at each apex.
fn write_tick_file(dir: &Path) {
    let mut f = File::create(dir.join("EURUSD.csv")).unwrap();
    writeln!(f, "time,bid,ask").unwrap();
    let start = Utc.with_ymd_and_hms(2019, 4, 10, 9, 0, 0).unwrap();
    let mut px: i64 = 110_000; // 1.10000 in pip fractions
    let mut step: i64 = 20;
    for i in 0..240 {
        if i % 40 == 0 && i > 0 {
            step = -step;
        }
        px += step;
        let time = start + Duration::seconds(i);
        let bid = Decimal::new(px - 1, 5);
        let ask = Decimal::new(px + 1, 5);
        writeln!(f, "{},{},{}", time.to_rfc3339(), bid, ask).unwrap();
    }
}

fn replay(data_dir: &Path, trades_path: &Path) -> (Decimal, u32, u32, u64) {
    let mut bus = EventBus::new();
    let mut portfolio = Portfolio::new(PortfolioConfig {
        base_currency: "USD".into(),
        equity: dec!(100000),
        leverage: dec!(20),
        risk_per_trade: dec!(0.02),
    });
    let mut strategy = MaCrossStrategy::new(MaCrossParams {
        fast_window: 4,
        slow_window: 16,
        min_edge_pips: Decimal::ONE,
        cooldown_ticks: 0,
    });
    let mut timeframe = TimeFrameTicker::all();
    let mut execution = ExecutionHandler::new(Box::new(SimulatedBroker::new()));
    let store = JsonlTradeStore::open(trades_path).unwrap();
    let mut ledger = TradeLedgerHandler::new("mock", "1001", Box::new(store));

    let mut handlers: Vec<&mut dyn Handler> = vec![
        &mut timeframe,
        &mut strategy,
        &mut portfolio,
        &mut execution,
        &mut ledger,
    ];

    let mut source = CsvTickSource::open(data_dir, &["EURUSD".to_string()]).unwrap();
    let mut driver = BacktestDriver::new();
    driver.run(&mut bus, &mut handlers, &mut source).unwrap();
    assert_eq!(driver.state(), DriverState::Finished);
    drop(handlers);

    (
        portfolio.balance(),
        portfolio.wins(),
        portfolio.losses(),
        driver.ticks_replayed(),
    )
}

#[test]
fn identical_runs_produce_identical_ledgers() {
    let dir = tempfile::tempdir().unwrap();
    write_tick_file(dir.path());

    let trades_a = dir.path().join("trades_a.jsonl");
    let trades_b = dir.path().join("trades_b.jsonl");

    let run_a = replay(dir.path(), &trades_a);
    let run_b = replay(dir.path(), &trades_b);

    assert_eq!(run_a, run_b);
    assert_eq!(run_a.3, 240);

    let ledger_a = std::fs::read_to_string(&trades_a).unwrap();
    let ledger_b = std::fs::read_to_string(&trades_b).unwrap();
    assert_eq!(ledger_a, ledger_b);
}

#[test]
fn replay_actually_trades() {
    let dir = tempfile::tempdir().unwrap();
    write_tick_file(dir.path());
    let trades = dir.path().join("trades.jsonl");

    let (balance, wins, losses, _) = replay(dir.path(), &trades);

    // every apex flips the signal: positions opened and closed
    assert!(wins + losses >= 2, "expected closes, got wins={wins} losses={losses}");
    assert_ne!(balance, dec!(100000));

    let ledger = std::fs::read_to_string(&trades).unwrap();
    assert_eq!(ledger.lines().count() as u32, wins + losses);
}
