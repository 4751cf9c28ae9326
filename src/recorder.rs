// ===============================
// src/recorder.rs
// ===============================
//
// Persistence for everything the engine produces:
// - JSONL event journal (append, BufWriter, flush every 1s or 1000 events,
//   reopen on write failure)
// - trade ledger: one JSONL row per closed trade, behind the TradeStore seam
// - equity snapshots: CSV of balance plus per-pair unrealized P&L
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` to enable the journal
// (see main.rs).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::Path;
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::bus::{Disposition, Handler, HandlerError, Outbox, Subscription};
use crate::event::{Event, EventKind, TradeClosedEvent};
use crate::market::units_to_lots;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

// -------- event journal --------

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

/// Journal task: drains the channel into the JSONL file.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            // keep draining so senders never block
            while rx.recv().await.is_some() {}
            return;
        }
    };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    Some(ev) => {
                        let line = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip event");
                                continue;
                            }
                        };

                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(?e, "recorder: write failed, attempting reopen");
                            match open_writer(&path).await {
                                Ok(w) => writer = w,
                                Err(e2) => {
                                    error!(?e2, "recorder: reopen failed, drop event");
                                    continue;
                                }
                            }
                            if let Err(e2) = writer.write_all(line.as_bytes()).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        let _ = writer.write_all(b"\n").await;

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                            let _ = writer.flush().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        let _ = writer.flush().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

/// In-loop handler side of the journal: forwards every event to the
/// recorder task without blocking the dispatch loop. A full channel
/// drops the event rather than stalling trading.
pub struct RecorderHandler {
    tx: mpsc::Sender<Event>,
}

impl RecorderHandler {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl Handler for RecorderHandler {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn subscription(&self) -> Subscription {
        Subscription::All
    }

    fn process(&mut self, event: &Event, _out: &mut Outbox) -> Result<Disposition, HandlerError> {
        if self.tx.try_send(event.clone()).is_err() {
            warn!(kind = %event.kind(), "recorder channel full, event not journaled");
        }
        Ok(Disposition::Done)
    }
}

// -------- trade ledger --------

/// One closed trade, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub broker: String,
    pub account_id: String,
    pub trade_id: String,
    pub instrument: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub lots: Decimal,
    pub pips: Decimal,
    pub profit: Decimal,
}

impl TradeRecord {
    pub fn from_event(broker: &str, account_id: &str, ev: &TradeClosedEvent) -> Self {
        Self {
            broker: broker.to_string(),
            account_id: account_id.to_string(),
            trade_id: ev.trade_id.clone(),
            instrument: ev.instrument.clone(),
            open_time: ev.opened_at,
            close_time: ev.time,
            open_price: ev.open_price,
            close_price: ev.close_price,
            lots: units_to_lots(ev.units),
            pips: ev.pips,
            profit: ev.profit,
        }
    }
}

pub trait TradeStore: Send {
    fn append(&mut self, record: &TradeRecord) -> Result<(), RecordError>;
}

/// Appends one JSON line per closed trade.
pub struct JsonlTradeStore {
    file: std::fs::File,
}

impl JsonlTradeStore {
    pub fn open(path: &Path) -> Result<Self, RecordError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl TradeStore for JsonlTradeStore {
    fn append(&mut self, record: &TradeRecord) -> Result<(), RecordError> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Writes every closed trade into the store.
pub struct TradeLedgerHandler {
    broker: String,
    account_id: String,
    store: Box<dyn TradeStore>,
}

impl TradeLedgerHandler {
    pub fn new(broker: impl Into<String>, account_id: impl Into<String>, store: Box<dyn TradeStore>) -> Self {
        Self {
            broker: broker.into(),
            account_id: account_id.into(),
            store,
        }
    }
}

impl Handler for TradeLedgerHandler {
    fn name(&self) -> &'static str {
        "trade_ledger"
    }

    fn subscription(&self) -> Subscription {
        Subscription::Only(&[EventKind::TradeClosed])
    }

    fn process(&mut self, event: &Event, _out: &mut Outbox) -> Result<Disposition, HandlerError> {
        if let Event::TradeClosed(ev) = event {
            let record = TradeRecord::from_event(&self.broker, &self.account_id, ev);
            if let Err(e) = self.store.append(&record) {
                error!(trade_id = %ev.trade_id, error = %e, "trade ledger append failed");
                // the row is lost if the retry ceiling is hit, but the
                // ledger gets every chance to catch up
                return Ok(Disposition::Redeliver);
            }
        }
        Ok(Disposition::Done)
    }
}

// -------- equity snapshots --------

/// CSV sink for per-tick equity snapshots: timestamp, balance, then one
/// column of unrealized P&L per configured pair.
pub struct EquityWriter {
    writer: csv::Writer<std::fs::File>,
    pairs: Vec<String>,
}

impl std::fmt::Debug for EquityWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquityWriter").field("pairs", &self.pairs).finish()
    }
}

impl EquityWriter {
    pub fn create(path: &Path, pairs: Vec<String>) -> Result<Self, RecordError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["Timestamp".to_string(), "Balance".to_string()];
        header.extend(pairs.iter().cloned());
        writer.write_record(&header)?;
        writer.flush()?;
        Ok(Self { writer, pairs })
    }

    pub fn write_row(
        &mut self,
        time: DateTime<Utc>,
        balance: Decimal,
        unrealized: &[(String, Decimal)],
    ) -> Result<(), RecordError> {
        let mut row = vec![time.to_rfc3339(), balance.to_string()];
        for pair in &self.pairs {
            let pnl = unrealized
                .iter()
                .find(|(p, _)| p == pair)
                .map(|(_, v)| *v)
                .unwrap_or(Decimal::ZERO);
            row.push(pnl.to_string());
        }
        self.writer.write_record(&row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RecordError> {
        self.writer.flush()?;
        Ok(())
    }
}
