// ===============================
// src/portfolio.rs
// ===============================
//
// The ledger. Owns every open position, the account balance, and the
// win/loss tally. Runs entirely inside the dispatch loop, so no locking:
// ticks mark positions to market, signals open/add/close exposure, and
// balance only ever moves when profit is realized on a close.
//
// Sizing: a signal without explicit units trades
// equity * leverage * risk_per_trade, truncated to whole units.
// A signal against an open position closes it in full and does nothing
// else; the next signal in that direction opens the new position.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::bus::{Disposition, Handler, HandlerError, Outbox, Subscription};
use crate::event::{
    Event, EventKind, OrderAction, OrderEvent, Side, SignalEvent, TradeClosedEvent,
    TradeOpenedEvent,
};
use crate::metrics::{BALANCE, PNL_REALIZED, PNL_UNREALIZED, TRADES_CLOSED};
use crate::position::Position;
use crate::recorder::EquityWriter;

#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub base_currency: String,
    pub equity: Decimal,
    pub leverage: Decimal,
    pub risk_per_trade: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct Quote {
    bid: Decimal,
    ask: Decimal,
}

pub struct Portfolio {
    cfg: PortfolioConfig,
    balance: Decimal,
    positions: HashMap<String, Position>,
    quotes: HashMap<String, Quote>,
    wins: u32,
    losses: u32,
    trade_seq: u64,
    market_open: bool,
    /// When set, one snapshot row is written per tick (backtest output).
    equity_writer: Option<EquityWriter>,
}

impl Portfolio {
    pub fn new(cfg: PortfolioConfig) -> Self {
        let balance = cfg.equity;
        Self {
            cfg,
            balance,
            positions: HashMap::new(),
            quotes: HashMap::new(),
            wins: 0,
            losses: 0,
            trade_seq: 0,
            market_open: true,
            equity_writer: None,
        }
    }

    pub fn with_equity_writer(mut self, writer: EquityWriter) -> Self {
        self.equity_writer = Some(writer);
        self
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Balance plus the unrealized P&L of every open position.
    pub fn equity(&self) -> Decimal {
        self.balance
            + self
                .positions
                .values()
                .map(|p| p.unrealized_pnl)
                .sum::<Decimal>()
    }

    pub fn wins(&self) -> u32 {
        self.wins
    }

    pub fn losses(&self) -> u32 {
        self.losses
    }

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Units for an unsized signal: equity * leverage * risk_per_trade,
    /// truncated to whole units.
    fn trade_units(&self) -> Decimal {
        (self.equity() * self.cfg.leverage * self.cfg.risk_per_trade).trunc()
    }

    fn next_trade_id(&mut self) -> String {
        self.trade_seq += 1;
        format!("T-{}", self.trade_seq)
    }

    fn on_tick(&mut self, instrument: &str, bid: Decimal, ask: Decimal, time: DateTime<Utc>) {
        self.quotes
            .insert(instrument.to_string(), Quote { bid, ask });

        // a closed market still records quotes but does not mark anything
        if !self.market_open {
            return;
        }

        if let Some(pos) = self.positions.get_mut(instrument) {
            // longs exit at the bid, shorts at the ask
            let mark = match pos.side {
                Side::Buy => bid,
                Side::Sell => ask,
            };
            pos.mark_price(mark);
        }
        self.publish_gauges();

        if let Some(writer) = &mut self.equity_writer {
            let unrealized: Vec<(String, Decimal)> = self
                .positions
                .iter()
                .map(|(k, p)| (k.clone(), p.unrealized_pnl))
                .collect();
            if let Err(e) = writer.write_row(time, self.balance, &unrealized) {
                warn!(error = %e, "equity snapshot write failed");
            }
        }
    }

    fn on_signal(&mut self, signal: &SignalEvent, out: &mut Outbox) -> Result<(), HandlerError> {
        if !self.market_open {
            debug!(instrument = %signal.instrument, "signal ignored, market closed");
            return Ok(());
        }
        let Some(quote) = self.quotes.get(&signal.instrument).copied() else {
            debug!(instrument = %signal.instrument, "signal ignored, no quote yet");
            return Ok(());
        };

        let held_side = self.positions.get(&signal.instrument).map(|p| p.side);
        match held_side {
            None => self.open_position(signal, quote, out),
            Some(side) if side == signal.side => self.add_to_position(signal, quote, out),
            Some(_) => {
                self.close_position(&signal.instrument, quote, signal.time, out)?;
                Ok(())
            }
        }
    }

    fn open_position(
        &mut self,
        signal: &SignalEvent,
        quote: Quote,
        out: &mut Outbox,
    ) -> Result<(), HandlerError> {
        let units = signal.units.unwrap_or_else(|| self.trade_units());
        if units <= Decimal::ZERO {
            warn!(instrument = %signal.instrument, %units, "trade size is zero, signal skipped");
            return Ok(());
        }
        // buy at the ask, sell at the bid
        let entry = match signal.side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let pos = Position::open(&signal.instrument, signal.side, units, entry, signal.time)?;
        self.positions.insert(signal.instrument.clone(), pos);

        let trade_id = self.next_trade_id();
        info!(
            %trade_id,
            instrument = %signal.instrument,
            side = ?signal.side,
            %units,
            %entry,
            "position opened"
        );
        out.publish(Event::Order(OrderEvent {
            instrument: signal.instrument.clone(),
            side: signal.side,
            units,
            action: OrderAction::Open,
            take_profit: None,
            stop_loss: None,
            trailing_stop: None,
            time: signal.time,
        }));
        out.publish(Event::TradeOpened(TradeOpenedEvent {
            trade_id,
            instrument: signal.instrument.clone(),
            side: signal.side,
            units,
            price: entry,
            time: signal.time,
        }));
        Ok(())
    }

    fn add_to_position(
        &mut self,
        signal: &SignalEvent,
        quote: Quote,
        out: &mut Outbox,
    ) -> Result<(), HandlerError> {
        let units = signal.units.unwrap_or_else(|| self.trade_units());
        if units <= Decimal::ZERO {
            warn!(instrument = %signal.instrument, %units, "trade size is zero, signal skipped");
            return Ok(());
        }
        let fill = match signal.side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let pos = self
            .positions
            .get_mut(&signal.instrument)
            .ok_or_else(|| HandlerError::Other("position vanished during add".into()))?;
        pos.add_units(units, fill)?;
        info!(
            instrument = %signal.instrument,
            side = ?signal.side,
            added = %units,
            total = %pos.units,
            avg = %pos.avg_price,
            "position increased"
        );
        out.publish(Event::Order(OrderEvent {
            instrument: signal.instrument.clone(),
            side: signal.side,
            units,
            action: OrderAction::Open,
            take_profit: None,
            stop_loss: None,
            trailing_stop: None,
            time: signal.time,
        }));
        Ok(())
    }

    /// Force a full close of the open position at the last stored quote.
    /// Returns the realized P&L, or `None` when nothing is open for the
    /// instrument. Used for operator closes and end-of-run liquidation;
    /// the reversing-signal path goes through the same settlement.
    pub fn close(
        &mut self,
        instrument: &str,
        time: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<Option<Decimal>, HandlerError> {
        if !self.positions.contains_key(instrument) {
            return Ok(None);
        }
        let Some(quote) = self.quotes.get(instrument).copied() else {
            // unreachable in practice: opening requires a quote
            return Ok(None);
        };
        let realized = self.close_position(instrument, quote, time, out)?;
        Ok(Some(realized))
    }

    fn close_position(
        &mut self,
        instrument: &str,
        quote: Quote,
        time: DateTime<Utc>,
        out: &mut Outbox,
    ) -> Result<Decimal, HandlerError> {
        let mut pos = self
            .positions
            .remove(instrument)
            .ok_or_else(|| HandlerError::Other("position vanished during close".into()))?;
        let exit = match pos.side {
            Side::Buy => quote.bid,
            Side::Sell => quote.ask,
        };
        pos.mark_price(exit);

        let units = pos.units;
        let pips = pos.pips();
        let realized = pos.remove_units(units)?;
        self.balance += realized;
        if realized > Decimal::ZERO {
            self.wins += 1;
        } else {
            self.losses += 1;
        }

        let trade_id = self.next_trade_id();
        info!(
            %trade_id,
            instrument = %instrument,
            side = ?pos.side,
            %units,
            %pips,
            profit = %realized,
            balance = %self.balance,
            "position closed"
        );
        TRADES_CLOSED.inc();
        self.publish_gauges();

        out.publish(Event::Order(OrderEvent {
            instrument: instrument.to_string(),
            side: pos.side.opposite(),
            units,
            action: OrderAction::Close,
            take_profit: None,
            stop_loss: None,
            trailing_stop: None,
            time,
        }));
        out.publish(Event::TradeClosed(TradeClosedEvent {
            trade_id,
            instrument: instrument.to_string(),
            side: pos.side,
            units,
            open_price: pos.avg_price,
            close_price: exit,
            pips,
            profit: realized,
            opened_at: pos.opened_at,
            time,
        }));
        Ok(realized)
    }

    fn publish_gauges(&self) {
        BALANCE.set(self.balance.to_f64().unwrap_or(0.0));
        PNL_REALIZED.set((self.balance - self.cfg.equity).to_f64().unwrap_or(0.0));
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl).sum();
        PNL_UNREALIZED.set(unrealized.to_f64().unwrap_or(0.0));
    }
}

impl Handler for Portfolio {
    fn name(&self) -> &'static str {
        "portfolio"
    }

    fn subscription(&self) -> Subscription {
        Subscription::Only(&[
            EventKind::Tick,
            EventKind::TickPrice,
            EventKind::Signal,
            EventKind::MarketOpen,
            EventKind::MarketClose,
        ])
    }

    fn process(&mut self, event: &Event, out: &mut Outbox) -> Result<Disposition, HandlerError> {
        match event {
            Event::Tick(t) => self.on_tick(&t.instrument, t.bid, t.ask, t.time),
            Event::TickPrice(t) => self.on_tick(&t.instrument, t.bid, t.ask, t.time),
            Event::Signal(s) => self.on_signal(s, out)?,
            Event::MarketOpen(_) => {
                self.market_open = true;
                info!("market open, ledger resumed");
            }
            Event::MarketClose(_) => {
                self.market_open = false;
                info!(balance = %self.balance, open = self.positions.len(), "market closed, ledger paused");
            }
            _ => {}
        }
        Ok(Disposition::Done)
    }
}
