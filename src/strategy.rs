// ===============================
// src/strategy.rs
// ===============================
//
// Moving-average crossover (trend-following):
// - fast SMA crossing above the slow SMA -> Buy (golden cross)
// - fast SMA crossing below the slow SMA -> Sell (dead cross)
//
// Filtering:
// - `min_edge_pips` ignores crossings where the two averages sit closer
//   than the threshold (noise), and `cooldown_ticks` suppresses whipsaw
//   in choppy markets.
//
// Signals carry no size; the portfolio applies its risk sizing.

use ahash::AHashMap;
use rust_decimal::Decimal;
use std::collections::VecDeque;

use crate::bus::{Disposition, Handler, HandlerError, Outbox, Subscription};
use crate::event::{Event, EventKind, Side, SignalEvent};
use crate::market::pip_unit;
use crate::metrics::SIGNALS;

#[derive(Debug, Clone)]
pub struct MaCrossParams {
    pub fast_window: usize,
    pub slow_window: usize,
    pub min_edge_pips: Decimal,
    pub cooldown_ticks: u32,
}

impl Default for MaCrossParams {
    fn default() -> Self {
        Self {
            fast_window: 16,
            slow_window: 64,
            min_edge_pips: Decimal::ONE,
            cooldown_ticks: 16,
        }
    }
}

struct Sma {
    window: VecDeque<Decimal>,
    sum: Decimal,
    cap: usize,
}

impl Sma {
    fn new(cap: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(cap),
            sum: Decimal::ZERO,
            cap,
        }
    }

    fn push(&mut self, v: Decimal) {
        if self.window.len() == self.cap {
            if let Some(x) = self.window.pop_front() {
                self.sum -= x;
            }
        }
        self.window.push_back(v);
        self.sum += v;
    }

    fn value(&self) -> Option<Decimal> {
        if self.window.len() == self.cap {
            Some(self.sum / Decimal::from(self.cap))
        } else {
            None
        }
    }
}

struct PairState {
    fast: Sma,
    slow: Sma,
    prev_diff_sign: i8, // -1, 0, +1
    since_last: u32,
}

impl PairState {
    fn new(params: &MaCrossParams) -> Self {
        Self {
            fast: Sma::new(params.fast_window),
            slow: Sma::new(params.slow_window),
            prev_diff_sign: 0,
            since_last: params.cooldown_ticks, // eligible from the start
        }
    }
}

pub struct MaCrossStrategy {
    params: MaCrossParams,
    pairs: AHashMap<String, PairState>,
}

impl MaCrossStrategy {
    pub fn new(params: MaCrossParams) -> Self {
        Self {
            params,
            pairs: AHashMap::new(),
        }
    }

    fn on_quote(
        &mut self,
        instrument: &str,
        bid: Decimal,
        ask: Decimal,
        time: chrono::DateTime<chrono::Utc>,
        out: &mut Outbox,
    ) {
        let state = self
            .pairs
            .entry(instrument.to_string())
            .or_insert_with(|| PairState::new(&self.params));

        let mid = (bid + ask) / Decimal::TWO;
        state.fast.push(mid);
        state.slow.push(mid);
        state.since_last = state.since_last.saturating_add(1);

        let (Some(fast), Some(slow)) = (state.fast.value(), state.slow.value()) else {
            return;
        };
        let diff = fast - slow;

        // edge filter, scaled to the pair's pip
        if diff.abs() < self.params.min_edge_pips * pip_unit(instrument) {
            return;
        }
        let cur_sign: i8 = if diff > Decimal::ZERO { 1 } else { -1 };

        if state.prev_diff_sign == 0 {
            // first complete reading seeds the sign without signaling
            state.prev_diff_sign = cur_sign;
            return;
        }
        if cur_sign != state.prev_diff_sign && state.since_last >= self.params.cooldown_ticks {
            state.prev_diff_sign = cur_sign;
            state.since_last = 0;
            let side = if cur_sign > 0 { Side::Buy } else { Side::Sell };
            SIGNALS.inc();
            out.publish(Event::Signal(SignalEvent {
                instrument: instrument.to_string(),
                side,
                units: None,
                time,
            }));
        }
    }
}

impl Handler for MaCrossStrategy {
    fn name(&self) -> &'static str {
        "ma_cross"
    }

    fn subscription(&self) -> Subscription {
        Subscription::Only(&[EventKind::Tick, EventKind::TickPrice])
    }

    fn process(&mut self, event: &Event, out: &mut Outbox) -> Result<Disposition, HandlerError> {
        match event {
            Event::Tick(t) => self.on_quote(&t.instrument, t.bid, t.ask, t.time, out),
            Event::TickPrice(t) => self.on_quote(&t.instrument, t.bid, t.ask, t.time, out),
            _ => {}
        }
        Ok(Disposition::Done)
    }
}
