// ===============================
// src/timeframe.rs
// ===============================
//
// Turns the tick stream into candle-period rollover events. Driven by
// event time rather than the wall clock, so a backtest replaying
// historical ticks rolls candles at the historical boundaries.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bus::{Disposition, Handler, HandlerError, Outbox, Subscription};
use crate::event::{Event, EventKind, TimeFrameEvent};
use crate::market::{TimeFrame, ALL_TIMEFRAMES};

pub struct TimeFrameTicker {
    frames: Vec<TimeFrame>,
    current: AHashMap<TimeFrame, DateTime<Utc>>,
}

impl TimeFrameTicker {
    pub fn new(frames: Vec<TimeFrame>) -> Self {
        Self {
            frames,
            current: AHashMap::new(),
        }
    }

    pub fn all() -> Self {
        Self::new(ALL_TIMEFRAMES.to_vec())
    }

    fn advance(&mut self, now: DateTime<Utc>, out: &mut Outbox) {
        for frame in &self.frames {
            let candle = frame.candle_time(now);
            match self.current.get_mut(frame) {
                None => {
                    // first observation seeds the candle without an event
                    self.current.insert(*frame, candle);
                }
                Some(prev) if *prev < candle => {
                    let previous = *prev;
                    *prev = candle;
                    debug!(timeframe = ?frame, %candle, "candle rollover");
                    out.publish(Event::TimeFrame(TimeFrameEvent {
                        timeframe: *frame,
                        current: candle,
                        previous,
                        time: now,
                    }));
                }
                Some(_) => {}
            }
        }
    }
}

impl Handler for TimeFrameTicker {
    fn name(&self) -> &'static str {
        "timeframe"
    }

    fn subscription(&self) -> Subscription {
        Subscription::Only(&[EventKind::Tick, EventKind::TickPrice, EventKind::Heartbeat])
    }

    fn process(&mut self, event: &Event, out: &mut Outbox) -> Result<Disposition, HandlerError> {
        self.advance(event.time(), out);
        Ok(Disposition::Done)
    }
}
