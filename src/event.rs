// ===============================
// src/event.rs
// ===============================
//
// Typed domain events: a closed tagged union serialized with an explicit
// "kind" discriminator. Prices travel as exact decimal strings and
// timestamps as RFC 3339, so a wire round-trip reproduces the event
// exactly. Unknown fields are rejected on decode.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market::TimeFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectAction {
    Connect,
    Reconnect,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Open,
    Close,
}

/// Historical tick replayed by the backtest driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickEvent {
    pub instrument: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Live tick from a broker price stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickPriceEvent {
    pub broker: String,
    pub instrument: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Emitted when a candle period rolls over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeFrameEvent {
    pub timeframe: TimeFrame,
    pub current: DateTime<Utc>,
    pub previous: DateTime<Utc>,
    pub time: DateTime<Utc>,
}

/// Synthetic liveness tick from the session driver, counter is monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatEvent {
    pub counter: u64,
    pub time: DateTime<Utc>,
}

/// Strategy output. `units = None` asks the portfolio for risk sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalEvent {
    pub instrument: String,
    pub side: Side,
    pub units: Option<Decimal>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderEvent {
    pub instrument: String,
    pub side: Side,
    pub units: Decimal,
    pub action: OrderAction,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub trailing_stop: Option<Decimal>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketOpenEvent {
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketCloseEvent {
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeOpenedEvent {
    pub trade_id: String,
    pub instrument: String,
    pub side: Side,
    pub units: Decimal,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeClosedEvent {
    pub trade_id: String,
    pub instrument: String,
    pub side: Side,
    pub units: Decimal,
    pub open_price: Decimal,
    pub close_price: Decimal,
    pub pips: Decimal,
    pub profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectEvent {
    pub action: ConnectAction,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    #[serde(rename = "TICK")]
    Tick(TickEvent),
    #[serde(rename = "TICK_PRICE")]
    TickPrice(TickPriceEvent),
    #[serde(rename = "TIME_FRAME")]
    TimeFrame(TimeFrameEvent),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(HeartbeatEvent),
    #[serde(rename = "SIGNAL")]
    Signal(SignalEvent),
    #[serde(rename = "ORDER")]
    Order(OrderEvent),
    #[serde(rename = "MARKET_OPEN")]
    MarketOpen(MarketOpenEvent),
    #[serde(rename = "MARKET_CLOSE")]
    MarketClose(MarketCloseEvent),
    #[serde(rename = "TRADE_OPENED")]
    TradeOpened(TradeOpenedEvent),
    #[serde(rename = "TRADE_CLOSED")]
    TradeClosed(TradeClosedEvent),
    #[serde(rename = "CONNECT")]
    Connect(ConnectEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    TickPrice,
    TimeFrame,
    Heartbeat,
    Signal,
    Order,
    MarketOpen,
    MarketClose,
    TradeOpened,
    TradeClosed,
    Connect,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Tick => "TICK",
            EventKind::TickPrice => "TICK_PRICE",
            EventKind::TimeFrame => "TIME_FRAME",
            EventKind::Heartbeat => "HEARTBEAT",
            EventKind::Signal => "SIGNAL",
            EventKind::Order => "ORDER",
            EventKind::MarketOpen => "MARKET_OPEN",
            EventKind::MarketClose => "MARKET_CLOSE",
            EventKind::TradeOpened => "TRADE_OPENED",
            EventKind::TradeClosed => "TRADE_CLOSED",
            EventKind::Connect => "CONNECT",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("event encode failed: {0}")]
    Encode(serde_json::Error),
    #[error("event decode failed: {0}")]
    Decode(serde_json::Error),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick(_) => EventKind::Tick,
            Event::TickPrice(_) => EventKind::TickPrice,
            Event::TimeFrame(_) => EventKind::TimeFrame,
            Event::Heartbeat(_) => EventKind::Heartbeat,
            Event::Signal(_) => EventKind::Signal,
            Event::Order(_) => EventKind::Order,
            Event::MarketOpen(_) => EventKind::MarketOpen,
            Event::MarketClose(_) => EventKind::MarketClose,
            Event::TradeOpened(_) => EventKind::TradeOpened,
            Event::TradeClosed(_) => EventKind::TradeClosed,
            Event::Connect(_) => EventKind::Connect,
        }
    }

    /// Timestamp carried by the event payload.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Event::Tick(e) => e.time,
            Event::TickPrice(e) => e.time,
            Event::TimeFrame(e) => e.time,
            Event::Heartbeat(e) => e.time,
            Event::Signal(e) => e.time,
            Event::Order(e) => e.time,
            Event::MarketOpen(e) => e.time,
            Event::MarketClose(e) => e.time,
            Event::TradeOpened(e) => e.time,
            Event::TradeClosed(e) => e.time,
            Event::Connect(e) => e.time,
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Event, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 4, 10, 9, 7, 56).unwrap()
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::Tick(TickEvent {
                instrument: "EURUSD".into(),
                time: ts(),
                bid: dec!(1.10450),
                ask: dec!(1.10462),
            }),
            Event::TickPrice(TickPriceEvent {
                broker: "MOCK".into(),
                instrument: "USDJPY".into(),
                time: ts(),
                bid: dec!(110.04),
                ask: dec!(110.06),
            }),
            Event::TimeFrame(TimeFrameEvent {
                timeframe: TimeFrame::H1,
                current: ts(),
                previous: ts(),
                time: ts(),
            }),
            Event::Heartbeat(HeartbeatEvent { counter: 42, time: ts() }),
            Event::Signal(SignalEvent {
                instrument: "EURUSD".into(),
                side: Side::Buy,
                units: None,
                time: ts(),
            }),
            Event::Order(OrderEvent {
                instrument: "EURUSD".into(),
                side: Side::Sell,
                units: dec!(1000),
                action: OrderAction::Open,
                take_profit: Some(dec!(1.10900)),
                stop_loss: None,
                trailing_stop: None,
                time: ts(),
            }),
            Event::MarketOpen(MarketOpenEvent { time: ts() }),
            Event::MarketClose(MarketCloseEvent { time: ts() }),
            Event::TradeOpened(TradeOpenedEvent {
                trade_id: "T-1".into(),
                instrument: "EURUSD".into(),
                side: Side::Buy,
                units: dec!(1000),
                price: dec!(1.10462),
                time: ts(),
            }),
            Event::TradeClosed(TradeClosedEvent {
                trade_id: "T-1".into(),
                instrument: "EURUSD".into(),
                side: Side::Buy,
                units: dec!(1000),
                open_price: dec!(1.10462),
                close_price: dec!(1.10512),
                pips: dec!(5.0),
                profit: dec!(5000.00),
                opened_at: ts(),
                time: ts(),
            }),
            Event::Connect(ConnectEvent { action: ConnectAction::Connect, time: ts() }),
        ]
    }

    #[test]
    fn wire_round_trip_is_exact() {
        for event in sample_events() {
            let bytes = event.to_wire().unwrap();
            let back = Event::from_wire(&bytes).unwrap();
            assert_eq!(event, back);
        }
    }

    #[test]
    fn decimal_survives_round_trip_as_string() {
        let event = Event::Tick(TickEvent {
            instrument: "EURUSD".into(),
            time: ts(),
            bid: dec!(1.10450),
            ask: dec!(1.10462),
        });
        let text = String::from_utf8(event.to_wire().unwrap()).unwrap();
        assert!(text.contains("\"1.10450\""), "decimal not exact in {text}");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let raw = br#"{"kind":"HEARTBEAT","counter":1,"time":"2019-04-10T09:07:56Z","socket":"0x7f"}"#;
        assert!(Event::from_wire(raw).is_err());
    }

    #[test]
    fn malformed_decimal_is_rejected() {
        let raw = br#"{"kind":"TICK","instrument":"EURUSD","time":"2019-04-10T09:07:56Z","bid":"1.10x","ask":"1.10462"}"#;
        assert!(Event::from_wire(raw).is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let raw = br#"{"kind":"SIGNAL","instrument":"EURUSD","time":"2019-04-10T09:07:56Z"}"#;
        assert!(Event::from_wire(raw).is_err());
    }
}
