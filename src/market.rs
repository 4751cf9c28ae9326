// ===============================
// src/market.rs
// ===============================
//
// Instrument pip semantics, lot conversion, candle periods and the weekly
// forex schedule. All price arithmetic is rust_decimal; realized figures
// are quantized with round-half-down (midpoint toward zero).

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::event::Side;

/// 1 standard lot = 100,000 units of base currency.
pub const UNITS_PER_LOT: Decimal = dec!(100000);

/// Decimal places used when quantizing pip distances.
pub const PIP_SCALE: u32 = 5;

/// Decimal places used when quantizing realized profit.
pub const PROFIT_SCALE: u32 = 2;

/// Pip size for an instrument: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
pub fn pip_unit(instrument: &str) -> Decimal {
    if instrument.to_ascii_uppercase().ends_with("JPY") {
        dec!(0.01)
    } else {
        dec!(0.0001)
    }
}

/// Round half-down as the ledger does everywhere: midpoints toward zero.
pub fn quantize(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointTowardZero)
}

/// Signed pip distance from `open_price` to `close_price` for a position
/// on `side`, quantized to `PIP_SCALE`.
pub fn profit_pips(instrument: &str, open_price: Decimal, close_price: Decimal, side: Side) -> Decimal {
    let distance = (close_price - open_price) * side.sign() / pip_unit(instrument);
    quantize(distance, PIP_SCALE)
}

pub fn units_to_lots(units: Decimal) -> Decimal {
    quantize(units / UNITS_PER_LOT, PROFIT_SCALE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

pub const ALL_TIMEFRAMES: [TimeFrame; 6] = [
    TimeFrame::M5,
    TimeFrame::M15,
    TimeFrame::M30,
    TimeFrame::H1,
    TimeFrame::H4,
    TimeFrame::D1,
];

impl TimeFrame {
    pub fn seconds(&self) -> i64 {
        match self {
            TimeFrame::M5 => 5 * 60,
            TimeFrame::M15 => 15 * 60,
            TimeFrame::M30 => 30 * 60,
            TimeFrame::H1 => 60 * 60,
            TimeFrame::H4 => 4 * 60 * 60,
            TimeFrame::D1 => 24 * 60 * 60,
        }
    }

    /// Floor `now` to the candle this period is currently in (UTC buckets).
    pub fn candle_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = now.timestamp();
        let bucket = secs - secs.rem_euclid(self.seconds());
        DateTime::<Utc>::from_timestamp(bucket, 0).unwrap_or(now)
    }
}

/// Whether the market accepts ticks at `now`.
pub trait MarketSchedule: Send {
    fn is_open(&self, now: DateTime<Utc>) -> bool;
}

/// The standard forex week: closed from Friday 20:00 UTC, reopening
/// after Sunday 22:59 UTC, and on New Year's Day outside those same
/// hours.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForexWeekSchedule;

impl MarketSchedule for ForexWeekSchedule {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        const HOLIDAYS: [(u32, u32); 1] = [(1, 1)];

        match now.weekday() {
            chrono::Weekday::Sat => return false,
            chrono::Weekday::Fri => return now.hour() < 20,
            chrono::Weekday::Sun => return now.hour() > 22,
            _ => {}
        }
        for (day, month) in HOLIDAYS {
            if now.day() == day && now.month() == month {
                return now.hour() < 20 || now.hour() > 22;
            }
        }
        true
    }
}

/// Schedule stub used by backtests and unit tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOpen;

impl MarketSchedule for AlwaysOpen {
    fn is_open(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pip_unit_depends_on_quote_currency() {
        assert_eq!(pip_unit("EURUSD"), dec!(0.0001));
        assert_eq!(pip_unit("GBPUSD"), dec!(0.0001));
        assert_eq!(pip_unit("USDJPY"), dec!(0.01));
        assert_eq!(pip_unit("eurjpy"), dec!(0.01));
    }

    #[test]
    fn pips_signed_by_side() {
        let pips = profit_pips("EURUSD", dec!(1.10000), dec!(1.10050), Side::Buy);
        assert_eq!(pips, dec!(5.00000));
        let pips = profit_pips("EURUSD", dec!(1.10000), dec!(1.10050), Side::Sell);
        assert_eq!(pips, dec!(-5.00000));
        let pips = profit_pips("USDJPY", dec!(110.00), dec!(109.80), Side::Sell);
        assert_eq!(pips, dec!(20.00000));
    }

    #[test]
    fn quantize_rounds_midpoint_toward_zero() {
        assert_eq!(quantize(dec!(1.005), 2), dec!(1.00));
        assert_eq!(quantize(dec!(-1.005), 2), dec!(-1.00));
        assert_eq!(quantize(dec!(1.006), 2), dec!(1.01));
    }

    #[test]
    fn lots_conversion() {
        assert_eq!(units_to_lots(dec!(100000)), dec!(1.00));
        assert_eq!(units_to_lots(dec!(25000)), dec!(0.25));
    }

    #[test]
    fn candle_time_floors_to_period() {
        let now = Utc.with_ymd_and_hms(2019, 4, 10, 9, 37, 12).unwrap();
        assert_eq!(
            TimeFrame::M5.candle_time(now),
            Utc.with_ymd_and_hms(2019, 4, 10, 9, 35, 0).unwrap()
        );
        assert_eq!(
            TimeFrame::H1.candle_time(now),
            Utc.with_ymd_and_hms(2019, 4, 10, 9, 0, 0).unwrap()
        );
        assert_eq!(
            TimeFrame::H4.candle_time(now),
            Utc.with_ymd_and_hms(2019, 4, 10, 8, 0, 0).unwrap()
        );
        assert_eq!(
            TimeFrame::D1.candle_time(now),
            Utc.with_ymd_and_hms(2019, 4, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn weekend_is_closed() {
        let schedule = ForexWeekSchedule;
        let saturday = Utc.with_ymd_and_hms(2019, 4, 13, 12, 0, 0).unwrap();
        assert!(!schedule.is_open(saturday));
        let friday_late = Utc.with_ymd_and_hms(2019, 4, 12, 21, 0, 0).unwrap();
        assert!(!schedule.is_open(friday_late));
        let sunday_open = Utc.with_ymd_and_hms(2019, 4, 14, 23, 0, 0).unwrap();
        assert!(schedule.is_open(sunday_open));
        let wednesday = Utc.with_ymd_and_hms(2019, 4, 10, 9, 0, 0).unwrap();
        assert!(schedule.is_open(wednesday));
    }
}
