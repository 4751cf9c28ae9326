// ===============================
// src/position.rs
// ===============================
//
// One open exposure in one instrument. Long positions enter at the ask
// and mark at the bid; short positions the reverse. P&L is pip distance
// times units, quantized half-down. Invariant violations (non-positive
// units, removing more than held) are programming errors and fail loudly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::event::Side;
use crate::market::{profit_pips, quantize, PROFIT_SCALE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("units must be positive, got {0}")]
    NonPositiveUnits(Decimal),
    #[error("cannot remove {requested} units from a position of {held}")]
    RemoveExceedsUnits { held: Decimal, requested: Decimal },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub units: Decimal,
    pub avg_price: Decimal,
    pub cur_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        instrument: &str,
        side: Side,
        units: Decimal,
        entry_price: Decimal,
        time: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        if units <= Decimal::ZERO {
            return Err(PositionError::NonPositiveUnits(units));
        }
        Ok(Self {
            instrument: instrument.to_string(),
            side,
            units,
            avg_price: entry_price,
            cur_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            opened_at: time,
        })
    }

    /// Signed pip distance between the average entry and the current price.
    pub fn pips(&self) -> Decimal {
        profit_pips(&self.instrument, self.avg_price, self.cur_price, self.side)
    }

    /// Grow the position; the average price becomes the size-weighted mean
    /// of all entry fills.
    pub fn add_units(&mut self, units: Decimal, fill_price: Decimal) -> Result<(), PositionError> {
        if units <= Decimal::ZERO {
            return Err(PositionError::NonPositiveUnits(units));
        }
        let new_total = self.units + units;
        self.avg_price = (self.avg_price * self.units + fill_price * units) / new_total;
        self.units = new_total;
        self.refresh_unrealized();
        Ok(())
    }

    /// Realize P&L on part (or all) of the position at the current price.
    /// Returns the realized amount, quantized half-down to two places.
    pub fn remove_units(&mut self, units: Decimal) -> Result<Decimal, PositionError> {
        if units <= Decimal::ZERO {
            return Err(PositionError::NonPositiveUnits(units));
        }
        if units > self.units {
            return Err(PositionError::RemoveExceedsUnits {
                held: self.units,
                requested: units,
            });
        }
        let realized = quantize(self.pips() * units, PROFIT_SCALE);
        self.units -= units;
        self.refresh_unrealized();
        Ok(realized)
    }

    /// Mark-to-market from the latest tick; same formula as `remove_units`
    /// without a size reduction.
    pub fn mark_price(&mut self, price: Decimal) {
        self.cur_price = price;
        self.refresh_unrealized();
    }

    pub fn is_closed(&self) -> bool {
        self.units.is_zero()
    }

    fn refresh_unrealized(&mut self) {
        self.unrealized_pnl = if self.units.is_zero() {
            Decimal::ZERO
        } else {
            quantize(self.pips() * self.units, PROFIT_SCALE)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position::open("EURUSD", Side::Buy, dec!(1000), dec!(1.10000), Utc::now()).unwrap()
    }

    #[test]
    fn open_rejects_non_positive_units() {
        let err = Position::open("EURUSD", Side::Buy, dec!(0), dec!(1.1), Utc::now()).unwrap_err();
        assert_eq!(err, PositionError::NonPositiveUnits(dec!(0)));
    }

    #[test]
    fn mark_price_recomputes_unrealized() {
        let mut pos = long_position();
        pos.mark_price(dec!(1.10050));
        // 5 pips on 1000 units
        assert_eq!(pos.unrealized_pnl, dec!(5000.00));
        pos.mark_price(dec!(1.09950));
        assert_eq!(pos.unrealized_pnl, dec!(-5000.00));
    }

    #[test]
    fn short_side_inverts_sign() {
        let mut pos =
            Position::open("EURUSD", Side::Sell, dec!(500), dec!(1.10000), Utc::now()).unwrap();
        pos.mark_price(dec!(1.09900));
        // 10 pips in favor on 500 units
        assert_eq!(pos.unrealized_pnl, dec!(5000.00));
    }

    #[test]
    fn add_units_reprices_weighted_average() {
        let mut pos = long_position();
        pos.add_units(dec!(1000), dec!(1.10100)).unwrap();
        assert_eq!(pos.units, dec!(2000));
        assert_eq!(pos.avg_price, dec!(1.10050));
    }

    #[test]
    fn remove_units_realizes_and_shrinks() {
        let mut pos = long_position();
        pos.mark_price(dec!(1.10050));
        let realized = pos.remove_units(dec!(400)).unwrap();
        assert_eq!(realized, dec!(2000.00));
        assert_eq!(pos.units, dec!(600));
        assert_eq!(pos.unrealized_pnl, dec!(3000.00));
    }

    #[test]
    fn full_remove_closes_position() {
        let mut pos = long_position();
        pos.mark_price(dec!(1.10050));
        let realized = pos.remove_units(dec!(1000)).unwrap();
        assert_eq!(realized, dec!(5000.00));
        assert!(pos.is_closed());
        assert_eq!(pos.unrealized_pnl, dec!(0));
    }

    #[test]
    fn remove_more_than_held_fails_loudly() {
        let mut pos = long_position();
        let err = pos.remove_units(dec!(1500)).unwrap_err();
        assert_eq!(
            err,
            PositionError::RemoveExceedsUnits { held: dec!(1000), requested: dec!(1500) }
        );
        assert_eq!(pos.units, dec!(1000));
    }

    #[test]
    fn jpy_pair_uses_two_decimal_pip() {
        let mut pos =
            Position::open("USDJPY", Side::Buy, dec!(1000), dec!(110.00), Utc::now()).unwrap();
        pos.mark_price(dec!(110.05));
        // 5 pips on 1000 units
        assert_eq!(pos.unrealized_pnl, dec!(5000.00));
    }

    proptest! {
        // Any sequence of adds and removes keeps units non-negative and the
        // average price inside the envelope of fill prices.
        #[test]
        fn units_never_negative_and_avg_stays_bounded(
            ops in prop::collection::vec((any::<bool>(), 1u32..5000, 100000u32..120000), 1..40)
        ) {
            let mut pos = Position::open(
                "EURUSD", Side::Buy, dec!(1000), dec!(1.10000), Utc::now(),
            ).unwrap();
            let mut min_fill = dec!(1.10000);
            let mut max_fill = dec!(1.10000);

            for (is_add, units, price_scaled) in ops {
                let units = Decimal::from(units);
                let price = Decimal::new(i64::from(price_scaled), 5);
                if is_add {
                    pos.add_units(units, price).unwrap();
                    if price < min_fill { min_fill = price; }
                    if price > max_fill { max_fill = price; }
                } else if units <= pos.units {
                    pos.remove_units(units).unwrap();
                } else {
                    prop_assert!(pos.remove_units(units).is_err());
                }
                if pos.is_closed() {
                    break;
                }
                prop_assert!(pos.units > Decimal::ZERO);
                prop_assert!(pos.avg_price >= min_fill && pos.avg_price <= max_fill);
            }
        }
    }
}
