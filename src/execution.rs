// ===============================
// src/execution.rs
// ===============================
//
// Order placement boundary. The core only depends on the BrokerClient
// capability; broker wire protocols live behind it. The handler keeps
// broker calls fire-and-forget under the dispatch loop: failures are
// transient, logged, and never fatal.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{Disposition, Handler, HandlerError, Outbox, Subscription};
use crate::event::{Event, EventKind, OrderAction, OrderEvent, Side};
use crate::metrics::ORDERS;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Single capability interface over broker order operations; one concrete
/// implementation per broker.
pub trait BrokerClient: Send {
    fn name(&self) -> &'static str;

    /// Place a market order; returns the broker trade id.
    fn market_order(&mut self, order: &OrderEvent) -> Result<String, ExecutionError>;

    /// Close an open position (optionally a percentage of it); returns the
    /// broker trade ids closed.
    fn close_position(
        &mut self,
        instrument: &str,
        side: Side,
        percent: Option<Decimal>,
    ) -> Result<Vec<String>, ExecutionError>;
}

/// Broker stub for backtests and the mock feed: every order fills
/// immediately at the requested terms.
pub struct SimulatedBroker {
    next_id: u64,
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    fn next_trade_id(&mut self) -> String {
        let id = format!("SIM-{}", self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for SimulatedBroker {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn market_order(&mut self, order: &OrderEvent) -> Result<String, ExecutionError> {
        let trade_id = self.next_trade_id();
        info!(
            trade_id = %trade_id,
            instrument = %order.instrument,
            side = ?order.side,
            units = %order.units,
            "simulated market order filled"
        );
        Ok(trade_id)
    }

    fn close_position(
        &mut self,
        instrument: &str,
        side: Side,
        _percent: Option<Decimal>,
    ) -> Result<Vec<String>, ExecutionError> {
        let trade_id = self.next_trade_id();
        info!(trade_id = %trade_id, instrument = %instrument, side = ?side, "simulated close");
        Ok(vec![trade_id])
    }
}

/// Routes Order events to the broker capability.
pub struct ExecutionHandler {
    broker: Box<dyn BrokerClient>,
}

impl ExecutionHandler {
    pub fn new(broker: Box<dyn BrokerClient>) -> Self {
        Self { broker }
    }
}

impl Handler for ExecutionHandler {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn subscription(&self) -> Subscription {
        Subscription::Only(&[EventKind::Order])
    }

    fn process(&mut self, event: &Event, _out: &mut Outbox) -> Result<Disposition, HandlerError> {
        let Event::Order(order) = event else {
            return Ok(Disposition::Done);
        };
        ORDERS.inc();
        let result = match order.action {
            OrderAction::Open => self.broker.market_order(order).map(|_| ()),
            OrderAction::Close => self
                .broker
                .close_position(&order.instrument, order.side.opposite(), None)
                .map(|_| ()),
        };
        if let Err(e) = result {
            // Transient: the ledger has already accounted for the trade.
            warn!(broker = self.broker.name(), instrument = %order.instrument, error = %e, "broker call failed");
        }
        Ok(Disposition::Done)
    }
}
