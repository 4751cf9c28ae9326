// ===============================
// src/bus.rs
// ===============================
//
// In-process event bus. Producers (feed tasks, session driver) publish
// through a bounded mpsc ingress; a single dispatch loop drains it into a
// FIFO queue and presents each event to every registered handler whose
// subscription matches, in registration order. All handler state is owned
// by the dispatch thread, so the ledger needs no locks.
//
// Backpressure: the ingress channel is bounded (default 4096). `publish`
// awaits free capacity; `try_publish` fails fast with `PublishError::Full`.
// Events published by handlers and redeliveries go to the queue tail, so
// FIFO publish order is preserved.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event::{Event, EventKind};
use crate::execution::ExecutionError;
use crate::metrics::{EVENTS_ABANDONED, EVENTS_DISPATCHED, EVENTS_REDELIVERED, HANDLER_ERRORS};
use crate::position::PositionError;

/// Delivery ceiling: an event a handler keeps bouncing is abandoned after
/// this many attempts.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 10;

pub const DEFAULT_BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    All,
    Only(&'static [EventKind]),
}

impl Subscription {
    pub fn accepts(&self, kind: EventKind) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("position error: {0}")]
    Position(#[from] PositionError),
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("{0}")]
    Other(String),
}

/// What a handler wants done with the event it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Republish the event for a later attempt, bounded by
    /// `MAX_DELIVERY_ATTEMPTS`.
    Redeliver,
}

/// Follow-up events a handler wants published; appended to the queue tail
/// after the current event has been presented to every handler.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<Event>,
}

impl Outbox {
    pub fn publish(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

pub trait Handler: Send {
    fn name(&self) -> &'static str;
    fn subscription(&self) -> Subscription;
    fn process(&mut self, event: &Event, out: &mut Outbox) -> Result<Disposition, HandlerError>;
}

#[derive(Debug)]
struct Delivery {
    event: Event,
    attempts: u32,
}

impl Delivery {
    fn new(event: Event) -> Self {
        Self { event, attempts: 0 }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus is full")]
    Full,
    #[error("bus is closed")]
    Closed,
}

/// Producer half of the bus, cheap to clone across tasks.
#[derive(Clone)]
pub struct BusSender {
    tx: mpsc::Sender<Delivery>,
}

impl BusSender {
    /// Append to the queue tail, waiting for capacity when the bus is full.
    pub async fn publish(&self, event: Event) -> Result<(), PublishError> {
        self.tx
            .send(Delivery::new(event))
            .await
            .map_err(|_| PublishError::Closed)
    }

    /// Non-blocking publish for producers that prefer to drop under load.
    pub fn try_publish(&self, event: Event) -> Result<(), PublishError> {
        self.tx.try_send(Delivery::new(event)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

pub struct EventBus {
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
    pending: VecDeque<Delivery>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx,
            pending: VecDeque::new(),
        }
    }

    pub fn sender(&self) -> BusSender {
        BusSender { tx: self.tx.clone() }
    }

    /// Direct enqueue from the owning thread (backtest driver, tests).
    pub fn enqueue(&mut self, event: Event) {
        self.pending.push_back(Delivery::new(event));
    }

    fn drain_ingress(&mut self) {
        while let Ok(delivery) = self.rx.try_recv() {
            self.pending.push_back(delivery);
        }
    }

    /// Dispatch the next queued event, if any. Returns false when idle.
    pub fn run_once(&mut self, handlers: &mut [&mut dyn Handler]) -> bool {
        self.drain_ingress();
        let Some(delivery) = self.pending.pop_front() else {
            return false;
        };
        self.dispatch(delivery, handlers);
        true
    }

    /// Live dispatch loop: drains the queue, then parks on the ingress
    /// channel until the next publish.
    pub async fn run(&mut self, handlers: &mut [&mut dyn Handler]) {
        loop {
            if self.run_once(handlers) {
                continue;
            }
            match self.rx.recv().await {
                Some(delivery) => self.pending.push_back(delivery),
                None => break,
            }
        }
    }

    fn dispatch(&mut self, mut delivery: Delivery, handlers: &mut [&mut dyn Handler]) {
        let kind = delivery.event.kind();
        let mut outbox = Outbox::default();
        let mut redeliver = false;

        EVENTS_DISPATCHED.with_label_values(&[kind.as_str()]).inc();
        debug!(kind = %kind, attempts = delivery.attempts, "dispatch");

        for handler in handlers.iter_mut() {
            if !handler.subscription().accepts(kind) {
                continue;
            }
            match handler.process(&delivery.event, &mut outbox) {
                Ok(Disposition::Done) => {}
                Ok(Disposition::Redeliver) => redeliver = true,
                Err(e) => {
                    // One handler's fault never blocks delivery to others.
                    HANDLER_ERRORS.with_label_values(&[handler.name()]).inc();
                    error!(handler = handler.name(), kind = %kind, error = %e, "handler failed");
                }
            }
        }

        for event in outbox.drain() {
            self.pending.push_back(Delivery::new(event));
        }

        if redeliver {
            delivery.attempts += 1;
            if delivery.attempts >= MAX_DELIVERY_ATTEMPTS {
                EVENTS_ABANDONED.inc();
                error!(kind = %kind, attempts = delivery.attempts, "delivery abandoned");
            } else {
                EVENTS_REDELIVERED.inc();
                warn!(kind = %kind, attempts = delivery.attempts, "redelivering");
                self.pending.push_back(delivery);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
