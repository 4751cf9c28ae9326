// ===============================
// src/session.rs
// ===============================
//
// Connection lifecycle for the price session. A pure state machine
// (`Machine`) decides what to do on every driver tick; the async `run`
// task feeds it wall-clock time and the feed stream, and applies the
// actions it emits. Keeping the machine free of I/O and real time is
// what makes the timeout and give-up paths testable.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::alert::AlertSink;
use crate::bus::BusSender;
use crate::event::{
    ConnectAction, ConnectEvent, Event, HeartbeatEvent, MarketCloseEvent, MarketOpenEvent,
    TickPriceEvent,
};
use crate::feed::{FeedConnector, FeedHandle};
use crate::market::MarketSchedule;
use crate::metrics::{FEED_CONNECTED, FEED_RECONNECTS, HEARTBEATS};

/// A quote stream older than this is treated as a dead connection.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(15);
/// Connect attempts before the session gives up for good.
pub const MAX_CONNECT_ATTEMPTS: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    MarketClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_connect_attempts: u32,
    /// Cadence of driver ticks; one heartbeat is emitted per tick while
    /// connected.
    pub driver_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            driver_interval: Duration::from_secs(1),
        }
    }
}

/// What the driver should do next. Ordering within the returned batch
/// matters: teardowns precede reconnects, lifecycle events precede data.
#[derive(Debug)]
pub enum Action {
    /// Open a fresh feed stream.
    Connect,
    /// Drop the current feed stream.
    Teardown,
    /// Put an event on the bus.
    Publish(Event),
    /// Notify the operator out of band.
    Alert(String),
}

pub struct Machine {
    cfg: SessionConfig,
    state: SessionState,
    connect_attempts: u32,
    last_tick: Option<DateTime<Utc>>,
    next_connect_at: Option<DateTime<Utc>>,
    heartbeat_seq: u64,
    ever_connected: bool,
    /// Set while the market is closed; a MarketOpen event goes out with
    /// the first successful connect after reopening.
    pending_open_event: bool,
    gave_up: bool,
}

impl Machine {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            cfg,
            state: SessionState::Disconnected,
            connect_attempts: 0,
            last_tick: None,
            next_connect_at: None,
            heartbeat_seq: 0,
            ever_connected: false,
            pending_open_event: false,
            gave_up: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    fn timeout(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.cfg.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(60))
    }

    fn delay(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.cfg.reconnect_delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(15))
    }

    /// Periodic driver tick. `market_open` comes from the schedule.
    pub fn on_driver_tick(&mut self, now: DateTime<Utc>, market_open: bool) -> Vec<Action> {
        if self.gave_up {
            return Vec::new();
        }
        let mut actions = Vec::new();

        if !market_open {
            if self.state != SessionState::MarketClosed {
                if matches!(self.state, SessionState::Connected | SessionState::Connecting) {
                    actions.push(Action::Teardown);
                }
                actions.push(Action::Publish(Event::MarketClose(MarketCloseEvent {
                    time: now,
                })));
                self.state = SessionState::MarketClosed;
                self.connect_attempts = 0;
                self.next_connect_at = None;
                self.pending_open_event = true;
            }
            return actions;
        }

        match self.state {
            SessionState::MarketClosed | SessionState::Disconnected => {
                let due = self.next_connect_at.map_or(true, |at| now >= at);
                if due {
                    self.state = SessionState::Connecting;
                    actions.push(Action::Connect);
                }
            }
            SessionState::Connecting => {
                // waiting for the connect result
            }
            SessionState::Connected => {
                let stale = self
                    .last_tick
                    .map_or(false, |seen| now - seen > self.timeout());
                if stale {
                    actions.push(Action::Teardown);
                    actions.push(Action::Publish(Event::Connect(ConnectEvent {
                        action: ConnectAction::Lost,
                        time: now,
                    })));
                    self.state = SessionState::Disconnected;
                    self.next_connect_at = Some(now + self.delay());
                } else {
                    self.heartbeat_seq += 1;
                    actions.push(Action::Publish(Event::Heartbeat(HeartbeatEvent {
                        counter: self.heartbeat_seq,
                        time: now,
                    })));
                }
            }
        }
        actions
    }

    /// The feed stream came up.
    pub fn on_connected(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let action = if self.ever_connected {
            ConnectAction::Reconnect
        } else {
            ConnectAction::Connect
        };
        self.state = SessionState::Connected;
        self.connect_attempts = 0;
        self.next_connect_at = None;
        self.last_tick = Some(now);
        self.ever_connected = true;

        let mut actions = vec![Action::Publish(Event::Connect(ConnectEvent {
            action,
            time: now,
        }))];
        if self.pending_open_event {
            self.pending_open_event = false;
            actions.push(Action::Publish(Event::MarketOpen(MarketOpenEvent {
                time: now,
            })));
        }
        actions
    }

    /// The connect call failed. After the attempt ceiling the session
    /// raises exactly one alert and stays down until restarted.
    pub fn on_connect_failed(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        self.state = SessionState::Disconnected;
        self.connect_attempts += 1;
        if self.connect_attempts >= self.cfg.max_connect_attempts {
            self.gave_up = true;
            return vec![Action::Alert(format!(
                "price session unreachable after {} connect attempts, trading halted",
                self.connect_attempts
            ))];
        }
        self.next_connect_at = Some(now + self.delay());
        Vec::new()
    }

    /// A quote arrived; refreshes the staleness clock.
    pub fn on_tick_seen(&mut self, at: DateTime<Utc>) {
        self.last_tick = Some(at);
    }

    /// The stream ended on its own (EOF, task death).
    pub fn on_stream_closed(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        if self.state != SessionState::Connected {
            return Vec::new();
        }
        self.state = SessionState::Disconnected;
        self.next_connect_at = Some(now + self.delay());
        vec![
            Action::Teardown,
            Action::Publish(Event::Connect(ConnectEvent {
                action: ConnectAction::Lost,
                time: now,
            })),
        ]
    }
}

async fn next_feed_tick(handle: &mut Option<FeedHandle>) -> Option<TickPriceEvent> {
    match handle {
        Some(h) => h.ticks.recv().await,
        None => std::future::pending().await,
    }
}

/// Drives the session: schedules connects, relays quotes onto the bus,
/// emits heartbeats, and declares the stream dead when quotes go stale.
pub async fn run(
    mut machine: Machine,
    mut connector: Box<dyn FeedConnector>,
    mut alerts: Box<dyn AlertSink>,
    schedule: Box<dyn MarketSchedule + Send>,
    bus: BusSender,
    driver_interval: Duration,
) {
    let mut handle: Option<FeedHandle> = None;
    let mut ticker = interval(driver_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let open = schedule.is_open(now);
                let actions = machine.on_driver_tick(now, open);
                apply(&mut machine, &mut connector, &mut alerts, &bus, &mut handle, actions).await;
            }
            maybe_tick = next_feed_tick(&mut handle) => {
                match maybe_tick {
                    Some(tick) => {
                        machine.on_tick_seen(tick.time);
                        if bus.publish(Event::TickPrice(tick)).await.is_err() {
                            warn!("bus closed, session task stopping");
                            return;
                        }
                    }
                    None => {
                        let now = Utc::now();
                        let actions = machine.on_stream_closed(now);
                        apply(&mut machine, &mut connector, &mut alerts, &bus, &mut handle, actions).await;
                    }
                }
            }
        }
        if machine.gave_up() {
            warn!("session gave up reconnecting, task stopped");
            return;
        }
    }
}

async fn apply(
    machine: &mut Machine,
    connector: &mut Box<dyn FeedConnector>,
    alerts: &mut Box<dyn AlertSink>,
    bus: &BusSender,
    handle: &mut Option<FeedHandle>,
    actions: Vec<Action>,
) {
    let mut queue: VecDeque<Action> = actions.into();
    while let Some(action) = queue.pop_front() {
        match action {
            Action::Connect => {
                FEED_RECONNECTS.inc();
                let now = Utc::now();
                match connector.connect() {
                    Ok(h) => {
                        *handle = Some(h);
                        FEED_CONNECTED.set(1);
                        info!(feed = connector.name(), "price session connected");
                        queue.extend(machine.on_connected(now));
                    }
                    Err(e) => {
                        warn!(feed = connector.name(), error = %e, "connect failed");
                        queue.extend(machine.on_connect_failed(now));
                    }
                }
            }
            Action::Teardown => {
                *handle = None;
                FEED_CONNECTED.set(0);
            }
            Action::Publish(event) => {
                if matches!(event, Event::Heartbeat(_)) {
                    HEARTBEATS.inc();
                }
                if bus.publish(event).await.is_err() {
                    warn!("bus closed while publishing session event");
                    return;
                }
            }
            Action::Alert(message) => {
                alerts.send_alert(&message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn connected_machine() -> Machine {
        let mut m = Machine::new(SessionConfig::default());
        let actions = m.on_driver_tick(at(0), true);
        assert!(matches!(actions[0], Action::Connect));
        m.on_connected(at(0));
        m
    }

    #[test]
    fn connects_on_first_tick_when_market_open() {
        let mut m = Machine::new(SessionConfig::default());
        let actions = m.on_driver_tick(at(0), true);
        assert!(matches!(actions.as_slice(), [Action::Connect]));
        assert_eq!(m.state(), SessionState::Connecting);

        let actions = m.on_connected(at(0));
        assert!(matches!(
            actions.as_slice(),
            [Action::Publish(Event::Connect(ConnectEvent {
                action: ConnectAction::Connect,
                ..
            }))]
        ));
        assert_eq!(m.state(), SessionState::Connected);
    }

    #[test]
    fn heartbeats_while_quotes_are_fresh() {
        let mut m = connected_machine();
        m.on_tick_seen(at(10));
        let actions = m.on_driver_tick(at(30), true);
        match actions.as_slice() {
            [Action::Publish(Event::Heartbeat(hb))] => assert_eq!(hb.counter, 1),
            other => panic!("expected heartbeat, got {other:?}"),
        }
        let actions = m.on_driver_tick(at(31), true);
        match actions.as_slice() {
            [Action::Publish(Event::Heartbeat(hb))] => assert_eq!(hb.counter, 2),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn stale_quotes_tear_the_connection_down() {
        let mut m = connected_machine();
        m.on_tick_seen(at(0));

        // 60s exactly is still fresh
        let actions = m.on_driver_tick(at(60), true);
        assert!(matches!(actions.as_slice(), [Action::Publish(Event::Heartbeat(_))]));

        // 61s is stale
        let actions = m.on_driver_tick(at(61), true);
        assert!(matches!(
            actions.as_slice(),
            [
                Action::Teardown,
                Action::Publish(Event::Connect(ConnectEvent {
                    action: ConnectAction::Lost,
                    ..
                }))
            ]
        ));
        assert_eq!(m.state(), SessionState::Disconnected);

        // no reconnect before the fixed delay elapses
        assert!(m.on_driver_tick(at(70), true).is_empty());
        let actions = m.on_driver_tick(at(76), true);
        assert!(matches!(actions.as_slice(), [Action::Connect]));
    }

    #[test]
    fn gives_up_with_one_alert_after_the_attempt_ceiling() {
        let mut m = Machine::new(SessionConfig::default());
        let mut alerts = 0;
        let mut clock = 0i64;
        for _ in 0..MAX_CONNECT_ATTEMPTS {
            let actions = m.on_driver_tick(at(clock), true);
            assert!(matches!(actions.as_slice(), [Action::Connect]));
            for a in m.on_connect_failed(at(clock)) {
                if matches!(a, Action::Alert(_)) {
                    alerts += 1;
                }
            }
            clock += 16;
        }
        assert_eq!(alerts, 1);
        assert!(m.gave_up());

        // parked for good: no further connect attempts
        for _ in 0..5 {
            clock += 60;
            assert!(m.on_driver_tick(at(clock), true).is_empty());
        }
    }

    #[test]
    fn market_close_tears_down_and_reopen_reconnects() {
        let mut m = connected_machine();
        m.on_tick_seen(at(0));

        let actions = m.on_driver_tick(at(5), false);
        assert!(matches!(
            actions.as_slice(),
            [Action::Teardown, Action::Publish(Event::MarketClose(_))]
        ));
        assert_eq!(m.state(), SessionState::MarketClosed);

        // close event goes out once, not every tick
        assert!(m.on_driver_tick(at(6), false).is_empty());

        // reopen: reconnect, then MarketOpen rides with the connect event
        let actions = m.on_driver_tick(at(100), true);
        assert!(matches!(actions.as_slice(), [Action::Connect]));
        let actions = m.on_connected(at(100));
        assert!(matches!(
            actions.as_slice(),
            [
                Action::Publish(Event::Connect(ConnectEvent {
                    action: ConnectAction::Reconnect,
                    ..
                })),
                Action::Publish(Event::MarketOpen(_))
            ]
        ));
    }

    #[test]
    fn stream_eof_schedules_a_delayed_reconnect() {
        let mut m = connected_machine();
        let actions = m.on_stream_closed(at(20));
        assert!(matches!(
            actions.as_slice(),
            [Action::Teardown, Action::Publish(Event::Connect(_))]
        ));
        assert!(m.on_driver_tick(at(30), true).is_empty());
        assert!(matches!(
            m.on_driver_tick(at(35), true).as_slice(),
            [Action::Connect]
        ));
    }
}
