// ===============================
// src/lib.rs
// ===============================
//
// Event-driven forex trading engine: one dispatch loop owns every
// handler, producers publish onto a bounded bus, and the same pipeline
// serves live trading and historical replay.

pub mod alert;
pub mod backtest;
pub mod bus;
pub mod config;
pub mod event;
pub mod execution;
pub mod feed;
pub mod market;
pub mod metrics;
pub mod portfolio;
pub mod position;
pub mod recorder;
pub mod session;
pub mod strategy;
pub mod timeframe;
