// src/core/tasks/mod.rs

//! Long-running background tasks that keep a client's connections healthy.

pub mod idle_sweep;

pub use idle_sweep::{IdleSweeper, SweepSummary, sweep_interval};
