//! # trigger-dispatch
//!
//! Trigger evaluation and task dispatch for on-chain automation jobs.
//!
//! Jobs describe a trigger (a polled value condition, a contract event, or
//! a WebSocket feed) and a target contract call. The condition-based
//! scheduler runs one worker per job; satisfied triggers become signed
//! tasks that move through the `tasks:*` streams of a pluggable stream
//! store (in-process or Postgres).

pub mod config;
pub mod error;
pub mod event;
pub mod jobs;
pub mod lock;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod worker;
