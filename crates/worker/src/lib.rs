//! Worker side of the job relay.
//!
//! Polls one or more brokers for jobs, hands each one to a local
//! processing backend, and reports the outcome (plus the result artifact)
//! back to the broker that issued it.

pub mod backend;
pub mod client;
pub mod config;
pub mod files;
pub mod poller;
pub mod pool;
pub mod runner;
