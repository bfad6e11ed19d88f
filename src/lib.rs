//! Foreman - local-first orchestrator for AI-assisted work.
//!
//! Typed tasks flow through a guarded state machine, a lease-based
//! dispatcher with WIP limits, configurable verification gates with
//! bounded retries, and a typed-port block pipeline runtime, all over a
//! single durable SQLite store with an append-only audit log.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{DomainError, DomainResult};
