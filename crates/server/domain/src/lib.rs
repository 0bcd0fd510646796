//! Vigil - Domain Layer
//!
//! Bounded contexts of the panic-incident orchestrator:
//! - shared_kernel: ids, errors and shared value types
//! - users: travelers and watchers, E.164 normalization
//! - guardians: guardian links and contact ordering
//! - incidents: the incident state machine
//! - alerts: per-guardian alerts and voice call attempts
//! - cascade: pure cascade policy (keys, retry decisions, backoff)
//! - commands: the closed set of inbound provider commands
//! - ports: repository and provider traits adapted by infrastructure
//! - events: outbox drafts and dispatch payloads
//! - ui_strings: Russian user-facing string catalog

pub mod alerts;
pub mod cascade;
pub mod commands;
pub mod events;
pub mod guardians;
pub mod incidents;
pub mod ports;
pub mod shared_kernel;
pub mod ui_strings;
pub mod users;

pub use shared_kernel::{DomainError, Result};
