//! Vigil - Application Layer
//!
//! Use cases and long-running services orchestrating the domain:
//! - panic: the incident state machine use cases
//! - cascade: the cascade engine seeding alerts and driving call retries
//! - outbox: the idempotent outbound dispatcher
//! - inbox: the exactly-once inbound gate
//! - scheduler: the durable action runner
//! - commands: inbound command dispatch
//! - telemetry: Prometheus metrics shared across services

pub mod cascade;
pub mod commands;
pub mod inbox;
pub mod outbox;
pub mod panic;
pub mod scheduler;
pub mod telemetry;
