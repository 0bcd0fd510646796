//! Vigil - Infrastructure Layer
//!
//! Adapters for the domain ports: PostgreSQL persistence, the chat and
//! voice provider clients, and environment-driven configuration.

pub mod config;
pub mod persistence;
pub mod providers;
