//! Vigil - Interface Layer
//!
//! The HTTP surface: provider webhooks, health probes, metrics exposition
//! and the admin trigger endpoints, plus the inbox sweep that re-delivers
//! stuck events.

pub mod auth;
pub mod http;
pub mod sweep;
