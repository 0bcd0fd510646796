//! In-memory adapters for the vigil domain ports.
//!
//! One shared [`MemoryStore`] implements every repository trait over a
//! single lock, which mirrors the transactional coupling the Postgres
//! gateway provides, plus recording mock provider ports.

mod memory_store;
mod mock_ports;

pub use memory_store::MemoryStore;
pub use mock_ports::{MockChatPort, MockVoicePort, PlacedCall, SentChatEdit, SentChatMessage};
