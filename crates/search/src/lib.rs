//! Search backend access and the index rotation state machine.
//!
//! Indices live behind stable aliases. `IndexRotator` builds a fresh index,
//! verifies it, and swaps the alias in one atomic backend call; its repair
//! pass converges an alias left inconsistent by an interrupted rotation.

pub mod backend;
pub mod config;
pub mod elasticsearch;
pub mod health;
pub mod index;
pub mod memory;
pub mod rotation;

pub use backend::*;
pub use config::*;
pub use elasticsearch::ElasticsearchClient;
pub use index::*;
pub use memory::{FailPoint, MemoryBackend};
pub use rotation::*;
