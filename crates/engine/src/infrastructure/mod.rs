//! External dependency implementations (ports + adapters).

pub mod memory_store;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod ports;
