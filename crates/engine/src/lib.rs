//! Fabula Engine library.
//!
//! This crate contains the server-side core of Fabula: the session-turn
//! orchestrator, the streaming-delivery layer, and the AI platform
//! abstraction behind it.
//!
//! ## Structure
//!
//! - `status_schema` - ordered status-field codec and response schema
//! - `infrastructure/` - AI platform ports and adapters, persistence ports
//! - `streams/` - stream registry, image cache, workshop event broker
//! - `use_cases/` - turn orchestration
//! - `api/` - HTTP/SSE delivery boundary
//! - `app` - application composition

pub mod api;
pub mod app;
pub mod infrastructure;
pub mod status_schema;
pub mod streams;
pub mod use_cases;

pub use app::App;
