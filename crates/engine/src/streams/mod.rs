//! Streaming-delivery state: per-turn chunk streams, the transient image
//! cache, and the workshop event broker.

pub mod events;
pub mod image_cache;
pub mod registry;

pub use events::{Subscription, WorkshopEventBroker};
pub use image_cache::{ImageCache, ImageStatus, PersistFn};
pub use registry::{StreamHandle, StreamRegistry};
