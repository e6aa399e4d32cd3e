//! Delivery boundary (HTTP + SSE).

pub mod http;
