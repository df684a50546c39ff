//! HTTP and WebSocket handlers.
//!
//! - `ws` - `GET /ws/chat` upgrade and per-connection socket tasks
//! - `control` - service-token protected control API

pub mod control;
pub mod ws;
