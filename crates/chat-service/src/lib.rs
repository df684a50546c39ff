//! Chat Service Library
//!
//! Realtime chat gateway: accepts persistent WebSocket connections, tracks
//! which users and rooms are live, routes typed messages between
//! participants and fans them out across instances through a shared broker,
//! so horizontally scaled nodes present one logical chat space.
//!
//! # Architecture
//!
//! ```text
//! WebSocket frame
//!   -> handshake (connect time only)
//!   -> ConnectionRegistry (register)
//!   -> DeliveryService (decode, dispatch by kind)
//!        -> local send via ConnectionRegistry
//!        -> or publish -> broker -> every instance's subscriber
//!             -> local delivery, or offline mailbox
//! ```
//!
//! Connections are per instance. Room membership, offline mailboxes and
//! cluster presence live in the shared store (Redis) so every instance sees
//! them.
//!
//! # Modules
//!
//! - [`protocol`] - wire envelope and decoding rules
//! - [`registry`] - local user -> connection map
//! - [`rooms`] - room membership tracker
//! - [`handshake`] - WebSocket upgrade authentication
//! - [`fanout`] - broker publish/subscribe
//! - [`delivery`] - lifecycle, dispatch and control operations
//! - [`store`] - membership, mailbox and presence backends
//! - [`archive`] - persistence collaborator client
//! - [`retry`] - retry policy
//! - [`routes`], [`handlers`], [`middleware`] - HTTP surface
//! - [`config`], [`errors`], [`observability`]

pub mod archive;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod fanout;
pub mod handlers;
pub mod handshake;
pub mod middleware;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod rooms;
pub mod routes;
pub mod store;
