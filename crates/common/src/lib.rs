//! Common utilities and types shared across the chat gateway crates.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for identifier types (users, rooms, messages, connections)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for user bearer-token utilities (validation, claims, constants)
pub mod jwt;
