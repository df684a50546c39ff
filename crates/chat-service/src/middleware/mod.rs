//! HTTP middleware for the control API.
//!
//! # Components
//!
//! - `auth` - service-token check for every control route
//! - `timing` - execution-time logging and HTTP request metrics

pub mod auth;
pub mod timing;

pub use auth::{require_service_token, ServiceAuthState};
pub use timing::log_execution_time;
