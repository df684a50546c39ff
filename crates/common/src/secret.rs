//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across the gateway for the Redis URL
//! (which may carry a password), the bearer-token signing secret and the
//! control API service token.
//!
//! `SecretString` implements `Debug` with redaction, so deriving `Debug` on a
//! config struct that holds one cannot leak the value through `{:?}` or a
//! tracing field. Reading the value requires an explicit `expose_secret()`.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let token = SecretString::from("svc-token");
//! assert!(!format!("{token:?}").contains("svc-token"));
//! assert_eq!(token.expose_secret(), "svc-token");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct ControlCredentials {
            service: String,
            token: SecretString,
        }

        let json = r#"{"service": "notifier", "token": "control-token-value"}"#;
        let creds: ControlCredentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.token.expose_secret(), "control-token-value");

        let debug = format!("{creds:?}");
        assert!(debug.contains("notifier"));
        assert!(!debug.contains("control-token-value"));
    }
}
