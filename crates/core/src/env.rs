//! Environment variable constants used throughout the application.
//!
//! Centralized definition of all `HOOKLINE_*` environment variables to ensure
//! consistency and avoid hardcoded strings.

/// Configuration file path override (CLI arg default env)
pub const HOOKLINE_CONFIG: &str = "HOOKLINE_CONFIG";

/// Log filter override used when `RUST_LOG` is unset
pub const HOOKLINE_LOG: &str = "HOOKLINE_LOG";

/// Connection timeout override in milliseconds, applied on top of the config file
pub const HOOKLINE_CONNECTION_TIMEOUT_MS: &str = "HOOKLINE_CONNECTION_TIMEOUT_MS";
