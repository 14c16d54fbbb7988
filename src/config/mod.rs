//! # Configuration
//!
//! TOML configuration for the engine, the blocking client, the mock broker
//! and logging. Durations use human-readable strings.
//!
//! ## Example Configuration
//!
//! ```toml
//! [engine]
//! name = "edge"
//! resend_interval = "30s"
//! connect_timeout = "10s"
//! blocking_timeout = "30s"
//!
//! [client]
//! keep_alive = "60s"
//! protocol = "v311"
//!
//! [broker]
//! bind = "127.0.0.1:1883"
//! allow_anonymous = true
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ConfigSource, BIND_ENV, CONFIG_ENV};
pub use types::{
    BrokerConfig, ClientConfig, Config, EngineConfig, LogFormat, LogLevel, LogOutput,
    LoggingConfig,
};
pub use validation::{
    BasicValidator, ValidationError, ValidationResult, ValidationSeverity, Validator,
};
