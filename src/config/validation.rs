//! Configuration validation system.

use super::types::Config;
use crate::packet::MAX_REMAINING_LENGTH;
use std::net::SocketAddr;
use std::time::Duration;

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation errors.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &Config) -> ValidationResult;
}

/// Built-in validator for basic configuration checks.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn require_nonzero(result: &mut ValidationResult, field: &str, value: Duration) {
    if value.is_zero() {
        result.add_error(ValidationError::error(field, "Interval cannot be zero"));
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &Config) -> ValidationResult {
        let mut result = ValidationResult::new();
        let engine = &config.engine;

        if engine.name.is_empty() {
            result.add_error(ValidationError::error(
                "engine.name",
                "Engine name cannot be empty",
            ));
        }

        require_nonzero(&mut result, "engine.resend_interval", engine.resend_interval);
        require_nonzero(&mut result, "engine.connect_timeout", engine.connect_timeout);
        require_nonzero(&mut result, "engine.blocking_timeout", engine.blocking_timeout);
        require_nonzero(&mut result, "engine.stats_interval", engine.stats_interval);

        if !(2..=MAX_REMAINING_LENGTH).contains(&engine.max_packet_size) {
            result.add_error(ValidationError::error(
                "engine.max_packet_size",
                format!("Packet size must be between 2 and {MAX_REMAINING_LENGTH}"),
            ));
        }

        if engine.read_buffer_size == 0 {
            result.add_error(ValidationError::error(
                "engine.read_buffer_size",
                "Read buffer size cannot be 0",
            ));
        }

        if engine.events_capacity == 0 {
            result.add_error(ValidationError::error(
                "engine.events_capacity",
                "Events capacity cannot be 0",
            ));
        }

        if config.client.keep_alive > Duration::from_secs(u64::from(u16::MAX)) {
            result.add_error(ValidationError::error(
                "client.keep_alive",
                "Keep-alive cannot exceed 65535 seconds",
            ));
        }

        if config.broker.bind.parse::<SocketAddr>().is_err() {
            result.add_error(ValidationError::error(
                "broker.bind",
                format!("Invalid bind address: {}", config.broker.bind),
            ));
        }

        if config.broker.max_client_id_len == 0 {
            result.add_error(ValidationError::error(
                "broker.max_client_id_len",
                "Client id length limit cannot be 0",
            ));
        }

        if !config.broker.allow_anonymous && config.broker.users.is_empty() {
            result.add_error(ValidationError::warning(
                "broker.users",
                "Anonymous access disabled and no users configured",
            ));
        }

        result
    }
}
