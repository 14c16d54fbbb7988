//! Configuration sources and loading.

use super::error::{ConfigError, ConfigResult};
use super::types::Config;
use super::validation::Validator;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the configuration file when the command line
/// gives none.
pub const CONFIG_ENV: &str = "R0N_MQTT_CONFIG";

/// Environment variable overriding `broker.bind`.
pub const BIND_ENV: &str = "R0N_MQTT_BIND";

/// Where a configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults.
    Defaults,
    /// A TOML file, which must exist.
    File(PathBuf),
}

impl ConfigSource {
    /// Resolve `r0n-mqtt [config.toml]`. `args` excludes the program name;
    /// `env_path` is the value of [`CONFIG_ENV`], used when no argument is
    /// given.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Usage`] for more than one argument.
    pub fn from_args<I>(args: I, env_path: Option<OsString>) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut args = args.into_iter();
        let path = args.next();
        if let Some(extra) = args.next() {
            return Err(ConfigError::Usage(format!(
                "unexpected argument '{}'; usage: r0n-mqtt [config.toml]",
                extra.to_string_lossy()
            )));
        }
        Ok(path
            .or(env_path)
            .filter(|p| !p.is_empty())
            .map_or(Self::Defaults, |p| Self::File(PathBuf::from(p))))
    }
}

/// Builds a [`Config`] from a source, applies overrides and validates it.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    validators: Vec<Box<dyn Validator>>,
    bind: Option<String>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator; all run in order after overrides are applied.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Replace `broker.bind` with `bind` when set, typically the value of
    /// [`BIND_ENV`].
    #[must_use]
    pub fn with_bind_override(mut self, bind: Option<String>) -> Self {
        self.bind = bind.filter(|b| !b.trim().is_empty());
        self
    }

    /// Load from `source`.
    ///
    /// # Errors
    ///
    /// A missing or unreadable file, malformed TOML, or a failed validation.
    pub fn load(&self, source: &ConfigSource) -> ConfigResult<Config> {
        match source {
            ConfigSource::Defaults => self.load_str(""),
            ConfigSource::File(path) => self.load_file(path),
        }
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// See [`ConfigLoader::load`].
    pub fn load_file(&self, path: impl AsRef<Path>) -> ConfigResult<Config> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = self.load_str(&content)?;
        debug!(path = %path.display(), engine = %config.engine.name, "Loaded configuration");
        Ok(config)
    }

    /// Load from TOML text; missing sections take their defaults.
    ///
    /// # Errors
    ///
    /// Malformed TOML or a failed validation.
    pub fn load_str(&self, content: &str) -> ConfigResult<Config> {
        let mut config: Config = toml::from_str(content)?;
        if let Some(bind) = &self.bind {
            debug!(bind = %bind, "Broker bind address overridden");
            config.broker.bind.clone_from(bind);
        }
        self.validate(&config)?;
        Ok(config)
    }

    fn validate(&self, config: &Config) -> ConfigResult<()> {
        for validator in &self.validators {
            let result = validator.validate(config);
            for warning in result.warnings() {
                warn!(field = %warning.field, "{}", warning.message);
            }
            if !result.is_valid() {
                let errors: Vec<String> = result
                    .errors()
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect();
                return Err(ConfigError::ValidationError(errors.join("; ")));
            }
        }
        Ok(())
    }
}
