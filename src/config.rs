// Configuration handling for the recovery engine
// Tunables, policy overrides and logging settings, loadable from YAML, TOML and the environment
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::classifier::ErrorClassifier;
use crate::error::{ConfigError, Result};
use crate::logging::utils::{config_loading_span, log_config_validation};
use crate::logging::{LogConfig, LogFormat};
use crate::policy::{RecoveryPolicy, RecoveryStrategy};
use crate::recovery::{RecoveryEngine, RecoveryExecutor};
use crate::taxonomy::ErrorKind;

pub const ENV_MAX_RETRY_ATTEMPTS: &str = "RECOVERY_MAX_RETRY_ATTEMPTS";
pub const ENV_BASE_DELAY_MS: &str = "RECOVERY_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "RECOVERY_MAX_DELAY_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "RECOVERY_BACKOFF_MULTIPLIER";
pub const ENV_JITTER: &str = "RECOVERY_JITTER";
pub const ENV_CIRCUIT_BREAKER_THRESHOLD: &str = "RECOVERY_CIRCUIT_BREAKER_THRESHOLD";
pub const ENV_CIRCUIT_BREAKER_TIMEOUT_MS: &str = "RECOVERY_CIRCUIT_BREAKER_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "RECOVERY_LOG_LEVEL";

/// Tunables shared by every strategy of one executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfiguration {
    pub max_retry_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub circuit_breaker_threshold: u32,
    #[serde(rename = "circuit_breaker_timeout_ms", with = "duration_ms")]
    pub circuit_breaker_timeout: Duration,
}

impl Default for RecoveryConfiguration {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }
}

impl RecoveryConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_circuit_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.circuit_breaker_timeout = timeout;
        self
    }

    /// Check every bound; all violations are reported together
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.max_retry_attempts == 0 {
            errors.push("max_retry_attempts must be greater than 0".to_string());
        }
        if self.base_delay.is_zero() {
            errors.push("base_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            errors.push(format!(
                "max_delay_ms ({}) must be at least base_delay_ms ({})",
                self.max_delay.as_millis(),
                self.base_delay.as_millis()
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            errors.push(format!(
                "backoff_multiplier must be a finite number greater than 1 (got {})",
                self.backoff_multiplier
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            errors.push("circuit_breaker_threshold must be greater than 0".to_string());
        }
        if self.circuit_breaker_timeout.is_zero() {
            errors.push("circuit_breaker_timeout_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed {
                message: format!("{} invalid recovery setting(s)", errors.len()),
                file_path: None,
                errors,
            }
            .into())
        }
    }
}

/// `[logging]` section of an engine config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingSection {
    pub fn parsed_level(&self) -> Result<tracing::Level> {
        tracing::Level::from_str(&self.level).map_err(|_| {
            ConfigError::InvalidValue {
                message: format!("Unknown log level '{}'", self.level),
                field: "logging.level".to_string(),
                value: self.level.clone(),
                expected: "trace, debug, info, warn or error".to_string(),
            }
            .into()
        })
    }

    /// Logging setup for a library host; CLI flags take precedence in the binary
    pub fn to_log_config(&self) -> Result<LogConfig> {
        Ok(LogConfig {
            level: self.parsed_level()?,
            format: self.format.clone(),
            ..LogConfig::default()
        })
    }
}

/// Complete engine configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub recovery: RecoveryConfiguration,
    /// Per-kind overrides, merged over the built-in policy table
    pub policies: HashMap<ErrorKind, Vec<RecoveryStrategy>>,
    pub logging: LoggingSection,
}

impl EngineConfig {
    /// Load from a `.yaml`, `.yml` or `.toml` file and validate
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
                suggestion: Some(
                    "Create a recovery.yaml file or pass --config with an existing path"
                        .to_string(),
                ),
            }
            .into());
        }

        if !path.is_file() {
            return Err(ConfigError::InvalidValue {
                message: "Configuration path is not a file".to_string(),
                field: "config_path".to_string(),
                value: path.display().to_string(),
                expected: "file path".to_string(),
            }
            .into());
        }

        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IOError {
            message: e.to_string(),
            path: Some(path.to_path_buf()),
        })?;

        let _span = config_loading_span(path).entered();
        let config = match format {
            ConfigFormat::Yaml => Self::parse_yaml(&content, Some(path))?,
            ConfigFormat::Toml => Self::parse_toml(&content, Some(path))?,
        };
        if let Err(e) = config.validate() {
            log_config_validation(path, false);
            return Err(attach_path(e, path));
        }
        log_config_validation(path, true);
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::parse_yaml(yaml, None)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        let config = Self::parse_toml(toml, None)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(yaml: &str, path: Option<&Path>) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            let mut config_error = *Box::<ConfigError>::from(e);
            if let ConfigError::InvalidYaml {
                ref mut file_path, ..
            } = config_error
            {
                *file_path = path.map(Path::to_path_buf);
            }
            config_error.into()
        })
    }

    fn parse_toml(toml: &str, path: Option<&Path>) -> Result<Self> {
        toml::from_str(toml).map_err(|e| {
            let mut config_error = *Box::<ConfigError>::from(e);
            if let ConfigError::InvalidToml {
                ref mut file_path, ..
            } = config_error
            {
                *file_path = path.map(Path::to_path_buf);
            }
            config_error.into()
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.recovery.validate()?;
        RecoveryPolicy::from_entries(self.policies.clone())?;
        self.logging.parsed_level()?;
        Ok(())
    }

    /// Built-in table with this file's overrides applied
    pub fn effective_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::default().merged(&self.policies)
    }

    /// Apply `RECOVERY_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(std::env::vars())
    }

    /// Apply `RECOVERY_*` overrides from an explicit variable list, then revalidate
    pub fn apply_env_overrides_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                ENV_MAX_RETRY_ATTEMPTS => {
                    self.recovery.max_retry_attempts = parse_env(key, value, "positive integer")?;
                }
                ENV_BASE_DELAY_MS => {
                    self.recovery.base_delay =
                        Duration::from_millis(parse_env(key, value, "milliseconds")?);
                }
                ENV_MAX_DELAY_MS => {
                    self.recovery.max_delay =
                        Duration::from_millis(parse_env(key, value, "milliseconds")?);
                }
                ENV_BACKOFF_MULTIPLIER => {
                    self.recovery.backoff_multiplier =
                        parse_env(key, value, "number greater than 1")?;
                }
                ENV_JITTER => {
                    self.recovery.jitter = parse_bool(key, value)?;
                }
                ENV_CIRCUIT_BREAKER_THRESHOLD => {
                    self.recovery.circuit_breaker_threshold =
                        parse_env(key, value, "positive integer")?;
                }
                ENV_CIRCUIT_BREAKER_TIMEOUT_MS => {
                    self.recovery.circuit_breaker_timeout =
                        Duration::from_millis(parse_env(key, value, "milliseconds")?);
                }
                ENV_LOG_LEVEL => {
                    self.logging.level = value.to_lowercase();
                }
                _ => continue,
            }
            tracing::debug!(variable = key, "Applied environment override");
        }

        self.validate()
    }

    pub fn build_executor(&self) -> Result<RecoveryExecutor> {
        RecoveryExecutor::new(self.recovery.clone(), self.effective_policy())
    }

    pub fn build_engine(&self) -> Result<RecoveryEngine> {
        Ok(RecoveryEngine::new(
            ErrorClassifier::new(),
            self.build_executor()?,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
                expected: ".yaml, .yml or .toml".to_string(),
            }
            .into()),
        }
    }
}

fn attach_path(error: crate::error::RecoveryError, path: &Path) -> crate::error::RecoveryError {
    match error {
        crate::error::RecoveryError::Config(mut config_error) => {
            if let ConfigError::ValidationFailed {
                ref mut file_path, ..
            } = *config_error
            {
                *file_path = Some(PathBuf::from(path));
            }
            crate::error::RecoveryError::Config(config_error)
        }
        other => other,
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str, expected: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ConfigError::InvalidValue {
            message: format!("Cannot parse {key}"),
            field: key.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
        .into()
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            message: format!("Cannot parse {key}"),
            field: key.to_string(),
            value: value.to_string(),
            expected: "true or false".to_string(),
        }
        .into()),
    }
}

/// Serialize a `Duration` as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
