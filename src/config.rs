//! Kernel configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — values set on [`KernelConfig`] directly
//! 2. **Environment variables** — values from `COTEST_*` vars
//! 3. **Defaults** — [`KernelConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COTEST_STACK_SIZE` | `usize` | `stack_size` |
//! | `COTEST_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `COTEST_DEADLOCK_VERBOSE` | `bool` | `deadlock_verbose` |

use thiserror::Error;

/// Environment variable name for coroutine thread stack size.
pub const ENV_STACK_SIZE: &str = "COTEST_STACK_SIZE";
/// Environment variable name for the coroutine thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "COTEST_THREAD_NAME_PREFIX";
/// Environment variable name for verbose deadlock dumps.
pub const ENV_DEADLOCK_VERBOSE: &str = "COTEST_DEADLOCK_VERBOSE";

/// Error raised for unparseable configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong shape.
    #[error("invalid value for {var}: {value:?} ({expected})")]
    InvalidValue {
        /// The offending variable name.
        var: &'static str,
        /// The raw value found in the environment.
        value: String,
        /// What a valid value would look like.
        expected: &'static str,
    },
}

/// Configuration for one test kernel.
///
/// | Field | Default |
/// |-------|---------|
/// | `stack_size` | 2 MiB |
/// | `thread_name_prefix` | `"cotest"` |
/// | `deadlock_verbose` | true |
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Stack size for coroutine threads, in bytes.
    pub stack_size: usize,
    /// Prefix for coroutine thread names.
    pub thread_name_prefix: String,
    /// Include every waiting predicate in deadlock reports.
    pub deadlock_verbose: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stack_size: 2 * 1024 * 1024,
            thread_name_prefix: String::from("cotest"),
            deadlock_verbose: true,
        }
    }
}

impl KernelConfig {
    /// Builds the default configuration with `COTEST_*` overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `COTEST_*` environment overrides to an existing configuration.
    ///
    /// Only variables present in the environment are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but unparseable.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_STACK_SIZE) {
            self.stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_DEADLOCK_VERBOSE) {
            self.deadlock_verbose = parse_bool(ENV_DEADLOCK_VERBOSE, &val)?;
        }
        Ok(())
    }
}

fn read_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: value.to_owned(),
            expected: "a non-negative integer",
        })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_owned(),
            expected: "one of 1/0, true/false, yes/no, on/off",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.stack_size, 2 * 1024 * 1024);
        assert_eq!(config.thread_name_prefix, "cotest");
        assert!(config.deadlock_verbose);
    }

    #[test]
    fn parse_usize_rejects_garbage() {
        let err = parse_usize(ENV_STACK_SIZE, "lots").expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { var, .. } if var == ENV_STACK_SIZE));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(ENV_DEADLOCK_VERBOSE, "true"), Ok(true));
        assert_eq!(parse_bool(ENV_DEADLOCK_VERBOSE, "ON"), Ok(true));
        assert_eq!(parse_bool(ENV_DEADLOCK_VERBOSE, "0"), Ok(false));
        assert!(parse_bool(ENV_DEADLOCK_VERBOSE, "maybe").is_err());
    }
}
