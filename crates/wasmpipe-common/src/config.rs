//! Configuration structures for wasmpipe.
//!
//! This module defines:
//! - [`PoolConfig`]: instance pool bounds and policy, parsed from the
//!   externally supplied string-keyed map with a strict key schema
//! - [`BuilderKind`]: the ABI adapter discriminator for a stage
//! - [`StageSpec`]: one middleware stage descriptor
//! - [`EngineConfig`] / [`ExecutionConfig`]: Wasmtime engine settings and
//!   per-invocation execution limits

use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::ConfigError;

/// The recognized external pool configuration keys.
///
/// Anything else is a configuration error at provisioning time.
const POOL_KEYS: &[&str] = &[
    "LIFO",
    "TestOnCreate",
    "TestOnBorrow",
    "TestOnReturn",
    "TestWhileIdle",
    "BlockWhenExhausted",
    "MaxTotal",
    "MaxIdle",
    "MinIdle",
    "NumTestsPerEvictionRun",
    "MinEvictableIdleTime",
    "SoftMinEvictableIdleTime",
    "TimeBetweenEvictionRuns",
];

/// Instance pool configuration.
///
/// Defaults mirror a conventional object pool: eight instances, LIFO borrow
/// order, blocking borrows, no validation, evictor disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of instances, borrowed plus idle.
    pub max_total: usize,
    /// Maximum number of idle instances retained on return.
    pub max_idle: usize,
    /// Idle floor the evictor will not go below (and refills to).
    pub min_idle: usize,
    /// Borrow the most recently returned instance first.
    pub lifo: bool,
    /// Wait (up to the borrow deadline) when at capacity, rather than
    /// failing immediately.
    pub block_when_exhausted: bool,
    /// Validate instances as they are created.
    pub test_on_create: bool,
    /// Validate instances on borrow; failures are discarded and replaced.
    pub test_on_borrow: bool,
    /// Validate instances on return; failures are discarded.
    pub test_on_return: bool,
    /// Validate idle instances during eviction runs.
    pub test_while_idle: bool,
    /// How many idle instances each eviction run examines.
    pub num_tests_per_eviction_run: usize,
    /// Idle time after which an instance is always evictable.
    pub min_evictable_idle_time: Duration,
    /// Idle time after which an instance is evictable while the idle count
    /// exceeds `min_idle`. Zero disables the soft threshold.
    pub soft_min_evictable_idle_time: Duration,
    /// Interval between eviction runs. `None` disables the evictor.
    pub time_between_eviction_runs: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: defaults::MAX_TOTAL,
            max_idle: defaults::MAX_IDLE,
            min_idle: 0,
            lifo: true,
            block_when_exhausted: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            num_tests_per_eviction_run: defaults::NUM_TESTS_PER_EVICTION_RUN,
            min_evictable_idle_time: defaults::min_evictable_idle_time(),
            soft_min_evictable_idle_time: Duration::ZERO,
            time_between_eviction_runs: None,
        }
    }
}

impl PoolConfig {
    /// Parse a pool configuration from the externally supplied key/value map.
    ///
    /// Keys are normalized (snake_case is accepted alongside the canonical
    /// PascalCase form, `lifo` becomes `LIFO`). Unknown keys are rejected.
    /// Boolean keys treat an empty string value as `true`, so a bare
    /// directive enables the toggle. Durations accept integer milliseconds
    /// or strings such as `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the offending key for unknown keys
    /// or uninterpretable values.
    pub fn from_keys(keys: &toml::value::Table) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (raw_key, value) in keys {
            let key = normalize_key(raw_key);
            if !POOL_KEYS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownPoolKey {
                    key: raw_key.clone(),
                });
            }

            match key.as_str() {
                "LIFO" => config.lifo = parse_bool(&key, value)?,
                "TestOnCreate" => config.test_on_create = parse_bool(&key, value)?,
                "TestOnBorrow" => config.test_on_borrow = parse_bool(&key, value)?,
                "TestOnReturn" => config.test_on_return = parse_bool(&key, value)?,
                "TestWhileIdle" => config.test_while_idle = parse_bool(&key, value)?,
                "BlockWhenExhausted" => config.block_when_exhausted = parse_bool(&key, value)?,
                "MaxTotal" => config.max_total = parse_usize(&key, value)?,
                "MaxIdle" => config.max_idle = parse_usize(&key, value)?,
                "MinIdle" => config.min_idle = parse_usize(&key, value)?,
                "NumTestsPerEvictionRun" => {
                    config.num_tests_per_eviction_run = parse_usize(&key, value)?;
                }
                "MinEvictableIdleTime" => {
                    config.min_evictable_idle_time = parse_duration(&key, value)?;
                }
                "SoftMinEvictableIdleTime" => {
                    config.soft_min_evictable_idle_time = parse_duration(&key, value)?;
                }
                "TimeBetweenEvictionRuns" => {
                    config.time_between_eviction_runs = Some(parse_duration(&key, value)?);
                }
                _ => unreachable!("key checked against POOL_KEYS"),
            }
        }

        if config.max_total == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MaxTotal".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(config)
    }
}

/// Normalize an external pool key to its canonical PascalCase form.
///
/// `lifo` maps to `LIFO`; keys already starting with an uppercase letter
/// pass through unchanged; snake_case keys are converted segment-wise.
fn normalize_key(key: &str) -> String {
    if key.eq_ignore_ascii_case("lifo") {
        return "LIFO".into();
    }
    if key.chars().next().is_some_and(char::is_uppercase) {
        return key.to_string();
    }

    let mut pascal = String::with_capacity(key.len());
    for segment in key.split('_') {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            pascal.extend(first.to_uppercase());
            pascal.push_str(&chars.as_str().to_lowercase());
        }
    }
    pascal
}

fn parse_bool(key: &str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        // A bare directive carries an empty value and means "enabled".
        Value::String(s) if s.is_empty() => Ok(true),
        Value::String(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{s}'"),
        }),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}

fn parse_usize(key: &str, value: &Value) -> Result<usize, ConfigError> {
    match value {
        Value::Integer(i) if *i >= 0 => Ok(usize::try_from(*i).unwrap_or(usize::MAX)),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a non-negative integer, got {other}"),
        }),
    }
}

fn parse_duration(key: &str, value: &Value) -> Result<Duration, ConfigError> {
    match value {
        Value::Integer(ms) if *ms >= 0 => Ok(Duration::from_millis(*ms as u64)),
        Value::String(s) => parse_duration_str(s).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a duration such as '30s' or '500ms', got '{s}'"),
        }),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a duration, got {other}"),
        }),
    }
}

/// Parse a duration string with a `ms`, `s`, `m`, or `h` suffix.
fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit())?);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// The ABI adapter a stage uses, selected once at provisioning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuilderKind {
    /// Host-callable export hooks (the default for an empty discriminator).
    #[default]
    Native,
    /// Stdio JSON envelope protocol (AssemblyScript/JS-style batch guests).
    StdioJson,
    /// CGI-style environment/stdout protocol (scripting-runtime guests).
    CgiEnv,
}

impl BuilderKind {
    /// Resolve a builder discriminator string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBuilder`] for unrecognized kinds.
    pub fn parse(kind: &str) -> Result<Self, ConfigError> {
        match kind {
            "" | "native" | "go" => Ok(Self::Native),
            "js" | "asc" => Ok(Self::StdioJson),
            "php" => Ok(Self::CgiEnv),
            other => Err(ConfigError::UnknownBuilder {
                kind: other.to_string(),
            }),
        }
    }
}

/// One middleware stage descriptor, as handed to provisioning.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Path to the module bytecode.
    pub path: String,
    /// Which ABI adapter to build the stage with.
    pub builder: BuilderKind,
    /// Opaque guest configuration, serialized once and handed to the guest.
    pub guest_config: Option<Value>,
    /// Instance pool configuration for this stage.
    pub pool: PoolConfig,
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator for fast instantiation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instance slots when pooling is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Linear memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption for execution deadlines.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-invocation execution limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (roughly, instructions) per guest invocation.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Guest execution deadline in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl ExecutionConfig {
    /// Get the execution deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Default value functions for serde and `PoolConfig`.
mod defaults {
    use std::time::Duration;

    pub const MAX_TOTAL: usize = 8;
    pub const MAX_IDLE: usize = 8;
    pub const NUM_TESTS_PER_EVICTION_RUN: usize = 3;

    pub const fn min_evictable_idle_time() -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn timeout_ms() -> u64 {
        1_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, Value)]) -> toml::value::Table {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_pool_defaults() {
        let config = PoolConfig::from_keys(&toml::value::Table::new()).unwrap();
        assert_eq!(config, PoolConfig::default());
        assert_eq!(config.max_total, 8);
        assert!(config.lifo);
        assert!(config.block_when_exhausted);
        assert!(config.time_between_eviction_runs.is_none());
    }

    #[test]
    fn test_pool_unknown_key_rejected() {
        let keys = table(&[("Frobnicate", Value::Boolean(true))]);
        let err = PoolConfig::from_keys(&keys).unwrap_err();
        assert!(err.to_string().contains("Frobnicate"));
    }

    #[test]
    fn test_pool_snake_case_keys() {
        let keys = table(&[
            ("max_total", Value::Integer(2)),
            ("lifo", Value::Boolean(false)),
            ("test_on_borrow", Value::Boolean(true)),
            ("block_when_exhausted", Value::Boolean(false)),
        ]);
        let config = PoolConfig::from_keys(&keys).unwrap();
        assert_eq!(config.max_total, 2);
        assert!(!config.lifo);
        assert!(config.test_on_borrow);
        assert!(!config.block_when_exhausted);
    }

    #[test]
    fn test_pool_bare_boolean_defaults_true() {
        let keys = table(&[("TestWhileIdle", Value::String(String::new()))]);
        let config = PoolConfig::from_keys(&keys).unwrap();
        assert!(config.test_while_idle);
    }

    #[test]
    fn test_pool_durations() {
        let keys = table(&[
            ("MinEvictableIdleTime", Value::String("30s".into())),
            ("SoftMinEvictableIdleTime", Value::Integer(500)),
            ("TimeBetweenEvictionRuns", Value::String("5m".into())),
        ]);
        let config = PoolConfig::from_keys(&keys).unwrap();
        assert_eq!(config.min_evictable_idle_time, Duration::from_secs(30));
        assert_eq!(config.soft_min_evictable_idle_time, Duration::from_millis(500));
        assert_eq!(
            config.time_between_eviction_runs,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_pool_invalid_duration() {
        let keys = table(&[("MinEvictableIdleTime", Value::String("fast".into()))]);
        let err = PoolConfig::from_keys(&keys).unwrap_err();
        assert!(err.to_string().contains("MinEvictableIdleTime"));
    }

    #[test]
    fn test_pool_zero_max_total_rejected() {
        let keys = table(&[("MaxTotal", Value::Integer(0))]);
        assert!(PoolConfig::from_keys(&keys).is_err());
    }

    #[test]
    fn test_builder_kind_parse() {
        assert_eq!(BuilderKind::parse("").unwrap(), BuilderKind::Native);
        assert_eq!(BuilderKind::parse("native").unwrap(), BuilderKind::Native);
        assert_eq!(BuilderKind::parse("go").unwrap(), BuilderKind::Native);
        assert_eq!(BuilderKind::parse("js").unwrap(), BuilderKind::StdioJson);
        assert_eq!(BuilderKind::parse("asc").unwrap(), BuilderKind::StdioJson);
        assert_eq!(BuilderKind::parse("php").unwrap(), BuilderKind::CgiEnv);
        assert!(BuilderKind::parse("cobol").is_err());
    }

    #[test]
    fn test_duration_str_parsing() {
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration_str("30"), None);
        assert_eq!(parse_duration_str("s"), None);
        assert_eq!(parse_duration_str("30fortnights"), None);
    }

    #[test]
    fn test_execution_config_timeout() {
        let config = ExecutionConfig {
            timeout_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Duration::from_millis(250));
    }
}
