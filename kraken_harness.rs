//! # Kraken Harness - Distributed Load Generation for Qserv
//!
//! A load-generation harness for a Qserv cluster. A workload configuration is
//! split across N cooperating worker processes ("slots"); each slot replays its
//! share of the workload for a bounded time and streams per-query telemetry
//! into a pluggable monitor chain.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            KRAKEN LOAD HARNESS                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CONFIG FILES → HarnessConfig → ConfigPartitioner::split(num_slots, slot)   │
//! │                                          │                                  │
//! │  RunnerManager ── one task per work item ── Connection::execute()           │
//! │        │                                                                    │
//! │        └─ record(name, fields, tags)                                        │
//! │              AddTagsMonitor → LogMonitor | InfluxDbFileMonitor              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Deterministic partitioning**: every slot gets a disjoint share, and the
//!   shares of all slots add up to exactly the original workload
//! - **Line-protocol telemetry**: InfluxDB files rotated on a fixed period
//! - **Composable monitors**: tag decorators over log or file sinks
//! - **Best-effort telemetry**: sink failures never abort the replay

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::task::{JoinHandle as TokioJoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, fmt::writer::BoxMakeWriter, layer::SubscriberExt,
    util::SubscriberInitExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Randomness
// ----------------------------------------------------------------------------
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use regex::Regex;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Harness version - follows semantic versioning
pub const HARNESS_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const HARNESS_NAME: &str = "kraken-harness";
pub const HARNESS_FULL_NAME: &str = "Qserv Kraken Load Harness";

// ----------------------------------------------------------------------------
// Monitoring Defaults
// ----------------------------------------------------------------------------

/// Seconds between rollovers of the InfluxDB file monitor
pub const DEFAULT_ROLLOVER_SECS: u64 = 3600;

/// File name template for the InfluxDB file monitor
pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "qserv-kraken-mon-%T.dat";

/// InfluxDB database named in the import header of every monitoring file
pub const DEFAULT_INFLUXDB_DB: &str = "qserv_kraken";

/// Token in a file name template replaced by the rotation start time
pub const TIMESTAMP_PLACEHOLDER: &str = "%T";

/// Compact UTC timestamp substituted for [`TIMESTAMP_PLACEHOLDER`]
pub const ROTATION_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Shortest rollover period; file names carry the rotation start to the second
pub const MIN_ROLLOVER: Duration = Duration::from_secs(1);

/// How often the background task flushes an open monitoring file
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;

/// Minimum spacing between two reports of the same sink failure
pub const SINK_ERROR_LOG_INTERVAL_SECS: u64 = 60;

/// Write buffer in front of each monitoring file
pub const FILE_WRITE_BUFFER_SIZE: usize = 64 * 1024;

// ----------------------------------------------------------------------------
// Metric Names & Tags
// ----------------------------------------------------------------------------

/// Metric recorded for every executed query
pub const QUERY_METRIC_NAME: &str = "query";

/// Metric recorded when a runner fails to obtain a connection
pub const CONNECT_METRIC_NAME: &str = "connect";

/// Tag carrying the slot number of the emitting process
pub const SLOT_TAG: &str = "slot";

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Prefix of environment variables that override configuration values
pub const CONFIG_ENV_PREFIX: &str = "KRAKEN_";

/// Default Qserv czar proxy endpoint
pub const DEFAULT_QSERV_HOST: &str = "127.0.0.1";
pub const DEFAULT_QSERV_PORT: u16 = 4040;
pub const DEFAULT_QSERV_USER: &str = "qsmaster";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Metric is the atomic unit of telemetry. Once built it is never mutated;
// decorators derive new metrics from old ones.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

/// Last stamp handed out by [`Timestamp::now_monotonic`].
static LAST_METRIC_STAMP: AtomicI64 = AtomicI64::new(i64::MIN);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current wall-clock timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Current time, never earlier than any stamp previously returned by this
    /// function in the same process.
    ///
    /// Wall clocks can step backwards; metric timestamps must not.
    pub fn now_monotonic() -> Self {
        let now = Self::now().0;
        let previous = LAST_METRIC_STAMP.fetch_max(now, AtomicOrdering::AcqRel);
        Self(previous.max(now))
    }

    /// Get nanoseconds value
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Get seconds value
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Add duration to timestamp
    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.9f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Field Values - Measured Quantities
// ----------------------------------------------------------------------------

/// The value of one metric field.
///
/// Line protocol distinguishes floats, signed and unsigned integers, booleans
/// and strings, so the variants follow that split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Floating point measurement (durations, rates)
    Float(f64),
    /// Signed integer
    Int(i64),
    /// Unsigned integer (row counts, sizes)
    UInt(u64),
    /// Boolean flag (success/failure)
    Bool(bool),
    /// Free-form text
    Text(CompactString),
}

impl FieldValue {
    /// Get the value as a float (for numeric types)
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FieldValue::Text(_) => None,
        }
    }

    /// Get the value as a bool
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Int(_) => "integer",
            FieldValue::UInt(_) => "unsigned",
            FieldValue::Bool(_) => "boolean",
            FieldValue::Text(_) => "string",
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::UInt(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

// Conversion implementations
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(v as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UInt(v as u64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(CompactString::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(CompactString::from(v))
    }
}

impl From<CompactString> for FieldValue {
    fn from(v: CompactString) -> Self {
        FieldValue::Text(v)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Fields & Tags - Keyed Measurements and Dimensions
// ----------------------------------------------------------------------------

/// Measured quantities of a metric, keyed by field name.
/// Ordered so that serialized output is stable.
pub type Fields = BTreeMap<CompactString, FieldValue>;

/// Dimensions of a metric, keyed by tag name.
pub type Tags = BTreeMap<CompactString, CompactString>;

/// Build a [`Tags`] map from `key => value` pairs.
#[macro_export]
macro_rules! tags {
    () => {
        $crate::Tags::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut tags = $crate::Tags::new();
        $(
            tags.insert(
                ::compact_str::CompactString::from($key),
                ::compact_str::CompactString::from($value),
            );
        )+
        tags
    }};
}

/// Build a [`Fields`] map from `key => value` pairs.
#[macro_export]
macro_rules! fields {
    () => {
        $crate::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::Fields::new();
        $(
            fields.insert(
                ::compact_str::CompactString::from($key),
                $crate::FieldValue::from($value),
            );
        )+
        fields
    }};
}

// ----------------------------------------------------------------------------
// 3.4 The Metric - One Observation
// ----------------------------------------------------------------------------

/// One named, tagged, timestamped observation.
///
/// Fields are private: a metric cannot be changed after construction, only
/// consumed into a new one (see [`Metric::with_default_tags`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    name: CompactString,
    fields: Fields,
    tags: Tags,
    timestamp: Timestamp,
}

impl Metric {
    /// Create a metric stamped with the current monotonic time
    pub fn new<N>(name: N, fields: Fields, tags: Tags) -> Self
    where
        N: Into<CompactString>,
    {
        Self {
            name: name.into(),
            fields,
            tags,
            timestamp: Timestamp::now_monotonic(),
        }
    }

    /// Pin the timestamp so encoded lines and rotation points are reproducible
    #[cfg(test)]
    pub(crate) fn at(self, timestamp: Timestamp) -> Self {
        Self { timestamp, ..self }
    }

    /// Merge `defaults` under this metric's own tags.
    ///
    /// On a key collision the metric's tag wins: a per-call tag is more
    /// specific than a wrapper-level default.
    pub fn with_default_tags(self, defaults: &Tags) -> Self {
        if defaults.is_empty() {
            return self;
        }
        let mut tags = defaults.clone();
        tags.extend(self.tags);
        Self { tags, ..self }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[inline]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Get a field value by key
    #[inline]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Get a tag value by key
    #[inline]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.name)?;
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", key, value)?;
        }
        write!(f, "}}")?;
        for (i, (key, value)) in self.fields.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { " " } else { "," }, key, value)?;
        }
        write!(f, " @ {}", self.timestamp)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING
// ============================================================================

/// Top-level error type for the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Check if this error should stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Config(_) | HarnessError::NotImplemented(_) | HarnessError::Internal(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            HarnessError::Config(_) => "config",
            HarnessError::Sink(_) => "sink",
            HarnessError::Encoding(_) => "encoding",
            HarnessError::Connection(_) => "connection",
            HarnessError::Io(_) => "io",
            HarnessError::Serialization(_) => "serialization",
            HarnessError::NotImplemented(_) => "not_implemented",
            HarnessError::Internal(_) => "internal",
        }
    }
}

/// Configuration loading, validation and partitioning errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration has no partitionable workload section")]
    MissingWorkload,

    #[error("Invalid partition: slot {slot} is outside [0, {num_slots})")]
    InvalidPartition { num_slots: usize, slot: usize },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures of a monitoring sink's backing store.
///
/// These are reported and counted by the sink itself and never reach the
/// code that records metrics.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to open monitoring file '{}': {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to write monitoring file '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to flush monitoring file '{}': {source}", path.display())]
    Flush { path: PathBuf, source: io::Error },
}

/// A metric that cannot be rendered as (or a line that is not) valid line protocol
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("Measurement name is empty")]
    EmptyMeasurement,

    #[error("Metric '{measurement}' has no fields")]
    NoFields { measurement: String },

    #[error("Metric '{measurement}' has an empty {kind} key")]
    EmptyKey {
        measurement: String,
        kind: &'static str,
    },

    #[error("Field '{field}' has non-finite value {value}")]
    NonFiniteFloat { field: String, value: f64 },

    #[error("Newline in {context}")]
    Newline { context: String },

    #[error("Malformed line protocol: {message}")]
    Malformed { message: String },
}

impl EncodingError {
    fn malformed(message: impl Into<String>) -> Self {
        EncodingError::Malformed {
            message: message.into(),
        }
    }
}

/// Errors raised by database connections
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {message}")]
    ConnectFailed { endpoint: String, message: String },

    #[error("Query failed: {message}")]
    QueryFailed { message: String },

    #[error("Connection closed")]
    Closed,
}

/// Result type alias for harness operations
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

// ----------------------------------------------------------------------------
// Log Throttling
// ----------------------------------------------------------------------------

/// Rate limiter for repeated error reports.
///
/// A persistently failing sink would otherwise log once per metric.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed)` when the caller should report now, where
    /// `suppressed` counts the events swallowed since the previous report.
    pub fn check(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last_report.lock();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => {
                self.suppressed.fetch_add(1, AtomicOrdering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, AtomicOrdering::Relaxed))
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(SINK_ERROR_LOG_INTERVAL_SECS))
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - One or more TOML/YAML/JSON files, later files overriding earlier ones
// - KRAKEN_* environment variable overrides
// - Command line overrides applied by the `run` subcommand
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of one harness process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Target database connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Run limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Telemetry sink
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// How the workload is split between slots
    #[serde(default)]
    pub partitioning: PartitioningConfig,

    /// Diagnostic logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Query classes to replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<Workload>,
}

impl HarnessConfig {
    /// Load and merge configuration files, then apply environment overrides.
    ///
    /// The provider for each file is chosen by its extension; anything that
    /// is not `.yaml`, `.yml` or `.json` is read as TOML.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        if paths.is_empty() {
            return Err(ConfigError::invalid_value(
                "config",
                "at least one configuration file is required",
            ));
        }

        let mut figment = Figment::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            debug!(path = %path.display(), "Merging configuration file");
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let config: Self = figment
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document (no environment overrides)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.monitor.validate()?;
        if let Some(workload) = &self.workload {
            workload.validate()?;
        }
        Ok(())
    }

    /// Compute this slot's share of the workload with the configured strategy
    pub fn split(&self, num_slots: usize, slot: usize) -> Result<HarnessConfig, ConfigError> {
        ConfigPartitioner::new(self.partitioning.strategy).split(self, num_slots, slot)
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self {
            workload: Some(Workload::example()),
            ..Self::default()
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Connection Configuration
// ----------------------------------------------------------------------------

/// Where the workload is sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Qserv czar proxy host
    #[serde(default = "default_qserv_host")]
    pub host: String,

    /// Qserv czar proxy port
    #[serde(default = "default_qserv_port")]
    pub port: u16,

    /// Database user
    #[serde(default = "default_qserv_user")]
    pub user: String,

    /// Default database for queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Replace the database with a simulated one
    #[serde(default)]
    pub dummy_db: bool,

    /// Behaviour of the simulated database
    #[serde(default)]
    pub dummy: DummyDbConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_qserv_host(),
            port: default_qserv_port(),
            user: default_qserv_user(),
            database: None,
            dummy_db: false,
            dummy: DummyDbConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid_value("connection.host", "host cannot be empty"));
        }
        self.dummy.validate()
    }
}

/// Latency, failure and result-size model of the simulated database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyDbConfig {
    /// Shortest simulated query time
    #[serde(default = "default_dummy_min_latency", with = "humantime_serde")]
    pub min_latency: Duration,

    /// Longest simulated query time
    #[serde(default = "default_dummy_max_latency", with = "humantime_serde")]
    pub max_latency: Duration,

    /// Probability in [0, 1] that a query fails
    #[serde(default)]
    pub failure_rate: f64,

    /// Upper bound on the simulated row count
    #[serde(default = "default_dummy_max_rows")]
    pub max_rows: u64,

    /// Seed for reproducible runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for DummyDbConfig {
    fn default() -> Self {
        Self {
            min_latency: default_dummy_min_latency(),
            max_latency: default_dummy_max_latency(),
            failure_rate: 0.0,
            max_rows: default_dummy_max_rows(),
            seed: None,
        }
    }
}

impl DummyDbConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_latency > self.max_latency {
            return Err(ConfigError::invalid_value(
                "connection.dummy.min_latency",
                "min_latency cannot exceed max_latency",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::invalid_value(
                "connection.dummy.failure_rate",
                format!("{} is not a probability in [0, 1]", self.failure_rate),
            ));
        }
        Ok(())
    }
}

fn default_qserv_host() -> String {
    DEFAULT_QSERV_HOST.to_string()
}

fn default_qserv_port() -> u16 {
    DEFAULT_QSERV_PORT
}

fn default_qserv_user() -> String {
    DEFAULT_QSERV_USER.to_string()
}

fn default_dummy_min_latency() -> Duration {
    Duration::from_millis(10)
}

fn default_dummy_max_latency() -> Duration {
    Duration::from_millis(100)
}

fn default_dummy_max_rows() -> u64 {
    1000
}

// ----------------------------------------------------------------------------
// 5.3 Limits & Partitioning
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Stop the run after this long; unlimited when absent
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitioningConfig {
    #[serde(default)]
    pub strategy: PartitionStrategy,
}

/// How work items are distributed over slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Item `g` goes to slot `g % num_slots`
    #[default]
    RoundRobin,
    /// Each slot takes one consecutive block of items
    Contiguous,
}

impl Display for PartitionStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStrategy::RoundRobin => write!(f, "round_robin"),
            PartitionStrategy::Contiguous => write!(f, "contiguous"),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Monitor Configuration
// ----------------------------------------------------------------------------

/// Which telemetry sink a process writes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// Telemetry disabled
    #[default]
    None,
    /// Metrics go to the diagnostic log
    Log,
    /// Metrics go to rotating InfluxDB line-protocol files
    InfluxdbFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub kind: MonitorKind,

    /// Rollover period of the InfluxDB file monitor
    #[serde(default = "default_rollover", with = "humantime_serde")]
    pub rollover: Duration,

    /// File name template; `%T` becomes the rotation start time
    #[serde(default = "default_file_name_template")]
    pub file_name_template: String,

    /// Database named in the file import header
    #[serde(default = "default_influxdb_db")]
    pub dbname: String,

    /// How often buffered monitoring output is flushed
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Extra tags attached to every metric of this process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kind: MonitorKind::None,
            rollover: default_rollover(),
            file_name_template: default_file_name_template(),
            dbname: default_influxdb_db(),
            flush_interval: default_flush_interval(),
            tags: BTreeMap::new(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rollover < MIN_ROLLOVER {
            return Err(ConfigError::invalid_value(
                "monitor.rollover",
                "rollover period must be at least one second",
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "monitor.flush_interval",
                "flush interval must be positive",
            ));
        }
        if self.kind == MonitorKind::InfluxdbFile && self.file_name_template.is_empty() {
            return Err(ConfigError::invalid_value(
                "monitor.file_name_template",
                "file name template cannot be empty",
            ));
        }
        if self.tags.keys().any(|key| key.is_empty()) {
            return Err(ConfigError::invalid_value("monitor.tags", "tag keys cannot be empty"));
        }
        Ok(())
    }

    /// Configured extra tags as a [`Tags`] map
    pub fn extra_tags(&self) -> Tags {
        self.tags
            .iter()
            .map(|(k, v)| (CompactString::from(k.as_str()), CompactString::from(v.as_str())))
            .collect()
    }
}

fn default_rollover() -> Duration {
    Duration::from_secs(DEFAULT_ROLLOVER_SECS)
}

fn default_file_name_template() -> String {
    DEFAULT_FILE_NAME_TEMPLATE.to_string()
}

fn default_influxdb_db() -> String {
    DEFAULT_INFLUXDB_DB.to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact, full)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.6 Workload Model
// ----------------------------------------------------------------------------

/// Placeholder syntax inside query templates: `{name}`
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// The partitionable part of a configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub classes: Vec<QueryClass>,
}

impl Workload {
    /// Every (class, runner) pair in canonical order: classes in
    /// configuration order, runners ascending within a class.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.classes
            .iter()
            .flat_map(|class| {
                class.runner_ids().into_iter().map(move |runner| WorkItem {
                    class: class.name.clone(),
                    runner,
                })
            })
            .collect()
    }

    pub fn class(&self, name: &str) -> Option<&QueryClass> {
        self.classes.iter().find(|class| class.name == name)
    }

    pub fn total_runners(&self) -> usize {
        self.classes.iter().map(QueryClass::runner_count).sum()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for class in &self.classes {
            if !seen.insert(class.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "workload.classes",
                    format!("duplicate query class '{}'", class.name),
                ));
            }
            class.validate()?;
        }
        Ok(())
    }

    fn example() -> Self {
        let mut queries = BTreeMap::new();
        queries.insert(
            "object_by_id".to_string(),
            "SELECT * FROM Object WHERE objectId = {object_id}".to_string(),
        );
        queries.insert(
            "cone_search".to_string(),
            "SELECT objectId FROM Object WHERE scisql_s2PtInCircle(ra, decl, {ra}, {decl}, 0.05) = 1"
                .to_string(),
        );
        let mut variables = BTreeMap::new();
        variables.insert(
            "object_id".to_string(),
            VariableSpec::IntRange {
                min: 1,
                max: 1_000_000,
            },
        );
        variables.insert("ra".to_string(), VariableSpec::FloatRange { min: 0.0, max: 360.0 });
        variables.insert("decl".to_string(), VariableSpec::FloatRange { min: -90.0, max: 90.0 });

        Self {
            classes: vec![QueryClass {
                name: "LV".to_string(),
                concurrent_queries: 4,
                runners: None,
                target_time: Some(Duration::from_secs(10)),
                max_rate: None,
                max_queries: None,
                queries,
                variables,
            }],
        }
    }
}

/// A named group of queries replayed by a fixed number of concurrent runners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClass {
    pub name: String,

    /// Number of concurrent runners in the whole cluster
    pub concurrent_queries: u32,

    /// Runner ids owned by this process; all of `0..concurrent_queries`
    /// when absent. Set by partitioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runners: Option<Vec<u32>>,

    /// Minimum time between two query starts of one runner
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub target_time: Option<Duration>,

    /// Ceiling on queries per second summed over the class's runners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate: Option<f64>,

    /// Stop each runner after this many queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queries: Option<u64>,

    /// Query templates by name
    pub queries: BTreeMap<String, String>,

    /// Values substituted for `{name}` placeholders
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableSpec>,
}

impl QueryClass {
    pub fn runner_ids(&self) -> Vec<u32> {
        match &self.runners {
            Some(ids) => ids.clone(),
            None => (0..self.concurrent_queries).collect(),
        }
    }

    pub fn runner_count(&self) -> usize {
        match &self.runners {
            Some(ids) => ids.len(),
            None => self.concurrent_queries as usize,
        }
    }

    /// Minimum interval between query starts of a single runner.
    ///
    /// `max_rate` is shared by the class's runners in this process, so each
    /// one may start a query every `runner_count / max_rate` seconds.
    pub fn pacing(&self) -> Option<Duration> {
        let rate_interval = self
            .max_rate
            .filter(|rate| *rate > 0.0)
            .map(|rate| Duration::from_secs_f64(self.runner_count() as f64 / rate));
        match (self.target_time, rate_interval) {
            (Some(target), Some(rate)) => Some(target.max(rate)),
            (target, rate) => target.or(rate),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("workload.classes.{}.{}", self.name, name);

        if self.name.is_empty() {
            return Err(ConfigError::invalid_value("workload.classes.name", "class name cannot be empty"));
        }
        if self.concurrent_queries == 0 {
            return Err(ConfigError::invalid_value(
                field("concurrent_queries"),
                "at least one runner is required",
            ));
        }
        if let Some(ids) = &self.runners {
            let unique: BTreeSet<u32> = ids.iter().copied().collect();
            if unique.len() != ids.len() || ids.iter().any(|id| *id >= self.concurrent_queries) {
                return Err(ConfigError::invalid_value(
                    field("runners"),
                    format!("runner ids must be unique and below {}", self.concurrent_queries),
                ));
            }
        }
        if let Some(rate) = self.max_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::invalid_value(field("max_rate"), "rate must be positive"));
            }
        }
        if self.queries.is_empty() {
            return Err(ConfigError::invalid_value(field("queries"), "no queries defined"));
        }
        for (name, variable) in &self.variables {
            variable.validate(&field(&format!("variables.{}", name)))?;
        }
        for (query, template) in &self.queries {
            for caps in PLACEHOLDER_RE.captures_iter(template) {
                let variable = &caps[1];
                if !self.variables.contains_key(variable) {
                    return Err(ConfigError::invalid_value(
                        field(&format!("queries.{}", query)),
                        format!("placeholder '{{{}}}' has no variable definition", variable),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Generator for the values of one query template placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariableSpec {
    /// Uniform integer in `[min, max]`
    IntRange { min: i64, max: i64 },
    /// Uniform float in `[min, max)`
    FloatRange { min: f64, max: f64 },
    /// One of the listed literals
    Choice { values: Vec<String> },
}

impl VariableSpec {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        match self {
            VariableSpec::IntRange { min, max } if min > max => {
                Err(ConfigError::invalid_value(field, "min cannot exceed max"))
            }
            VariableSpec::FloatRange { min, max } if !(min.is_finite() && max.is_finite()) || min > max => {
                Err(ConfigError::invalid_value(field, "bounds must be finite with min <= max"))
            }
            VariableSpec::Choice { values } if values.is_empty() => {
                Err(ConfigError::invalid_value(field, "choice needs at least one value"))
            }
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self {
            VariableSpec::IntRange { min, max } => rng.gen_range(*min..=*max).to_string(),
            VariableSpec::FloatRange { min, max } if min < max => rng.gen_range(*min..*max).to_string(),
            VariableSpec::FloatRange { min, .. } => min.to_string(),
            VariableSpec::Choice { values } => values.choose(rng).cloned().unwrap_or_default(),
        }
    }
}

/// Substitute every `{name}` placeholder of `template` with a fresh sample.
/// Placeholders without a variable definition are left untouched.
pub fn expand_query<R: Rng + ?Sized>(
    template: &str,
    variables: &BTreeMap<String, VariableSpec>,
    rng: &mut R,
) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| match variables.get(&caps[1]) {
            Some(generator) => generator.sample(&mut *rng),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// One runner of one query class; the unit of partitioning
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub class: String,
    pub runner: u32,
}

impl Display for WorkItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.runner)
    }
}

// ============================================================================
// SECTION 6: WORKLOAD PARTITIONING
// ============================================================================
// Every process of an N-slot run receives the same configuration and keeps
// only its own share. The split is a pure function of (config, N, slot):
// shares of distinct slots are disjoint and together they cover the whole
// workload.
// ============================================================================

/// Splits a [`HarnessConfig`] into per-slot shares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigPartitioner {
    strategy: PartitionStrategy,
}

impl ConfigPartitioner {
    pub fn new(strategy: PartitionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Indices in `0..total` owned by `slot`, ascending
    pub fn assign(&self, total: usize, num_slots: usize, slot: usize) -> Vec<usize> {
        if num_slots == 0 || slot >= num_slots {
            return Vec::new();
        }
        match self.strategy {
            PartitionStrategy::RoundRobin => (slot..total).step_by(num_slots).collect(),
            PartitionStrategy::Contiguous => {
                let base = total / num_slots;
                let extra = total % num_slots;
                let start = slot * base + slot.min(extra);
                let len = base + usize::from(slot < extra);
                (start..start + len).collect()
            }
        }
    }

    /// Derive the configuration of `slot` out of `num_slots`.
    ///
    /// The result is `config` with its workload narrowed to this slot's work
    /// items; every other section is copied unchanged. Classes that receive no
    /// runners are left out, and a class's `max_rate` is scaled by the
    /// fraction of its runners this slot owns.
    pub fn split(
        &self,
        config: &HarnessConfig,
        num_slots: usize,
        slot: usize,
    ) -> Result<HarnessConfig, ConfigError> {
        if num_slots == 0 || slot >= num_slots {
            return Err(ConfigError::InvalidPartition { num_slots, slot });
        }

        let workload = config.workload.as_ref().ok_or(ConfigError::MissingWorkload)?;
        let items = workload.work_items();
        if items.is_empty() {
            return Err(ConfigError::MissingWorkload);
        }

        let mut owned: HashMap<&str, Vec<u32>> = HashMap::new();
        for index in self.assign(items.len(), num_slots, slot) {
            let item = &items[index];
            owned.entry(item.class.as_str()).or_default().push(item.runner);
        }

        let classes: Vec<QueryClass> = workload
            .classes
            .iter()
            .filter_map(|class| {
                let ids = owned.remove(class.name.as_str())?;
                let total = class.runner_count();
                let mut share = class.clone();
                share.max_rate = class
                    .max_rate
                    .map(|rate| rate * ids.len() as f64 / total as f64);
                share.runners = Some(ids);
                Some(share)
            })
            .collect();

        debug!(
            num_slots,
            slot,
            strategy = %self.strategy,
            items = items.len(),
            classes = classes.len(),
            "Partitioned workload"
        );

        Ok(HarnessConfig {
            workload: Some(Workload { classes }),
            ..config.clone()
        })
    }
}

// ============================================================================
// SECTION 7: INFLUXDB LINE PROTOCOL
// ============================================================================
// measurement[,tag=value...] field=value[,field=value...] timestamp_ns
//
// Measurement escapes comma, space and backslash; tag keys, tag values and
// field keys also escape equals. String field values are double quoted
// with `"` and `\` escaped. Integers carry an `i` suffix, unsigned integers
// a `u` suffix.
// ============================================================================

const MEASUREMENT_SPECIALS: &[char] = &[',', ' ', '\\'];
const KEY_SPECIALS: &[char] = &[',', '=', ' ', '\\'];

/// Characters a backslash escapes when reading a line back
const ESCAPABLE: &[char] = &[',', '=', ' ', '"', '\\'];

fn escape_into(out: &mut String, raw: &str, specials: &[char]) {
    for c in raw.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn reject_newline(value: &str, context: impl FnOnce() -> String) -> Result<(), EncodingError> {
    if value.contains('\n') || value.contains('\r') {
        return Err(EncodingError::Newline { context: context() });
    }
    Ok(())
}

fn encode_field_value(
    out: &mut String,
    key: &str,
    value: &FieldValue,
) -> Result<(), EncodingError> {
    match value {
        FieldValue::Float(v) => {
            if !v.is_finite() {
                return Err(EncodingError::NonFiniteFloat {
                    field: key.to_string(),
                    value: *v,
                });
            }
            out.push_str(&v.to_string());
        }
        FieldValue::Int(v) => {
            out.push_str(&v.to_string());
            out.push('i');
        }
        FieldValue::UInt(v) => {
            out.push_str(&v.to_string());
            out.push('u');
        }
        FieldValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::Text(s) => {
            reject_newline(s, || format!("value of field '{}'", key))?;
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
    Ok(())
}

/// Render one metric as a single line of line protocol (no trailing newline).
///
/// Tags with an empty value are omitted.
pub fn encode_line(metric: &Metric) -> Result<String, EncodingError> {
    let measurement = metric.name();
    if measurement.is_empty() {
        return Err(EncodingError::EmptyMeasurement);
    }
    reject_newline(measurement, || "measurement name".to_string())?;
    if metric.fields().is_empty() {
        return Err(EncodingError::NoFields {
            measurement: measurement.to_string(),
        });
    }

    let mut line = String::with_capacity(64);
    escape_into(&mut line, measurement, MEASUREMENT_SPECIALS);

    for (key, value) in metric.tags() {
        if value.is_empty() {
            continue;
        }
        if key.is_empty() {
            return Err(EncodingError::EmptyKey {
                measurement: measurement.to_string(),
                kind: "tag",
            });
        }
        reject_newline(key, || format!("tag key '{}'", key.escape_debug()))?;
        reject_newline(value, || format!("value of tag '{}'", key))?;
        line.push(',');
        escape_into(&mut line, key, KEY_SPECIALS);
        line.push('=');
        escape_into(&mut line, value, KEY_SPECIALS);
    }

    line.push(' ');
    for (i, (key, value)) in metric.fields().iter().enumerate() {
        if key.is_empty() {
            return Err(EncodingError::EmptyKey {
                measurement: measurement.to_string(),
                kind: "field",
            });
        }
        reject_newline(key, || format!("field key '{}'", key.escape_debug()))?;
        if i > 0 {
            line.push(',');
        }
        escape_into(&mut line, key, KEY_SPECIALS);
        line.push('=');
        encode_field_value(&mut line, key, value)?;
    }

    line.push(' ');
    line.push_str(&metric.timestamp().as_nanos().to_string());
    Ok(line)
}

/// Header that lets `influx -import` load a monitoring file as-is
pub fn import_header(dbname: &str) -> String {
    if dbname.is_empty() {
        "# DML\n".to_string()
    } else {
        format!("# DML\n# CONTEXT-DATABASE: {}\n", dbname)
    }
}

/// A decoded line of line protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedLine {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: Option<i64>,
}

impl Display for ParsedLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.timestamp {
            Some(ts) => write!(f, "{} @ {}", self.measurement, Timestamp::from_nanos(ts))?,
            None => write!(f, "{}", self.measurement)?,
        }
        for (key, value) in &self.tags {
            write!(f, " {}={}", key, value)?;
        }
        write!(f, " |")?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Split `input` on every `delimiter` that is neither backslash-escaped nor,
/// when `quoted` is set, inside a double-quoted string.
fn split_unescaped(input: &str, delimiter: char, quoted: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quoted => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn split_key_value(pair: &str) -> Result<(&str, &str), EncodingError> {
    let mut escaped = false;
    for (i, c) in pair.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '=' {
            return Ok((&pair[..i], &pair[i + 1..]));
        }
    }
    Err(EncodingError::malformed(format!("missing '=' in '{}'", pair)))
}

fn unescape(raw: &str) -> CompactString {
    let mut out = CompactString::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if ESCAPABLE.contains(&next) {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn parse_field_value(raw: &str) -> Result<FieldValue, EncodingError> {
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| EncodingError::malformed(format!("unterminated string {}", raw)))?;
        return Ok(FieldValue::Text(unescape(inner)));
    }
    let invalid = || EncodingError::malformed(format!("invalid field value '{}'", raw));
    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Bool(false)),
        _ => {}
    }
    if let Some(digits) = raw.strip_suffix('i') {
        return digits.parse().map(FieldValue::Int).map_err(|_| invalid());
    }
    if let Some(digits) = raw.strip_suffix('u') {
        return digits.parse().map(FieldValue::UInt).map_err(|_| invalid());
    }
    raw.parse().map(FieldValue::Float).map_err(|_| invalid())
}

/// Parse one line of line protocol
pub fn parse_line(line: &str) -> Result<ParsedLine, EncodingError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let sections = split_unescaped(line, ' ', true);
    let (series, field_section, timestamp) = match sections.as_slice() {
        [series, fields] => (*series, *fields, None),
        [series, fields, ts] => (*series, *fields, Some(*ts)),
        _ => {
            return Err(EncodingError::malformed(format!(
                "expected 2 or 3 space-separated sections, found {}",
                sections.len()
            )))
        }
    };

    let mut series_parts = split_unescaped(series, ',', false).into_iter();
    let measurement = unescape(series_parts.next().unwrap_or_default());
    if measurement.is_empty() {
        return Err(EncodingError::EmptyMeasurement);
    }

    let mut tags = Tags::new();
    for pair in series_parts {
        let (key, value) = split_key_value(pair)?;
        tags.insert(unescape(key), unescape(value));
    }

    let mut fields = Fields::new();
    for pair in split_unescaped(field_section, ',', true) {
        let (key, value) = split_key_value(pair)?;
        fields.insert(unescape(key), parse_field_value(value)?);
    }
    if fields.is_empty() {
        return Err(EncodingError::NoFields {
            measurement: measurement.to_string(),
        });
    }

    let timestamp = timestamp
        .map(|ts| {
            ts.parse::<i64>()
                .map_err(|_| EncodingError::malformed(format!("invalid timestamp '{}'", ts)))
        })
        .transpose()?;

    Ok(ParsedLine {
        measurement: measurement.to_string(),
        tags,
        fields,
        timestamp,
    })
}

/// Read every data line of a monitoring file, skipping blanks and `#` comments
pub fn read_line_protocol_file(path: &Path) -> HarnessResult<Vec<ParsedLine>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parsed = parse_line(trimmed).map_err(|e| {
            HarnessError::Encoding(EncodingError::malformed(format!(
                "{}:{}: {}",
                path.display(),
                number + 1,
                e
            )))
        })?;
        lines.push(parsed);
    }
    Ok(lines)
}

// ============================================================================
// SECTION 8: MONITORS
// ============================================================================
// A monitor is a telemetry sink. Recording is best-effort: a monitor never
// returns an error to the caller and never panics on sink failure. Decorators
// own their child exclusively, so a chain is built once and then shared
// behind an Arc.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 The Monitor Capability
// ----------------------------------------------------------------------------

/// Destination for metrics
pub trait Monitor: Send + Sync + Debug {
    /// Record one observation stamped with the current time
    fn record(&self, name: &str, fields: Fields, tags: Tags) {
        self.submit(Metric::new(name, fields, tags));
    }

    /// Record an already built metric
    fn submit(&self, metric: Metric);

    /// Push buffered output to the backing store
    fn flush(&self) {}

    /// Short name for diagnostics
    fn kind(&self) -> &'static str;
}

impl<M: Monitor + ?Sized> Monitor for Box<M> {
    fn record(&self, name: &str, fields: Fields, tags: Tags) {
        (**self).record(name, fields, tags)
    }

    fn submit(&self, metric: Metric) {
        (**self).submit(metric)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }
}

impl<M: Monitor + ?Sized> Monitor for Arc<M> {
    fn record(&self, name: &str, fields: Fields, tags: Tags) {
        (**self).record(name, fields, tags)
    }

    fn submit(&self, metric: Metric) {
        (**self).submit(metric)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }
}

/// An absent monitor: recording into `None` does nothing at all
impl<M: Monitor> Monitor for Option<M> {
    fn record(&self, name: &str, fields: Fields, tags: Tags) {
        if let Some(monitor) = self {
            monitor.record(name, fields, tags);
        }
    }

    fn submit(&self, metric: Metric) {
        if let Some(monitor) = self {
            monitor.submit(metric);
        }
    }

    fn flush(&self) {
        if let Some(monitor) = self {
            monitor.flush();
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Some(monitor) => monitor.kind(),
            None => "none",
        }
    }
}

/// Monitor that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn submit(&self, _metric: Metric) {}

    fn kind(&self) -> &'static str {
        "null"
    }
}

// ----------------------------------------------------------------------------
// 8.2 LogMonitor - Metrics as Log Records
// ----------------------------------------------------------------------------

/// Log target of metric records
pub const METRICS_LOG_TARGET: &str = "kraken::metrics";

/// Writes one info-level record per metric to a tracing dispatcher.
///
/// Without an explicit dispatcher the process-wide subscriber is used.
#[derive(Debug, Clone, Default)]
pub struct LogMonitor {
    dispatch: Option<tracing::Dispatch>,
}

impl LogMonitor {
    pub fn new() -> Self {
        Self { dispatch: None }
    }

    /// Log through `dispatch` instead of the global subscriber
    pub fn with_dispatch(dispatch: tracing::Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }
}

/// `name tag=value,... field=value,...` in key order
pub fn format_log_line(metric: &Metric) -> String {
    let mut line = String::from(metric.name());
    if !metric.tags().is_empty() {
        line.push(' ');
        let tags: Vec<String> = metric
            .tags()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        line.push_str(&tags.join(","));
    }
    line.push(' ');
    let fields: Vec<String> = metric
        .fields()
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    line.push_str(&fields.join(","));
    line
}

fn emit_metric_record(line: &str) {
    info!(target: METRICS_LOG_TARGET, "{}", line);
}

impl Monitor for LogMonitor {
    fn submit(&self, metric: Metric) {
        let line = format_log_line(&metric);
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, || emit_metric_record(&line)),
            None => emit_metric_record(&line),
        }
    }

    fn kind(&self) -> &'static str {
        "log"
    }
}

// ----------------------------------------------------------------------------
// 8.3 InfluxDbFileMonitor - Rotating Line-Protocol Files
// ----------------------------------------------------------------------------

/// Log target of sink diagnostics
const MONITOR_LOG_TARGET: &str = "kraken::monitor";

/// File name pattern of the rotating sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameTemplate {
    template: String,
}

impl FileNameTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn has_placeholder(&self) -> bool {
        self.template.contains(TIMESTAMP_PLACEHOLDER)
    }

    /// File name for a rotation period starting at `start`
    pub fn resolve(&self, start: Timestamp) -> PathBuf {
        let stamp = start.to_datetime().format(ROTATION_TIMESTAMP_FORMAT).to_string();
        PathBuf::from(self.template.replace(TIMESTAMP_PLACEHOLDER, &stamp))
    }
}

/// Snapshot of a file sink's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub lines_written: u64,
    pub bytes_written: u64,
    pub files_opened: u64,
    pub open_errors: u64,
    pub write_errors: u64,
    pub dropped_metrics: u64,
}

#[derive(Debug, Default)]
struct SinkCounters {
    lines_written: AtomicU64,
    bytes_written: AtomicU64,
    files_opened: AtomicU64,
    open_errors: AtomicU64,
    write_errors: AtomicU64,
    dropped_metrics: AtomicU64,
}

impl SinkCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> SinkStats {
        SinkStats {
            lines_written: self.lines_written.load(AtomicOrdering::Relaxed),
            bytes_written: self.bytes_written.load(AtomicOrdering::Relaxed),
            files_opened: self.files_opened.load(AtomicOrdering::Relaxed),
            open_errors: self.open_errors.load(AtomicOrdering::Relaxed),
            write_errors: self.write_errors.load(AtomicOrdering::Relaxed),
            dropped_metrics: self.dropped_metrics.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Mutable part of the sink, guarded by a single lock so that rotation and
/// writes never interleave.
#[derive(Debug, Default)]
struct RolloverState {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    rotated_at: Option<Timestamp>,
}

impl RolloverState {
    fn current_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_default()
    }
}

/// Appends line protocol to a file that is replaced every `period`.
///
/// Rotation is lazy: it happens on the first record whose timestamp is at
/// least `period` past the start of the current file. The previous file is
/// flushed and closed before its successor is opened. A new, empty file
/// starts with an import header naming `dbname`.
#[derive(Debug)]
pub struct InfluxDbFileMonitor {
    template: FileNameTemplate,
    period: Duration,
    dbname: String,
    state: Mutex<RolloverState>,
    counters: SinkCounters,
    error_throttle: LogThrottle,
}

impl InfluxDbFileMonitor {
    pub fn new(
        template: impl Into<String>,
        period: Duration,
        dbname: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let template = FileNameTemplate::new(template);
        if template.as_str().is_empty() {
            return Err(ConfigError::invalid_value(
                "monitor.file_name_template",
                "file name template cannot be empty",
            ));
        }
        if period < MIN_ROLLOVER {
            return Err(ConfigError::invalid_value(
                "monitor.rollover",
                "rollover period must be at least one second",
            ));
        }
        if !template.has_placeholder() {
            warn!(
                target: MONITOR_LOG_TARGET,
                template = template.as_str(),
                "File name template has no {} placeholder; every rotation reopens the same file",
                TIMESTAMP_PLACEHOLDER
            );
        }
        Ok(Self {
            template,
            period,
            dbname: dbname.into(),
            state: Mutex::new(RolloverState::default()),
            counters: SinkCounters::default(),
            error_throttle: LogThrottle::default(),
        })
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.file_name_template.clone(),
            config.rollover,
            config.dbname.clone(),
        )
    }

    /// Replace the interval between repeated sink error reports
    pub fn with_error_log_interval(mut self, interval: Duration) -> Self {
        self.error_throttle = LogThrottle::new(interval);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn template(&self) -> &FileNameTemplate {
        &self.template
    }

    /// Path of the file currently receiving metrics
    pub fn current_path(&self) -> Option<PathBuf> {
        let state = self.state.lock();
        state.writer.as_ref().and(state.path.clone())
    }

    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    /// Flush and close the current file. The next record opens a new one.
    pub fn close(&self) {
        let mut state = self.state.lock();
        self.close_current(&mut state);
        state.rotated_at = None;
    }

    fn rotation_due(&self, state: &RolloverState, at: Timestamp) -> bool {
        match (&state.writer, state.rotated_at) {
            (Some(_), Some(start)) => at.duration_since(start) >= self.period,
            _ => true,
        }
    }

    fn close_current(&self, state: &mut RolloverState) {
        if let Some(mut writer) = state.writer.take() {
            if let Err(source) = writer.flush() {
                self.report(SinkError::Flush {
                    path: state.current_path(),
                    source,
                });
            }
            debug!(target: MONITOR_LOG_TARGET, path = %state.current_path().display(), "Closed monitoring file");
        }
    }

    fn rotate(&self, state: &mut RolloverState, at: Timestamp) {
        self.close_current(state);

        let path = self.template.resolve(at);
        state.rotated_at = Some(at);
        state.path = Some(path.clone());
        match open_for_append(&path, &self.dbname) {
            Ok(writer) => {
                SinkCounters::bump(&self.counters.files_opened, 1);
                info!(target: MONITOR_LOG_TARGET, path = %path.display(), "Opened monitoring file");
                state.writer = Some(writer);
            }
            Err(source) => {
                SinkCounters::bump(&self.counters.open_errors, 1);
                self.report(SinkError::Open { path, source });
            }
        }
    }

    fn write_line(&self, line: &str, at: Timestamp) {
        let mut state = self.state.lock();
        if self.rotation_due(&state, at) {
            self.rotate(&mut state, at);
        }

        let result = match state.writer.as_mut() {
            Some(writer) => writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.write_all(b"\n")),
            None => {
                SinkCounters::bump(&self.counters.dropped_metrics, 1);
                return;
            }
        };

        match result {
            Ok(()) => {
                SinkCounters::bump(&self.counters.lines_written, 1);
                SinkCounters::bump(&self.counters.bytes_written, line.len() as u64 + 1);
            }
            Err(source) => {
                SinkCounters::bump(&self.counters.write_errors, 1);
                SinkCounters::bump(&self.counters.dropped_metrics, 1);
                self.report(SinkError::Write {
                    path: state.current_path(),
                    source,
                });
            }
        }
    }

    fn report(&self, err: SinkError) {
        if let Some(suppressed) = self.error_throttle.check() {
            error!(
                target: MONITOR_LOG_TARGET,
                error = %err,
                suppressed,
                "Monitoring sink failure, metrics are being dropped"
            );
        }
    }
}

fn open_for_append(path: &Path, dbname: &str) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;
    let mut writer = BufWriter::with_capacity(FILE_WRITE_BUFFER_SIZE, file);
    if is_new {
        writer.write_all(import_header(dbname).as_bytes())?;
    }
    Ok(writer)
}

impl Monitor for InfluxDbFileMonitor {
    fn submit(&self, metric: Metric) {
        match encode_line(&metric) {
            Ok(line) => self.write_line(&line, metric.timestamp()),
            Err(err) => {
                SinkCounters::bump(&self.counters.dropped_metrics, 1);
                warn!(
                    target: MONITOR_LOG_TARGET,
                    metric = metric.name(),
                    error = %err,
                    "Dropping metric that cannot be encoded"
                );
            }
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            if let Err(source) = writer.flush() {
                let path = state.current_path();
                self.report(SinkError::Flush { path, source });
            }
        }
    }

    fn kind(&self) -> &'static str {
        "influxdb_file"
    }
}

impl Drop for InfluxDbFileMonitor {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(mut writer) = state.writer.take() {
            if let Err(err) = writer.flush() {
                error!(target: MONITOR_LOG_TARGET, error = %err, "Failed to flush monitoring file on shutdown");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 8.4 AddTagsMonitor - Default Tags Decorator
// ----------------------------------------------------------------------------

/// Adds a fixed set of tags to every metric before forwarding it.
///
/// Tags supplied by the caller win over the decorator's defaults.
#[derive(Debug)]
pub struct AddTagsMonitor<M: Monitor = Box<dyn Monitor>> {
    inner: M,
    tags: Tags,
}

impl<M: Monitor> AddTagsMonitor<M> {
    pub fn new(inner: M, tags: Tags) -> Self {
        Self { inner, tags }
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Monitor> Monitor for AddTagsMonitor<M> {
    fn submit(&self, metric: Metric) {
        self.inner.submit(metric.with_default_tags(&self.tags));
    }

    fn flush(&self) {
        self.inner.flush();
    }

    fn kind(&self) -> &'static str {
        "add_tags"
    }
}

// ----------------------------------------------------------------------------
// 8.5 Monitor Assembly
// ----------------------------------------------------------------------------

/// Build the monitor chain of one process:
/// sink, wrapped in the configured extra tags, wrapped in the slot tag.
///
/// Returns `None` when telemetry is disabled.
pub fn build_monitor(
    config: &MonitorConfig,
    slot: Option<usize>,
) -> Result<Option<Box<dyn Monitor>>, ConfigError> {
    let mut monitor: Box<dyn Monitor> = match config.kind {
        MonitorKind::None => {
            debug!(target: MONITOR_LOG_TARGET, "Telemetry disabled");
            return Ok(None);
        }
        MonitorKind::Log => Box::new(LogMonitor::new()),
        MonitorKind::InfluxdbFile => Box::new(InfluxDbFileMonitor::from_config(config)?),
    };

    let extra = config.extra_tags();
    if !extra.is_empty() {
        monitor = Box::new(AddTagsMonitor::new(monitor, extra));
    }
    if let Some(slot) = slot {
        monitor = Box::new(AddTagsMonitor::new(monitor, tags! { SLOT_TAG => slot.to_string() }));
    }

    info!(target: MONITOR_LOG_TARGET, kind = ?config.kind, slot = ?slot, "Monitor configured");
    Ok(Some(monitor))
}

/// Periodically flush `monitor` until `token` is cancelled, then flush once more
pub fn spawn_flush_task(
    monitor: Arc<dyn Monitor>,
    every: Duration,
    token: CancellationToken,
) -> TokioJoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => monitor.flush(),
                _ = token.cancelled() => break,
            }
        }
        monitor.flush();
        trace!(target: MONITOR_LOG_TARGET, "Flush task stopped");
    })
}

// ============================================================================
// SECTION 9: WORKLOAD RUNNER
// ============================================================================
// RunnerManager owns one task per work item. Each task holds its own
// connection and replays its class's queries until the time limit, the
// query budget or an external cancellation stops it.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Connections
// ----------------------------------------------------------------------------

/// Result of one successful query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    pub rows: u64,
}

/// A session with the target database
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome, ConnectionError>;
}

/// Opens database sessions for runners
#[async_trait]
pub trait ConnectionFactory: Send + Sync + Debug {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError>;

    fn endpoint(&self) -> String;
}

/// Factory of simulated connections with configurable latency and failures
#[derive(Debug)]
pub struct DummyConnectionFactory {
    config: DummyDbConfig,
    endpoint: String,
    opened: AtomicU64,
}

impl DummyConnectionFactory {
    pub fn new(connection: &ConnectionConfig) -> Self {
        Self {
            config: connection.dummy.clone(),
            endpoint: format!("dummy://{}", connection.endpoint()),
            opened: AtomicU64::new(0),
        }
    }

    pub fn connections_opened(&self) -> u64 {
        self.opened.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl ConnectionFactory for DummyConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        let index = self.opened.fetch_add(1, AtomicOrdering::Relaxed);
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index)),
            None => StdRng::from_entropy(),
        };
        trace!(target: "kraken::dummy_db", connection = index, "Opened simulated connection");
        Ok(Box::new(DummyConnection {
            config: self.config.clone(),
            rng,
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[derive(Debug)]
pub struct DummyConnection {
    config: DummyDbConfig,
    rng: StdRng,
}

impl DummyConnection {
    fn sample_latency(&mut self) -> Duration {
        let min = self.config.min_latency.as_nanos() as u64;
        let max = self.config.max_latency.as_nanos() as u64;
        if max <= min {
            return self.config.min_latency;
        }
        Duration::from_nanos(self.rng.gen_range(min..=max))
    }
}

#[async_trait]
impl Connection for DummyConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryOutcome, ConnectionError> {
        let latency = self.sample_latency();
        let failed = self.rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        let rows = self.rng.gen_range(0..=self.config.max_rows);
        trace!(target: "kraken::dummy_db", sql, latency_ms = latency.as_millis() as u64, "Simulating query");

        sleep(latency).await;
        if failed {
            Err(ConnectionError::QueryFailed {
                message: "simulated failure".to_string(),
            })
        } else {
            Ok(QueryOutcome { rows })
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Run Statistics
// ----------------------------------------------------------------------------

/// Latency and failure totals of a set of queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueryStats {
    pub count: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl QueryStats {
    pub fn observe(&mut self, duration_ms: f64, success: bool) {
        if self.count == 0 {
            self.min_ms = duration_ms;
            self.max_ms = duration_ms;
        } else {
            self.min_ms = self.min_ms.min(duration_ms);
            self.max_ms = self.max_ms.max(duration_ms);
        }
        self.count += 1;
        self.total_ms += duration_ms;
        if !success {
            self.failures += 1;
        }
    }

    pub fn merge(&mut self, other: &QueryStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.failures += other.failures;
        self.total_ms += other.total_ms;
        self.min_ms = self.min_ms.min(other.min_ms);
        self.max_ms = self.max_ms.max(other.max_ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Outcome of a [`RunnerManager::run`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub slot: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub runners: usize,
    pub connect_failures: u64,
    pub classes: BTreeMap<String, QueryStats>,
}

impl RunSummary {
    pub fn total(&self) -> QueryStats {
        let mut total = QueryStats::default();
        for stats in self.classes.values() {
            total.merge(stats);
        }
        total
    }
}

// ----------------------------------------------------------------------------
// 9.3 RunnerManager
// ----------------------------------------------------------------------------

/// Replays the workload of one process
#[derive(Debug)]
pub struct RunnerManager {
    config: HarnessConfig,
    factory: Arc<dyn ConnectionFactory>,
    slot: Option<usize>,
    time_limit: Option<Duration>,
    monitor: Option<Arc<dyn Monitor>>,
    cancel: CancellationToken,
}

impl RunnerManager {
    pub fn new(
        config: HarnessConfig,
        factory: Arc<dyn ConnectionFactory>,
        slot: Option<usize>,
        time_limit: Option<Duration>,
        monitor: Option<Arc<dyn Monitor>>,
    ) -> Self {
        Self {
            config,
            factory,
            slot,
            time_limit,
            monitor,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every work item of the configuration to completion
    pub async fn run(&self) -> HarnessResult<RunSummary> {
        let workload = self
            .config
            .workload
            .as_ref()
            .ok_or(ConfigError::MissingWorkload)?;

        let started = Instant::now();
        let run_token = self.cancel.child_token();

        let timer = self.time_limit.map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(limit) => {
                        info!(limit = %humantime::format_duration(limit), "Time limit reached, stopping runners");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let mut tasks = JoinSet::new();
        for class in &workload.classes {
            let class = Arc::new(class.clone());
            for runner in class.runner_ids() {
                let task = QueryRunner {
                    class: Arc::clone(&class),
                    runner,
                    factory: Arc::clone(&self.factory),
                    monitor: self.monitor.clone(),
                    cancel: run_token.clone(),
                };
                tasks.spawn(task.run());
            }
        }

        info!(
            slot = ?self.slot,
            runners = tasks.len(),
            classes = workload.classes.len(),
            endpoint = %self.factory.endpoint(),
            "Starting workload"
        );

        let mut summary = RunSummary {
            slot: self.slot,
            runners: tasks.len(),
            ..RunSummary::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    if report.connect_failed {
                        summary.connect_failures += 1;
                    }
                    summary
                        .classes
                        .entry(report.class)
                        .or_default()
                        .merge(&report.stats);
                }
                Err(err) => error!(error = %err, "Query runner task failed"),
            }
        }

        run_token.cancel();
        if let Some(timer) = timer {
            if let Err(err) = timer.await {
                debug!(error = %err, "Time limit task ended abnormally");
            }
        }

        self.monitor.flush();
        summary.elapsed = started.elapsed();

        let total = summary.total();
        info!(
            queries = total.count,
            failures = total.failures,
            mean_ms = total.mean_ms(),
            elapsed = %humantime::format_duration(summary.elapsed),
            "Workload finished"
        );
        Ok(summary)
    }
}

/// Per-task result handed back to the manager
#[derive(Debug)]
struct RunnerReport {
    class: String,
    stats: QueryStats,
    connect_failed: bool,
}

/// One runner of one query class
#[derive(Debug)]
struct QueryRunner {
    class: Arc<QueryClass>,
    runner: u32,
    factory: Arc<dyn ConnectionFactory>,
    monitor: Option<Arc<dyn Monitor>>,
    cancel: CancellationToken,
}

impl QueryRunner {
    fn tags(&self, query: &str) -> Tags {
        tags! {
            "class" => self.class.name.as_str(),
            "query" => query,
            "runner" => self.runner.to_string(),
        }
    }

    async fn run(self) -> RunnerReport {
        let mut report = RunnerReport {
            class: self.class.name.clone(),
            stats: QueryStats::default(),
            connect_failed: false,
        };

        let connect_started = Instant::now();
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return report,
            connected = self.factory.connect() => connected,
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(err) => {
                warn!(class = %self.class.name, runner = self.runner, error = %err, "Runner failed to connect");
                self.monitor.record(
                    CONNECT_METRIC_NAME,
                    fields! {
                        "duration_ms" => connect_started.elapsed().as_secs_f64() * 1000.0,
                        "success" => false,
                    },
                    tags! {
                        "class" => self.class.name.as_str(),
                        "runner" => self.runner.to_string(),
                    },
                );
                report.connect_failed = true;
                return report;
            }
        };

        let queries: Vec<(&String, &String)> = self.class.queries.iter().collect();
        let pacing = self.class.pacing();
        let mut rng = StdRng::from_entropy();
        let mut executed: u64 = 0;

        debug!(class = %self.class.name, runner = self.runner, "Runner started");
        while !self.cancel.is_cancelled() {
            if self.class.max_queries.map_or(false, |max| executed >= max) {
                break;
            }
            let Some(&(query_name, template)) = queries.choose(&mut rng) else {
                break;
            };
            let sql = expand_query(template, &self.class.variables, &mut rng);

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = connection.execute(&sql) => outcome,
            };
            let elapsed = started.elapsed();
            let duration_ms = elapsed.as_secs_f64() * 1000.0;
            executed += 1;

            let mut fields = fields! {
                "duration_ms" => duration_ms,
                "success" => outcome.is_ok(),
            };
            match &outcome {
                Ok(result) => {
                    fields.insert(CompactString::from("rows"), FieldValue::from(result.rows));
                }
                Err(err) => {
                    debug!(class = %self.class.name, query = %query_name, error = %err, "Query failed");
                }
            }
            report.stats.observe(duration_ms, outcome.is_ok());
            self.monitor.record(QUERY_METRIC_NAME, fields, self.tags(query_name));

            if let Some(rest) = pacing.and_then(|pace| pace.checked_sub(elapsed)) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(rest) => {}
                }
            }
        }

        debug!(class = %self.class.name, runner = self.runner, executed, "Runner stopped");
        report
    }
}

// ============================================================================
// SECTION 10: LOGGING INITIALIZATION
// ============================================================================

/// Log level selected by the number of `-v` flags
pub fn verbosity_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn parse_level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        "off" => tracing::level_filters::LevelFilter::OFF,
        _ => tracing::level_filters::LevelFilter::WARN,
    }
}

/// Initialize the global subscriber.
///
/// When logging goes to a file, the returned guard must be kept alive for
/// the lifetime of the process so that buffered records are written out.
pub fn init_logging(config: &LoggingConfig) -> HarnessResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let (writer, guard) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                HarnessError::Internal(format!("Invalid log file path: {}", path.display()))
            })?;
            fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };
    let ansi = config.colors && config.file.is_none();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init(),
        "pretty" => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };
    installed.map_err(|e| HarnessError::Internal(format!("Failed to set logger: {}", e)))?;

    Ok(guard)
}

// ============================================================================
// SECTION 11: CLI INTERFACE
// ============================================================================

/// Test harness to generate load for Qserv
#[derive(Parser, Debug)]
#[command(
    name = "kraken",
    author = "Qserv Team",
    version = HARNESS_VERSION,
    about = "Test harness to generate load for Qserv",
    long_about = "Replays a workload of query classes against a Qserv cluster. \
                  Several processes can share one workload: each is given the \
                  total number of slots and its own slot number and runs only \
                  its share."
)]
pub struct Cli {
    /// More verbose output, can use several times
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay this process's share of the workload
    Run(RunArgs),

    /// Validate configuration files
    Validate {
        /// Configuration files, later ones override earlier ones
        #[arg(required = true, value_name = "CONFIG")]
        config: Vec<PathBuf>,

        /// Print the merged configuration
        #[arg(long)]
        show: bool,
    },

    /// Show how the workload is divided between slots
    Split {
        /// Configuration files, later ones override earlier ones
        #[arg(required = true, value_name = "CONFIG")]
        config: Vec<PathBuf>,

        /// Total number of slots
        #[arg(short = 'n', long, value_name = "NUMBER")]
        num_slots: usize,

        /// Override the configured partitioning strategy
        #[arg(long, value_enum)]
        partition_strategy: Option<PartitionStrategy>,
    },

    /// Print the contents of a monitoring file
    Inspect {
        /// Line-protocol file written by the influxdb-file monitor
        file: PathBuf,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Generate a default configuration file
    GenerateConfig {
        /// Output file path (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Total number of slots, must be used together with --slot
    #[arg(short = 'n', long, value_name = "NUMBER", requires = "slot")]
    pub num_slots: Option<usize>,

    /// Slot number of this process, in [0, num-slots)
    #[arg(short = 's', long, value_name = "NUMBER", requires = "num_slots")]
    pub slot: Option<usize>,

    /// Stop after this many seconds
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub time_limit: Option<u64>,

    /// Use a simulated database instead of Qserv
    #[arg(long)]
    pub dummy_db: bool,

    /// Telemetry sink
    #[arg(short = 'm', long, value_enum)]
    pub monitor: Option<MonitorKind>,

    /// Seconds between rollovers of the influxdb-file monitor
    #[arg(short = 'r', long, value_name = "SECONDS")]
    pub monitor_rollover: Option<u64>,

    /// Monitoring file name template, "%T" is replaced with the rotation time
    #[arg(long, value_name = "PATH")]
    pub influxdb_file_name: Option<String>,

    /// Database name for the monitoring file import header
    #[arg(long, value_name = "DATABASE")]
    pub influxdb_db: Option<String>,

    /// Override the configured partitioning strategy
    #[arg(long, value_enum)]
    pub partition_strategy: Option<PartitionStrategy>,

    /// Configuration files, later ones override earlier ones
    #[arg(required = true, value_name = "CONFIG")]
    pub config: Vec<PathBuf>,
}

impl RunArgs {
    /// Apply command line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(secs) = self.time_limit {
            config.limits.time_limit = Some(Duration::from_secs(secs));
        }
        if self.dummy_db {
            config.connection.dummy_db = true;
        }
        if let Some(kind) = self.monitor {
            config.monitor.kind = kind;
        }
        if let Some(secs) = self.monitor_rollover {
            config.monitor.rollover = Duration::from_secs(secs);
        }
        if let Some(template) = &self.influxdb_file_name {
            config.monitor.file_name_template = template.clone();
        }
        if let Some(db) = &self.influxdb_db {
            config.monitor.dbname = db.clone();
        }
        if let Some(strategy) = self.partition_strategy {
            config.partitioning.strategy = strategy;
        }
    }

    fn partition(&self) -> Option<(usize, usize)> {
        self.num_slots.zip(self.slot)
    }
}

// ----------------------------------------------------------------------------
// Command Handlers
// ----------------------------------------------------------------------------

async fn handle_run(args: RunArgs, verbose: u8) -> AnyhowResult<()> {
    let mut config = HarnessConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration after command line overrides")?;

    let mut logging = config.logging.clone();
    if verbose > 0 {
        logging.level = verbosity_level(verbose).to_string();
    }
    let _log_guard = init_logging(&logging)?;

    if let Some((num_slots, slot)) = args.partition() {
        config = config.split(num_slots, slot)?;
    }
    println!(
        "Configuration for slot {} of {}:",
        args.slot.map_or_else(|| "-".to_string(), |s| s.to_string()),
        args.num_slots.map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    println!("{}", config.to_toml()?);

    let factory: Arc<dyn ConnectionFactory> = if config.connection.dummy_db {
        Arc::new(DummyConnectionFactory::new(&config.connection))
    } else {
        return Err(HarnessError::NotImplemented(format!(
            "connections to {} (use --dummy-db)",
            config.connection.endpoint()
        ))
        .into());
    };

    let monitor: Option<Arc<dyn Monitor>> =
        build_monitor(&config.monitor, args.slot)?.map(Arc::from);

    let flush_token = CancellationToken::new();
    let flusher = monitor
        .clone()
        .map(|m| spawn_flush_task(m, config.monitor.flush_interval, flush_token.clone()));

    let time_limit = config.limits.time_limit;
    let manager = RunnerManager::new(config, factory, args.slot, time_limit, monitor);

    let stop = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping runners");
            stop.cancel();
        }
    });

    let summary = manager.run().await?;

    flush_token.cancel();
    if let Some(flusher) = flusher {
        if let Err(err) = flusher.await {
            warn!(error = %err, "Flush task ended abnormally");
        }
    }
    drop(manager);

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "Run finished in {} ({} runners, {} connect failures)",
        humantime::format_duration(Duration::from_millis(summary.elapsed.as_millis() as u64)),
        summary.runners,
        summary.connect_failures
    );
    println!(
        "  {:<20} {:>10} {:>10} {:>12} {:>12} {:>12}",
        "class", "queries", "failures", "mean ms", "min ms", "max ms"
    );
    for (class, stats) in &summary.classes {
        println!(
            "  {:<20} {:>10} {:>10} {:>12.2} {:>12.2} {:>12.2}",
            class,
            stats.count,
            stats.failures,
            stats.mean_ms(),
            stats.min_ms,
            stats.max_ms
        );
    }
}

fn handle_validate(paths: &[PathBuf], show: bool) -> AnyhowResult<()> {
    let config = HarnessConfig::load(paths)?;
    println!("✅ Configuration is valid");
    if let Some(workload) = &config.workload {
        println!(
            "   {} query classes, {} work items",
            workload.classes.len(),
            workload.total_runners()
        );
    } else {
        println!("   No workload section");
    }
    if show {
        println!();
        println!("{}", config.to_toml()?);
    }
    Ok(())
}

fn handle_split(
    paths: &[PathBuf],
    num_slots: usize,
    strategy: Option<PartitionStrategy>,
) -> AnyhowResult<()> {
    let mut config = HarnessConfig::load(paths)?;
    if let Some(strategy) = strategy {
        config.partitioning.strategy = strategy;
    }
    println!(
        "Splitting workload over {} slots ({})",
        num_slots, config.partitioning.strategy
    );
    for slot in 0..num_slots.max(1) {
        let share = config.split(num_slots, slot)?;
        let items: Vec<String> = share
            .workload
            .as_ref()
            .map(|w| w.work_items().iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        println!("  slot {:>3}: {:>4} items  {}", slot, items.len(), items.join(" "));
    }
    Ok(())
}

fn handle_inspect(path: &Path, json: bool) -> AnyhowResult<()> {
    let lines = read_line_protocol_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    for line in &lines {
        if json {
            println!("{}", serde_json::to_string(line)?);
        } else {
            println!("{}", line);
        }
    }
    if !json {
        println!("{} metrics", lines.len());
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = HarnessConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", HARNESS_FULL_NAME, HARNESS_VERSION);
    println!("  binary: {}", HARNESS_NAME);
    println!("  monitors: log, influxdb-file");
    println!("  partitioning: round-robin, contiguous");
}

// ============================================================================
// SECTION 12: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => handle_run(args, cli.verbose).await,
        Commands::Validate { config, show } => handle_validate(&config, show),
        Commands::Split {
            config,
            num_slots,
            partition_strategy,
        } => handle_split(&config, num_slots, partition_strategy),
        Commands::Inspect { file, json } => handle_inspect(&file, json),
        Commands::GenerateConfig { output } => handle_generate_config(output.as_deref()),
        Commands::Version => {
            handle_version();
            Ok(())
        }
    }
}

// ============================================================================
// SECTION 13: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_timestamp_monotonic() {
        let mut previous = Timestamp::now_monotonic();
        for _ in 0..1000 {
            let next = Timestamp::now_monotonic();
            assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn test_metrics_are_stamped_in_creation_order() {
        let first = Metric::new("a", fields! { "v" => 1.0 }, tags! {});
        let second = Metric::new("b", fields! { "v" => 2.0 }, tags! {});
        assert!(first.timestamp() > Timestamp::EPOCH);
        assert!(second.timestamp() >= first.timestamp());
    }

    #[test]
    fn test_timestamp_operations() {
        let ts = Timestamp::from_secs(100);
        assert_eq!(ts.as_nanos(), 100_000_000_000);
        assert_eq!(ts.add_duration(Duration::from_secs(5)).as_secs(), 105);
        assert_eq!(ts.duration_since(Timestamp::from_secs(90)), Duration::from_secs(10));
        assert_eq!(Timestamp::from_secs(90).duration_since(ts), Duration::ZERO);
        assert_eq!(Timestamp::from_millis(1500).as_nanos(), 1_500_000_000);
    }

    #[test]
    fn test_field_value_conversions() {
        assert_eq!(FieldValue::from(1.5), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from(-2i64), FieldValue::Int(-2));
        assert_eq!(FieldValue::from(3u64), FieldValue::UInt(3));
        assert_eq!(FieldValue::from(true), FieldValue::Bool(true));
        assert_eq!(FieldValue::from("ok").as_str(), Some("ok"));
        assert_eq!(FieldValue::from(4u32).as_f64(), Some(4.0));
        assert_eq!(FieldValue::from("x").type_name(), "string");
    }

    #[test]
    fn test_metric_default_tags_caller_wins() {
        let metric = Metric::new("query", fields! { "ms" => 1.0 }, tags! { "slot" => "7", "q" => "a" });
        let merged = metric.with_default_tags(&tags! { "slot" => "3", "site" => "ncsa" });
        assert_eq!(merged.tag("slot"), Some("7"));
        assert_eq!(merged.tag("q"), Some("a"));
        assert_eq!(merged.tag("site"), Some("ncsa"));
        assert_eq!(merged.tags().len(), 3);
    }

    #[test]
    fn test_metric_display() {
        let metric = Metric::new("query", fields! { "ms" => 2.5 }, tags! { "slot" => "1" })
            .at(Timestamp::EPOCH);
        let rendered = metric.to_string();
        assert!(rendered.starts_with("query{slot=\"1\"} ms=2.5 @ 1970-01-01"));
    }

    #[test]
    fn test_log_throttle() {
        let throttle = LogThrottle::new(Duration::from_secs(3600));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);

        let open = LogThrottle::new(Duration::ZERO);
        assert_eq!(open.check(), Some(0));
        assert_eq!(open.check(), Some(0));
    }

    // ------------------------------------------------------------------------
    // Line protocol
    // ------------------------------------------------------------------------

    #[test]
    fn test_encode_line_example() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_789);
        let metric = Metric::new(
            "query",
            fields! { "ms" => 12.5, "ok" => "true" },
            tags! { "slot" => "1" },
        )
        .at(ts);

        let line = encode_line(&metric).unwrap();
        assert_eq!(line, "query,slot=1 ms=12.5,ok=\"true\" 1700000000123456789");

        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.measurement, "query");
        assert_eq!(parsed.tags, *metric.tags());
        assert_eq!(parsed.fields, *metric.fields());
        assert_eq!(parsed.timestamp, Some(ts.as_nanos()));
    }

    #[rstest]
    #[case("cpu load", "host", "a b", r"cpu\ load,host=a\ b v=1 0")]
    #[case("cpu,x", "k=y", "v,w", r"cpu\,x,k\=y=v\,w v=1 0")]
    #[case("m=1", "k", "x=y", r"m=1,k=x\=y v=1 0")]
    #[case("m", "path", r"C:\dir", r"m,path=C:\\dir v=1 0")]
    #[case(r"m\", r"k\", r"x\", r"m\\,k\\=x\\ v=1 0")]
    fn test_escaping(
        #[case] measurement: &str,
        #[case] key: &str,
        #[case] value: &str,
        #[case] expected: &str,
    ) {
        let metric = Metric::new(measurement, fields! { "v" => 1.0 }, tags! { key => value })
            .at(Timestamp::EPOCH);
        let line = encode_line(&metric).unwrap();
        assert_eq!(line, expected);

        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.measurement, measurement);
        assert_eq!(parsed.tags.get(key).map(|v| v.as_str()), Some(value));
    }

    #[test]
    fn test_trailing_backslash_keeps_next_tag() {
        let metric = Metric::new("m", fields! { "v" => 1.0 }, tags! { "a" => r"x\", "b" => "y" })
            .at(Timestamp::EPOCH);
        let line = encode_line(&metric).unwrap();
        assert_eq!(line, r"m,a=x\\,b=y v=1 0");

        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.tags, *metric.tags());
    }

    #[test]
    fn test_unescape_keeps_lone_backslash() {
        assert_eq!(unescape(r"C:\dir"), r"C:\dir");
        assert_eq!(unescape(r"a\,b\\c"), r"a,b\c");
    }

    #[test]
    fn test_string_field_escaping() {
        let text = r#"say "hi", \o/ = done"#;
        let metric = Metric::new("m", fields! { "msg" => text }, tags! {}).at(Timestamp::EPOCH);
        let line = encode_line(&metric).unwrap();
        assert_eq!(line, r#"m msg="say \"hi\", \\o/ = done" 0"#);

        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.fields.get("msg"), Some(&FieldValue::from(text)));
    }

    #[test]
    fn test_encode_value_types() {
        let metric = Metric::new(
            "m",
            fields! { "a" => -3i64, "b" => 7u64, "c" => true, "d" => 0.25 },
            tags! {},
        )
        .at(Timestamp::from_nanos(5));
        let line = encode_line(&metric).unwrap();
        assert_eq!(line, "m a=-3i,b=7u,c=true,d=0.25 5");
        assert_eq!(parse_line(&line).unwrap().fields, *metric.fields());
    }

    #[test]
    fn test_empty_tag_values_are_omitted() {
        let metric = Metric::new("m", fields! { "v" => 1.0 }, tags! { "a" => "", "b" => "x" })
            .at(Timestamp::EPOCH);
        assert_eq!(encode_line(&metric).unwrap(), "m,b=x v=1 0");
    }

    #[test]
    fn test_encode_rejects_invalid_metrics() {
        let at = |m: Metric| m.at(Timestamp::EPOCH);

        let nan = at(Metric::new("m", fields! { "v" => f64::NAN }, tags! {}));
        assert!(matches!(encode_line(&nan), Err(EncodingError::NonFiniteFloat { .. })));

        let inf = at(Metric::new("m", fields! { "v" => f64::INFINITY }, tags! {}));
        assert!(matches!(encode_line(&inf), Err(EncodingError::NonFiniteFloat { .. })));

        let empty = at(Metric::new("m", fields! {}, tags! {}));
        assert!(matches!(encode_line(&empty), Err(EncodingError::NoFields { .. })));

        let unnamed = at(Metric::new("", fields! { "v" => 1.0 }, tags! {}));
        assert_eq!(encode_line(&unnamed), Err(EncodingError::EmptyMeasurement));

        let newline = at(Metric::new("m", fields! { "v" => 1.0 }, tags! { "k" => "a\nb" }));
        assert!(matches!(encode_line(&newline), Err(EncodingError::Newline { .. })));

        let no_key = at(Metric::new("m", fields! { "v" => 1.0 }, tags! { "" => "x" }));
        assert!(matches!(
            encode_line(&no_key),
            Err(EncodingError::EmptyKey { kind: "tag", .. })
        ));
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_line("just_a_measurement").is_err());
        assert!(parse_line("m v=abc 1").is_err());
        assert!(parse_line("m v=1 not_a_time").is_err());
        assert!(parse_line("m v 1").is_err());
        assert!(parse_line("m v=\"open 1").is_err());
    }

    #[test]
    fn test_parse_line_without_timestamp() {
        let parsed = parse_line("m,host=a v=1i").unwrap();
        assert_eq!(parsed.timestamp, None);
        assert_eq!(parsed.fields.get("v"), Some(&FieldValue::Int(1)));
    }

    #[test]
    fn test_read_line_protocol_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mon.dat");
        let content = format!("{}m v=1 10\n\nm,slot=2 v=2 20\n", import_header("db"));
        fs::write(&path, content).unwrap();

        let lines = read_line_protocol_file(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].tags.get("slot").map(|v| v.as_str()), Some("2"));
    }

    #[test]
    fn test_import_header() {
        assert_eq!(import_header("qserv_kraken"), "# DML\n# CONTEXT-DATABASE: qserv_kraken\n");
        assert_eq!(import_header(""), "# DML\n");
    }
}

#[cfg(test)]
mod config_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::from_toml_str("").unwrap();
        assert_eq!(config.monitor.kind, MonitorKind::None);
        assert_eq!(config.monitor.rollover, Duration::from_secs(DEFAULT_ROLLOVER_SECS));
        assert_eq!(config.monitor.file_name_template, DEFAULT_FILE_NAME_TEMPLATE);
        assert_eq!(config.monitor.dbname, DEFAULT_INFLUXDB_DB);
        assert_eq!(config.partitioning.strategy, PartitionStrategy::RoundRobin);
        assert_eq!(config.limits.time_limit, None);
        assert!(config.workload.is_none());
    }

    #[test]
    fn test_sample_config() {
        let config = sample_config();
        assert!(config.connection.dummy_db);
        assert_eq!(config.connection.dummy.seed, Some(7));
        assert_eq!(config.connection.dummy.max_latency, Duration::from_millis(2));
        assert_eq!(config.monitor.kind, MonitorKind::InfluxdbFile);
        assert_eq!(config.monitor.rollover, Duration::from_secs(600));
        assert_eq!(config.monitor.extra_tags(), tags! { "site" => "ncsa" });

        let workload = config.workload.as_ref().unwrap();
        assert_eq!(workload.classes.len(), 2);
        assert_eq!(workload.total_runners(), 5);
        let lv = workload.class("LV").unwrap();
        assert_eq!(lv.target_time, Some(Duration::from_secs(1)));
        assert_eq!(
            lv.variables.get("oid"),
            Some(&VariableSpec::IntRange { min: 1, max: 100 })
        );
    }

    #[test]
    fn test_work_items_order() {
        let items = sample_config().workload.unwrap().work_items();
        let names: Vec<String> = items.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["LV#0", "LV#1", "LV#2", "FTSObj#0", "FTSObj#1"]);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = sample_config();
        let rendered = config.to_toml().unwrap();
        assert_eq!(HarnessConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_generated_config_is_valid() {
        let generated = HarnessConfig::generate_default_config();
        let config = HarnessConfig::from_toml_str(&generated).unwrap();
        assert!(config.workload.is_some());
    }

    #[test]
    fn test_unbound_placeholder_is_rejected() {
        let toml = r#"
[[workload.classes]]
name = "LV"
concurrent_queries = 1

[workload.classes.queries]
q = "SELECT * FROM Object WHERE objectId = {missing}"
"#;
        let err = HarnessConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = sample_config();
        config.connection.dummy.failure_rate = 2.0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.workload.as_mut().unwrap().classes[0].concurrent_queries = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.workload.as_mut().unwrap().classes[1].name = "LV".to_string();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.workload.as_mut().unwrap().classes[0].runners = Some(vec![0, 5]);
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.monitor.rollover = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.monitor.rollover = Duration::from_millis(300);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        fs::write(
            &base,
            "connection:\n  dummy_db: true\nworkload:\n  classes:\n    - name: LV\n      concurrent_queries: 2\n      queries:\n        q1: \"SELECT 1\"\n",
        )
        .unwrap();
        let overrides = dir.path().join("override.toml");
        fs::write(&overrides, "[monitor]\nkind = \"log\"\n\n[limits]\ntime_limit = \"30s\"\n").unwrap();

        let config = HarnessConfig::load(&[base, overrides]).unwrap();
        assert!(config.connection.dummy_db);
        assert_eq!(config.monitor.kind, MonitorKind::Log);
        assert_eq!(config.limits.time_limit, Some(Duration::from_secs(30)));
        assert_eq!(config.workload.unwrap().total_runners(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = HarnessConfig::load(&[PathBuf::from("/nonexistent/kraken.toml")]).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));

        let none: [PathBuf; 0] = [];
        assert!(matches!(
            HarnessConfig::load(&none),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_run_args_override_config() {
        let mut config = sample_config();
        let args = RunArgs {
            num_slots: Some(4),
            slot: Some(1),
            time_limit: Some(60),
            dummy_db: true,
            monitor: Some(MonitorKind::Log),
            monitor_rollover: Some(30),
            influxdb_file_name: Some("out-%T.dat".to_string()),
            influxdb_db: Some("test_db".to_string()),
            partition_strategy: Some(PartitionStrategy::Contiguous),
            config: vec![],
        };
        args.apply(&mut config);
        assert_eq!(config.limits.time_limit, Some(Duration::from_secs(60)));
        assert_eq!(config.monitor.kind, MonitorKind::Log);
        assert_eq!(config.monitor.rollover, Duration::from_secs(30));
        assert_eq!(config.monitor.file_name_template, "out-%T.dat");
        assert_eq!(config.monitor.dbname, "test_db");
        assert_eq!(config.partitioning.strategy, PartitionStrategy::Contiguous);
        assert_eq!(args.partition(), Some((4, 1)));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "kraken", "-vv", "run", "-n", "4", "-s", "2", "--dummy-db", "-m", "influxdb-file",
            "a.toml", "b.yaml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.partition(), Some((4, 2)));
                assert_eq!(args.monitor, Some(MonitorKind::InfluxdbFile));
                assert_eq!(args.config.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["kraken", "run", "-n", "4", "a.toml"]).is_err());
    }

    #[test]
    fn test_expand_query() {
        let mut variables = BTreeMap::new();
        variables.insert("a".to_string(), VariableSpec::IntRange { min: 5, max: 5 });
        variables.insert(
            "b".to_string(),
            VariableSpec::Choice {
                values: vec!["x".to_string()],
            },
        );
        let mut rng = StdRng::seed_from_u64(1);
        let sql = expand_query("SELECT {a}, '{b}', {c}", &variables, &mut rng);
        assert_eq!(sql, "SELECT 5, 'x', {c}");
    }

    #[test]
    fn test_float_range_sample_in_bounds() {
        let generator = VariableSpec::FloatRange { min: -1.0, max: 1.0 };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let value: f64 = generator.sample(&mut rng).parse().unwrap();
            assert!((-1.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_pacing() {
        let mut class = simple_class("LV", 4);
        assert_eq!(class.pacing(), None);

        class.max_rate = Some(2.0);
        assert_eq!(class.pacing(), Some(Duration::from_secs(2)));

        class.target_time = Some(Duration::from_secs(3));
        assert_eq!(class.pacing(), Some(Duration::from_secs(3)));

        class.target_time = Some(Duration::from_millis(500));
        assert_eq!(class.pacing(), Some(Duration::from_secs(2)));
    }
}



#[cfg(test)]
mod runner_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn shared(recorder: &Arc<RecordingMonitor>) -> Option<Arc<dyn Monitor>> {
        let monitor: Arc<dyn Monitor> = recorder.clone();
        Some(monitor)
    }

    fn runner_config(runners: u32, max_queries: Option<u64>, failure_rate: f64) -> HarnessConfig {
        let mut class = simple_class("LV", runners);
        class.max_queries = max_queries;
        HarnessConfig {
            connection: ConnectionConfig {
                dummy_db: true,
                dummy: DummyDbConfig {
                    min_latency: Duration::from_millis(1),
                    max_latency: Duration::from_millis(2),
                    failure_rate,
                    max_rows: 10,
                    seed: Some(1),
                },
                ..ConnectionConfig::default()
            },
            workload: Some(Workload {
                classes: vec![class],
            }),
            ..HarnessConfig::default()
        }
    }

    #[derive(Debug)]
    struct RefusingFactory;

    #[async_trait]
    impl ConnectionFactory for RefusingFactory {
        async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
            Err(ConnectionError::ConnectFailed {
                endpoint: self.endpoint(),
                message: "refused".to_string(),
            })
        }

        fn endpoint(&self) -> String {
            "nowhere:0".to_string()
        }
    }

    #[tokio::test]
    async fn test_runners_stop_after_max_queries() {
        let config = runner_config(2, Some(5), 0.0);
        let recorder = Arc::new(RecordingMonitor::default());
        let monitor: Arc<dyn Monitor> = recorder.clone();
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));

        let manager = RunnerManager::new(config, factory.clone(), Some(3), None, Some(monitor));
        let summary = manager.run().await.unwrap();

        assert_eq!(summary.slot, Some(3));
        assert_eq!(summary.runners, 2);
        assert_eq!(summary.total().count, 10);
        assert_eq!(summary.total().failures, 0);
        assert_eq!(factory.connections_opened(), 2);

        let metrics = recorder.metrics();
        assert_eq!(metrics.len(), 10);
        for metric in &metrics {
            assert_eq!(metric.name(), QUERY_METRIC_NAME);
            assert_eq!(metric.tag("class"), Some("LV"));
            assert_eq!(metric.tag("query"), Some("q"));
            assert!(metric.tag("runner").is_some());
            assert_eq!(metric.field("success"), Some(&FieldValue::Bool(true)));
            assert!(metric.field("rows").is_some());
            assert!(metric.field("duration_ms").and_then(FieldValue::as_f64).unwrap() >= 0.0);
        }
        assert!(recorder.flushes() >= 1);
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let config = runner_config(1, Some(3), 1.0);
        let recorder = Arc::new(RecordingMonitor::default());
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));

        let manager = RunnerManager::new(config, factory, None, None, shared(&recorder));
        let summary = manager.run().await.unwrap();

        assert_eq!(summary.classes["LV"].failures, 3);
        for metric in recorder.metrics() {
            assert_eq!(metric.field("success"), Some(&FieldValue::Bool(false)));
            assert!(metric.field("rows").is_none());
        }
    }

    #[tokio::test]
    async fn test_time_limit_stops_runners() {
        let config = runner_config(3, None, 0.0);
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));
        let manager = RunnerManager::new(
            config,
            factory,
            None,
            Some(Duration::from_millis(100)),
            None,
        );

        let summary = manager.run().await.unwrap();
        assert!(summary.total().count > 0);
        assert!(summary.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_run_executes_nothing() {
        let config = runner_config(2, None, 0.0);
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));
        let manager = RunnerManager::new(config, factory, None, None, None);

        manager.cancellation_token().cancel();
        let summary = manager.run().await.unwrap();
        assert_eq!(summary.total().count, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let config = runner_config(2, Some(1), 0.0);
        let recorder = Arc::new(RecordingMonitor::default());
        let manager = RunnerManager::new(
            config,
            Arc::new(RefusingFactory),
            None,
            None,
            shared(&recorder),
        );

        let summary = manager.run().await.unwrap();
        assert_eq!(summary.connect_failures, 2);
        assert_eq!(summary.total().count, 0);

        let metrics = recorder.metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.name() == CONNECT_METRIC_NAME));
        assert!(metrics
            .iter()
            .all(|m| m.field("success") == Some(&FieldValue::Bool(false))));
    }

    #[tokio::test]
    async fn test_missing_workload_is_an_error() {
        let config = HarnessConfig::default();
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));
        let manager = RunnerManager::new(config, factory, None, None, None);
        assert!(matches!(
            manager.run().await,
            Err(HarnessError::Config(ConfigError::MissingWorkload))
        ));
    }

    #[tokio::test]
    async fn test_split_share_runs_only_owned_runners() {
        let config = runner_config(5, Some(2), 0.0).split(2, 1).unwrap();
        let recorder = Arc::new(RecordingMonitor::default());
        let factory = Arc::new(DummyConnectionFactory::new(&config.connection));
        let manager = RunnerManager::new(config, factory, Some(1), None, shared(&recorder));

        let summary = manager.run().await.unwrap();
        assert_eq!(summary.runners, 2);

        let mut runners: Vec<String> = recorder
            .metrics()
            .iter()
            .filter_map(|m| m.tag("runner").map(str::to_string))
            .collect();
        runners.sort();
        runners.dedup();
        assert_eq!(runners, vec!["1", "3"]);
    }

    #[test]
    fn test_query_stats_merge() {
        let mut a = QueryStats::default();
        a.observe(10.0, true);
        a.observe(30.0, false);
        let mut b = QueryStats::default();
        b.observe(5.0, true);

        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.failures, 1);
        assert_eq!(a.min_ms, 5.0);
        assert_eq!(a.max_ms, 30.0);
        assert_eq!(a.mean_ms(), 15.0);

        let mut empty = QueryStats::default();
        empty.merge(&a);
        assert_eq!(empty, a);
    }
}
