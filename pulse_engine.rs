//! # Pulse Engine - Metrics Collection & Analysis Pipeline
//!
//! An in-process, event-driven metrics aggregator meant to be embedded inside a
//! larger observability service. Collectors observe raw activity (storage usage,
//! logical path accesses, operation durations), publish it on a named metric bus,
//! and an aggregator retains a normalized view that answers time-ranged
//! collection queries and computes derived analyses.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PULSE ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  COLLECTORS → EVENT BUS (metric:<name>) → NORMALIZER → RETAINED INDEX       │
//! │       ▲                                                    │                │
//! │       └──────── collect(sources, range) ◄── AGGREGATOR ────┴─► analyze()    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Named pub/sub bus**: ordered, isolated synchronous delivery per channel
//! - **Structural normalization**: heterogeneous payloads mapped to one shape
//! - **Live collection**: `collect()` pulls fresh snapshots from each collector
//! - **Analysis**: performance percentiles, usage aggregation, hourly activity
//!
//! ## Author
//!
//! AIOps Team

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::Metadata as FsMetadata;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::fs;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::interval;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Statistics, Configuration, CLI
// ----------------------------------------------------------------------------
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Filesystem Watching (optional)
// ----------------------------------------------------------------------------
#[cfg(feature = "fs-watch")]
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-engine";
pub const ENGINE_FULL_NAME: &str = "Pulse Metrics Engine";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PULSE_";

// ----------------------------------------------------------------------------
// Sources & Channels
// ----------------------------------------------------------------------------

/// Source name of the storage usage collector
pub const SOURCE_STORAGE: &str = "storage";

/// Source name of the logical path access collector
pub const SOURCE_MEMORY_PATH: &str = "memory-path";

/// Source name of the operation duration collector
pub const SOURCE_PERFORMANCE: &str = "performance";

/// Wildcard accepted by `collect` (every source) and `analyze` (every category)
pub const ALL: &str = "all";

/// Namespace prepended to every bus channel
pub const CHANNEL_PREFIX: &str = "metric:";

// ----------------------------------------------------------------------------
// Bus Limits
// ----------------------------------------------------------------------------

/// Listener count per channel above which a leak warning is logged
pub const DEFAULT_LISTENER_WARN_THRESHOLD: usize = 100;

/// The bus must carry at least this many listeners per channel silently
pub const MIN_LISTENER_WARN_THRESHOLD: usize = 20;

/// Buffer size of the broadcast stream handed to async subscribers
pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

// ----------------------------------------------------------------------------
// Retention & Analysis
// ----------------------------------------------------------------------------

/// Retained metrics per source before the oldest are evicted (0 = unbounded)
pub const DEFAULT_MAX_METRICS_PER_SOURCE: usize = 100_000;

/// Default `get_top_paths` limit
pub const DEFAULT_TOP_PATHS_LIMIT: usize = 10;

/// Default `get_recent_accesses` window (minutes)
pub const DEFAULT_RECENT_WINDOW_MINUTES: u64 = 60;

/// Paths reported by the access pattern analysis
pub const DEFAULT_PATTERN_TOP_PATHS: usize = 5;

/// Recent activity window of the access pattern analysis (minutes)
pub const DEFAULT_PATTERN_RECENT_MINUTES: u64 = 15;

/// Paths reported in `mostAccessedPaths` of the usage analysis
pub const USAGE_TOP_PATHS: usize = 5;

/// Interval between analysis summaries logged by `pulse run` (seconds)
pub const DEFAULT_SUMMARY_INTERVAL_SECS: u64 = 60;

/// File type recorded for files without an extension
pub const UNKNOWN_FILE_TYPE: &str = "unknown";

pub const NO_PERFORMANCE_DATA: &str = "No performance data available";
pub const NO_ACTIVITY_DATA: &str = "No activity data available";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Every value flowing through the pipeline: timestamps, clocks, raw and
// normalized metrics, and query time ranges.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Epoch Milliseconds
// ----------------------------------------------------------------------------

/// Naive date-time layouts accepted in addition to RFC 3339 (interpreted as UTC).
const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Maximum representable timestamp
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Minimum representable timestamp
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Add duration to timestamp
    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Subtract duration from timestamp
    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Check if timestamp is within an inclusive range
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    /// Convert to chrono DateTime<Utc>, `None` when out of chrono's range
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }

    /// Hour of day (0-23, UTC)
    pub fn hour_of_day(&self) -> Option<u32> {
        self.to_datetime().map(|dt| dt.hour())
    }

    /// Parse an ISO-8601 string: RFC 3339, naive date-time (UTC) or plain date.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self(dt.timestamp_millis()));
        }
        for format in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Some(Self::from_naive(&naive));
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Self::from_naive(&naive))
    }

    fn from_naive(naive: &NaiveDateTime) -> Self {
        Self(Utc.from_utc_datetime(naive).timestamp_millis())
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl From<Timestamp> for i64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration_millis(duration))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Clock - Injectable Time Source
// ----------------------------------------------------------------------------

/// Source of "now" for collectors and the aggregator.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock, used to make time-dependent behaviour deterministic.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start.as_millis()))
    }

    pub fn set(&self, ts: Timestamp) {
        self.0.store(ts.as_millis(), AtomicOrdering::Release);
    }

    pub fn advance(&self, duration: Duration) {
        self.0
            .fetch_add(duration_millis(duration), AtomicOrdering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.0.load(AtomicOrdering::Acquire))
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

// ----------------------------------------------------------------------------
// 3.3 Metric Values & Types
// ----------------------------------------------------------------------------

/// Timestamp as supplied by a producer, before coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl From<Timestamp> for RawTimestamp {
    fn from(ts: Timestamp) -> Self {
        RawTimestamp::Millis(ts.as_millis())
    }
}

impl From<i64> for RawTimestamp {
    fn from(millis: i64) -> Self {
        RawTimestamp::Millis(millis)
    }
}

impl From<&str> for RawTimestamp {
    fn from(text: &str) -> Self {
        RawTimestamp::Text(text.to_string())
    }
}

impl From<String> for RawTimestamp {
    fn from(text: String) -> Self {
        RawTimestamp::Text(text)
    }
}

/// The single scalar measurement carried by a normalized metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value; text is parsed, non-finite results are rejected.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(s) => s.trim().parse::<f64>().ok(),
        };
        value.filter(|v| v.is_finite())
    }

    /// Convert a JSON field into a value: numbers and strings are kept, anything
    /// else is rendered as its JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Number(n) => n
                .as_f64()
                .map(MetricValue::Number)
                .unwrap_or_else(|| MetricValue::Text(n.to_string())),
            JsonValue::String(s) => MetricValue::Text(s.clone()),
            other => MetricValue::Text(other.to_string()),
        }
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", n),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// Closed set of normalized metric kinds, inferred from payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    PathAccess,
    StorageUsage,
    Performance,
    Generic,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::PathAccess => "path_access",
            MetricType::StorageUsage => "storage_usage",
            MetricType::Performance => "performance",
            MetricType::Generic => "generic",
        }
    }
}

impl Display for MetricType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Raw & Normalized Metrics
// ----------------------------------------------------------------------------

/// Auxiliary, type-specific fields of a normalized metric.
pub type Metadata = JsonMap<String, JsonValue>;

/// An unprocessed observation as published by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetric {
    /// Producing collector
    pub source: String,
    /// Collector-specific payload
    #[serde(default)]
    pub data: JsonValue,
    /// Epoch millis or ISO-8601 text; capture time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<RawTimestamp>,
}

impl RawMetric {
    pub fn new(source: impl Into<String>, data: JsonValue) -> Self {
        Self {
            source: source.into(),
            data,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<RawTimestamp>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// The canonical, analysis-ready metric shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetric {
    pub source: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub timestamp: Timestamp,
    pub value: MetricValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl NormalizedMetric {
    pub fn new(
        source: impl Into<String>,
        metric_type: MetricType,
        timestamp: Timestamp,
        value: impl Into<MetricValue>,
    ) -> Self {
        Self {
            source: source.into(),
            metric_type,
            timestamp,
            value: value.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// String metadata field, if present
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(JsonValue::as_str)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Query Time Range
// ----------------------------------------------------------------------------

/// Inclusive time window for `collect` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Build a range from two ISO-8601 strings.
    pub fn parse(start: &str, end: &str) -> PulseResult<Self> {
        let parse = |text: &str| {
            Timestamp::parse(text).ok_or_else(|| PulseError::InvalidTimeRange {
                message: format!("'{}' is not an ISO-8601 timestamp", text),
            })
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    /// The `minutes` preceding `now`.
    pub fn last_minutes(now: Timestamp, minutes: u64) -> Self {
        Self::new(now.sub_duration(Duration::from_secs(minutes.saturating_mul(60))), now)
    }

    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts.is_within(self.start, self.end)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Library operations degrade instead of failing: malformed payloads become
// `generic` metrics, unknown sources and categories are skipped, per-entry walk
// errors are logged. Only top-level failures surface as `PulseError`.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid time range: {message}")]
    InvalidTimeRange { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PulseError::Config(_) => false,
            PulseError::Collector(e) => e.is_recoverable(),
            PulseError::Bus(_) => true,
            PulseError::InvalidTimeRange { .. } => true,
            PulseError::Io(_) => true,
            PulseError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "config",
            PulseError::Collector(_) => "collector",
            PulseError::Bus(_) => "bus",
            PulseError::InvalidTimeRange { .. } => "query",
            PulseError::Io(_) => "io",
            PulseError::Internal(_) => "internal",
        }
    }
}

pub type PulseResult<T> = Result<T, PulseError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from metric collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to walk '{}': {source}", .path.display())]
    WalkFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to inspect '{}': {source}", .path.display())]
    StatFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to watch '{}': {message}", .path.display())]
    WatchFailed { path: PathBuf, message: String },

    #[error("Collector '{name}' not found")]
    NotFound { name: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollectorError::NotFound { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.4 Bus Errors
// ----------------------------------------------------------------------------

/// Failure reported by a bus handler. Never propagated past the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Handler on '{channel}' failed: {message}")]
    HandlerFailed { channel: String, message: String },

    #[error("Handler on '{channel}' panicked: {message}")]
    HandlerPanicked { channel: String, message: String },
}

impl BusError {
    pub fn handler_failed(channel: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::HandlerFailed {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing, PULSE_* environment overrides, validation and defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Storage collector settings
    #[serde(default)]
    pub storage: StorageCollectorConfig,

    /// Memory-path collector settings
    #[serde(default)]
    pub memory_path: MemoryPathConfig,

    /// Retention policy for retained metrics and sample buffers
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn parse_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.listener_warn_threshold < MIN_LISTENER_WARN_THRESHOLD {
            return Err(ConfigError::invalid_value(
                "bus.listener_warn_threshold",
                format!(
                    "Listener threshold must be at least {}",
                    MIN_LISTENER_WARN_THRESHOLD
                ),
            ));
        }

        if self.bus.stream_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "bus.stream_capacity",
                "Stream capacity must be greater than zero",
            ));
        }

        if self.engine.summary_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "engine.summary_interval_secs",
                "Summary interval must be greater than zero",
            ));
        }

        if self.memory_path.top_paths_limit == 0 || self.memory_path.pattern_top_paths == 0 {
            return Err(ConfigError::invalid_value(
                "memory_path",
                "Top path limits must be greater than zero",
            ));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Expected one of {:?}", LOG_FORMATS),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 5.2 Section Configurations
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Seconds between analysis summaries in `pulse run`
    #[serde(default = "default_summary_interval")]
    pub summary_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            summary_interval_secs: default_summary_interval(),
        }
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Listeners per channel tolerated before a leak warning
    #[serde(default = "default_listener_warn_threshold")]
    pub listener_warn_threshold: usize,

    /// Broadcast buffer of async channel streams
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listener_warn_threshold: default_listener_warn_threshold(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

/// Storage collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCollectorConfig {
    /// Directories walked (and optionally watched) by `pulse run`
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Follow symbolic links while walking
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,

    /// Maximum directory depth below a root (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,

    /// Watch roots for changes after the initial walk
    #[serde(default)]
    pub watch: bool,
}

impl Default for StorageCollectorConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            follow_symlinks: true,
            max_depth: None,
            watch: false,
        }
    }
}

/// Memory-path collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPathConfig {
    #[serde(default = "default_top_paths_limit")]
    pub top_paths_limit: usize,

    #[serde(default = "default_recent_window_minutes")]
    pub recent_window_minutes: u64,

    #[serde(default = "default_pattern_top_paths")]
    pub pattern_top_paths: usize,

    #[serde(default = "default_pattern_recent_minutes")]
    pub pattern_recent_minutes: u64,
}

impl Default for MemoryPathConfig {
    fn default() -> Self {
        Self {
            top_paths_limit: default_top_paths_limit(),
            recent_window_minutes: default_recent_window_minutes(),
            pattern_top_paths: default_pattern_top_paths(),
            pattern_recent_minutes: default_pattern_recent_minutes(),
        }
    }
}

/// Retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Metrics kept per source, oldest evicted first (0 = unbounded)
    #[serde(default = "default_max_per_source")]
    pub max_per_source: usize,

    /// Drop retained metrics ingested longer ago than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

impl RetentionConfig {
    pub fn unbounded() -> Self {
        Self {
            max_per_source: 0,
            max_age_secs: None,
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_per_source: default_max_per_source(),
            max_age_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for pretty/compact output
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log records
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_summary_interval() -> u64 {
    DEFAULT_SUMMARY_INTERVAL_SECS
}

fn default_listener_warn_threshold() -> usize {
    DEFAULT_LISTENER_WARN_THRESHOLD
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

fn default_top_paths_limit() -> usize {
    DEFAULT_TOP_PATHS_LIMIT
}

fn default_recent_window_minutes() -> u64 {
    DEFAULT_RECENT_WINDOW_MINUTES
}

fn default_pattern_top_paths() -> usize {
    DEFAULT_PATTERN_TOP_PATHS
}

fn default_pattern_recent_minutes() -> u64 {
    DEFAULT_PATTERN_RECENT_MINUTES
}

fn default_max_per_source() -> usize {
    DEFAULT_MAX_METRICS_PER_SOURCE
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

fn parse_level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration.
///
/// Records go to stderr; stdout is reserved for command output. `RUST_LOG`
/// directives take precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> PulseResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .with_writer(std::io::stderr)
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .with_writer(std::io::stderr)
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| PulseError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: EVENT BUS
// ============================================================================
// Named, synchronous publish/subscribe channels (`metric:<name>`):
// - Delivery in emit order and handler registration order
// - Each handler isolated: an error or panic never reaches siblings
// - Handlers run outside the bus lock (they may emit or subscribe)
// - Optional broadcast stream per channel for async consumers
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Handlers & Subscriptions
// ----------------------------------------------------------------------------

/// A synchronous channel handler.
pub type MetricHandler = Arc<dyn Fn(&RawMetric) -> Result<(), BusError> + Send + Sync>;

/// Handle returned by `on_metric`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Channel {
    handlers: Vec<(SubscriptionId, MetricHandler)>,
    stream: Option<broadcast::Sender<Arc<RawMetric>>>,
    leak_warned: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            handlers: Vec::new(),
            stream: None,
            leak_warned: false,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Bus Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BusCounters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub emitted: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

// ----------------------------------------------------------------------------
// 7.3 Event Bus
// ----------------------------------------------------------------------------

/// In-process metric bus. Owns no metric data, only routes it.
pub struct EventBus {
    channels: RwLock<HashMap<String, Channel>>,
    next_id: AtomicU64,
    listener_warn_threshold: usize,
    stream_capacity: usize,
    counters: BusCounters,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(&BusConfig::default())
    }

    pub fn with_config(config: &BusConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            listener_warn_threshold: config.listener_warn_threshold.max(MIN_LISTENER_WARN_THRESHOLD),
            stream_capacity: config.stream_capacity.max(1),
            counters: BusCounters::default(),
        }
    }

    /// Namespaced channel key for a metric name.
    pub fn channel_name(name: &str) -> String {
        format!("{}{}", CHANNEL_PREFIX, name)
    }

    /// Register `handler` for every future emit on `name`.
    pub fn on_metric<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&RawMetric) -> Result<(), BusError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let key = Self::channel_name(name);

        let mut channels = self.channels.write();
        let channel = channels.entry(key.clone()).or_insert_with(Channel::new);
        channel.handlers.push((id, Arc::new(handler)));

        let listeners = channel.handlers.len();
        if listeners > self.listener_warn_threshold && !channel.leak_warned {
            channel.leak_warned = true;
            warn!(
                target: "pulse::bus",
                channel = %key,
                listeners,
                threshold = self.listener_warn_threshold,
                "Listener count exceeds threshold, possible handler leak"
            );
        }

        debug!(target: "pulse::bus", channel = %key, listeners, "Handler subscribed");
        id
    }

    /// Remove a subscription. Returns false when it was not registered.
    pub fn off_metric(&self, name: &str, id: SubscriptionId) -> bool {
        let key = Self::channel_name(name);
        let mut channels = self.channels.write();
        let Some(channel) = channels.get_mut(&key) else {
            return false;
        };

        let before = channel.handlers.len();
        channel.handlers.retain(|(sub, _)| *sub != id);
        let removed = channel.handlers.len() != before;

        if channel.handlers.len() <= self.listener_warn_threshold {
            channel.leak_warned = false;
        }
        if channel.handlers.is_empty() && channel.stream.is_none() {
            channels.remove(&key);
        }

        if removed {
            debug!(target: "pulse::bus", channel = %key, "Handler unsubscribed");
        }
        removed
    }

    /// Publish `metric` to every current subscriber of `name`.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn emit_metric(&self, name: &str, metric: RawMetric) -> usize {
        let key = Self::channel_name(name);
        self.counters.emitted.fetch_add(1, AtomicOrdering::Relaxed);

        let (handlers, stream) = {
            let channels = self.channels.read();
            match channels.get(&key) {
                Some(channel) => (
                    channel
                        .handlers
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect::<Vec<_>>(),
                    channel.stream.clone(),
                ),
                None => {
                    trace!(target: "pulse::bus", channel = %key, "No subscribers");
                    return 0;
                }
            }
        };

        let mut delivered = 0;
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&metric)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(payload) => BusError::HandlerPanicked {
                    channel: key.clone(),
                    message: panic_message(payload.as_ref()),
                },
            };
            self.counters
                .handler_failures
                .fetch_add(1, AtomicOrdering::Relaxed);
            warn!(target: "pulse::bus", channel = %key, error = %failure, "Metric handler failed");
        }

        if let Some(stream) = stream {
            if stream.receiver_count() > 0 {
                // Lagging receivers observe `RecvError::Lagged`; nothing to do here.
                let _ = stream.send(Arc::new(metric));
            }
        }

        self.counters
            .delivered
            .fetch_add(delivered as u64, AtomicOrdering::Relaxed);
        delivered
    }

    /// Async view of a channel. Receives every metric emitted after this call.
    pub fn stream(&self, name: &str) -> broadcast::Receiver<Arc<RawMetric>> {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(Self::channel_name(name))
            .or_insert_with(Channel::new);
        let capacity = self.stream_capacity;
        channel
            .stream
            .get_or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    /// Current number of handlers on `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.channels
            .read()
            .get(&Self::channel_name(name))
            .map_or(0, |channel| channel.handlers.len())
    }

    /// Namespaced keys of every channel with subscribers, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.channels.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted: self.counters.emitted.load(AtomicOrdering::Relaxed),
            delivered: self.counters.delivered.load(AtomicOrdering::Relaxed),
            handler_failures: self.counters.handler_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channels())
            .field("listener_warn_threshold", &self.listener_warn_threshold)
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// SECTION 8: METRIC NORMALIZER
// ============================================================================
// Pure RawMetric -> NormalizedMetric mapping. Type inference precedence, first
// match wins:
//   1. `path` and `accessCount`  -> path_access
//   2. `size`                    -> storage_usage
//   3. `duration`                -> performance
//   4. anything else             -> generic
// A field counts as present when it exists and is not null, so zero sizes and
// zero durations keep their type.
// ============================================================================

/// Normalize using the current wall-clock time as capture time.
pub fn normalize(raw: &RawMetric) -> NormalizedMetric {
    normalize_at(raw, Timestamp::now())
}

/// Normalize with an explicit capture time (used when `raw.timestamp` is absent
/// or unusable).
pub fn normalize_at(raw: &RawMetric, captured_at: Timestamp) -> NormalizedMetric {
    let (metric_type, value, metadata) = classify(&raw.data);
    NormalizedMetric {
        source: raw.source.clone(),
        metric_type,
        timestamp: resolve_timestamp(raw.timestamp.as_ref(), captured_at),
        value,
        metadata,
    }
}

/// Coerce a producer timestamp to epoch millis.
pub fn resolve_timestamp(timestamp: Option<&RawTimestamp>, captured_at: Timestamp) -> Timestamp {
    match timestamp {
        None => captured_at,
        Some(RawTimestamp::Millis(millis)) => Timestamp::from_millis(*millis),
        Some(RawTimestamp::Fractional(millis)) if millis.is_finite() => {
            Timestamp::from_millis(millis.trunc() as i64)
        }
        Some(RawTimestamp::Fractional(millis)) => {
            debug!(target: "pulse::normalize", timestamp = %millis, "Non-finite timestamp, using capture time");
            captured_at
        }
        Some(RawTimestamp::Text(text)) => Timestamp::parse(text).unwrap_or_else(|| {
            warn!(target: "pulse::normalize", timestamp = %text, "Unparseable timestamp, using capture time");
            captured_at
        }),
    }
}

fn field<'a>(data: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    data.get(key).filter(|value| !value.is_null())
}

fn metadata_from<const N: usize>(entries: [(&str, Option<&JsonValue>); N]) -> Metadata {
    entries
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.clone())))
        .collect()
}

fn classify(data: &JsonValue) -> (MetricType, MetricValue, Option<Metadata>) {
    if let (Some(path), Some(count)) = (field(data, "path"), field(data, "accessCount")) {
        let metadata = metadata_from([("path", Some(path)), ("lastAccess", field(data, "lastAccess"))]);
        return (MetricType::PathAccess, MetricValue::from_json(count), Some(metadata));
    }

    if let Some(size) = field(data, "size") {
        let metadata = metadata_from([
            ("location", field(data, "location")),
            ("type", field(data, "fileType")),
        ]);
        return (MetricType::StorageUsage, MetricValue::from_json(size), Some(metadata));
    }

    if let Some(duration) = field(data, "duration") {
        let metadata = metadata_from([
            ("operation", field(data, "operation")),
            ("status", field(data, "status")),
        ]);
        return (MetricType::Performance, MetricValue::from_json(duration), Some(metadata));
    }

    let value = match data {
        JsonValue::String(text) => MetricValue::Text(text.clone()),
        other => MetricValue::Text(other.to_string()),
    };
    (MetricType::Generic, value, None)
}

// ============================================================================
// SECTION 9: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn raw(data: JsonValue) -> RawMetric {
        RawMetric::new("test", data)
    }

    #[test]
    fn test_timestamp_parse_formats() {
        assert_eq!(
            Timestamp::parse("2024-01-01T00:00:00Z"),
            Some(Timestamp::from_millis(1_704_067_200_000))
        );
        assert_eq!(
            Timestamp::parse("2024-01-01T01:00:00+01:00"),
            Some(Timestamp::from_millis(1_704_067_200_000))
        );
        assert_eq!(
            Timestamp::parse("2024-01-01 00:00:00.250"),
            Some(Timestamp::from_millis(1_704_067_200_250))
        );
        assert_eq!(
            Timestamp::parse("2024-01-01"),
            Some(Timestamp::from_millis(1_704_067_200_000))
        );
        assert_eq!(Timestamp::parse("yesterday"), None);
    }

    #[test]
    fn test_timestamp_hour_and_display() {
        let ts = Timestamp::from_millis(1_704_067_200_000 + 13 * 3_600_000);
        assert_eq!(ts.hour_of_day(), Some(13));
        assert_eq!(ts.to_string(), "2024-01-01T13:00:00.000Z");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), Timestamp::from_millis(3_000));
        clock.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }

    #[test]
    fn test_time_range_parse() {
        let range = TimeRange::parse("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z").unwrap();
        assert!(range.contains(Timestamp::from_millis(1_704_067_200_000)));
        assert!(range.contains(Timestamp::from_millis(1_704_153_600_000)));
        assert!(!range.contains(Timestamp::from_millis(1_704_153_600_001)));

        let err = TimeRange::parse("not-a-date", "2024-01-02").unwrap_err();
        assert_eq!(err.category(), "query");
    }

    #[test]
    fn test_metric_value_conversions() {
        assert_eq!(MetricValue::from(42u64).as_f64(), Some(42.0));
        assert_eq!(MetricValue::from(" 1.5 ").as_f64(), Some(1.5));
        assert_eq!(MetricValue::from("NaN").as_f64(), None);
        assert_eq!(MetricValue::from_json(&json!(true)), MetricValue::Text("true".into()));
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.bus.listener_warn_threshold, DEFAULT_LISTENER_WARN_THRESHOLD);
        assert_eq!(config.memory_path.top_paths_limit, DEFAULT_TOP_PATHS_LIMIT);
        assert_eq!(config.retention.max_per_source, DEFAULT_MAX_METRICS_PER_SOURCE);
        assert!(config.storage.follow_symlinks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_generate_and_parse() {
        let rendered = EngineConfig::generate_default_config().unwrap();
        let parsed = EngineConfig::parse_toml(&rendered).unwrap();
        assert_eq!(parsed.logging.format, "pretty");
        assert_eq!(parsed.engine.instance_name, ENGINE_NAME);
    }

    #[test]
    fn test_config_validation() {
        let err = EngineConfig::parse_toml("[bus]\nlistener_warn_threshold = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "bus.listener_warn_threshold"));

        let err = EngineConfig::parse_toml("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let config = EngineConfig::parse_toml("[retention]\nmax_per_source = 0\nmax_age_secs = 30\n").unwrap();
        assert_eq!(config.retention.max_age(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_missing_file() {
        let err = EngineConfig::load("/definitely/not/here/pulse.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    // ------------------------------------------------------------------------
    // Normalizer
    // ------------------------------------------------------------------------

    #[rstest]
    #[case(json!({"path": "p", "accessCount": 3, "size": 9}), MetricType::PathAccess, MetricValue::Number(3.0))]
    #[case(json!({"path": "p", "size": 9, "duration": 4}), MetricType::StorageUsage, MetricValue::Number(9.0))]
    #[case(json!({"accessCount": 3, "duration": 4}), MetricType::Performance, MetricValue::Number(4.0))]
    #[case(json!({"size": null, "duration": 0}), MetricType::Performance, MetricValue::Number(0.0))]
    #[case(json!({"foo": 1}), MetricType::Generic, MetricValue::Text("{\"foo\":1}".into()))]
    #[case(json!("plain"), MetricType::Generic, MetricValue::Text("plain".into()))]
    #[case(json!(12), MetricType::Generic, MetricValue::Text("12".into()))]
    fn test_type_inference_precedence(
        #[case] data: JsonValue,
        #[case] expected_type: MetricType,
        #[case] expected_value: MetricValue,
    ) {
        let metric = normalize_at(&raw(data), Timestamp::EPOCH);
        assert_eq!(metric.metric_type, expected_type);
        assert_eq!(metric.value, expected_value);
    }

    #[test]
    fn test_normalize_path_access_metadata() {
        let metric = normalize(&raw(json!({"path": "p", "accessCount": 3})));

        assert_eq!(metric.metric_type, MetricType::PathAccess);
        assert_eq!(metric.value, MetricValue::Number(3.0));
        let mut expected = Metadata::new();
        expected.insert("path".into(), json!("p"));
        assert_eq!(metric.metadata, Some(expected));

        let stamped = raw(json!({"path": "p", "accessCount": 3})).with_timestamp(1_704_067_200_000_i64);
        assert_eq!(normalize(&stamped), normalize(&stamped));
        assert_eq!(normalize(&stamped).timestamp, Timestamp::from_millis(1_704_067_200_000));
    }

    #[test]
    fn test_normalize_zero_size() {
        let metric = normalize(&raw(json!({"size": 0, "location": "l", "fileType": "txt"})));

        assert_eq!(metric.metric_type, MetricType::StorageUsage);
        assert_eq!(metric.value, MetricValue::Number(0.0));
        assert_eq!(metric.metadata_str("location"), Some("l"));
        assert_eq!(metric.metadata_str("type"), Some("txt"));
    }

    #[test]
    fn test_normalize_generic_has_no_metadata() {
        let metric = normalize(&raw(json!({"foo": "bar"})));
        assert_eq!(metric.metric_type, MetricType::Generic);
        assert!(metric.metadata.is_none());

        let encoded = serde_json::to_value(&metric).unwrap();
        assert!(encoded.get("metadata").is_none());
        assert_eq!(encoded["type"], json!("generic"));
    }

    #[test]
    fn test_timestamp_coercion() {
        let captured = Timestamp::from_millis(5);
        let iso = raw(json!({"size": 1})).with_timestamp("2024-01-01T00:00:00Z");
        assert_eq!(
            normalize_at(&iso, captured).timestamp,
            Timestamp::from_millis(1_704_067_200_000)
        );

        let millis = raw(json!({"size": 1})).with_timestamp(1_234i64);
        assert_eq!(normalize_at(&millis, captured).timestamp, Timestamp::from_millis(1_234));

        let fractional = RawMetric {
            timestamp: Some(RawTimestamp::Fractional(99.9)),
            ..raw(json!({}))
        };
        assert_eq!(normalize_at(&fractional, captured).timestamp, Timestamp::from_millis(99));

        let absent = raw(json!({"size": 1}));
        assert_eq!(normalize_at(&absent, captured).timestamp, captured);

        let before = Timestamp::now();
        let now = normalize(&absent).timestamp;
        assert!(now >= before && now.as_millis() - before.as_millis() < 1_000);
    }

    #[test]
    fn test_invalid_timestamp_falls_back_to_capture_time() {
        let captured = Timestamp::from_millis(77);
        let bad = raw(json!({"duration": 1})).with_timestamp("not a date");
        assert_eq!(normalize_at(&bad, captured).timestamp, captured);
    }

    #[test]
    fn test_raw_metric_deserialization() {
        let parsed: RawMetric =
            serde_json::from_str(r#"{"source":"x","data":{"duration":2.5},"timestamp":"2024-01-01"}"#).unwrap();
        assert_eq!(parsed.timestamp, Some(RawTimestamp::Text("2024-01-01".into())));

        let parsed: RawMetric = serde_json::from_str(r#"{"source":"x","timestamp":10}"#).unwrap();
        assert_eq!(parsed.timestamp, Some(RawTimestamp::Millis(10)));
        assert_eq!(normalize(&parsed).metric_type, MetricType::Generic);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_deterministic(path in "[a-z/]{1,24}", count in 0u64..10_000, ts in 0i64..4_000_000_000_000) {
            let metric = raw(json!({"path": path, "accessCount": count})).with_timestamp(ts);
            let first = normalize_at(&metric, Timestamp::EPOCH);
            let second = normalize_at(&metric, Timestamp::MAX);

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.metric_type, MetricType::PathAccess);
            prop_assert_eq!(first.value.as_f64(), Some(count as f64));
            prop_assert_eq!(first.timestamp, Timestamp::from_millis(ts));
        }
    }

    // ------------------------------------------------------------------------
    // Event Bus
    // ------------------------------------------------------------------------

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> MetricHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &str| -> MetricHandler {
            let sink = Arc::clone(&sink);
            let label = label.to_string();
            Arc::new(move |metric: &RawMetric| {
                sink.lock().push(format!("{}:{}", label, metric.data));
                Ok::<(), BusError>(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_bus_delivery_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = make("a");
        let second = make("b");
        bus.on_metric("storage", move |m| first(m));
        bus.on_metric("storage", move |m| second(m));

        bus.emit_metric("storage", raw(json!(1)));
        bus.emit_metric("storage", raw(json!(2)));
        bus.emit_metric("memory-path", raw(json!(3)));

        assert_eq!(*log.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
        assert_eq!(bus.channels(), vec!["metric:storage".to_string()]);
    }

    #[test]
    fn test_bus_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit_metric("nobody", raw(json!({}))), 0);
        assert_eq!(bus.stats().emitted, 1);
    }

    #[test]
    fn test_bus_unsubscribe() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let handler = make("a");
        let id = bus.on_metric("storage", move |m| handler(m));

        bus.emit_metric("storage", raw(json!(1)));
        assert!(bus.off_metric("storage", id));
        assert!(!bus.off_metric("storage", id));
        bus.emit_metric("storage", raw(json!(2)));

        assert_eq!(*log.lock(), vec!["a:1"]);
        assert_eq!(bus.listener_count("storage"), 0);
        assert!(bus.channels().is_empty());
    }

    #[test]
    fn test_bus_supports_many_subscribers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..25 {
            let hits = Arc::clone(&hits);
            bus.on_metric("storage", move |_| {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(bus.listener_count("storage"), 25);
        assert_eq!(bus.emit_metric("storage", raw(json!({}))), 25);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 25);
    }

    #[test]
    fn test_bus_isolates_failing_handlers() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let before = make("before");
        let after = make("after");

        bus.on_metric("storage", move |m| before(m));
        bus.on_metric("storage", |_| Err(BusError::handler_failed("metric:storage", "boom")));
        bus.on_metric("storage", |_| panic!("handler exploded"));
        bus.on_metric("storage", move |m| after(m));

        assert_eq!(bus.emit_metric("storage", raw(json!(1))), 2);
        assert_eq!(bus.emit_metric("storage", raw(json!(2))), 2);

        assert_eq!(*log.lock(), vec!["before:1", "after:1", "before:2", "after:2"]);
        let stats = bus.stats();
        assert_eq!(stats.handler_failures, 4);
        assert_eq!(stats.delivered, 4);
    }

    #[test]
    fn test_bus_handler_may_emit() {
        let bus = Arc::new(EventBus::new());
        let (log, make) = recorder();
        let downstream = make("b");
        bus.on_metric("b", move |m| downstream(m));

        let weak = Arc::downgrade(&bus);
        bus.on_metric("a", move |m| {
            if let Some(bus) = weak.upgrade() {
                bus.emit_metric("b", m.clone());
            }
            Ok(())
        });

        bus.emit_metric("a", raw(json!("hop")));
        assert_eq!(*log.lock(), vec!["b:\"hop\""]);
    }

    #[test]
    fn test_bus_stream() {
        let bus = EventBus::new();
        let mut rx = bus.stream("performance");

        bus.emit_metric("performance", raw(json!({"duration": 3})));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.data, json!({"duration": 3}));
        assert_eq!(bus.listener_count("performance"), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}

// ============================================================================
// SECTION 10: METRIC SOURCE TRAIT
// ============================================================================

/// A named producer the aggregator can pull a fresh snapshot from.
///
/// Implementors own their accumulated state exclusively; `collect` never
/// mutates it.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Source name, also the bus channel the source publishes on.
    fn name(&self) -> &str;

    /// Current accumulated state as normalized metrics.
    async fn collect(&self) -> Vec<NormalizedMetric>;

    /// Drop all accumulated state.
    fn reset(&self);
}

// ============================================================================
// SECTION 11: STORAGE COLLECTOR
// ============================================================================
// Storage usage observations, produced by walking a directory tree or pushed
// in reactively (single files, filesystem watcher). One record per file,
// published on the `storage` channel.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Storage Records
// ----------------------------------------------------------------------------

/// One observed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetricData {
    /// Size in bytes
    pub size: u64,
    /// Full path of the file
    pub location: String,
    /// Extension without the dot, `unknown` when absent
    pub file_type: String,
    /// Last modification time
    pub timestamp: Timestamp,
}

impl StorageMetricData {
    pub fn from_metadata(path: &Path, metadata: &FsMetadata) -> Self {
        let file_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .unwrap_or(UNKNOWN_FILE_TYPE)
            .to_string();
        let timestamp = metadata
            .modified()
            .map(Timestamp::from)
            .unwrap_or_else(|_| Timestamp::now());

        Self {
            size: metadata.len(),
            location: path.to_string_lossy().into_owned(),
            file_type,
            timestamp,
        }
    }

    /// Payload published on the bus.
    pub fn to_raw(&self) -> RawMetric {
        RawMetric::new(
            SOURCE_STORAGE,
            json!({
                "size": self.size,
                "location": self.location,
                "fileType": self.file_type,
            }),
        )
        .with_timestamp(self.timestamp)
    }

    pub fn to_normalized(&self) -> NormalizedMetric {
        let mut metadata = Metadata::new();
        metadata.insert("location".into(), json!(self.location));
        metadata.insert("type".into(), json!(self.file_type));

        NormalizedMetric::new(
            SOURCE_STORAGE,
            MetricType::StorageUsage,
            self.timestamp,
            self.size,
        )
        .with_metadata(metadata)
    }
}

/// Outcome of one `track_directory` walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    /// Entries skipped because of an I/O error
    pub errors: u64,
    /// Directories skipped because they were already visited
    pub skipped_cycles: u64,
}

// ----------------------------------------------------------------------------
// 11.2 Storage Metrics Collector
// ----------------------------------------------------------------------------

pub struct StorageMetricsCollector {
    bus: Arc<EventBus>,
    records: RwLock<Vec<StorageMetricData>>,
    follow_symlinks: bool,
    max_depth: Option<usize>,
}

impl StorageMetricsCollector {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_config(bus, &StorageCollectorConfig::default())
    }

    pub fn with_config(bus: Arc<EventBus>, config: &StorageCollectorConfig) -> Self {
        Self {
            bus,
            records: RwLock::new(Vec::new()),
            follow_symlinks: config.follow_symlinks,
            max_depth: config.max_depth,
        }
    }

    /// Recursively record every regular file below `path`, depth-first.
    ///
    /// Only an unreadable root fails the walk. Errors on individual entries are
    /// logged, counted in the summary and skipped. Each directory is visited at
    /// most once (by canonical path), so symlink cycles terminate.
    pub async fn track_directory(&self, path: impl AsRef<Path>) -> PulseResult<WalkSummary> {
        let path = path.as_ref();
        let started = Instant::now();

        let canonical = fs::canonicalize(path)
            .await
            .map_err(|source| CollectorError::WalkFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let mut visited = HashSet::new();
        visited.insert(canonical);
        let mut summary = WalkSummary::default();
        self.walk(path.to_path_buf(), 0, &mut visited, &mut summary)
            .await?;

        info!(
            target: "pulse::storage",
            root = %path.display(),
            files = summary.files,
            directories = summary.directories,
            bytes = summary.bytes,
            errors = summary.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Directory walk complete"
        );
        Ok(summary)
    }

    fn walk<'a>(
        &'a self,
        dir: PathBuf,
        depth: usize,
        visited: &'a mut HashSet<PathBuf>,
        summary: &'a mut WalkSummary,
    ) -> BoxFuture<'a, PulseResult<()>> {
        async move {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(source) if depth == 0 => {
                    return Err(CollectorError::WalkFailed { path: dir, source }.into());
                }
                Err(err) => {
                    warn!(target: "pulse::storage", path = %dir.display(), error = %err, "Cannot read directory, skipping");
                    summary.errors += 1;
                    return Ok(());
                }
            };
            summary.directories += 1;

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: "pulse::storage", path = %dir.display(), error = %err, "Directory listing interrupted");
                        summary.errors += 1;
                        break;
                    }
                };
                let path = entry.path();

                let metadata = if self.follow_symlinks {
                    fs::metadata(&path).await
                } else {
                    fs::symlink_metadata(&path).await
                };
                let metadata = match metadata {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(target: "pulse::storage", path = %path.display(), error = %err, "Cannot stat entry, skipping");
                        summary.errors += 1;
                        continue;
                    }
                };

                if metadata.is_dir() {
                    if self.max_depth.is_some_and(|max| depth >= max) {
                        trace!(target: "pulse::storage", path = %path.display(), "Max depth reached");
                        continue;
                    }
                    let canonical = match fs::canonicalize(&path).await {
                        Ok(canonical) => canonical,
                        Err(err) => {
                            warn!(target: "pulse::storage", path = %path.display(), error = %err, "Cannot resolve directory, skipping");
                            summary.errors += 1;
                            continue;
                        }
                    };
                    if !visited.insert(canonical) {
                        debug!(target: "pulse::storage", path = %path.display(), "Directory already visited, skipping");
                        summary.skipped_cycles += 1;
                        continue;
                    }
                    self.walk(path, depth + 1, visited, summary).await?;
                } else if metadata.is_file() {
                    let data = StorageMetricData::from_metadata(&path, &metadata);
                    summary.files += 1;
                    summary.bytes += data.size;
                    self.record(data);
                }
            }

            Ok(())
        }
        .boxed()
    }

    /// Observe a single file. Returns `None` for anything but a regular file.
    pub async fn track_file(&self, path: impl AsRef<Path>) -> PulseResult<Option<StorageMetricData>> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)
            .await
            .map_err(|source| CollectorError::StatFailed {
                path: path.to_path_buf(),
                source,
            })?;

        if !metadata.is_file() {
            return Ok(None);
        }

        let data = StorageMetricData::from_metadata(path, &metadata);
        self.record(data.clone());
        Ok(Some(data))
    }

    /// Store an observation and publish it on the `storage` channel.
    pub fn record(&self, data: StorageMetricData) {
        let raw = data.to_raw();
        self.records.write().push(data);
        self.bus.emit_metric(SOURCE_STORAGE, raw);
    }

    pub fn snapshot(&self) -> Vec<NormalizedMetric> {
        self.records
            .read()
            .iter()
            .map(StorageMetricData::to_normalized)
            .collect()
    }

    pub fn records(&self) -> Vec<StorageMetricData> {
        self.records.read().clone()
    }

    pub fn reset(&self) {
        self.records.write().clear();
        debug!(target: "pulse::storage", "Storage records cleared");
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Debug for StorageMetricsCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageMetricsCollector")
            .field("records", &self.len())
            .field("follow_symlinks", &self.follow_symlinks)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[async_trait]
impl MetricSource for StorageMetricsCollector {
    fn name(&self) -> &str {
        SOURCE_STORAGE
    }

    async fn collect(&self) -> Vec<NormalizedMetric> {
        self.snapshot()
    }

    fn reset(&self) {
        StorageMetricsCollector::reset(self)
    }
}

// ----------------------------------------------------------------------------
// 11.3 Filesystem Watching
// ----------------------------------------------------------------------------

/// Active watch on a directory tree. Watching stops when dropped.
#[cfg(feature = "fs-watch")]
pub struct StorageWatch {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

#[cfg(feature = "fs-watch")]
impl StorageWatch {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(feature = "fs-watch")]
impl Debug for StorageWatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageWatch")
            .field("root", &self.root)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[cfg(feature = "fs-watch")]
impl Drop for StorageWatch {
    fn drop(&mut self) {
        self.task.abort();
        debug!(target: "pulse::storage", root = %self.root.display(), "Storage watch stopped");
    }
}

#[cfg(feature = "fs-watch")]
impl StorageMetricsCollector {
    /// Record files created or modified below `path` as they change.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(self: &Arc<Self>, path: impl AsRef<Path>) -> PulseResult<StorageWatch> {
        let root = path.as_ref().to_path_buf();
        let watch_failed = |e: notify::Error| CollectorError::WatchFailed {
            path: root.clone(),
            message: e.to_string(),
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    for changed in event.paths {
                        if tx.send(changed).is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(target: "pulse::storage", error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(watch_failed)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(watch_failed)?;

        let collector = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(changed) = rx.recv().await {
                match collector.track_file(&changed).await {
                    Ok(Some(data)) => {
                        trace!(target: "pulse::storage", location = %data.location, size = data.size, "File change recorded")
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(target: "pulse::storage", path = %changed.display(), error = %err, "Changed entry not recorded")
                    }
                }
            }
        });

        info!(target: "pulse::storage", root = %root.display(), "Watching directory");
        Ok(StorageWatch {
            root,
            _watcher: watcher,
            task,
        })
    }
}

// ============================================================================
// SECTION 12: MEMORY-PATH COLLECTOR
// ============================================================================
// Access frequency and operation history per logical path key (any
// application-defined identifier). Every access publishes the updated record
// on the `memory-path` channel.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Path Records
// ----------------------------------------------------------------------------

/// Access history of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPathData {
    pub path: String,
    pub access_count: u64,
    pub last_access: Timestamp,
    /// Set on the first access, never changes afterwards
    pub first_access: Timestamp,
    pub operations: Vec<String>,
}

impl MemoryPathData {
    fn first(path: &str, operation: &str, now: Timestamp) -> Self {
        Self {
            path: path.to_string(),
            access_count: 1,
            last_access: now,
            first_access: now,
            operations: vec![operation.to_string()],
        }
    }

    fn touch(&mut self, operation: &str, now: Timestamp) {
        self.access_count += 1;
        self.last_access = now;
        self.operations.push(operation.to_string());
    }

    pub fn to_raw(&self) -> RawMetric {
        RawMetric::new(
            SOURCE_MEMORY_PATH,
            json!({
                "path": self.path,
                "accessCount": self.access_count,
                "lastAccess": self.last_access,
                "firstAccess": self.first_access,
                "operations": self.operations,
            }),
        )
        .with_timestamp(self.last_access)
    }

    pub fn to_normalized(&self) -> NormalizedMetric {
        let mut metadata = Metadata::new();
        metadata.insert("path".into(), json!(self.path));
        metadata.insert("firstAccess".into(), json!(self.first_access));
        metadata.insert("operations".into(), json!(self.operations));

        NormalizedMetric::new(
            SOURCE_MEMORY_PATH,
            MetricType::PathAccess,
            self.last_access,
            self.access_count,
        )
        .with_metadata(metadata)
    }
}

/// Insertion-ordered path table.
#[derive(Debug, Default)]
struct PathTable {
    records: Vec<MemoryPathData>,
    index: HashMap<String, usize>,
}

impl PathTable {
    fn upsert(&mut self, path: &str, operation: &str, now: Timestamp) -> MemoryPathData {
        match self.index.get(path) {
            Some(&slot) => {
                let record = &mut self.records[slot];
                record.touch(operation, now);
                record.clone()
            }
            None => {
                let record = MemoryPathData::first(path, operation, now);
                self.index.insert(path.to_string(), self.records.len());
                self.records.push(record.clone());
                record
            }
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }
}

/// Result of `analyze_access_patterns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPatternReport {
    pub total_accesses: u64,
    pub unique_paths: usize,
    pub operation_distribution: BTreeMap<String, u64>,
    pub top_paths: Vec<MemoryPathData>,
    pub recent_activity: Vec<MemoryPathData>,
}

// ----------------------------------------------------------------------------
// 12.2 Memory-Path Metrics Collector
// ----------------------------------------------------------------------------

pub struct MemoryPathMetricsCollector {
    bus: Arc<EventBus>,
    clock: SharedClock,
    table: RwLock<PathTable>,
    config: MemoryPathConfig,
}

impl MemoryPathMetricsCollector {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_config(bus, system_clock(), MemoryPathConfig::default())
    }

    pub fn with_config(bus: Arc<EventBus>, clock: SharedClock, config: MemoryPathConfig) -> Self {
        Self {
            bus,
            clock,
            table: RwLock::new(PathTable::default()),
            config,
        }
    }

    /// Record one access to `path` and publish the updated record.
    pub fn track_access(&self, path: &str, operation: &str) -> MemoryPathData {
        let now = self.clock.now();
        let record = self.table.write().upsert(path, operation, now);

        trace!(
            target: "pulse::memory_path",
            path,
            operation,
            access_count = record.access_count,
            "Path access tracked"
        );
        self.bus.emit_metric(SOURCE_MEMORY_PATH, record.to_raw());
        record
    }

    pub fn get(&self, path: &str) -> Option<MemoryPathData> {
        let table = self.table.read();
        table.index.get(path).map(|&slot| table.records[slot].clone())
    }

    /// Paths by descending access count; ties keep insertion order.
    pub fn get_top_paths(&self, limit: usize) -> Vec<MemoryPathData> {
        let mut records = self.table.read().records.clone();
        records.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        records.truncate(limit);
        records
    }

    /// `get_top_paths` with the configured default limit.
    pub fn top_paths(&self) -> Vec<MemoryPathData> {
        self.get_top_paths(self.config.top_paths_limit)
    }

    /// Paths last accessed within the past `minutes`.
    pub fn get_recent_accesses(&self, minutes: u64) -> Vec<MemoryPathData> {
        let window = TimeRange::last_minutes(self.clock.now(), minutes);
        self.table
            .read()
            .records
            .iter()
            .filter(|record| record.last_access >= window.start)
            .cloned()
            .collect()
    }

    /// `get_recent_accesses` with the configured default window.
    pub fn recent_accesses(&self) -> Vec<MemoryPathData> {
        self.get_recent_accesses(self.config.recent_window_minutes)
    }

    pub fn analyze_access_patterns(&self) -> AccessPatternReport {
        let (total_accesses, unique_paths, operation_distribution) = {
            let table = self.table.read();
            let mut distribution = BTreeMap::new();
            for operation in table.records.iter().flat_map(|r| r.operations.iter()) {
                *distribution.entry(operation.clone()).or_insert(0u64) += 1;
            }
            let total = table.records.iter().map(|r| r.access_count).sum::<u64>();
            (total, table.records.len(), distribution)
        };

        AccessPatternReport {
            total_accesses,
            unique_paths,
            operation_distribution,
            top_paths: self.get_top_paths(self.config.pattern_top_paths),
            recent_activity: self.get_recent_accesses(self.config.pattern_recent_minutes),
        }
    }

    pub fn snapshot(&self) -> Vec<NormalizedMetric> {
        self.table
            .read()
            .records
            .iter()
            .map(MemoryPathData::to_normalized)
            .collect()
    }

    pub fn reset(&self) {
        self.table.write().clear();
        debug!(target: "pulse::memory_path", "Path records cleared");
    }

    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().records.is_empty()
    }
}

impl Debug for MemoryPathMetricsCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPathMetricsCollector")
            .field("paths", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl MetricSource for MemoryPathMetricsCollector {
    fn name(&self) -> &str {
        SOURCE_MEMORY_PATH
    }

    async fn collect(&self) -> Vec<NormalizedMetric> {
        self.snapshot()
    }

    fn reset(&self) {
        MemoryPathMetricsCollector::reset(self)
    }
}

// ============================================================================
// SECTION 13: PERFORMANCE COLLECTOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
        }
    }
}

/// One timed operation. `duration` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub operation: String,
    pub duration: f64,
    pub status: OperationStatus,
    pub timestamp: Timestamp,
}

impl PerformanceSample {
    pub fn to_raw(&self) -> RawMetric {
        RawMetric::new(
            SOURCE_PERFORMANCE,
            json!({
                "duration": self.duration,
                "operation": self.operation,
                "status": self.status.as_str(),
            }),
        )
        .with_timestamp(self.timestamp)
    }

    pub fn to_normalized(&self) -> NormalizedMetric {
        let mut metadata = Metadata::new();
        metadata.insert("operation".into(), json!(self.operation));
        metadata.insert("status".into(), json!(self.status.as_str()));

        NormalizedMetric::new(
            SOURCE_PERFORMANCE,
            MetricType::Performance,
            self.timestamp,
            self.duration,
        )
        .with_metadata(metadata)
    }
}

/// Operation durations, bounded to the newest `capacity` samples.
pub struct PerformanceMetricsCollector {
    bus: Arc<EventBus>,
    clock: SharedClock,
    samples: Mutex<VecDeque<PerformanceSample>>,
    capacity: usize,
}

impl PerformanceMetricsCollector {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_config(bus, system_clock(), &RetentionConfig::default())
    }

    pub fn with_config(bus: Arc<EventBus>, clock: SharedClock, retention: &RetentionConfig) -> Self {
        Self {
            bus,
            clock,
            samples: Mutex::new(VecDeque::new()),
            capacity: retention.max_per_source,
        }
    }

    pub fn record(&self, operation: &str, duration: Duration, status: OperationStatus) -> PerformanceSample {
        let sample = PerformanceSample {
            operation: operation.to_string(),
            duration: duration.as_secs_f64() * 1_000.0,
            status,
            timestamp: self.clock.now(),
        };

        {
            let mut samples = self.samples.lock();
            samples.push_back(sample.clone());
            if self.capacity > 0 {
                while samples.len() > self.capacity {
                    samples.pop_front();
                }
            }
        }

        trace!(
            target: "pulse::performance",
            operation,
            duration_ms = sample.duration,
            status = status.as_str(),
            "Operation recorded"
        );
        self.bus.emit_metric(SOURCE_PERFORMANCE, sample.to_raw());
        sample
    }

    /// Await `future`, recording its duration and outcome under `operation`.
    pub async fn time<F, T, E>(&self, operation: &str, future: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = future.await;
        let status = if result.is_ok() {
            OperationStatus::Success
        } else {
            OperationStatus::Error
        };
        self.record(operation, started.elapsed(), status);
        result
    }

    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<NormalizedMetric> {
        self.samples
            .lock()
            .iter()
            .map(PerformanceSample::to_normalized)
            .collect()
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
        debug!(target: "pulse::performance", "Performance samples cleared");
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

impl Debug for PerformanceMetricsCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMetricsCollector")
            .field("samples", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl MetricSource for PerformanceMetricsCollector {
    fn name(&self) -> &str {
        SOURCE_PERFORMANCE
    }

    async fn collect(&self) -> Vec<NormalizedMetric> {
        self.snapshot()
    }

    fn reset(&self) {
        PerformanceMetricsCollector::reset(self)
    }
}

// ============================================================================
// SECTION 14: PHASE 2 TESTS
// ============================================================================


// ============================================================================
// SECTION 15: ANALYSIS
// ============================================================================
// Derived statistics over retained metrics. Every analysis degrades to an
// informative empty shape instead of failing.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Analysis Categories
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisCategory {
    Performance,
    Usage,
    Patterns,
}

impl AnalysisCategory {
    pub const ALL: [AnalysisCategory; 3] = [
        AnalysisCategory::Performance,
        AnalysisCategory::Usage,
        AnalysisCategory::Patterns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisCategory::Performance => "performance",
            AnalysisCategory::Usage => "usage",
            AnalysisCategory::Patterns => "patterns",
        }
    }

    /// Resolve requested names, expanding `all`. Unknown names are skipped,
    /// duplicates collapse onto their first occurrence.
    pub fn expand<S: AsRef<str>>(requested: &[S]) -> Vec<AnalysisCategory> {
        let mut categories = Vec::new();
        for name in requested {
            let name = name.as_ref();
            let resolved: Vec<AnalysisCategory> = if name == ALL {
                Self::ALL.to_vec()
            } else {
                match name.parse::<AnalysisCategory>() {
                    Ok(category) => vec![category],
                    Err(err) => {
                        debug!(target: "pulse::aggregator", error = %err, "Ignoring analysis category");
                        continue;
                    }
                }
            };
            for category in resolved {
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
        }
        categories
    }
}

impl FromStr for AnalysisCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "performance" => Ok(AnalysisCategory::Performance),
            "usage" => Ok(AnalysisCategory::Usage),
            "patterns" => Ok(AnalysisCategory::Patterns),
            other => Err(format!("unknown analysis category '{}'", other)),
        }
    }
}

impl Display for AnalysisCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 15.2 Result Shapes
// ----------------------------------------------------------------------------

/// Analysis result, or a summary explaining why there is none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Analysis<T> {
    Available(T),
    Unavailable { summary: String },
}

impl<T> Analysis<T> {
    pub fn unavailable(summary: impl Into<String>) -> Self {
        Analysis::Unavailable {
            summary: summary.into(),
        }
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Analysis::Available(value) => Some(value),
            Analysis::Unavailable { .. } => None,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            Analysis::Available(_) => None,
            Analysis::Unavailable { summary } => Some(summary),
        }
    }
}

/// Duration statistics in milliseconds. Percentiles use the nearest-rank method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub total_operations: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PerformanceStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted: Vec<OrderedFloat<f64>> = values.iter().copied().map(OrderedFloat).collect();
        sorted.sort_unstable();
        let count = sorted.len();
        let total: f64 = values.iter().sum();

        Some(Self {
            average: total / count as f64,
            min: sorted[0].0,
            max: sorted[count - 1].0,
            total_operations: count as u64,
            p50: nearest_rank(&sorted, 0.50),
            p95: nearest_rank(&sorted, 0.95),
            p99: nearest_rank(&sorted, 0.99),
        })
    }
}

/// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[OrderedFloat<f64>], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1].0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathCount {
    pub path: String,
    pub count: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Sum of all `storage_usage` values (bytes)
    pub total_storage_usage: f64,
    /// Path -> summed `path_access` values
    pub path_access_patterns: BTreeMap<String, f64>,
    /// Highest summed paths, descending; ties keep first-seen order
    pub most_accessed_paths: Vec<PathCount>,
}

/// Activity per UTC hour of day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStats {
    pub activity_by_hour: BTreeMap<u32, u64>,
    pub peak_activity_hour: u32,
    pub peak_activity_count: u64,
}

/// Output of `MetricsAggregator::analyze`; only requested categories are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<Analysis<PerformanceStats>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Analysis<PatternStats>>,
}

// ----------------------------------------------------------------------------
// 15.3 Analyzers
// ----------------------------------------------------------------------------

pub fn analyze_performance(metrics: &[NormalizedMetric]) -> Analysis<PerformanceStats> {
    let durations: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == MetricType::Performance)
        .filter_map(|m| m.value.as_f64())
        .collect();

    match PerformanceStats::from_values(&durations) {
        Some(stats) => Analysis::Available(stats),
        None => Analysis::unavailable(NO_PERFORMANCE_DATA),
    }
}

pub fn analyze_usage(metrics: &[NormalizedMetric]) -> UsageStats {
    let mut total_storage_usage = 0.0;
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, f64> = HashMap::new();

    for metric in metrics {
        match metric.metric_type {
            MetricType::StorageUsage => {
                total_storage_usage += metric.value.as_f64().unwrap_or(0.0);
            }
            MetricType::PathAccess => {
                let Some(path) = metric.metadata_str("path") else {
                    continue;
                };
                let value = metric.value.as_f64().unwrap_or(0.0);
                match totals.get_mut(path) {
                    Some(total) => *total += value,
                    None => {
                        order.push(path.to_string());
                        totals.insert(path.to_string(), value);
                    }
                }
            }
            _ => {}
        }
    }

    let mut most_accessed_paths: Vec<PathCount> = order
        .into_iter()
        .map(|path| {
            let count = totals.get(&path).copied().unwrap_or(0.0);
            PathCount { path, count }
        })
        .collect();
    most_accessed_paths.sort_by(|a, b| OrderedFloat(b.count).cmp(&OrderedFloat(a.count)));
    most_accessed_paths.truncate(USAGE_TOP_PATHS);

    UsageStats {
        total_storage_usage,
        path_access_patterns: totals.into_iter().collect(),
        most_accessed_paths,
    }
}

pub fn analyze_patterns(metrics: &[NormalizedMetric]) -> Analysis<PatternStats> {
    let mut activity_by_hour: BTreeMap<u32, u64> = BTreeMap::new();
    for hour in metrics.iter().filter_map(|m| m.timestamp.hour_of_day()) {
        *activity_by_hour.entry(hour).or_insert(0) += 1;
    }

    // Lowest hour wins ties.
    let mut peak: Option<(u32, u64)> = None;
    for (&hour, &count) in &activity_by_hour {
        if peak.map_or(true, |(_, best)| count > best) {
            peak = Some((hour, count));
        }
    }

    match peak {
        Some((peak_activity_hour, peak_activity_count)) => Analysis::Available(PatternStats {
            activity_by_hour,
            peak_activity_hour,
            peak_activity_count,
        }),
        None => Analysis::unavailable(NO_ACTIVITY_DATA),
    }
}

// ============================================================================
// SECTION 16: METRICS AGGREGATOR
// ============================================================================
// Single point of query across sources:
// - `collect` pulls live snapshots from registered sources
// - `analyze` runs over the retained index, fed by bus subscriptions
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Retained Index
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RetainedEntry {
    ingested_at: Timestamp,
    metric: NormalizedMetric,
}

/// Normalized bus history keyed by source, bounded by the retention policy.
#[derive(Debug)]
struct RetainedIndex {
    clock: SharedClock,
    max_per_source: usize,
    max_age: Option<Duration>,
    sources: RwLock<HashMap<String, VecDeque<RetainedEntry>>>,
    evicted: AtomicU64,
}

impl RetainedIndex {
    fn new(retention: &RetentionConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            max_per_source: retention.max_per_source,
            max_age: retention.max_age(),
            sources: RwLock::new(HashMap::new()),
            evicted: AtomicU64::new(0),
        }
    }

    fn ingest(&self, source: &str, raw: &RawMetric) {
        let now = self.clock.now();
        let metric = normalize_at(raw, now);

        let mut sources = self.sources.write();
        let entries = sources.entry(source.to_string()).or_default();
        entries.push_back(RetainedEntry {
            ingested_at: now,
            metric,
        });

        let mut evicted = 0;
        if self.max_per_source > 0 {
            while entries.len() > self.max_per_source {
                entries.pop_front();
                evicted += 1;
            }
        }
        if let Some(max_age) = self.max_age {
            evicted += Self::expire(entries, now.sub_duration(max_age));
        }
        if evicted > 0 {
            self.evicted.fetch_add(evicted, AtomicOrdering::Relaxed);
            trace!(target: "pulse::aggregator", source, evicted, "Retained metrics evicted");
        }
    }

    fn expire(entries: &mut VecDeque<RetainedEntry>, cutoff: Timestamp) -> u64 {
        let mut expired = 0;
        while entries.front().is_some_and(|entry| entry.ingested_at < cutoff) {
            entries.pop_front();
            expired += 1;
        }
        expired
    }

    fn prune(&self) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let cutoff = self.clock.now().sub_duration(max_age);
        let mut sources = self.sources.write();
        let expired: u64 = sources
            .values_mut()
            .map(|entries| Self::expire(entries, cutoff))
            .sum();
        if expired > 0 {
            self.evicted.fetch_add(expired, AtomicOrdering::Relaxed);
        }
    }

    fn metrics(&self, source: &str) -> Vec<NormalizedMetric> {
        self.prune();
        self.sources
            .read()
            .get(source)
            .map(|entries| entries.iter().map(|e| e.metric.clone()).collect())
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<NormalizedMetric> {
        self.prune();
        let sources = self.sources.read();
        let mut keys: Vec<&String> = sources.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| sources[key].iter().map(|e| e.metric.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.sources.read().values().map(VecDeque::len).sum()
    }

    fn clear(&self) {
        self.sources.write().clear();
    }
}

// ----------------------------------------------------------------------------
// 16.2 Metrics Aggregator
// ----------------------------------------------------------------------------

pub struct MetricsAggregator {
    bus: Arc<EventBus>,
    sources: DashMap<String, Arc<dyn MetricSource>>,
    index: Arc<RetainedIndex>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl MetricsAggregator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_config(bus, &RetentionConfig::default(), system_clock())
    }

    pub fn with_config(bus: Arc<EventBus>, retention: &RetentionConfig, clock: SharedClock) -> Self {
        Self {
            bus,
            sources: DashMap::new(),
            index: Arc::new(RetainedIndex::new(retention, clock)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Make `source` available to `collect` and retain what it publishes.
    pub fn register(&self, source: Arc<dyn MetricSource>) {
        let name = source.name().to_string();
        self.watch_channel(&name);
        if self.sources.insert(name.clone(), source).is_some() {
            warn!(target: "pulse::aggregator", source = %name, "Replaced registered source");
        } else {
            info!(target: "pulse::aggregator", source = %name, "Source registered");
        }
    }

    /// Retain metrics published on `name` without a registered source.
    ///
    /// Returns false when the channel is already watched.
    pub fn watch_channel(&self, name: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.iter().any(|(watched, _)| watched == name) {
            return false;
        }

        let index = Arc::clone(&self.index);
        let key = name.to_string();
        let id = self.bus.on_metric(name, move |raw| {
            index.ingest(&key, raw);
            Ok(())
        });
        subscriptions.push((name.to_string(), id));
        debug!(target: "pulse::aggregator", channel = %EventBus::channel_name(name), "Watching channel");
        true
    }

    /// Fresh snapshot per requested source, filtered to `range` (inclusive).
    ///
    /// `all` expands to every registered source; unknown names produce no key.
    pub async fn collect<S: AsRef<str>>(
        &self,
        sources: &[S],
        range: Option<TimeRange>,
    ) -> BTreeMap<String, Vec<NormalizedMetric>> {
        let mut result = BTreeMap::new();

        for name in self.expand_sources(sources) {
            let Some(source) = self.sources.get(&name).map(|entry| Arc::clone(entry.value())) else {
                debug!(target: "pulse::aggregator", source = %name, "Ignoring unknown source");
                continue;
            };

            let mut metrics = source.collect().await;
            if let Some(range) = range {
                metrics.retain(|metric| range.contains(metric.timestamp));
            }
            result.insert(name, metrics);
        }

        result
    }

    fn expand_sources<S: AsRef<str>>(&self, requested: &[S]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in requested {
            let name = name.as_ref();
            let expanded = if name == ALL { self.sources() } else { vec![name.to_string()] };
            for name in expanded {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Statistics over everything retained so far (not a fresh collect).
    pub async fn analyze<S: AsRef<str>>(&self, categories: &[S]) -> AnalysisReport {
        let categories = AnalysisCategory::expand(categories);
        let metrics = self.index.all();
        let mut report = AnalysisReport::default();

        for category in &categories {
            match category {
                AnalysisCategory::Performance => report.performance = Some(analyze_performance(&metrics)),
                AnalysisCategory::Usage => report.usage = Some(analyze_usage(&metrics)),
                AnalysisCategory::Patterns => report.patterns = Some(analyze_patterns(&metrics)),
            }
        }

        debug!(
            target: "pulse::aggregator",
            categories = ?categories,
            retained = metrics.len(),
            "Analysis complete"
        );
        report
    }

    /// Retained metrics for one source, oldest first.
    pub fn retained(&self, source: &str) -> Vec<NormalizedMetric> {
        self.index.metrics(source)
    }

    pub fn retained_len(&self) -> usize {
        self.index.len()
    }

    /// Metrics dropped by the retention policy since construction.
    pub fn evicted(&self) -> u64 {
        self.index.evicted.load(AtomicOrdering::Relaxed)
    }

    /// Clear the retained index. Registered sources keep their own state.
    pub fn reset(&self) {
        self.index.clear();
        debug!(target: "pulse::aggregator", "Retained metrics cleared");
    }

    /// Registered source names, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl Debug for MetricsAggregator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("sources", &self.sources())
            .field("retained", &self.retained_len())
            .finish()
    }
}

impl Drop for MetricsAggregator {
    fn drop(&mut self) {
        for (name, id) in self.subscriptions.get_mut().drain(..) {
            self.bus.off_metric(&name, id);
        }
    }
}

// ============================================================================
// SECTION 17: PIPELINE ASSEMBLY
// ============================================================================

/// Bus, collectors and aggregator wired together from one configuration.
#[derive(Debug)]
pub struct Pipeline {
    pub bus: Arc<EventBus>,
    pub storage: Arc<StorageMetricsCollector>,
    pub memory_path: Arc<MemoryPathMetricsCollector>,
    pub performance: Arc<PerformanceMetricsCollector>,
    pub aggregator: MetricsAggregator,
}

impl Pipeline {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &EngineConfig, clock: SharedClock) -> Self {
        let bus = Arc::new(EventBus::with_config(&config.bus));
        let storage = Arc::new(StorageMetricsCollector::with_config(
            Arc::clone(&bus),
            &config.storage,
        ));
        let memory_path = Arc::new(MemoryPathMetricsCollector::with_config(
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.memory_path.clone(),
        ));
        let performance = Arc::new(PerformanceMetricsCollector::with_config(
            Arc::clone(&bus),
            Arc::clone(&clock),
            &config.retention,
        ));

        let aggregator = MetricsAggregator::with_config(Arc::clone(&bus), &config.retention, clock);
        aggregator.register(storage.clone());
        aggregator.register(memory_path.clone());
        aggregator.register(performance.clone());

        Self {
            bus,
            storage,
            memory_path,
            performance,
            aggregator,
        }
    }
}

// ============================================================================
// SECTION 18: PHASE 3 TESTS
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;

    /// 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;

    /// Source returning a fixed snapshot.
    struct FixedSource {
        name: String,
        metrics: Vec<NormalizedMetric>,
    }

    #[async_trait]
    impl MetricSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn collect(&self) -> Vec<NormalizedMetric> {
            self.metrics.clone()
        }

        fn reset(&self) {}
    }

    fn fixed(name: &str, timestamps: &[i64]) -> Arc<FixedSource> {
        let metrics = timestamps
            .iter()
            .map(|&ts| NormalizedMetric::new(name, MetricType::Generic, Timestamp::from_millis(ts), ts as f64))
            .collect();
        Arc::new(FixedSource {
            name: name.to_string(),
            metrics,
        })
    }

    fn aggregator_with(retention: RetentionConfig, clock: SharedClock) -> (Arc<EventBus>, MetricsAggregator) {
        let bus = Arc::new(EventBus::new());
        let aggregator = MetricsAggregator::with_config(Arc::clone(&bus), &retention, clock);
        (bus, aggregator)
    }

    fn duration_metric(ms: f64) -> RawMetric {
        RawMetric::new("external", json!({"duration": ms, "operation": "op", "status": "success"}))
    }

    #[tokio::test]
    async fn test_analyze_without_data() {
        let aggregator = MetricsAggregator::new(Arc::new(EventBus::new()));

        let report = aggregator.analyze(&["performance"]).await;
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"performance": {"summary": NO_PERFORMANCE_DATA}})
        );

        let report = aggregator.analyze(&[ALL]).await;
        assert_eq!(report.patterns.unwrap().summary(), Some(NO_ACTIVITY_DATA));
        assert_eq!(report.usage, Some(UsageStats::default()));
    }

    #[tokio::test]
    async fn test_collect_filters_time_range() {
        let aggregator = MetricsAggregator::new(Arc::new(EventBus::new()));
        aggregator.register(fixed("fixed", &[100, 200, 300]));

        let range = TimeRange::new(Timestamp::from_millis(150), Timestamp::from_millis(250));
        let result = aggregator.collect(&["fixed"], Some(range)).await;
        let timestamps: Vec<i64> = result["fixed"].iter().map(|m| m.timestamp.as_millis()).collect();
        assert_eq!(timestamps, vec![200]);

        let bounds = TimeRange::new(Timestamp::from_millis(100), Timestamp::from_millis(300));
        assert_eq!(aggregator.collect(&["fixed"], Some(bounds)).await["fixed"].len(), 3);
    }

    #[tokio::test]
    async fn test_collect_unknown_and_all_sources() {
        let aggregator = MetricsAggregator::new(Arc::new(EventBus::new()));
        aggregator.register(fixed("b", &[1]));
        aggregator.register(fixed("a", &[]));

        assert!(aggregator.collect(&["nonexistent-source"], None).await.is_empty());

        let everything = aggregator.collect(&[ALL, "a", "missing"], None).await;
        assert_eq!(everything.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(everything["a"].is_empty());
        assert_eq!(aggregator.sources(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_end_to_end_storage_pipeline() {
        let dir = TempDir::new().unwrap();
        for (name, size) in [("ten.bin", 10), ("twenty.bin", 20)] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(&vec![0u8; size]).unwrap();
        }
        let pipeline = Pipeline::new(&EngineConfig::default());

        pipeline.storage.track_directory(dir.path()).await.unwrap();

        let collected = pipeline.aggregator.collect(&[SOURCE_STORAGE], None).await;
        let storage = &collected[SOURCE_STORAGE];
        assert_eq!(storage.len(), 2);
        assert!(storage.iter().all(|m| m.metric_type == MetricType::StorageUsage));
        let mut sizes: Vec<f64> = storage.iter().filter_map(|m| m.value.as_f64()).collect();
        sizes.sort_by_key(|v| OrderedFloat(*v));
        assert_eq!(sizes, vec![10.0, 20.0]);

        let report = pipeline.aggregator.analyze(&["usage"]).await;
        assert_eq!(report.usage.unwrap().total_storage_usage, 30.0);
        assert!(report.performance.is_none());
        assert_eq!(pipeline.aggregator.retained(SOURCE_STORAGE).len(), 2);
    }

    #[tokio::test]
    async fn test_usage_sums_path_access_values() {
        let pipeline = Pipeline::new(&EngineConfig::default());
        for _ in 0..3 {
            pipeline.memory_path.track_access("a", "read");
        }
        pipeline.memory_path.track_access("b", "write");

        let usage = pipeline.aggregator.analyze(&["usage"]).await.usage.unwrap();

        // Each access publishes the running count: 1 + 2 + 3.
        assert_eq!(usage.path_access_patterns.get("a"), Some(&6.0));
        assert_eq!(usage.path_access_patterns.get("b"), Some(&1.0));
        assert_eq!(usage.most_accessed_paths[0].path, "a");
        assert_eq!(usage.total_storage_usage, 0.0);
    }

    #[tokio::test]
    async fn test_performance_percentiles() {
        let (bus, aggregator) = aggregator_with(RetentionConfig::default(), system_clock());
        aggregator.watch_channel("external");
        for ms in [40.0, 10.0, 30.0, 20.0] {
            bus.emit_metric("external", duration_metric(ms));
        }

        let report = aggregator.analyze(&["performance"]).await;
        let stats = report.performance.unwrap().available().cloned().unwrap();
        assert_eq!(
            stats,
            PerformanceStats {
                average: 25.0,
                min: 10.0,
                max: 40.0,
                total_operations: 4,
                p50: 20.0,
                p95: 40.0,
                p99: 40.0,
            }
        );
    }

    #[tokio::test]
    async fn test_pipeline_records_timed_operations() {
        let pipeline = Pipeline::new(&EngineConfig::default());
        let _: Result<(), ()> = pipeline.performance.time("noop", async { Ok(()) }).await;

        let report = pipeline.aggregator.analyze(&["performance"]).await;
        let stats = report.performance.unwrap();
        assert_eq!(stats.available().map(|s| s.total_operations), Some(1));
    }

    #[tokio::test]
    async fn test_activity_patterns_by_hour() {
        let (bus, aggregator) = aggregator_with(RetentionConfig::default(), system_clock());
        aggregator.watch_channel("external");
        for ts in [T0 + 7 * HOUR, T0 + 5 * HOUR, T0 + 3 * HOUR, T0 + 5 * HOUR, T0 + 3 * HOUR + 60_000] {
            bus.emit_metric("external", RawMetric::new("external", json!({"n": 1})).with_timestamp(ts));
        }

        let report = aggregator.analyze(&["patterns"]).await;
        let patterns = report.patterns.unwrap().available().cloned().unwrap();
        assert_eq!(patterns.activity_by_hour, BTreeMap::from([(3, 2), (5, 2), (7, 1)]));
        assert_eq!(patterns.peak_activity_hour, 3);
        assert_eq!(patterns.peak_activity_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_category_ignored() {
        let aggregator = MetricsAggregator::new(Arc::new(EventBus::new()));
        let report = aggregator.analyze(&["bogus"]).await;
        assert_eq!(report, AnalysisReport::default());
        assert_eq!(serde_json::to_value(&report).unwrap(), json!({}));

        assert_eq!(
            AnalysisCategory::expand(&["usage", "all", "USAGE"]),
            vec![AnalysisCategory::Usage, AnalysisCategory::Performance, AnalysisCategory::Patterns]
        );
    }

    #[test]
    fn test_retention_caps_per_source() {
        let retention = RetentionConfig {
            max_per_source: 2,
            max_age_secs: None,
        };
        let (bus, aggregator) = aggregator_with(retention, system_clock());
        aggregator.watch_channel("external");

        for ms in [1.0, 2.0, 3.0] {
            bus.emit_metric("external", duration_metric(ms));
        }

        let values: Vec<f64> = aggregator
            .retained("external")
            .iter()
            .filter_map(|m| m.value.as_f64())
            .collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(aggregator.retained_len(), 2);
        assert_eq!(aggregator.evicted(), 1);
    }

    #[test]
    fn test_retention_expires_by_ingestion_age() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let retention = RetentionConfig {
            max_per_source: 0,
            max_age_secs: Some(60),
        };
        let (bus, aggregator) = aggregator_with(retention, clock.clone());
        aggregator.watch_channel("external");

        bus.emit_metric("external", duration_metric(1.0));
        clock.advance(Duration::from_secs(120));
        bus.emit_metric("external", duration_metric(2.0));
        assert_eq!(aggregator.retained_len(), 1);

        clock.advance(Duration::from_secs(120));
        assert!(aggregator.retained("external").is_empty());
    }

    #[test]
    fn test_retained_metrics_use_ingestion_time_when_missing() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(T0)));
        let (bus, aggregator) = aggregator_with(RetentionConfig::default(), clock);
        aggregator.watch_channel("external");

        bus.emit_metric("external", RawMetric::new("external", json!("hello")));

        let retained = aggregator.retained("external");
        assert_eq!(retained[0].timestamp, Timestamp::from_millis(T0));
        assert_eq!(retained[0].value, MetricValue::Text("hello".into()));
    }

    #[test]
    fn test_watch_channel_once() {
        let (bus, aggregator) = aggregator_with(RetentionConfig::default(), system_clock());

        assert!(aggregator.watch_channel("external"));
        assert!(!aggregator.watch_channel("external"));
        assert_eq!(bus.listener_count("external"), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        {
            let aggregator = MetricsAggregator::new(Arc::clone(&bus));
            aggregator.register(fixed("fixed", &[]));
            aggregator.watch_channel("external");
            assert_eq!(bus.listener_count("fixed"), 1);
        }
        assert_eq!(bus.listener_count("fixed"), 0);
        assert_eq!(bus.listener_count("external"), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_retained_only() {
        let pipeline = Pipeline::new(&EngineConfig::default());
        pipeline.memory_path.track_access("p", "read");
        assert_eq!(pipeline.aggregator.retained_len(), 1);

        pipeline.aggregator.reset();

        assert_eq!(pipeline.aggregator.retained_len(), 0);
        assert_eq!(pipeline.aggregator.collect(&[SOURCE_MEMORY_PATH], None).await[SOURCE_MEMORY_PATH].len(), 1);
    }

    #[test]
    fn test_nearest_rank() {
        let sorted: Vec<OrderedFloat<f64>> = [5.0].into_iter().map(OrderedFloat).collect();
        assert_eq!(nearest_rank(&sorted, 0.0), 5.0);
        assert_eq!(nearest_rank(&sorted, 0.99), 5.0);
        assert!(PerformanceStats::from_values(&[]).is_none());
    }
}

// ============================================================================
// SECTION 19: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 19.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Pulse Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    author = "AIOps Team",
    version,
    about = "Event-driven metrics collection and analysis engine",
    long_about = "Pulse walks storage roots, tracks path access and operation \
                  durations, normalizes everything into one metric shape and \
                  reports performance, usage and activity analyses."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PULSE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Walk a directory and print the collected metrics as JSON
    Scan {
        /// Directory to walk
        directory: PathBuf,

        /// Sources to collect (comma separated, `all` for every source)
        #[arg(short, long, value_delimiter = ',', default_value = ALL)]
        sources: Vec<String>,

        /// Inclusive range start (ISO-8601)
        #[arg(long, requires = "end")]
        start: Option<String>,

        /// Inclusive range end (ISO-8601)
        #[arg(long, requires = "start")]
        end: Option<String>,
    },

    /// Walk a directory and print the analysis report as JSON
    Analyze {
        /// Directory to walk
        directory: PathBuf,

        /// Categories to compute (performance, usage, patterns or all)
        #[arg(short = 't', long, value_delimiter = ',', default_value = ALL)]
        categories: Vec<String>,
    },

    /// Start the engine on the configured storage roots
    Run {
        /// Watch roots for changes after the initial walk
        #[arg(short, long)]
        watch: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 19.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> PulseResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Storage roots: {}", config.storage.roots.len());
            println!("  • Watch roots: {}", config.storage.watch);
            println!("  • Listener warning threshold: {}", config.bus.listener_warn_threshold);
            match config.retention.max_per_source {
                0 => println!("  • Retention: unbounded"),
                n => println!("  • Retention: {} metrics per source", n),
            }
            if let Some(secs) = config.retention.max_age_secs {
                println!("  • Retention TTL: {}s", secs);
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(PulseError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> PulseResult<()> {
    let config_str = EngineConfig::generate_default_config()?;

    match output {
        Some(path) => {
            std::fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Filesystem watching: {}", cfg!(feature = "fs-watch"));
    println!();
    println!("Sources:");
    println!("  • {} (directory walks, file watching)", SOURCE_STORAGE);
    println!("  • {} (logical path access)", SOURCE_MEMORY_PATH);
    println!("  • {} (operation durations)", SOURCE_PERFORMANCE);
    println!();
    println!("License: MIT");
}

/// Handle the scan subcommand
async fn handle_scan(
    config: &EngineConfig,
    directory: &Path,
    sources: &[String],
    start: Option<&str>,
    end: Option<&str>,
) -> AnyhowResult<()> {
    let range = match (start, end) {
        (Some(start), Some(end)) => Some(TimeRange::parse(start, end)?),
        _ => None,
    };

    let pipeline = Pipeline::new(config);
    let summary = pipeline
        .storage
        .track_directory(directory)
        .await
        .with_context(|| format!("Failed to scan {}", directory.display()))?;
    let metrics = pipeline.aggregator.collect(sources, range).await;

    let output = json!({ "walk": summary, "metrics": metrics });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Handle the analyze subcommand
async fn handle_analyze(config: &EngineConfig, directory: &Path, categories: &[String]) -> AnyhowResult<()> {
    let pipeline = Pipeline::new(config);
    pipeline
        .storage
        .track_directory(directory)
        .await
        .with_context(|| format!("Failed to scan {}", directory.display()))?;

    let report = pipeline.aggregator.analyze(categories).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ----------------------------------------------------------------------------
// 19.3 Engine Run Loop
// ----------------------------------------------------------------------------

#[cfg(feature = "fs-watch")]
type WatchGuard = StorageWatch;

#[cfg(not(feature = "fs-watch"))]
type WatchGuard = ();

#[cfg(feature = "fs-watch")]
fn watch_root(storage: &Arc<StorageMetricsCollector>, root: &Path) -> PulseResult<Option<WatchGuard>> {
    storage.watch(root).map(Some)
}

#[cfg(not(feature = "fs-watch"))]
fn watch_root(_storage: &Arc<StorageMetricsCollector>, root: &Path) -> PulseResult<Option<WatchGuard>> {
    warn!(
        target: "pulse::engine",
        root = %root.display(),
        "Built without the fs-watch feature, not watching"
    );
    Ok(None)
}

fn log_summary(pipeline: &Pipeline, report: &AnalysisReport) {
    let operations = report
        .performance
        .as_ref()
        .and_then(Analysis::available)
        .map_or(0, |stats| stats.total_operations);
    let storage_bytes = report
        .usage
        .as_ref()
        .map_or(0.0, |usage| usage.total_storage_usage);
    let peak_hour = report
        .patterns
        .as_ref()
        .and_then(Analysis::available)
        .map(|patterns| patterns.peak_activity_hour);
    let bus = pipeline.bus.stats();

    info!(
        target: "pulse::engine",
        retained = pipeline.aggregator.retained_len(),
        evicted = pipeline.aggregator.evicted(),
        files = pipeline.storage.len(),
        paths = pipeline.memory_path.len(),
        operations,
        storage_bytes,
        peak_hour = ?peak_hour,
        handler_failures = bus.handler_failures,
        "Analysis summary"
    );
}

/// Walk the configured roots, optionally watch them, and log an analysis
/// summary every `summary_interval_secs` until Ctrl-C.
async fn run_engine(config: EngineConfig, watch: bool) -> AnyhowResult<()> {
    let pipeline = Pipeline::new(&config);
    info!(
        target: "pulse::engine",
        instance = %config.engine.instance_name,
        roots = config.storage.roots.len(),
        "Engine starting"
    );

    for root in &config.storage.roots {
        if let Err(e) = pipeline.storage.track_directory(root).await {
            error!(target: "pulse::engine", root = %root.display(), error = %e, category = e.category(), "Initial walk failed");
        }
    }

    let mut watches: Vec<WatchGuard> = Vec::new();
    if watch || config.storage.watch {
        for root in &config.storage.roots {
            match watch_root(&pipeline.storage, root) {
                Ok(Some(guard)) => watches.push(guard),
                Ok(None) => {}
                Err(e) => error!(target: "pulse::engine", root = %root.display(), error = %e, "Failed to watch root"),
            }
        }
    }

    let mut ticker = interval(Duration::from_secs(config.engine.summary_interval_secs));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = pipeline.aggregator.analyze(&[ALL]).await;
                log_summary(&pipeline, &report);
            }
            result = signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!(target: "pulse::engine", "Shutdown signal received");
                break;
            }
        }
    }

    drop(watches);
    let report = pipeline.aggregator.analyze(&[ALL]).await;
    log_summary(&pipeline, &report);
    info!(target: "pulse::engine", "Engine stopped");
    Ok(())
}

// ============================================================================
// SECTION 20: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the Pulse engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;
    if !config_found {
        warn!(
            target: "pulse::engine",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }
    debug!(target: "pulse::engine", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Some(Commands::Scan {
            directory,
            sources,
            start,
            end,
        }) => {
            handle_scan(&config, &directory, &sources, start.as_deref(), end.as_deref()).await?;
        }
        Some(Commands::Analyze {
            directory,
            categories,
        }) => {
            handle_analyze(&config, &directory, &categories).await?;
        }
        Some(Commands::Run { watch }) => run_engine(config, watch).await?,
        None => run_engine(config, false).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}
