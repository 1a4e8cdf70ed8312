//! # Pulse Reporter - In-Process Metrics Aggregation Engine
//!
//! A high-performance metrics aggregation and reporting engine written in pure
//! Rust. Callers report named numeric observations (gauge-style metrics and
//! counters) tagged with key-value dimensions; the engine combines concurrent
//! observations that share an identity, periodically flushes the accumulated
//! aggregates to pluggable output drivers, and sweeps stale aggregates to
//! bound memory.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           PULSE REPORTER ENGINE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  REPORT CALLS → SERIES IDENTITY → AGGREGATE TABLES → FLUSH → DRIVERS     │
//! │                                        ▲                                 │
//! │                            TIMERS · SWEEP · DRAIN                        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Race-Safe Aggregation**: double-checked create-or-merge insertion, one
//!   live aggregate per series, no observation lost or double-counted
//! - **Non-Blocking Reporting**: report calls only ever take short locks;
//!   flushes run asynchronously and never stall producers
//! - **Bounded Memory**: per-series observation caps plus a periodic table
//!   sweep reclaim high-cardinality, low-frequency series
//! - **Pluggable Outputs**: drivers receive batches of aggregated points;
//!   failures surface on a bounded, non-blocking error channel
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::Handle as RuntimeHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use xxhash_rust::xxh3::Xxh3;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// Futures
// ----------------------------------------------------------------------------
use futures::future::join_all;

// ============================================================================
// SECTION 2: CONSTANTS & DEFAULTS
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-reporter";

// ----------------------------------------------------------------------------
// Aggregation Defaults
// ----------------------------------------------------------------------------

/// Default flush interval for every aggregate (steady-state cadence)
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of observations an aggregate absorbs before a forced flush
pub const DEFAULT_MAX_OBSERVATIONS: u64 = 100_000;

/// Default cadence of the table sweep that reclaims idle aggregates
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Default per-driver send timeout; a send that overruns it counts as failed
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the bounded error channel
pub const DEFAULT_ERROR_CAPACITY: usize = 1000;

// ----------------------------------------------------------------------------
// Table & Tag Limits
// ----------------------------------------------------------------------------

/// Number of shards per aggregate table (power of two)
pub const TABLE_SHARDS: usize = 16;

/// Maximum number of tags a single series may carry
pub const MAX_TAGS_PER_SERIES: usize = 64;

/// Maximum length of a tag key in bytes
pub const MAX_TAG_KEY_LENGTH: usize = 128;

/// Maximum length of a tag value in bytes
pub const MAX_TAG_VALUE_LENGTH: usize = 512;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types flowing through the engine: timestamps, series
// identity, tags, and the aggregated points handed to output drivers.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Millisecond Precision Time Handling
// ----------------------------------------------------------------------------

/// Timestamp in milliseconds since Unix epoch, stamped on every emitted point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1000)
    }

    /// Get the current timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Get milliseconds value
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Get seconds value
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1000
    }

    /// Duration elapsed since an earlier timestamp (saturating)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Convert to chrono `DateTime<Utc>`
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1000);
        let millis = self.0.rem_euclid(1000) as u32;
        DateTime::from_timestamp(secs, millis * 1_000_000).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
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

// ----------------------------------------------------------------------------
// 3.2 Series Identity - Canonical Hash of Name + Tags
// ----------------------------------------------------------------------------

/// Unique identifier for a series, computed from the full metric name and its
/// tag set. Tag insertion order does not affect the result: keys are sorted
/// before hashing.
///
/// Uses 64-bit xxHash (xxh3). Collisions are a theoretical possibility that is
/// deliberately not handled: at the cardinalities this engine targets (well
/// below 2^32 live series) the birthday-bound collision probability is
/// negligible, and a collision merely merges two series' statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SeriesId(u64);

impl SeriesId {
    /// Create a SeriesId from a raw hash value
    #[inline]
    pub const fn from_raw(hash: u64) -> Self {
        Self(hash)
    }

    /// Compute the identity of a (name, tags) pair.
    ///
    /// Pure function of its inputs; any permutation of the same tag set
    /// produces the same identity.
    pub fn compute(name: &str, tags: &Tags) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(name.as_bytes());
        hasher.update(b"|");

        // Sort tags by (key, value) for order-independent hashing; the value
        // tiebreak keeps duplicate keys order-independent too
        let mut sorted: SmallVec<[&Tag; 8]> = tags.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.value.cmp(&b.value)));

        for tag in sorted {
            hasher.update(tag.key.as_bytes());
            hasher.update(b"=");
            hasher.update(tag.value.as_bytes());
            hasher.update(b",");
        }

        Self(hasher.digest())
    }

    /// Compute the identity of an untagged series
    #[inline]
    pub fn from_name(name: &str) -> Self {
        Self::compute_untagged(name)
    }

    fn compute_untagged(name: &str) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(name.as_bytes());
        hasher.update(b"|");
        Self(hasher.digest())
    }

    /// Get the raw hash value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Shard index for sharded data structures
    #[inline]
    pub const fn shard_index(&self, num_shards: usize) -> usize {
        (self.0 as usize) % num_shards
    }
}

impl Display for SeriesId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SeriesId {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Tags - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single tag (key-value pair) on a series.
/// Uses CompactString for small string optimization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key (e.g., "host", "route", "environment")
    pub key: CompactString,
    /// Tag value (e.g., "web-01", "/checkout", "production")
    pub value: CompactString,
}

impl Tag {
    /// Create a new tag
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Check if the tag is valid (non-empty key, within length limits)
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
            && self.key.len() <= MAX_TAG_KEY_LENGTH
            && self.value.len() <= MAX_TAG_VALUE_LENGTH
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Tag
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// A set of tags with stack allocation for small sets.
/// Most series carry fewer than 8 tags, so we optimize for that case.
pub type Tags = SmallVec<[Tag; 8]>;

/// Extension trait for Tags
pub trait TagsExt {
    /// Get a tag value by key
    fn get_value(&self, key: &str) -> Option<&str>;

    /// Check if a tag exists
    fn contains_key(&self, key: &str) -> bool;

    /// Add or update a tag
    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    /// Check if all tags are valid and the set is within limits
    fn is_valid(&self) -> bool;
}

impl TagsExt for Tags {
    fn get_value(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|t| t.key.as_str() == key)
            .map(|t| t.value.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.iter().any(|t| t.key.as_str() == key)
    }

    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(tag) = self.iter_mut().find(|t| t.key == key) {
            tag.value = value;
        } else {
            self.push(Tag { key, value });
        }
    }

    fn is_valid(&self) -> bool {
        self.len() <= MAX_TAGS_PER_SERIES && self.iter().all(|t| t.is_valid())
    }
}

/// Create a Tags collection from key-value pairs
#[macro_export]
macro_rules! tags {
    () => {
        $crate::Tags::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut tags = $crate::Tags::new();
        $(tags.push($crate::Tag::new($key, $value));)+
        tags
    }};
}

// ----------------------------------------------------------------------------
// 3.4 Statistic Sets - What an Emitted Point Means
// ----------------------------------------------------------------------------

/// The statistic set a series is tracked with.
///
/// Every aggregate accumulates the full count/sum/min/max regardless of kind;
/// the kind tells drivers which of those fields are meaningful at emission
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticSet {
    /// Gauge-style summary: count, sum, min and max are all meaningful
    Summary,
    /// Counter-style additive value: only the sum is meaningful
    Additive,
}

impl Display for StatisticSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StatisticSet::Summary => write!(f, "summary"),
            StatisticSet::Additive => write!(f, "additive"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Aggregated Points - The Driver-Facing Data Model
// ----------------------------------------------------------------------------

/// One flushed data point: the statistics a single aggregate accumulated over
/// one flush window. Drivers receive batches of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedPoint {
    /// Full (prefixed) series name
    pub name: CompactString,
    /// Tag set of the series
    pub tags: Tags,
    /// Statistic set this point was tracked with
    pub kind: StatisticSet,
    /// Number of observations merged into this window
    pub count: u64,
    /// Sum of all observed values
    pub sum: f64,
    /// Minimum observed value
    pub min: f64,
    /// Maximum observed value
    pub max: f64,
    /// Time the window was flushed
    pub timestamp: Timestamp,
}

impl AggregatedPoint {
    /// Arithmetic mean of the window
    #[inline]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl Display for AggregatedPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.name)?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", tag.key, tag.value)?;
        }
        match self.kind {
            StatisticSet::Additive => {
                write!(f, "}} sum={} @ {}", self.sum, self.timestamp)
            }
            StatisticSet::Summary => write!(
                f,
                "}} count={} sum={} min={} max={} @ {}",
                self.count, self.sum, self.min, self.max, self.timestamp
            ),
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for the engine, plus the bounded error channel that carries
// flush failures to whoever wants to observe them. Reporting calls never fail:
// all failures are local to the flush path and surfaced asynchronously.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the reporter engine.
#[derive(Error, Debug)]
pub enum ReporterError {
    /// A driver rejected or failed a batch send
    #[error("driver '{driver}' failed to send batch: {message}")]
    DriverSend { driver: String, message: String },

    /// A driver did not answer within the configured timeout; the window's
    /// data is dropped (at-most-once delivery)
    #[error("driver '{driver}' timed out after {timeout:?}")]
    DriverTimeout { driver: String, timeout: Duration },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The reporter was constructed outside a Tokio runtime context
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Internal engine error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result alias for engine operations
pub type ReporterResult<T> = Result<T, ReporterError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Bounded Error Channel
// ----------------------------------------------------------------------------

/// A bounded, non-blocking queue of flush errors.
///
/// This is a best-effort diagnostics channel, not a delivery guarantee: when
/// the queue is full the oldest error is silently displaced so that neither a
/// flush nor a reporting call ever blocks on error delivery. Displaced errors
/// are counted.
pub struct ErrorChannel {
    queue: ArrayQueue<ReporterError>,
    dropped: AtomicU64,
}

impl ErrorChannel {
    /// Create a channel holding at most `capacity` errors
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an error, displacing the oldest one if the channel is full.
    /// Never blocks.
    pub fn report(&self, err: ReporterError) {
        warn!(error = %err, "flush error");
        if self.queue.force_push(err).is_some() {
            self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    /// Pop the oldest error, if any
    #[inline]
    pub fn try_pop(&self) -> Option<ReporterError> {
        self.queue.pop()
    }

    /// Drain every queued error
    pub fn drain(&self) -> Vec<ReporterError> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(err) = self.queue.pop() {
            out.push(err);
        }
        out
    }

    /// Number of errors currently queued
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no errors are queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Channel capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of errors displaced because the channel was full
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }
}

impl Debug for ErrorChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Reporter configuration with serde defaults, manual validation, and loading
// from TOML files with environment overrides.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Reporter Configuration
// ----------------------------------------------------------------------------

/// Configuration for a [`MetricReporter`] instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// Name prefix applied to every reported series ("" = none)
    #[serde(default)]
    pub prefix: String,

    /// Base tags merged into every observation's tag set; observation-supplied
    /// tags take precedence on key collision
    #[serde(default)]
    pub base_tags: BTreeMap<String, String>,

    /// Steady-state flush cadence per aggregate
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Observations an aggregate absorbs before a forced flush-and-detach
    #[serde(default = "default_max_observations")]
    pub max_observations: u64,

    /// Cadence of the table sweep that detaches and flushes all aggregates
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Per-driver send timeout; an overrun counts as a failed flush
    #[serde(default = "default_driver_timeout", with = "humantime_serde")]
    pub driver_timeout: Duration,

    /// Capacity of the bounded error channel
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            base_tags: BTreeMap::new(),
            flush_interval: default_flush_interval(),
            max_observations: default_max_observations(),
            sweep_interval: default_sweep_interval(),
            driver_timeout: default_driver_timeout(),
            error_capacity: default_error_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ReporterConfig {
    /// Load configuration from a TOML file with environment overrides
    /// (`PULSE_` prefix, `__` as separator)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PULSE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (for testing and embedding)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "flush_interval",
                "flush interval must be non-zero",
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "sweep_interval",
                "sweep interval must be non-zero",
            ));
        }

        if self.driver_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "driver_timeout",
                "driver timeout must be non-zero",
            ));
        }

        if self.max_observations == 0 {
            return Err(ConfigError::invalid_value(
                "max_observations",
                "at least one observation per window is required",
            ));
        }

        if self.error_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "error_capacity",
                "error channel capacity must be at least 1",
            ));
        }

        for (key, value) in &self.base_tags {
            let tag = Tag::new(key.as_str(), value.as_str());
            if !tag.is_valid() {
                return Err(ConfigError::invalid_value(
                    "base_tags",
                    format!("invalid base tag '{}'", key),
                ));
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Base tags as a Tags collection
    pub(crate) fn base_tags_vec(&self) -> Tags {
        self.base_tags
            .iter()
            .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
            .collect()
    }
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_max_observations() -> u64 {
    DEFAULT_MAX_OBSERVATIONS
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_driver_timeout() -> Duration {
    DEFAULT_DRIVER_TIMEOUT
}

fn default_error_capacity() -> usize {
    DEFAULT_ERROR_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.2 Per-Observation Overrides
// ----------------------------------------------------------------------------

/// Optional per-observation overrides of the reporter defaults. Only the
/// first observation of a series (the one that creates its aggregate)
/// determines that aggregate's interval and cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// Override of the flush interval for this series
    pub interval: Option<Duration>,
    /// Override of the forced-flush observation cap for this series
    pub max_observations: Option<u64>,
}

impl ReportOptions {
    /// Options with every field left at the reporter default
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the flush interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Builder: set the observation cap
    pub fn with_max_observations(mut self, max: u64) -> Self {
        self.max_observations = Some(max);
        self
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging setup. The engine itself only emits tracing events;
// embedding applications may install their own subscriber instead.
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level ("trace" | "debug" | "info" | "warn" | "error")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" | "compact" | "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for the text formats
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

/// Initialize the logging system based on configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> ReporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReporterError::Internal(format!("failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReporterError::Internal(format!("failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReporterError::Internal(format!("failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        "logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: OUTPUT DRIVERS
// ============================================================================
// The driver boundary: the engine hands every flushed window to a set of
// drivers as a batch of aggregated points. Driver instances are shared,
// immutable references and must tolerate concurrent sends from many
// aggregates at once. The engine never retries a failed send itself.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Driver Trait - The Foundation
// ----------------------------------------------------------------------------

/// The core trait every output driver implements.
///
/// Drivers ship batches of aggregated points to a backend. `send` is invoked
/// concurrently from many flush tasks; implementations must be safe for that,
/// and should respect cancellation since the engine wraps every send in a
/// timeout.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Returns the unique name of this driver (used in error reports)
    fn name(&self) -> &str;

    /// Ship a batch of aggregated points to the backend
    async fn send(&self, batch: &[AggregatedPoint]) -> ReporterResult<()>;
}

// ----------------------------------------------------------------------------
// 7.2 Driver Set - Fan-Out With Timeouts
// ----------------------------------------------------------------------------

/// An immutable set of drivers sharing one send timeout and one error channel.
///
/// Sends to all drivers run concurrently; a driver overrunning the timeout is
/// reported as a failure and its window's data is dropped (at-most-once).
pub struct DriverSet {
    drivers: Vec<Arc<dyn Driver>>,
    timeout: Duration,
    errors: Arc<ErrorChannel>,
}

impl DriverSet {
    /// Create a driver set
    pub fn new(drivers: Vec<Arc<dyn Driver>>, timeout: Duration, errors: Arc<ErrorChannel>) -> Self {
        Self {
            drivers,
            timeout,
            errors,
        }
    }

    /// Number of drivers in the set
    #[inline]
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Check if the set is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Emit one point to every driver concurrently. Failures and timeouts go
    /// to the error channel; this never propagates an error to the caller.
    pub(crate) async fn emit(&self, point: AggregatedPoint) {
        if self.drivers.is_empty() {
            return;
        }

        let batch = [point];
        let sends = self.drivers.iter().map(|driver| {
            let driver = Arc::clone(driver);
            let batch = &batch[..];
            async move {
                match timeout(self.timeout, driver.send(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => self.errors.report(err),
                    Err(_) => self.errors.report(ReporterError::DriverTimeout {
                        driver: driver.name().to_string(),
                        timeout: self.timeout,
                    }),
                }
            }
        });

        join_all(sends).await;
    }
}

impl Debug for DriverSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.drivers.iter().map(|d| d.name()).collect();
        f.debug_struct("DriverSet")
            .field("drivers", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 7.3 Log Driver - Emit Points Through Tracing
// ----------------------------------------------------------------------------

/// A driver that emits every point as a structured tracing event. Useful as a
/// default output in development and as a template for real backends.
#[derive(Debug, Default, Clone)]
pub struct LogDriver;

impl LogDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for LogDriver {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, batch: &[AggregatedPoint]) -> ReporterResult<()> {
        for point in batch {
            match point.kind {
                StatisticSet::Additive => info!(
                    target: "pulse::points",
                    name = %point.name,
                    sum = point.sum,
                    ts = point.timestamp.as_millis(),
                    "counter"
                ),
                StatisticSet::Summary => info!(
                    target: "pulse::points",
                    name = %point.name,
                    count = point.count,
                    sum = point.sum,
                    min = point.min,
                    max = point.max,
                    ts = point.timestamp.as_millis(),
                    "metric"
                ),
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 7.4 Memory Driver - Buffer Points In-Process
// ----------------------------------------------------------------------------

/// A driver that buffers every point in memory. Intended for tests and for
/// embedders that want to scrape aggregated points themselves.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    points: Mutex<Vec<AggregatedPoint>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every point received so far
    pub fn points(&self) -> Vec<AggregatedPoint> {
        self.points.lock().clone()
    }

    /// Take every buffered point, leaving the buffer empty
    pub fn take(&self) -> Vec<AggregatedPoint> {
        mem::take(&mut *self.points.lock())
    }

    /// Number of points received so far
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// Check if no points were received
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, batch: &[AggregatedPoint]) -> ReporterResult<()> {
        self.points.lock().extend_from_slice(batch);
        Ok(())
    }
}

// ============================================================================
// SECTION 8: AGGREGATES
// ============================================================================
// The per-series accumulator. One aggregate exists per live series identity;
// every observation for that identity is merged into it under its own mutex.
// Flushing snapshots the statistics under the same mutex, so an observation
// racing a flush lands either in the flushed window or in the next one, and a
// final (sealing) snapshot makes late mergers retry through the table instead
// of writing into a dead accumulator.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Flush Modes & Merge Outcomes
// ----------------------------------------------------------------------------

/// How a flush treats the aggregate afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Steady-state timer flush: snapshot, zero the window, keep accumulating
    /// under the same table entry
    Reset,
    /// Final flush of a detached aggregate (cap reached, swept, or drained):
    /// snapshot and seal; the aggregate never accumulates or flushes again
    Discard,
}

/// Result of merging one observation into an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum MergeOutcome {
    /// Observation folded into the window
    Merged,
    /// Observation folded in and the window hit its observation cap; the
    /// caller must detach the aggregate and flush it
    Full,
    /// The aggregate was already sealed by a final flush; the observation was
    /// NOT recorded and the caller must retry through the table
    Sealed,
}

// ----------------------------------------------------------------------------
// 8.2 Statistics Window
// ----------------------------------------------------------------------------

/// The mutable statistics of one flush window, guarded by the aggregate's
/// mutex. `sealed` and `flush_requested` live under the same lock so the
/// merge/flush race has one deterministic arbiter.
#[derive(Debug, Clone, Copy)]
struct StatWindow {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sealed: bool,
    flush_requested: bool,
}

impl StatWindow {
    fn empty() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sealed: false,
            flush_requested: false,
        }
    }

    fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Take the window's statistics, zeroing them for the next window.
    fn take(&mut self) -> (u64, f64, f64, f64) {
        let snap = (self.count, self.sum, self.min, self.max);
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        snap
    }
}

// ----------------------------------------------------------------------------
// 8.3 Aggregate - One Accumulator Per Series
// ----------------------------------------------------------------------------

/// The live accumulator for one series between flushes.
///
/// Created on the first observation of an unseen identity; every later
/// observation with the same identity merges into it; destroyed after it is
/// detached (by cap, sweep, or drain) and flushed exactly once more.
pub struct Aggregate {
    id: SeriesId,
    name: CompactString,
    tags: Tags,
    kind: StatisticSet,
    interval: Duration,
    max_observations: u64,
    drivers: Arc<DriverSet>,
    window: Mutex<StatWindow>,
}

impl Aggregate {
    /// Build an aggregate with its first observation already merged in.
    pub fn new(
        id: SeriesId,
        name: CompactString,
        tags: Tags,
        kind: StatisticSet,
        first_value: f64,
        interval: Duration,
        max_observations: u64,
        drivers: Arc<DriverSet>,
    ) -> Self {
        let mut window = StatWindow::empty();
        window.fold(first_value);

        Self {
            id,
            name,
            tags,
            kind,
            interval,
            max_observations: max_observations.max(1),
            drivers,
            window: Mutex::new(window),
        }
    }

    /// Series identity of this aggregate
    #[inline]
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Display name of the series
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured flush interval
    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fold one observation into the window under the statistics lock.
    pub fn merge(&self, value: f64) -> MergeOutcome {
        let mut window = self.window.lock();
        if window.sealed {
            return MergeOutcome::Sealed;
        }

        window.fold(value);

        if window.count >= self.max_observations && !window.flush_requested {
            window.flush_requested = true;
            return MergeOutcome::Full;
        }

        MergeOutcome::Merged
    }

    /// Check whether the window already holds its cap (used for the
    /// create path, where the first observation may fill a cap of one).
    /// Claims the flush trigger, so it returns true at most once per window.
    pub fn poll_full(&self) -> bool {
        let mut window = self.window.lock();
        if window.count >= self.max_observations && !window.flush_requested {
            window.flush_requested = true;
            true
        } else {
            false
        }
    }

    /// Whether a final flush has sealed this aggregate
    pub fn is_sealed(&self) -> bool {
        self.window.lock().sealed
    }

    /// Current observation count of the window
    pub fn observation_count(&self) -> u64 {
        self.window.lock().count
    }

    /// Snapshot the window under the statistics lock and emit it to every
    /// driver. An empty window emits nothing. `Discard` additionally seals
    /// the aggregate so late mergers retry through the table.
    pub async fn flush(&self, mode: FlushMode) {
        let (count, sum, min, max) = {
            let mut window = self.window.lock();
            if mode == FlushMode::Discard {
                window.sealed = true;
            }
            window.flush_requested = false;
            window.take()
        };

        if count == 0 {
            trace!(series = %self.id, name = %self.name, "flush skipped: empty window");
            return;
        }

        let point = AggregatedPoint {
            name: self.name.clone(),
            tags: self.tags.clone(),
            kind: self.kind,
            count,
            sum,
            min,
            max,
            timestamp: Timestamp::now(),
        };

        debug!(
            series = %self.id,
            name = %self.name,
            count,
            sum,
            ?mode,
            "flushing window"
        );

        self.drivers.emit(point).await;
    }
}

impl Debug for Aggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("max_observations", &self.max_observations)
            .finish()
    }
}

// ============================================================================
// SECTION 9: AGGREGATE TABLES
// ============================================================================
// The concurrent series-identity -> aggregate mapping. Sharded to keep write
// contention low; each shard is an AHashMap behind its own RwLock. The
// get-or-create primitive uses double-checked insertion: optimistic read,
// then re-check under the write lock, so exactly one racer wins creation.
// ============================================================================

type TableShard = RwLock<AHashMap<SeriesId, Arc<Aggregate>>>;

/// A sharded concurrent map of live aggregates, one per series identity.
pub struct AggregateTable {
    shards: Box<[TableShard]>,
    len: AtomicUsize,
}

impl AggregateTable {
    /// Create an empty table
    pub fn new() -> Self {
        let shards: Vec<TableShard> = (0..TABLE_SHARDS)
            .map(|_| RwLock::new(AHashMap::new()))
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard(&self, id: SeriesId) -> &TableShard {
        &self.shards[id.shard_index(self.shards.len())]
    }

    /// Look up the live aggregate for an identity
    pub fn get(&self, id: SeriesId) -> Option<Arc<Aggregate>> {
        self.shard(id).read().get(&id).cloned()
    }

    /// Insert `candidate` unless an aggregate for its identity already
    /// exists.
    ///
    /// Returns the table's aggregate for the identity and whether the
    /// candidate won the insert. Exactly one of any number of concurrent
    /// callers for the same fresh identity observes `true`; every other
    /// caller receives the winner's instance and must merge its observation
    /// into it (the candidate already carries its first observation, so the
    /// winner has nothing further to do).
    pub fn get_or_create(&self, candidate: Arc<Aggregate>) -> (Arc<Aggregate>, bool) {
        let id = candidate.id();
        let shard = self.shard(id);

        // Optimistic read: the common case is a live series.
        {
            let guard = shard.read();
            if let Some(existing) = guard.get(&id) {
                return (Arc::clone(existing), false);
            }
        }

        // Pessimistic write: re-check, another writer may have won the race
        // between the two lock acquisitions.
        let mut guard = shard.write();
        if let Some(existing) = guard.get(&id) {
            return (Arc::clone(existing), false);
        }

        guard.insert(id, Arc::clone(&candidate));
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
        (candidate, true)
    }

    /// Remove the aggregate for an identity only if the mapped entry is the
    /// given instance (detach).
    ///
    /// Detach paths race the sweep: by the time a detach runs, the sweep may
    /// already have drained this instance and a later observation may have
    /// re-created the identity. An unconditional removal would evict that
    /// fresh aggregate without ever flushing it, losing its observations.
    pub fn remove_if(&self, id: SeriesId, expected: &Arc<Aggregate>) -> bool {
        let mut guard = self.shard(id).write();
        match guard.get(&id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                guard.remove(&id);
                self.len.fetch_sub(1, AtomicOrdering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Detach every aggregate by replacing each shard's map with a fresh
    /// empty one under its write lock. Lookups racing the swap land either in
    /// the drained batch or in the fresh table; they never block on a flush.
    pub fn drain_all(&self) -> Vec<Arc<Aggregate>> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let taken = mem::take(&mut *shard.write());
            if !taken.is_empty() {
                self.len.fetch_sub(taken.len(), AtomicOrdering::Relaxed);
                drained.extend(taken.into_values());
            }
        }
        drained
    }

    /// Approximate number of live aggregates
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    /// Check if no aggregates are live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AggregateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for AggregateTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateTable")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// SECTION 10: FLUSH SCHEDULING & SWEEP
// ============================================================================
// Time-driven flushing. Every flush runs as a tracked task so the shutdown
// drain can await all of them. Per-aggregate timers are lightweight tokio
// sleep loops over weak references (the tokio timer wheel scales to very high
// series cardinality without an OS-level resource per series); the sweep
// wholesale-replaces the tables on a fixed cadence to bound growth and
// guarantee every aggregate is eventually flushed.
// ============================================================================

/// Spawns and tracks every flush task in the engine.
pub(crate) struct FlushScheduler {
    handle: RuntimeHandle,
    tracker: TaskTracker,
}

impl FlushScheduler {
    pub(crate) fn new(handle: RuntimeHandle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn an asynchronous, tracked flush of one aggregate.
    pub(crate) fn spawn_flush(&self, aggregate: Arc<Aggregate>, mode: FlushMode) {
        self.tracker
            .spawn_on(async move { aggregate.flush(mode).await }, &self.handle);
    }

    /// Arm the steady-state flush timer of a freshly created aggregate.
    ///
    /// The timer holds only a weak reference: once the aggregate is detached
    /// and its final flush completes, the loop exits and the timer disappears
    /// with it.
    pub(crate) fn arm_timer(&self, aggregate: &Arc<Aggregate>) {
        let weak = Arc::downgrade(aggregate);
        let interval = aggregate.interval();
        let tracker = self.tracker.clone();

        self.handle.spawn(async move {
            loop {
                sleep(interval).await;
                let Some(aggregate) = weak.upgrade() else {
                    break;
                };
                if aggregate.is_sealed() {
                    break;
                }
                tracker
                    .track_future(async move { aggregate.flush(FlushMode::Reset).await })
                    .await;
            }
        });
    }

    /// Close the tracker and wait for every outstanding flush to finish.
    /// Used only by the shutdown drain.
    pub(crate) async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Debug for FlushScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("outstanding", &self.tracker.len())
            .finish()
    }
}

/// The periodic table sweep: detach everything, flush it asynchronously.
///
/// This bounds table growth from high-cardinality, low-frequency series and
/// guarantees every aggregate is flushed no later than one sweep period after
/// its last observation, even when its own interval timer is longer.
async fn run_sweep(
    metrics: Arc<AggregateTable>,
    counters: Arc<AggregateTable>,
    scheduler: Arc<FlushScheduler>,
    cadence: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(cadence) => {}
        }

        let mut detached = metrics.drain_all();
        detached.extend(counters.drain_all());

        if detached.is_empty() {
            continue;
        }

        debug!(count = detached.len(), "sweep detached aggregates");
        for aggregate in detached {
            scheduler.spawn_flush(aggregate, FlushMode::Discard);
        }
    }

    trace!("sweep task stopped");
}

// ============================================================================
// SECTION 11: METRIC REPORTER
// ============================================================================
// The public facade. Owns one table for gauge-style metrics and a second,
// independent table for counters, each with its own driver set. Reporting
// calls are synchronous and never block on a flush: they compute the series
// identity, take the read-mostly fast path, and fall back to the
// create-or-merge loop on a miss or on a lost race against a final flush.
// ============================================================================

/// In-process metrics aggregation and reporting engine.
///
/// Construct inside a Tokio runtime context (the engine captures the runtime
/// handle for its flush tasks; the reporting calls themselves are synchronous
/// and may come from any thread).
pub struct MetricReporter {
    prefix: CompactString,
    base_tags: Tags,
    flush_interval: Duration,
    max_observations: u64,

    metrics: Arc<AggregateTable>,
    counters: Arc<AggregateTable>,
    metric_drivers: Arc<DriverSet>,
    counter_drivers: Arc<DriverSet>,

    errors: Arc<ErrorChannel>,
    scheduler: Arc<FlushScheduler>,
    sweep_cancel: CancellationToken,
    closed: AtomicBool,
}

impl MetricReporter {
    /// Create a reporter and start its sweep task.
    ///
    /// `metric_drivers` receive gauge-style summary points, `counter_drivers`
    /// receive additive counter points; the two sets may differ or overlap.
    pub fn new(
        config: ReporterConfig,
        metric_drivers: Vec<Arc<dyn Driver>>,
        counter_drivers: Vec<Arc<dyn Driver>>,
    ) -> ReporterResult<Self> {
        config.validate()?;

        let handle = RuntimeHandle::try_current()
            .map_err(|e| ReporterError::NoRuntime(e.to_string()))?;

        let errors = Arc::new(ErrorChannel::new(config.error_capacity));
        let metric_drivers = Arc::new(DriverSet::new(
            metric_drivers,
            config.driver_timeout,
            Arc::clone(&errors),
        ));
        let counter_drivers = Arc::new(DriverSet::new(
            counter_drivers,
            config.driver_timeout,
            Arc::clone(&errors),
        ));

        let metrics = Arc::new(AggregateTable::new());
        let counters = Arc::new(AggregateTable::new());
        let scheduler = Arc::new(FlushScheduler::new(handle.clone()));
        let sweep_cancel = CancellationToken::new();

        handle.spawn(run_sweep(
            Arc::clone(&metrics),
            Arc::clone(&counters),
            Arc::clone(&scheduler),
            config.sweep_interval,
            sweep_cancel.clone(),
        ));

        info!(
            target: "pulse::init",
            prefix = %config.prefix,
            flush_interval = ?config.flush_interval,
            sweep_interval = ?config.sweep_interval,
            max_observations = config.max_observations,
            "metric reporter started"
        );

        Ok(Self {
            prefix: CompactString::from(config.prefix.as_str()),
            base_tags: config.base_tags_vec(),
            flush_interval: config.flush_interval,
            max_observations: config.max_observations,
            metrics,
            counters,
            metric_drivers,
            counter_drivers,
            errors,
            scheduler,
            sweep_cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Report a gauge-style metric observation (count/sum/min/max summary).
    pub fn metric(&self, name: &str, value: f64, tags: Tags) {
        self.metric_with(name, value, tags, ReportOptions::default());
    }

    /// Report a gauge-style metric observation with per-series overrides.
    pub fn metric_with(&self, name: &str, value: f64, tags: Tags, opts: ReportOptions) {
        self.report(StatisticSet::Summary, name, value, tags, opts);
    }

    /// Report a counter observation (additive sum).
    pub fn counter(&self, name: &str, value: f64, tags: Tags) {
        self.counter_with(name, value, tags, ReportOptions::default());
    }

    /// Report a counter observation with per-series overrides.
    pub fn counter_with(&self, name: &str, value: f64, tags: Tags, opts: ReportOptions) {
        self.report(StatisticSet::Additive, name, value, tags, opts);
    }

    /// The bounded error channel carrying flush failures.
    pub fn errors(&self) -> &Arc<ErrorChannel> {
        &self.errors
    }

    /// Number of live metric aggregates (approximate)
    pub fn live_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Number of live counter aggregates (approximate)
    pub fn live_counters(&self) -> usize {
        self.counters.len()
    }

    /// Flush every live aggregate in both tables and wait for every
    /// outstanding flush task to complete.
    ///
    /// Used at process shutdown. After this returns, no further flush is
    /// guaranteed: observations reported after the drain started are recorded
    /// in memory but may never reach a driver.
    pub async fn drain(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.sweep_cancel.cancel();

        let mut detached = self.metrics.drain_all();
        detached.extend(self.counters.drain_all());

        debug!(count = detached.len(), "drain detached aggregates");
        for aggregate in detached {
            self.scheduler.spawn_flush(aggregate, FlushMode::Discard);
        }

        self.scheduler.shutdown().await;
        info!(target: "pulse::shutdown", "metric reporter drained");
    }

    // ------------------------------------------------------------------------
    // 11.1 Reporting Core - Identity, Fast Path, Create-or-Merge
    // ------------------------------------------------------------------------

    fn report(&self, kind: StatisticSet, name: &str, value: f64, tags: Tags, opts: ReportOptions) {
        if self.closed.load(AtomicOrdering::Acquire) {
            debug!(name, "observation reported after drain; it may never be flushed");
        }

        let full_name = self.full_name(name);
        let tags = self.with_base_tags(tags);

        // Recording never fails: an over-limit tag set is warned about but
        // still aggregated. The limits are enforced only on configured base
        // tags, where they are a validation error.
        if !tags.is_valid() {
            warn!(name = %full_name, "tag set exceeds limits");
        }

        let id = SeriesId::compute(&full_name, &tags);
        let interval = opts.interval.unwrap_or(self.flush_interval);
        let max_observations = opts.max_observations.unwrap_or(self.max_observations);

        let (table, drivers) = match kind {
            StatisticSet::Summary => (&self.metrics, &self.metric_drivers),
            StatisticSet::Additive => (&self.counters, &self.counter_drivers),
        };

        // Fast path: the series is already live.
        if let Some(aggregate) = table.get(id) {
            match aggregate.merge(value) {
                MergeOutcome::Merged => return,
                MergeOutcome::Full => {
                    self.detach_and_flush(table, aggregate);
                    return;
                }
                // Raced a final flush; fall through and re-create.
                MergeOutcome::Sealed => {}
            }
        }

        loop {
            let candidate = Arc::new(Aggregate::new(
                id,
                full_name.clone(),
                tags.clone(),
                kind,
                value,
                interval,
                max_observations,
                Arc::clone(drivers),
            ));

            let (aggregate, created) = table.get_or_create(candidate);

            if created {
                self.scheduler.arm_timer(&aggregate);
                // A cap of one fills the window with its first observation.
                if aggregate.poll_full() {
                    self.detach_and_flush(table, aggregate);
                }
                return;
            }

            match aggregate.merge(value) {
                MergeOutcome::Merged => return,
                MergeOutcome::Full => {
                    self.detach_and_flush(table, aggregate);
                    return;
                }
                // The winner was sealed between our lookup and our merge;
                // retry so the observation is never lost.
                MergeOutcome::Sealed => continue,
            }
        }
    }

    /// Detach an aggregate that hit its observation cap and flush it
    /// asynchronously. Removal happens synchronously on the reporting path so
    /// the next observation of the same identity deterministically creates a
    /// fresh aggregate. The removal is instance-conditional: if the sweep
    /// already detached this aggregate and the identity was re-created, the
    /// fresh entry stays live.
    fn detach_and_flush(&self, table: &Arc<AggregateTable>, aggregate: Arc<Aggregate>) {
        table.remove_if(aggregate.id(), &aggregate);
        self.scheduler.spawn_flush(aggregate, FlushMode::Discard);
    }

    fn full_name(&self, name: &str) -> CompactString {
        if self.prefix.is_empty() {
            CompactString::from(name)
        } else {
            let mut full = CompactString::with_capacity(self.prefix.len() + 1 + name.len());
            full.push_str(&self.prefix);
            full.push('.');
            full.push_str(name);
            full
        }
    }

    /// Merge the reporter's base tags into an observation's tags;
    /// observation-supplied tags win on key collision.
    fn with_base_tags(&self, mut tags: Tags) -> Tags {
        for base in &self.base_tags {
            if !tags.contains_key(&base.key) {
                tags.push(base.clone());
            }
        }
        tags
    }
}

impl Debug for MetricReporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricReporter")
            .field("prefix", &self.prefix)
            .field("live_metrics", &self.metrics.len())
            .field("live_counters", &self.counters.len())
            .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl Drop for MetricReporter {
    fn drop(&mut self) {
        // Stop the sweep task; outstanding flushes complete on their own.
        self.sweep_cancel.cancel();
    }
}

// ============================================================================
// SECTION 12: TESTS
// ============================================================================


#[cfg(test)]
mod identity_proptests {
    use super::*;
    use proptest::prelude::*;

    fn unique_pairs(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        pairs
            .into_iter()
            .filter(|(k, _)| seen.insert(k.clone()))
            .collect()
    }

    proptest! {
        #[test]
        fn permutations_share_identity(
            pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 0..8)
        ) {
            let pairs = unique_pairs(pairs);
            let forward: Tags = pairs
                .iter()
                .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
                .collect();
            let reversed: Tags = pairs
                .iter()
                .rev()
                .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
                .collect();

            prop_assert_eq!(
                SeriesId::compute("m", &forward),
                SeriesId::compute("m", &reversed)
            );
        }

        #[test]
        fn extra_tag_changes_identity(
            pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 0..6),
            extra_key in "[A-Z]{1,6}"
        ) {
            let pairs = unique_pairs(pairs);
            let base: Tags = pairs
                .iter()
                .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
                .collect();
            let mut extended = base.clone();
            extended.push(Tag::new(extra_key.as_str(), "x"));

            prop_assert_ne!(
                SeriesId::compute("m", &base),
                SeriesId::compute("m", &extended)
            );
        }

        #[test]
        fn changed_value_changes_identity(
            pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 1..6)
        ) {
            let pairs = unique_pairs(pairs);
            let base: Tags = pairs
                .iter()
                .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
                .collect();
            let mut changed = base.clone();
            let bumped = format!("{}x", changed[0].value);
            changed[0].value = bumped.into();

            prop_assert_ne!(
                SeriesId::compute("m", &base),
                SeriesId::compute("m", &changed)
            );
        }
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn test_driver_set() -> (Arc<DriverSet>, Arc<MemoryDriver>, Arc<ErrorChannel>) {
        let memory = Arc::new(MemoryDriver::new());
        let errors = Arc::new(ErrorChannel::new(64));
        let set = Arc::new(DriverSet::new(
            vec![memory.clone() as Arc<dyn Driver>],
            Duration::from_secs(1),
            Arc::clone(&errors),
        ));
        (set, memory, errors)
    }

    fn candidate(id: SeriesId, drivers: &Arc<DriverSet>, first_value: f64, cap: u64) -> Arc<Aggregate> {
        Arc::new(Aggregate::new(
            id,
            "requests".into(),
            tags! { "route" => "/a" },
            StatisticSet::Summary,
            first_value,
            Duration::from_secs(60),
            cap,
            Arc::clone(drivers),
        ))
    }

    #[test]
    fn concurrent_merges_land_in_one_window() {
        const THREADS: usize = 8;
        const MERGES_PER_THREAD: usize = 1000;

        let (drivers, _memory, _errors) = test_driver_set();
        let aggregate = candidate(SeriesId::from_name("requests"), &drivers, 1.0, u64::MAX);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let aggregate = Arc::clone(&aggregate);
                scope.spawn(move || {
                    for _ in 0..MERGES_PER_THREAD {
                        assert!(matches!(aggregate.merge(2.0), MergeOutcome::Merged));
                    }
                });
            }
        });

        let total = (THREADS * MERGES_PER_THREAD) as u64;
        assert_eq!(aggregate.observation_count(), total + 1);
    }

    #[test]
    fn get_or_create_race_has_exactly_one_winner() {
        const THREADS: usize = 16;

        let table = Arc::new(AggregateTable::new());
        let (drivers, _memory, _errors) = test_driver_set();
        let id = SeriesId::from_name("raced");
        let created_count = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let table = Arc::clone(&table);
                let drivers = Arc::clone(&drivers);
                let created_count = &created_count;
                let barrier = &barrier;
                scope.spawn(move || {
                    let cand = candidate(id, &drivers, 5.0, u64::MAX);
                    barrier.wait();
                    let (aggregate, created) = table.get_or_create(cand);
                    if created {
                        created_count.fetch_add(1, AtomicOrdering::Relaxed);
                    } else {
                        // Losers must still merge their observation.
                        assert!(matches!(aggregate.merge(5.0), MergeOutcome::Merged));
                    }
                });
            }
        });

        assert_eq!(created_count.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(table.len(), 1);

        // Every racer's observation landed in the single winner.
        let winner = table.get(id).expect("winner should be live");
        assert_eq!(winner.observation_count(), THREADS as u64);
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let table = AggregateTable::new();
        let (drivers, _memory, _errors) = test_driver_set();
        let id = SeriesId::from_name("shared");

        let (first, created) = table.get_or_create(candidate(id, &drivers, 1.0, u64::MAX));
        assert!(created);

        let (second, created) = table.get_or_create(candidate(id, &drivers, 2.0, u64::MAX));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        let looked_up = table.get(id).expect("live aggregate");
        assert!(Arc::ptr_eq(&first, &looked_up));
    }

    #[test]
    fn remove_if_detaches_only_the_matching_instance() {
        let table = AggregateTable::new();
        let (drivers, _memory, _errors) = test_driver_set();
        let id = SeriesId::from_name("conditional");

        let (first, _) = table.get_or_create(candidate(id, &drivers, 1.0, u64::MAX));
        assert!(table.remove_if(id, &first));
        assert!(table.is_empty());
        // Already gone; a second removal of the same instance is a no-op.
        assert!(!table.remove_if(id, &first));

        let (second, _) = table.get_or_create(candidate(id, &drivers, 2.0, u64::MAX));
        assert!(!table.remove_if(id, &first));
        assert_eq!(table.len(), 1);
        assert!(table.remove_if(id, &second));
    }

    #[tokio::test]
    async fn cap_detach_never_evicts_a_recreated_aggregate() {
        let (drivers, memory, _errors) = test_driver_set();
        let table = AggregateTable::new();
        let id = SeriesId::from_name("raced-cap");

        let (full, created) = table.get_or_create(candidate(id, &drivers, 1.0, 2));
        assert!(created);
        assert!(matches!(full.merge(1.0), MergeOutcome::Full));

        // The sweep wins the race: it detaches and discard-flushes the full
        // aggregate before the reporting path runs its own detach.
        let swept = table.drain_all();
        assert_eq!(swept.len(), 1);
        swept[0].flush(FlushMode::Discard).await;

        // A later observation re-creates the identity in the meantime.
        let (fresh, created) = table.get_or_create(candidate(id, &drivers, 5.0, u64::MAX));
        assert!(created);

        // The delayed detach must not evict the fresh aggregate.
        assert!(!table.remove_if(id, &full));
        let live = table.get(id).expect("fresh aggregate stays live");
        assert!(Arc::ptr_eq(&live, &fresh));
        assert!(!fresh.is_sealed());

        // Its observations remain flushable.
        fresh.flush(FlushMode::Discard).await;
        let sums: Vec<f64> = memory.take().iter().map(|p| p.sum).collect();
        assert!(sums.contains(&2.0));
        assert!(sums.contains(&5.0));
    }

    #[test]
    fn drain_all_empties_every_shard() {
        let table = AggregateTable::new();
        let (drivers, _memory, _errors) = test_driver_set();

        for i in 0..100 {
            let id = SeriesId::from_name(&format!("series-{i}"));
            let (_, created) = table.get_or_create(candidate(id, &drivers, 1.0, u64::MAX));
            assert!(created);
        }
        assert_eq!(table.len(), 100);

        let drained = table.drain_all();
        assert_eq!(drained.len(), 100);
        assert!(table.is_empty());
        assert!(table.get(SeriesId::from_name("series-0")).is_none());
    }

    #[tokio::test]
    async fn sealed_aggregate_rejects_merges() {
        let (drivers, _memory, _errors) = test_driver_set();
        let aggregate = candidate(SeriesId::from_name("sealed"), &drivers, 1.0, u64::MAX);

        aggregate.flush(FlushMode::Discard).await;

        assert!(aggregate.is_sealed());
        assert!(matches!(aggregate.merge(1.0), MergeOutcome::Sealed));
    }

    #[test]
    fn merge_reports_full_exactly_once_per_window() {
        let (drivers, _memory, _errors) = test_driver_set();
        let aggregate = candidate(SeriesId::from_name("capped"), &drivers, 1.0, 3);

        assert!(matches!(aggregate.merge(1.0), MergeOutcome::Merged));
        assert!(matches!(aggregate.merge(1.0), MergeOutcome::Full));
        // The trigger is claimed; later merges do not re-fire it.
        assert!(matches!(aggregate.merge(1.0), MergeOutcome::Merged));
        assert!(!aggregate.poll_full());
    }

    #[test]
    fn poll_full_claims_trigger_on_cap_of_one() {
        let (drivers, _memory, _errors) = test_driver_set();
        let aggregate = candidate(SeriesId::from_name("tiny"), &drivers, 1.0, 1);

        assert!(aggregate.poll_full());
        assert!(!aggregate.poll_full());
    }

    #[tokio::test]
    async fn reset_flush_keeps_accumulating() {
        let (drivers, memory, _errors) = test_driver_set();
        let aggregate = candidate(SeriesId::from_name("steady"), &drivers, 10.0, u64::MAX);
        assert!(matches!(aggregate.merge(30.0), MergeOutcome::Merged));

        aggregate.flush(FlushMode::Reset).await;
        assert!(!aggregate.is_sealed());
        assert_eq!(aggregate.observation_count(), 0);

        let points = memory.take();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 2);
        assert_eq!(points[0].sum, 40.0);
        assert_eq!(points[0].min, 10.0);
        assert_eq!(points[0].max, 30.0);

        // An empty window flushes nothing.
        aggregate.flush(FlushMode::Reset).await;
        assert!(memory.is_empty());

        // The next window accumulates from scratch.
        assert!(matches!(aggregate.merge(7.0), MergeOutcome::Merged));
        aggregate.flush(FlushMode::Reset).await;
        let points = memory.take();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 1);
        assert_eq!(points[0].sum, 7.0);
    }
}
