//! # Bandwidth Forecast - Monthly Quota Control
//!
//! Forecasts how much of a monthly transfer cap a link is allowed to have
//! consumed at any instant of its billing cycle, and derives from live
//! byte-counter telemetry the highest transfer rate that keeps cumulative
//! usage under that cap.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         BANDWIDTH FORECAST CORE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  PROMETHEUS → METRICS GATEWAY → SERIES VALIDATOR → QUOTA MODEL → DATASET │
//! │              (range queries)   (cycle-tag filter)  (forecast +  (charts) │
//! │                                                      speed limit)        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Stateless calendar math**: the billing window is recomputed for every
//!   evaluated instant, so nothing has to be invalidated at a month boundary
//! - **Closed-form control law**: expected-usage line plus a two-bound speed
//!   limit clamped to the contracted peak rate
//! - **Cycle-tag validation**: samples leaking across month boundaries are
//!   discarded per series before any derivation happens
//! - **All-or-nothing datasets**: any failed query or bad tag fails the whole
//!   forecast
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{
    DateTime, Datelike, Days, Local, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::{Client as HttpClient, StatusCode};

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

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "bandwidth-forecast";
pub const ENGINE_FULL_NAME: &str = "Bandwidth Quota Forecaster";

/// Prefix for environment overrides (`BWFORECAST_QUOTA__CAP=...`)
pub const ENV_PREFIX: &str = "BWFORECAST_";

// ----------------------------------------------------------------------------
// Metrics Backend
// ----------------------------------------------------------------------------

/// Default Prometheus address
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:9090";

/// Range query endpoint, relative to the backend address
pub const RANGE_QUERY_PATH: &str = "/api/v1/query_range";

/// Default timeout for HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Cumulative byte counter queried for usage
pub const DEFAULT_USAGE_METRIC: &str = "l4_total_bytes";

/// Label asserting which billing cycle a series belongs to
pub const DEFAULT_CYCLE_LABEL: &str = "since";

/// Label added to derived series, naming the derivation
pub const DERIVED_LABEL: &str = "forecast";

/// Longest error body carried into an error message
const MAX_ERROR_BODY_CHARS: usize = 512;

// ----------------------------------------------------------------------------
// Sampling & Range
// ----------------------------------------------------------------------------

/// Default resolution of both range queries (6 hours)
pub const DEFAULT_SAMPLING_INTERVAL_SECS: u64 = 6 * 3600;

/// Minimum allowed resolution (seconds)
pub const MIN_SAMPLING_INTERVAL_SECS: u64 = 1;

/// Length of the default date range, ending now (days)
pub const DEFAULT_RANGE_DAYS: u64 = 30;

// ----------------------------------------------------------------------------
// Quota Defaults
// ----------------------------------------------------------------------------

/// Monthly cap (bytes)
pub const DEFAULT_CAP_BYTES: f64 = 1e12;

/// Contracted line rate (bytes/second)
pub const DEFAULT_PEAK_RATE: f64 = 4_103_250.0;

/// Smoothing horizon of the speed limit (seconds)
pub const DEFAULT_GRACE_SECS: f64 = 3600.0;

/// Extra allowance moved to the start of each cycle (bytes)
pub const DEFAULT_EARLY_SHIFT_BYTES: f64 = 0.0;

/// Shortest possible billing cycle (February, non-leap), in seconds
pub const MIN_CYCLE_SECS: f64 = 28.0 * 86_400.0;

// ----------------------------------------------------------------------------
// Presentation
// ----------------------------------------------------------------------------

pub const USAGE_SERIES_NAME: &str = "Usage";
pub const USAGE_LIMIT_SERIES_NAME: &str = "Usage Limit";
pub const RATE_SERIES_NAME: &str = "Used Speed";
pub const SPEED_LIMIT_SERIES_NAME: &str = "Speed Limit";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Instant in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Build from fractional Unix-epoch seconds as sent by Prometheus.
    /// Rounded to millisecond resolution; `None` if non-finite or out of range.
    pub fn from_epoch_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        let millis = (secs * 1000.0).round();
        let limit = (i64::MAX / 1_000_000) as f64;
        if millis.abs() >= limit {
            return None;
        }
        Some(Self::from_millis(millis as i64))
    }

    #[inline]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    /// Fractional seconds elapsed since `earlier` (negative if `earlier` is later).
    #[inline]
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1e9
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>. Saturates outside the i64 range.
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        match dt.timestamp_nanos_opt() {
            Some(nanos) => Self(nanos),
            None if dt.timestamp() < 0 => Self(i64::MIN),
            None => Self(i64::MAX),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Labels - Series Identity
// ----------------------------------------------------------------------------

/// A single label (key-value pair) of a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label key (e.g. "__name__", "since")
    pub key: CompactString,
    /// Label value (e.g. "l4_total_bytes", "2024-03")
    pub value: CompactString,
}

impl Label {
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
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}=\"{}\"", self.key, self.value)
    }
}

/// A set of labels with stack allocation for small sets.
pub type Labels = SmallVec<[Label; 8]>;

/// Extension trait for Labels
pub trait LabelsExt {
    /// Get a label value by key
    fn get_label(&self, key: &str) -> Option<&str>;

    /// Check if a label exists
    fn has_label(&self, key: &str) -> bool;

    /// Add or update a label
    fn set_label<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    /// Convert to an ordered map
    fn to_map(&self) -> BTreeMap<&str, &str>;

    /// Prometheus-style rendering: `name{k="v", ...}`
    fn describe(&self) -> String;
}

impl LabelsExt for Labels {
    fn get_label(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|l| l.key.as_str() == key)
            .map(|l| l.value.as_str())
    }

    fn has_label(&self, key: &str) -> bool {
        self.iter().any(|l| l.key.as_str() == key)
    }

    fn set_label<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(label) = self.iter_mut().find(|l| l.key == key) {
            label.value = value;
        } else {
            self.push(Label { key, value });
        }
    }

    fn to_map(&self) -> BTreeMap<&str, &str> {
        self.iter()
            .map(|l| (l.key.as_str(), l.value.as_str()))
            .collect()
    }

    fn describe(&self) -> String {
        let name = self.get_label("__name__").unwrap_or("");
        let rest: Vec<String> = self
            .to_map()
            .into_iter()
            .filter(|(k, _)| *k != "__name__")
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{}{{{}}}", name, rest.join(", "))
    }
}

/// Create a Labels collection from key-value pairs
#[macro_export]
macro_rules! labels {
    () => {
        $crate::Labels::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut labels = $crate::Labels::new();
        $( labels.push($crate::Label::new($key, $value)); )+
        labels
    }};
}

fn serialize_labels<S: Serializer>(labels: &Labels, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(labels.iter().map(|l| (l.key.as_str(), l.value.as_str())))
}

// ----------------------------------------------------------------------------
// 3.3 Samples & Time Series
// ----------------------------------------------------------------------------

/// A single `(timestamp, value)` point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    #[inline]
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// An immutable labelled series. Samples are strictly increasing in
/// timestamp; both constructors enforce it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    #[serde(serialize_with = "serialize_labels")]
    labels: Labels,
    samples: Vec<Sample>,
}

impl TimeSeries {
    /// Sorts by timestamp and drops repeated timestamps, keeping the first.
    pub fn new(labels: Labels, mut samples: Vec<Sample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        samples.dedup_by_key(|s| s.timestamp);
        Self { labels, samples }
    }

    /// Accepts samples only if they are already strictly ordered.
    pub fn from_sorted(labels: Labels, samples: Vec<Sample>) -> ValidationResult<Self> {
        if samples.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
            return Err(ValidationError::UnsortedSeries {
                series: labels.describe(),
            });
        }
        Ok(Self { labels, samples })
    }

    pub fn empty(labels: Labels) -> Self {
        Self {
            labels,
            samples: Vec::new(),
        }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get_label(key)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn describe(&self) -> String {
        self.labels.describe()
    }

    /// Value recorded at exactly `timestamp`, if any.
    pub fn value_at(&self, timestamp: Timestamp) -> Option<f64> {
        self.samples
            .binary_search_by_key(&timestamp, |s| s.timestamp)
            .ok()
            .map(|idx| self.samples[idx].value)
    }

    /// Copy keeping only samples in `[start, end)`.
    pub fn retain_between(&self, start: Timestamp, end: Timestamp) -> TimeSeries {
        let samples = self
            .samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .copied()
            .collect();
        Self {
            labels: self.labels.clone(),
            samples,
        }
    }

    /// Same timestamps, values replaced by `f(sample)`, labels extended by one label.
    pub fn derive<F>(&self, label_value: &str, mut f: F) -> TimeSeries
    where
        F: FnMut(&Sample) -> f64,
    {
        let mut labels = self.labels.clone();
        labels.set_label(DERIVED_LABEL, label_value);
        let samples = self
            .samples
            .iter()
            .map(|s| Sample::new(s.timestamp, f(s)))
            .collect();
        Self { labels, samples }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Cycle Tag
// ----------------------------------------------------------------------------

/// A billing cycle named by its calendar month (`YYYY-MM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleTag(NaiveDate);

impl CycleTag {
    /// `None` unless the whole month, padded by a day on each side for
    /// timezone offsets, fits in a `Timestamp`.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let tag = Self(NaiveDate::from_ymd_opt(year, month, 1)?);
        let before = tag.0.checked_sub_days(Days::new(1))?;
        let after = tag.0.checked_add_months(Months::new(1))?.checked_add_days(Days::new(1))?;
        let representable =
            |date: NaiveDate| date.and_time(NaiveTime::MIN).and_utc().timestamp_nanos_opt().is_some();
        (representable(before) && representable(after)).then_some(tag)
    }

    /// Cycle containing the given calendar day.
    pub fn of(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> CycleTag {
        Self(self.0.checked_add_months(Months::new(1)).unwrap_or(NaiveDate::MAX))
    }
}

/// A cycle tag that is not a `YYYY-MM` month, or names a month outside
/// the range a `Timestamp` can hold.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected a YYYY-MM month between 1677-10 and 2262-03, got '{0}'")]
pub struct CycleTagParseError(pub String);

impl FromStr for CycleTag {
    type Err = CycleTagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CycleTagParseError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;

        let digits = |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(year, 4) || !digits(month, 2) {
            return Err(invalid());
        }

        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl Display for CycleTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl Serialize for CycleTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Errors
// ----------------------------------------------------------------------------

/// The main error type of the crate.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics backend error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Series validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForecastError {
    /// Whether re-issuing the same request could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ForecastError::Gateway(e) => e.is_recoverable(),
            ForecastError::Io(_) => true,
            _ => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ForecastError::Config(_) => "config",
            ForecastError::Gateway(e) => e.category(),
            ForecastError::Validation(_) => "validation",
            ForecastError::Logging(_) => "logging",
            ForecastError::Io(_) => "io",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
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
// 4.3 Metrics Gateway Errors
// ----------------------------------------------------------------------------

/// Errors from the metrics backend boundary
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Request to '{endpoint}' failed: {message}")]
    Transport {
        endpoint: String,
        message: String,
        timed_out: bool,
    },

    #[error("Query failed with status '{status}': {message}{}", .error_type.as_ref().map(|t| format!(" [{}]", t)).unwrap_or_default())]
    QueryFailed {
        status: String,
        error_type: Option<String>,
        message: String,
    },

    #[error("Malformed sample in {series} at {timestamp}: {value}")]
    MalformedSample {
        series: String,
        timestamp: String,
        value: String,
    },

    #[error("Invalid response from '{endpoint}': {message}")]
    InvalidResponse { endpoint: String, message: String },
}

impl GatewayError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::Transport { .. } => "transport",
            GatewayError::QueryFailed { .. } => "query_failed",
            GatewayError::MalformedSample { .. } => "malformed_sample",
            GatewayError::InvalidResponse { .. } => "invalid_response",
        }
    }

    pub fn query_failed(status: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::QueryFailed {
            status: status.into(),
            error_type: None,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Validation Errors
// ----------------------------------------------------------------------------

/// Errors found while checking series against their cycle tags
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid cycle tag on {series}: {reason}")]
    InvalidCycleTag { series: String, reason: String },

    #[error("Samples of {series} are not strictly ordered by timestamp")]
    UnsortedSeries { series: String },
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type ForecastResult<T> = Result<T, ForecastError>;

pub type ConfigResult<T> = Result<T, ConfigError>;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub type ValidationResult<T> = Result<T, ValidationError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + `BWFORECAST_` environment overrides, validated before use.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Metrics backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// What to query
    #[serde(default)]
    pub query: QueryConfig,

    /// Query resolution
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Date range to forecast over
    #[serde(default)]
    pub range: RangeConfig,

    /// Control-law parameters
    #[serde(default)]
    pub quota: QuotaParameters,

    /// Billing calendar
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ForecastConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Defaults with environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;
        self.query.validate()?;
        self.sampling.step()?;
        self.range.validate()?;
        self.quota.validate()?;
        Ok(())
    }

    /// Render the defaults as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Backend Configuration
// ----------------------------------------------------------------------------

/// Metrics backend connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Prometheus address; a bare `host:port` is taken as plain HTTP
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-request timeout
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout: default_http_timeout(),
        }
    }
}

impl BackendConfig {
    /// Address with a scheme and without a trailing slash.
    pub fn base_url(&self) -> String {
        let url = self.url.trim().trim_end_matches('/');
        if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        let base = self.base_url();
        let parsed = reqwest::Url::parse(&base)
            .map_err(|e| ConfigError::invalid_value("backend.url", format!("'{}': {}", self.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid_value(
                "backend.url",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid_value("backend.timeout", "must be positive"));
        }
        Ok(())
    }
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Query Configuration
// ----------------------------------------------------------------------------

/// What to ask the backend for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Cumulative byte counter (usage query)
    pub metric: String,
    /// Label carrying the `YYYY-MM` cycle tag
    pub cycle_label: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            metric: DEFAULT_USAGE_METRIC.into(),
            cycle_label: DEFAULT_CYCLE_LABEL.into(),
        }
    }
}

impl QueryConfig {
    pub fn usage_expression(&self) -> String {
        self.metric.clone()
    }

    /// Per-second rate of the counter over one sampling interval.
    pub fn rate_expression(&self, step: SamplingInterval) -> String {
        format!("rate({}[{}])", self.metric, step)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.metric.trim().is_empty() {
            return Err(ConfigError::invalid_value("query.metric", "must not be empty"));
        }
        if self.cycle_label.trim().is_empty() {
            return Err(ConfigError::invalid_value("query.cycle_label", "must not be empty"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.4 Sampling Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Resolution of both queries, e.g. "6h"
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: default_sampling_interval(),
        }
    }
}

impl SamplingConfig {
    pub fn step(&self) -> ConfigResult<SamplingInterval> {
        SamplingInterval::from_duration(self.interval)
    }
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(DEFAULT_SAMPLING_INTERVAL_SECS)
}

/// A whole number of seconds, at least one, rendered in Prometheus
/// duration syntax (`6h`, `90m`, `45s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamplingInterval(u64);

impl SamplingInterval {
    pub fn from_secs(secs: u64) -> ConfigResult<Self> {
        if secs < MIN_SAMPLING_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "sampling.interval",
                format!("must be at least {}s", MIN_SAMPLING_INTERVAL_SECS),
            ));
        }
        Ok(Self(secs))
    }

    pub fn from_duration(duration: Duration) -> ConfigResult<Self> {
        if duration.subsec_nanos() != 0 {
            return Err(ConfigError::invalid_value(
                "sampling.interval",
                format!("{:?} is not a whole number of seconds", duration),
            ));
        }
        Self::from_secs(duration.as_secs())
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for SamplingInterval {
    fn default() -> Self {
        Self(DEFAULT_SAMPLING_INTERVAL_SECS)
    }
}

impl FromStr for SamplingInterval {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration = humantime::parse_duration(s.trim())
            .map_err(|e| ConfigError::invalid_value("sampling.interval", format!("'{}': {}", s, e)))?;
        Self::from_duration(duration)
    }
}

impl Display for SamplingInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 3] = [("d", 86_400), ("h", 3_600), ("m", 60)];
        match UNITS.iter().find(|(_, size)| self.0 % size == 0) {
            Some((unit, size)) => write!(f, "{}{}", self.0 / size, unit),
            None => write!(f, "{}s", self.0),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.5 Date Range Configuration
// ----------------------------------------------------------------------------

/// Calendar dates bounding the forecast. Both ends are inclusive whole
/// days in UTC. Missing `end` means now; missing `start` means
/// `DEFAULT_RANGE_DAYS` before the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

impl RangeConfig {
    pub fn resolve(&self, now: DateTime<Utc>) -> ConfigResult<DateRange> {
        let end = match self.end {
            Some(date) => utc_midnight(date.checked_add_days(Days::new(1)).unwrap_or(date)),
            None => now,
        };
        let start = match self.start {
            Some(date) => utc_midnight(date),
            None => end - chrono::Duration::days(DEFAULT_RANGE_DAYS as i64),
        };
        DateRange::new(start, end)
    }

    fn validate(&self) -> ConfigResult<()> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start > end => Err(ConfigError::invalid_value(
                "range",
                format!("start {} is after end {}", start, end),
            )),
            _ => Ok(()),
        }
    }
}

fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// A non-empty `[start, end]` interval to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ConfigResult<Self> {
        if start >= end {
            return Err(ConfigError::invalid_value(
                "range",
                format!("start {} must be before end {}", start.to_rfc3339(), end.to_rfc3339()),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

// ----------------------------------------------------------------------------
// 5.6 Quota Parameters
// ----------------------------------------------------------------------------

/// Parameters of the control law. Fixed for one forecast run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaParameters {
    /// Monthly cap (bytes)
    pub cap: f64,
    /// Smoothing horizon (seconds)
    pub grace_secs: f64,
    /// Contracted line rate (bytes/second)
    pub peak_rate: f64,
    /// Extra allowance moved to the start of the cycle (bytes)
    pub early_shift_bytes: f64,
}

impl Default for QuotaParameters {
    fn default() -> Self {
        Self {
            cap: DEFAULT_CAP_BYTES,
            grace_secs: DEFAULT_GRACE_SECS,
            peak_rate: DEFAULT_PEAK_RATE,
            early_shift_bytes: DEFAULT_EARLY_SHIFT_BYTES,
        }
    }
}

impl QuotaParameters {
    /// Rejects everything the control law assumes cannot happen.
    pub fn validate(&self) -> ConfigResult<()> {
        let positive = |field: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::invalid_value(field, format!("{} must be finite and positive", value)))
            }
        };
        positive("quota.cap", self.cap)?;
        positive("quota.peak_rate", self.peak_rate)?;
        positive("quota.grace_secs", self.grace_secs)?;

        if self.grace_secs > MIN_CYCLE_SECS {
            return Err(ConfigError::invalid_value(
                "quota.grace_secs",
                format!("{} exceeds the shortest cycle ({}s)", self.grace_secs, MIN_CYCLE_SECS),
            ));
        }
        if !self.early_shift_bytes.is_finite() || self.early_shift_bytes < 0.0 {
            return Err(ConfigError::invalid_value(
                "quota.early_shift_bytes",
                format!("{} must be finite and non-negative", self.early_shift_bytes),
            ));
        }
        // The front-loaded allowance must fit under the cap or the forecast slopes downward.
        let front_load = self.peak_rate * self.grace_secs + self.early_shift_bytes;
        if front_load > self.cap {
            return Err(ConfigError::invalid_value(
                "quota",
                format!(
                    "peak_rate * grace_secs + early_shift_bytes ({}) exceeds cap ({})",
                    front_load, self.cap
                ),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.7 Billing Calendar Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Timezone in which months start
    #[serde(default)]
    pub timezone: CycleZone,
}

// ----------------------------------------------------------------------------
// 5.8 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

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
            colors: true,
            source_location: false,
        }
    }
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

/// Initialize the logging system based on configuration.
/// Logs go to stderr so stdout stays free for the dataset.
pub fn init_logging(config: &LoggingConfig) -> ForecastResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    installed.map_err(|e| ForecastError::Logging(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "bwforecast::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: CALENDAR CYCLE
// ============================================================================
// The billing cycle is the calendar month. The window is a pure function of
// the instant and is never cached, so a month boundary needs no invalidation.
// ============================================================================

/// Timezone in which billing months begin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleZone {
    #[default]
    Local,
    Utc,
}

/// Position of an instant inside its billing month.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleWindow {
    /// First instant of the month
    pub start: Timestamp,
    /// Seconds from this month start to the next one (28-31 days, +/- DST)
    pub duration_secs: f64,
    /// Seconds from month start to the instant, in `[0, duration_secs)`
    pub elapsed_secs: f64,
}

impl CycleWindow {
    pub fn next_start(&self) -> Timestamp {
        Timestamp::from_nanos(self.start.as_nanos() + (self.duration_secs * 1e9).round() as i64)
    }

    pub fn remaining_secs(&self) -> f64 {
        self.duration_secs - self.elapsed_secs
    }

    pub fn contains(&self, instant: Timestamp) -> bool {
        instant >= self.start && instant < self.next_start()
    }
}

/// Stateless month arithmetic in a fixed zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarCycle {
    zone: CycleZone,
}

impl CalendarCycle {
    pub fn new(zone: CycleZone) -> Self {
        Self { zone }
    }

    pub fn utc() -> Self {
        Self::new(CycleZone::Utc)
    }

    pub fn zone(&self) -> CycleZone {
        self.zone
    }

    /// Billing window enclosing `instant`.
    pub fn window_for(&self, instant: Timestamp) -> CycleWindow {
        let (start, next) = self.bounds_for_tag(self.tag_for(instant));
        CycleWindow {
            start,
            duration_secs: next.seconds_since(start),
            elapsed_secs: instant.seconds_since(start).max(0.0),
        }
    }

    /// Month containing `instant` in this zone.
    pub fn tag_for(&self, instant: Timestamp) -> CycleTag {
        let utc = instant.to_datetime();
        let date = match self.zone {
            CycleZone::Utc => utc.date_naive(),
            CycleZone::Local => utc.with_timezone(&Local).date_naive(),
        };
        CycleTag::of(date)
    }

    /// `[month start, next month start)` asserted by a cycle tag.
    pub fn bounds_for_tag(&self, tag: CycleTag) -> (Timestamp, Timestamp) {
        match self.zone {
            CycleZone::Utc => (month_start_in(&Utc, tag), month_start_in(&Utc, tag.next())),
            CycleZone::Local => (month_start_in(&Local, tag), month_start_in(&Local, tag.next())),
        }
    }
}

/// Local midnight on the first of the month. Inside a DST gap the first
/// valid quarter hour after it is used; ambiguous midnights take the earliest.
fn month_start_in<Tz: TimeZone>(tz: &Tz, tag: CycleTag) -> Timestamp {
    let midnight: NaiveDateTime = tag.first_day().and_time(NaiveTime::MIN);
    let resolved = first_valid_instant(&midnight, |naive| {
        tz.from_local_datetime(naive).map(|dt| dt.with_timezone(&Utc))
    })
    .unwrap_or_else(|| Utc.from_utc_datetime(&midnight));
    Timestamp::from_datetime(resolved)
}

/// Earliest instant for `local`, or for the first quarter hour after it
/// (up to four hours) when `local` does not exist.
fn first_valid_instant<F>(local: &NaiveDateTime, to_utc: F) -> Option<DateTime<Utc>>
where
    F: Fn(&NaiveDateTime) -> LocalResult<DateTime<Utc>>,
{
    let earliest = |naive: &NaiveDateTime| match to_utc(naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(a, b) => Some(a.min(b)),
        LocalResult::None => None,
    };

    earliest(local).or_else(|| {
        (1..=16).find_map(|quarter| earliest(&(*local + chrono::Duration::minutes(15 * quarter))))
    })
}

// ============================================================================
// SECTION 8: QUOTA MODEL
// ============================================================================
// Expected usage is a straight line over the cycle from `moved` bytes at the
// month start to `cap` at the month end. The speed limit is the larger of:
//   A - the rate that lands back on the line `grace` seconds from now
//   B - the flat run-rate that reaches the cap exactly at month end
// clamped to the peak rate.
// ============================================================================

/// Forecast and limit evaluated at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaPoint {
    pub timestamp: Timestamp,
    /// Bytes the cycle may have consumed by now
    pub expected_usage: f64,
    /// Highest allowed rate right now (bytes/second)
    pub speed_limit: f64,
}

/// The control law for one set of parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaModel {
    params: QuotaParameters,
    calendar: CalendarCycle,
}

impl QuotaModel {
    pub fn new(params: QuotaParameters, calendar: CalendarCycle) -> Self {
        Self { params, calendar }
    }

    pub fn params(&self) -> &QuotaParameters {
        &self.params
    }

    pub fn calendar(&self) -> CalendarCycle {
        self.calendar
    }

    /// Allowance available at the very start of the cycle.
    pub fn moved_bytes(&self, window: &CycleWindow) -> f64 {
        let p = &self.params;
        p.peak_rate * p.grace_secs - p.cap * p.grace_secs / window.duration_secs + p.early_shift_bytes
    }

    /// The expected-usage line at an arbitrary offset into the window.
    fn line_at(&self, window: &CycleWindow, elapsed_secs: f64) -> f64 {
        let moved = self.moved_bytes(window);
        elapsed_secs / window.duration_secs * (self.params.cap - moved) + moved
    }

    pub fn expected_usage(&self, instant: Timestamp) -> f64 {
        let window = self.calendar.window_for(instant);
        self.line_at(&window, window.elapsed_secs)
    }

    /// Maximum rate given `usage` bytes already consumed this cycle.
    /// Never negative: usage beyond the cap yields zero, and so does a
    /// NaN usage reading.
    pub fn speed_limit(&self, instant: Timestamp, usage: f64) -> f64 {
        if usage.is_nan() {
            return 0.0;
        }
        let window = self.calendar.window_for(instant);
        let grace = self.params.grace_secs;
        debug_assert!(window.remaining_secs() > 0.0);

        let smoothing = (self.line_at(&window, window.elapsed_secs + grace) - usage) / grace;
        let run_rate = (self.params.cap - usage) / window.remaining_secs();

        smoothing.max(run_rate).min(self.params.peak_rate).max(0.0)
    }

    pub fn evaluate(&self, instant: Timestamp, usage: f64) -> QuotaPoint {
        QuotaPoint {
            timestamp: instant,
            expected_usage: self.expected_usage(instant),
            speed_limit: self.speed_limit(instant, usage),
        }
    }
}

// ============================================================================
// SECTION 9: SERIES VALIDATOR
// ============================================================================

/// Keeps each series to the month its own cycle tag asserts.
#[derive(Debug, Clone)]
pub struct SeriesValidator {
    cycle_label: CompactString,
    calendar: CalendarCycle,
}

impl SeriesValidator {
    pub fn new(cycle_label: impl Into<CompactString>, calendar: CalendarCycle) -> Self {
        Self {
            cycle_label: cycle_label.into(),
            calendar,
        }
    }

    pub fn cycle_label(&self) -> &str {
        &self.cycle_label
    }

    /// Parsed cycle tag of a series. Missing or malformed tags are errors.
    pub fn cycle_tag_of(&self, series: &TimeSeries) -> ValidationResult<CycleTag> {
        let raw = series
            .label(&self.cycle_label)
            .ok_or_else(|| ValidationError::InvalidCycleTag {
                series: series.describe(),
                reason: format!("missing '{}' label", self.cycle_label),
            })?;
        raw.parse().map_err(|e: CycleTagParseError| ValidationError::InvalidCycleTag {
            series: series.describe(),
            reason: e.to_string(),
        })
    }

    /// Filters one series to `[month start, next month start)` of its tag.
    /// A series left empty is still returned.
    pub fn filter_series(&self, series: &TimeSeries) -> ValidationResult<(CycleTag, TimeSeries)> {
        let tag = self.cycle_tag_of(series)?;
        let (start, end) = self.calendar.bounds_for_tag(tag);
        let kept = series.retain_between(start, end);

        let dropped = series.len() - kept.len();
        if dropped > 0 {
            debug!(
                target: "bwforecast::validator",
                series = %series.describe(),
                cycle = %tag,
                dropped,
                kept = kept.len(),
                "Dropped samples outside their cycle"
            );
        }
        Ok((tag, kept))
    }

    pub fn filter_by_since(&self, series: &[TimeSeries]) -> ValidationResult<Vec<TimeSeries>> {
        series
            .iter()
            .map(|s| self.filter_series(s).map(|(_, kept)| kept))
            .collect()
    }

    /// Filters and keys a query result by cycle tag. Two series with the
    /// same tag cannot be told apart downstream and are rejected.
    pub fn group_by_cycle(&self, series: &[TimeSeries]) -> ValidationResult<BTreeMap<CycleTag, TimeSeries>> {
        let mut grouped = BTreeMap::new();
        for s in series {
            let (tag, kept) = self.filter_series(s)?;
            if grouped.insert(tag, kept).is_some() {
                return Err(ValidationError::InvalidCycleTag {
                    series: s.describe(),
                    reason: format!("duplicate series for cycle {}", tag),
                });
            }
        }
        Ok(grouped)
    }
}

// ============================================================================
// SECTION 10: METRICS GATEWAY
// ============================================================================
// Range queries against the Prometheus HTTP API, normalized into TimeSeries.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Range Query & Backend Trait
// ----------------------------------------------------------------------------

/// One range query: expression over `[start, end]` at `step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub expression: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: SamplingInterval,
}

impl RangeQuery {
    pub fn new(expression: impl Into<String>, range: &DateRange, step: SamplingInterval) -> Self {
        Self {
            expression: expression.into(),
            start: range.start(),
            end: range.end(),
            step,
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("query", self.expression.clone()),
            ("start", self.start.to_rfc3339()),
            ("end", self.end.to_rfc3339()),
            ("step", self.step.to_string()),
        ]
    }
}

/// Source of range-query results.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Series returned are sorted by timestamp with unique timestamps.
    async fn query_range(&self, query: &RangeQuery) -> GatewayResult<Vec<TimeSeries>>;

    /// Where queries go, for logs.
    fn endpoint(&self) -> &str;
}

// ----------------------------------------------------------------------------
// 10.2 Prometheus Wire Format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromData {
    result_type: String,
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, JsonValue)>,
}

/// Decodes a `query_range` body. `http_status` only matters when the body
/// is not a Prometheus envelope.
pub fn decode_range_response(endpoint: &str, http_status: StatusCode, body: &str) -> GatewayResult<Vec<TimeSeries>> {
    let response: PromResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(_) if !http_status.is_success() => {
            return Err(GatewayError::query_failed(http_status.to_string(), truncate(body)));
        }
        Err(e) => {
            return Err(GatewayError::InvalidResponse {
                endpoint: endpoint.to_string(),
                message: format!("undecodable body: {}", e),
            });
        }
    };

    if response.status != "success" {
        return Err(GatewayError::QueryFailed {
            status: response.status,
            error_type: response.error_type,
            message: response.error.unwrap_or_else(|| "query failed".to_string()),
        });
    }

    let data = response.data.ok_or_else(|| GatewayError::InvalidResponse {
        endpoint: endpoint.to_string(),
        message: "missing 'data' in successful response".to_string(),
    })?;
    if data.result_type != "matrix" {
        return Err(GatewayError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: format!("expected a matrix result, got '{}'", data.result_type),
        });
    }

    data.result.into_iter().map(normalize_series).collect()
}

fn normalize_series(raw: PromSeries) -> GatewayResult<TimeSeries> {
    let labels: Labels = raw.metric.into_iter().map(|(k, v)| Label::new(k, v)).collect();

    let mut samples = Vec::with_capacity(raw.values.len());
    for (secs, value) in raw.values {
        let malformed = || GatewayError::MalformedSample {
            series: labels.describe(),
            timestamp: secs.to_string(),
            value: value.to_string(),
        };
        let timestamp = Timestamp::from_epoch_secs_f64(secs).ok_or_else(malformed)?;
        let value = parse_sample_value(&value).ok_or_else(malformed)?;
        samples.push(Sample::new(timestamp, value));
    }

    Ok(TimeSeries::new(labels, samples))
}

/// Prometheus sends values as strings ("123", "NaN", "+Inf"); bare numbers are accepted too.
fn parse_sample_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    cut.push('…');
    cut
}

// ----------------------------------------------------------------------------
// 10.3 Prometheus Gateway
// ----------------------------------------------------------------------------

/// HTTP gateway to a Prometheus-compatible range-query API.
#[derive(Debug, Clone)]
pub struct PrometheusGateway {
    /// HTTP client with connection pooling
    client: HttpClient,
    query_url: String,
}

impl PrometheusGateway {
    pub fn new(config: &BackendConfig) -> GatewayResult<Self> {
        let base_url = config.base_url();
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| GatewayError::Transport {
                endpoint: base_url.clone(),
                message: format!("failed to build HTTP client: {}", e),
                timed_out: false,
            })?;
        Ok(Self::with_client(client, &base_url))
    }

    pub fn with_client(client: HttpClient, base_url: &str) -> Self {
        Self {
            client,
            query_url: format!("{}{}", base_url.trim_end_matches('/'), RANGE_QUERY_PATH),
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> GatewayError {
        GatewayError::Transport {
            endpoint: self.query_url.clone(),
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

#[async_trait]
impl MetricsBackend for PrometheusGateway {
    async fn query_range(&self, query: &RangeQuery) -> GatewayResult<Vec<TimeSeries>> {
        let started = Instant::now();

        let response = self
            .client
            .get(&self.query_url)
            .query(&query.params())
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(&e))?;
        let series = decode_range_response(&self.query_url, status, &body)?;

        debug!(
            target: "bwforecast::gateway",
            query = %query.expression,
            start = %query.start.to_rfc3339(),
            end = %query.end.to_rfc3339(),
            step = %query.step,
            series = series.len(),
            samples = series.iter().map(TimeSeries::len).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Range query complete"
        );
        Ok(series)
    }

    fn endpoint(&self) -> &str {
        &self.query_url
    }
}

// ============================================================================
// SECTION 11: FORECAST PIPELINE & DATASET
// ============================================================================
// query (usage ‖ rate) → validate → derive → merge, as plain function calls
// over immutable values. Any failure discards everything.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Dataset
// ----------------------------------------------------------------------------

/// Observed and derived series of one billing cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSeries {
    pub usage: TimeSeries,
    pub usage_limit: TimeSeries,
    pub rate: TimeSeries,
    pub speed_limit: TimeSeries,
}

/// Pipeline output, keyed by cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Dataset {
    cycles: BTreeMap<CycleTag, CycleSeries>,
}

/// A labelled line for the presentation layer: `(epoch ms, value)` points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub label: String,
    pub points: Vec<(i64, f64)>,
}

impl ChartSeries {
    fn from_series(tag: CycleTag, name: &str, series: &TimeSeries) -> Self {
        Self {
            label: format!("{} {}", tag, name),
            points: series
                .samples()
                .iter()
                .map(|s| (s.timestamp.as_millis(), s.value))
                .collect(),
        }
    }
}

/// Both charts in one serializable value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Charts {
    pub usage: Vec<ChartSeries>,
    pub speed: Vec<ChartSeries>,
}

impl Dataset {
    pub fn new(cycles: BTreeMap<CycleTag, CycleSeries>) -> Self {
        Self { cycles }
    }

    pub fn cycles(&self) -> &BTreeMap<CycleTag, CycleSeries> {
        &self.cycles
    }

    pub fn cycle(&self, tag: CycleTag) -> Option<&CycleSeries> {
        self.cycles.get(&tag)
    }

    /// Number of cycles
    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Observed usage then expected usage, per cycle.
    pub fn usage_chart(&self) -> Vec<ChartSeries> {
        self.cycles
            .iter()
            .flat_map(|(tag, c)| {
                [
                    ChartSeries::from_series(*tag, USAGE_SERIES_NAME, &c.usage),
                    ChartSeries::from_series(*tag, USAGE_LIMIT_SERIES_NAME, &c.usage_limit),
                ]
            })
            .collect()
    }

    /// Observed rate then speed limit, per cycle.
    pub fn speed_chart(&self) -> Vec<ChartSeries> {
        self.cycles
            .iter()
            .flat_map(|(tag, c)| {
                [
                    ChartSeries::from_series(*tag, RATE_SERIES_NAME, &c.rate),
                    ChartSeries::from_series(*tag, SPEED_LIMIT_SERIES_NAME, &c.speed_limit),
                ]
            })
            .collect()
    }

    pub fn series(&self) -> Vec<ChartSeries> {
        let mut all = self.usage_chart();
        all.extend(self.speed_chart());
        all
    }

    pub fn charts(&self) -> Charts {
        Charts {
            usage: self.usage_chart(),
            speed: self.speed_chart(),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Derivation & Merge
// ----------------------------------------------------------------------------

/// Expected usage at every usage timestamp.
pub fn derive_usage_limit(model: &QuotaModel, usage: &TimeSeries) -> TimeSeries {
    usage.derive("usage_limit", |s| model.expected_usage(s.timestamp))
}

/// Speed limit at every rate timestamp that has a usage sample, computed
/// from that usage value. Without a rate series, at every usage timestamp.
pub fn derive_speed_limit(model: &QuotaModel, usage: &TimeSeries, rate: Option<&TimeSeries>) -> TimeSeries {
    let mut labels = usage.labels().clone();
    labels.set_label(DERIVED_LABEL, "speed_limit");

    let samples = match rate {
        Some(rate) => rate
            .samples()
            .iter()
            .filter_map(|s| {
                usage
                    .value_at(s.timestamp)
                    .map(|used| Sample::new(s.timestamp, model.speed_limit(s.timestamp, used)))
            })
            .collect(),
        None => usage
            .samples()
            .iter()
            .map(|s| Sample::new(s.timestamp, model.speed_limit(s.timestamp, s.value)))
            .collect(),
    };
    TimeSeries::new(labels, samples)
}

/// Joins validated usage and rate results per cycle and appends the
/// derived series. Rate cycles without usage have nothing to derive from
/// and are left out.
pub fn merge_cycles(
    model: &QuotaModel,
    cycle_label: &str,
    usage: BTreeMap<CycleTag, TimeSeries>,
    mut rate: BTreeMap<CycleTag, TimeSeries>,
) -> Dataset {
    let mut cycles = BTreeMap::new();

    for (tag, usage_series) in usage {
        let rate_series = rate.remove(&tag);
        let speed_limit = derive_speed_limit(model, &usage_series, rate_series.as_ref());
        let usage_limit = derive_usage_limit(model, &usage_series);
        let rate_series = rate_series.unwrap_or_else(|| TimeSeries::empty(labels![cycle_label => tag.to_string()]));

        cycles.insert(
            tag,
            CycleSeries {
                usage: usage_series,
                usage_limit,
                rate: rate_series,
                speed_limit,
            },
        );
    }

    for tag in rate.keys() {
        warn!(
            target: "bwforecast::pipeline",
            cycle = %tag,
            "Rate series has no matching usage series, dropping it"
        );
    }

    Dataset::new(cycles)
}

// ----------------------------------------------------------------------------
// 11.3 Pipeline
// ----------------------------------------------------------------------------

/// Query → validate → derive → merge, against any backend.
#[derive(Debug)]
pub struct ForecastPipeline<B> {
    backend: B,
    query: QueryConfig,
    validator: SeriesValidator,
    calendar: CalendarCycle,
}

impl ForecastPipeline<PrometheusGateway> {
    /// Pipeline talking to the configured Prometheus.
    pub fn from_config(config: &ForecastConfig) -> ForecastResult<Self> {
        let backend = PrometheusGateway::new(&config.backend)?;
        Ok(Self::new(backend, config.query.clone(), CalendarCycle::new(config.cycle.timezone)))
    }
}

impl<B: MetricsBackend> ForecastPipeline<B> {
    pub fn new(backend: B, query: QueryConfig, calendar: CalendarCycle) -> Self {
        let validator = SeriesValidator::new(query.cycle_label.as_str(), calendar);
        Self {
            backend,
            query,
            validator,
            calendar,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs one forecast. Either both queries succeed and every series
    /// validates, or no dataset is produced. Dropping the returned future
    /// cancels the in-flight queries.
    pub async fn build_dataset(
        &self,
        params: &QuotaParameters,
        sampling: SamplingInterval,
        range: &DateRange,
    ) -> ForecastResult<Dataset> {
        let started = Instant::now();
        let result = self.run(params, sampling, range).await;

        match &result {
            Ok(dataset) => info!(
                target: "bwforecast::pipeline",
                endpoint = self.backend.endpoint(),
                cycles = dataset.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Forecast dataset built"
            ),
            Err(err) => warn!(
                target: "bwforecast::pipeline",
                endpoint = self.backend.endpoint(),
                category = err.category(),
                error = %err,
                "Forecast failed, no dataset produced"
            ),
        }
        result
    }

    async fn run(
        &self,
        params: &QuotaParameters,
        sampling: SamplingInterval,
        range: &DateRange,
    ) -> ForecastResult<Dataset> {
        let model = QuotaModel::new(*params, self.calendar);
        let usage_query = RangeQuery::new(self.query.usage_expression(), range, sampling);
        let rate_query = RangeQuery::new(self.query.rate_expression(sampling), range, sampling);

        let (usage, rate) = tokio::try_join!(
            self.backend.query_range(&usage_query),
            self.backend.query_range(&rate_query)
        )?;

        let usage = self.validator.group_by_cycle(&usage)?;
        let rate = self.validator.group_by_cycle(&rate)?;

        Ok(merge_cycles(&model, self.validator.cycle_label(), usage, rate))
    }
}

// ============================================================================
// SECTION 12: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_timestamp_from_epoch_secs_rounds_to_millis() {
        let t = Timestamp::from_epoch_secs_f64(1_709_251_200.123_4).unwrap();
        assert_eq!(t.as_millis(), 1_709_251_200_123);

        assert!(Timestamp::from_epoch_secs_f64(f64::NAN).is_none());
        assert!(Timestamp::from_epoch_secs_f64(f64::INFINITY).is_none());
        assert!(Timestamp::from_epoch_secs_f64(1e300).is_none());
    }

    #[test]
    fn test_timestamp_datetime_conversion() {
        let t = ts("2024-03-01T00:00:00Z");
        assert_eq!(t.as_millis(), 1_709_251_200_000);
        assert_eq!(t.to_datetime().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(ts("2024-03-01T01:00:00Z").seconds_since(t), 3600.0);
    }

    #[test]
    fn test_labels() {
        let mut labels = labels!["__name__" => "l4_total_bytes", "since" => "2024-03"];

        assert_eq!(labels.get_label("since"), Some("2024-03"));
        assert_eq!(labels.get_label("missing"), None);
        assert!(labels.has_label("__name__"));

        labels.set_label("since", "2024-04");
        labels.set_label("host", "edge-01");
        assert_eq!(labels.get_label("since"), Some("2024-04"));
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.describe(), r#"l4_total_bytes{host="edge-01", since="2024-04"}"#);
    }

    #[test]
    fn test_time_series_sorts_and_keeps_first_duplicate() {
        let series = TimeSeries::new(
            labels!["since" => "2024-03"],
            vec![
                Sample::new(Timestamp::from_secs(20), 2.0),
                Sample::new(Timestamp::from_secs(10), 1.0),
                Sample::new(Timestamp::from_secs(20), 9.0),
            ],
        );

        assert_eq!(
            series.samples(),
            &[
                Sample::new(Timestamp::from_secs(10), 1.0),
                Sample::new(Timestamp::from_secs(20), 2.0),
            ]
        );
        assert_eq!(series.value_at(Timestamp::from_secs(20)), Some(2.0));
        assert_eq!(series.value_at(Timestamp::from_secs(15)), None);
    }

    #[test]
    fn test_time_series_from_sorted_rejects_disorder() {
        let ordered = vec![
            Sample::new(Timestamp::from_secs(1), 1.0),
            Sample::new(Timestamp::from_secs(2), 2.0),
        ];
        assert!(TimeSeries::from_sorted(labels![], ordered).is_ok());

        let repeated = vec![
            Sample::new(Timestamp::from_secs(1), 1.0),
            Sample::new(Timestamp::from_secs(1), 2.0),
        ];
        assert!(matches!(
            TimeSeries::from_sorted(labels!["since" => "2024-03"], repeated),
            Err(ValidationError::UnsortedSeries { .. })
        ));

        let reversed = vec![
            Sample::new(Timestamp::from_secs(2), 2.0),
            Sample::new(Timestamp::from_secs(1), 1.0),
        ];
        assert!(TimeSeries::from_sorted(labels![], reversed).is_err());
    }

    #[rstest]
    #[case("2024-03", Some((2024, 3)))]
    #[case("1999-12", Some((1999, 12)))]
    #[case(" 2024-01 ", Some((2024, 1)))]
    #[case("2024-13", None)]
    #[case("2024-00", None)]
    #[case("2024-3", None)]
    #[case("24-03", None)]
    #[case("2024/03", None)]
    #[case("2024-03-01", None)]
    #[case("March", None)]
    #[case("", None)]
    #[case("1677-10", Some((1677, 10)))]
    #[case("2262-03", Some((2262, 3)))]
    #[case("1677-09", None)]
    #[case("1600-03", None)]
    #[case("2262-04", None)]
    fn test_cycle_tag_parsing(#[case] raw: &str, #[case] expected: Option<(i32, u32)>) {
        let parsed = raw.parse::<CycleTag>().ok().map(|t| (t.year(), t.month()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_timestamp_saturates_outside_range() {
        let ancient = NaiveDate::from_ymd_opt(1500, 1, 1).unwrap().and_time(NaiveTime::MIN).and_utc();
        let distant = NaiveDate::from_ymd_opt(2300, 1, 1).unwrap().and_time(NaiveTime::MIN).and_utc();

        assert_eq!(Timestamp::from_datetime(ancient).as_nanos(), i64::MIN);
        assert_eq!(Timestamp::from_datetime(distant).as_nanos(), i64::MAX);
    }

    #[test]
    fn test_cycle_tag_ordering_and_next() {
        let dec: CycleTag = "2024-12".parse().unwrap();
        let jan = dec.next();

        assert_eq!(jan.to_string(), "2025-01");
        assert!(dec < jan);
        assert_eq!(CycleTag::of(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()).to_string(), "2024-02");
        assert_eq!(serde_json::to_string(&jan).unwrap(), r#""2025-01""#);
    }

    #[test]
    fn test_error_categories() {
        let err: ForecastError = GatewayError::Transport {
            endpoint: "http://localhost:9090".into(),
            message: "connection refused".into(),
            timed_out: false,
        }
        .into();
        assert_eq!(err.category(), "transport");
        assert!(err.is_recoverable());

        let err: ForecastError = ValidationError::InvalidCycleTag {
            series: "x".into(),
            reason: "bad".into(),
        }
        .into();
        assert_eq!(err.category(), "validation");
        assert!(!err.is_recoverable());

        let err = GatewayError::QueryFailed {
            status: "error".into(),
            error_type: Some("bad_data".into()),
            message: "parse error".into(),
        };
        assert_eq!(err.to_string(), "Query failed with status 'error': parse error [bad_data]");
    }
}




#[cfg(test)]
mod gateway_tests {
    use super::test_support::*;
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    const ENDPOINT: &str = "http://prometheus:9090/api/v1/query_range";

    const MATRIX_BODY: &str = r#"{
        "status": "success",
        "data": {
            "resultType": "matrix",
            "result": [
                {
                    "metric": {"__name__": "l4_total_bytes", "since": "2024-03"},
                    "values": [[1709272800, "2000"], [1709251200.5, "1000"], [1709294400, 3000]]
                },
                {
                    "metric": {"since": "2024-02"},
                    "values": [[1709164800, "NaN"], [1709168400, "+Inf"], [1709172000, "-Inf"]]
                }
            ]
        }
    }"#;

    fn decode(status: u16, body: &str) -> GatewayResult<Vec<TimeSeries>> {
        decode_range_response(ENDPOINT, StatusCode::from_u16(status).unwrap(), body)
    }

    #[test]
    fn test_decode_matrix_sorts_and_parses_values() {
        let series = decode(200, MATRIX_BODY).unwrap();
        assert_eq!(series.len(), 2);

        let march = &series[0];
        assert_eq!(march.label("__name__"), Some("l4_total_bytes"));
        assert_eq!(march.label("since"), Some("2024-03"));
        assert_eq!(
            march.samples(),
            &[
                Sample::new(Timestamp::from_millis(1_709_251_200_500), 1000.0),
                Sample::new(Timestamp::from_secs(1_709_272_800), 2000.0),
                Sample::new(Timestamp::from_secs(1_709_294_400), 3000.0),
            ]
        );

        let specials: Vec<f64> = series[1].samples().iter().map(|s| s.value).collect();
        assert!(specials[0].is_nan());
        assert_eq!(specials[1], f64::INFINITY);
        assert_eq!(specials[2], f64::NEG_INFINITY);
    }

    #[test]
    fn test_decode_empty_result() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
        assert!(decode(200, body).unwrap().is_empty());
    }

    #[test]
    fn test_decode_error_status_is_query_failed() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 5"}"#;
        match decode(400, body) {
            Err(GatewayError::QueryFailed {
                status,
                error_type,
                message,
            }) => {
                assert_eq!(status, "error");
                assert_eq!(error_type.as_deref(), Some("bad_data"));
                assert_eq!(message, "parse error at char 5");
            }
            other => panic!("expected QueryFailed, got {:?}", other),
        }

        assert!(matches!(
            decode(200, r#"{"status":"error"}"#),
            Err(GatewayError::QueryFailed { .. })
        ));
    }

    #[test]
    fn test_decode_non_json_bodies() {
        match decode(502, "<html>bad gateway</html>") {
            Err(GatewayError::QueryFailed { status, message, .. }) => {
                assert_eq!(status, "502 Bad Gateway");
                assert_eq!(message, "<html>bad gateway</html>");
            }
            other => panic!("expected QueryFailed, got {:?}", other),
        }

        assert!(matches!(
            decode(200, "not json"),
            Err(GatewayError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_non_matrix_and_missing_data() {
        let vector = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(matches!(decode(200, vector), Err(GatewayError::InvalidResponse { .. })));

        assert!(matches!(
            decode(200, r#"{"status":"success"}"#),
            Err(GatewayError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_decode_malformed_sample() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"since":"2024-03"},"values":[[1709251200,"12"],[1709254800,"lots"]]}
        ]}}"#;
        match decode(200, body) {
            Err(GatewayError::MalformedSample { series, value, .. }) => {
                assert!(series.contains("2024-03"));
                assert!(value.contains("lots"));
            }
            other => panic!("expected MalformedSample, got {:?}", other),
        }

        let boolean = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{},"values":[[1709251200,true]]}
        ]}}"#;
        assert!(matches!(decode(200, boolean), Err(GatewayError::MalformedSample { .. })));
    }

    fn march_query(expression: &str) -> RangeQuery {
        let range = DateRange::new(utc("2024-03-01T00:00:00Z"), utc("2024-03-31T00:00:00Z")).unwrap();
        RangeQuery::new(expression, &range, SamplingInterval::default())
    }

    #[tokio::test]
    async fn test_gateway_issues_range_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", RANGE_QUERY_PATH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), "rate(l4_total_bytes[6h])".into()),
                Matcher::UrlEncoded("start".into(), "2024-03-01T00:00:00+00:00".into()),
                Matcher::UrlEncoded("end".into(), "2024-03-31T00:00:00+00:00".into()),
                Matcher::UrlEncoded("step".into(), "6h".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(MATRIX_BODY)
            .create_async()
            .await;

        let gateway = PrometheusGateway::new(&BackendConfig {
            url: server.url(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let series = gateway.query_range(&march_query("rate(l4_total_bytes[6h])")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(series.len(), 2);
        assert!(gateway.endpoint().ends_with(RANGE_QUERY_PATH));
    }

    #[tokio::test]
    async fn test_gateway_surfaces_backend_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", RANGE_QUERY_PATH)
            .match_query(Matcher::Any)
            .with_status(422)
            .with_body(r#"{"status":"error","errorType":"execution","error":"too many samples"}"#)
            .create_async()
            .await;

        let gateway = PrometheusGateway::with_client(HttpClient::new(), &server.url());
        let err = gateway.query_range(&march_query(DEFAULT_USAGE_METRIC)).await.unwrap_err();

        assert_eq!(err.category(), "query_failed");
        assert!(err.to_string().contains("too many samples"));
    }

    #[tokio::test]
    async fn test_gateway_unreachable_backend_is_transport_error() {
        let gateway = PrometheusGateway::new(&BackendConfig {
            url: "127.0.0.1:1".into(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let err = gateway.query_range(&march_query(DEFAULT_USAGE_METRIC)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert!(err.is_recoverable());
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const RATE_EXPRESSION: &str = "rate(l4_total_bytes[6h])";

    /// Canned results keyed by query expression.
    #[derive(Debug, Default)]
    struct FakeBackend {
        responses: HashMap<String, Vec<TimeSeries>>,
        failing: Option<String>,
    }

    impl FakeBackend {
        fn respond(mut self, expression: &str, series: Vec<TimeSeries>) -> Self {
            self.responses.insert(expression.to_string(), series);
            self
        }

        fn fail_on(mut self, expression: &str) -> Self {
            self.failing = Some(expression.to_string());
            self
        }
    }

    #[async_trait]
    impl MetricsBackend for FakeBackend {
        async fn query_range(&self, query: &RangeQuery) -> GatewayResult<Vec<TimeSeries>> {
            if self.failing.as_deref() == Some(query.expression.as_str()) {
                return Err(GatewayError::query_failed("error", "backend unavailable"));
            }
            Ok(self.responses.get(&query.expression).cloned().unwrap_or_default())
        }

        fn endpoint(&self) -> &str {
            "fake://backend"
        }
    }

    fn usage() -> Vec<TimeSeries> {
        vec![
            tagged(
                "2024-03",
                &[
                    ("2024-02-29T18:00:00Z", 500.0),
                    ("2024-03-01T06:00:00Z", 1e9),
                    ("2024-03-01T12:00:00Z", 2e9),
                    ("2024-03-01T18:00:00Z", 3e9),
                ],
            ),
            tagged("2024-04", &[("2024-04-01T06:00:00Z", 1e8)]),
        ]
    }

    fn rate() -> Vec<TimeSeries> {
        vec![tagged(
            "2024-03",
            &[
                ("2024-03-01T12:00:00Z", 46_296.0),
                ("2024-03-01T18:00:00Z", 46_296.0),
                ("2024-03-01T21:00:00Z", 46_296.0),
            ],
        )]
    }

    fn pipeline(backend: FakeBackend) -> ForecastPipeline<FakeBackend> {
        ForecastPipeline::new(backend, QueryConfig::default(), CalendarCycle::utc())
    }

    fn range() -> DateRange {
        DateRange::new(utc("2024-02-25T00:00:00Z"), utc("2024-04-02T00:00:00Z")).unwrap()
    }

    async fn build(backend: FakeBackend) -> ForecastResult<Dataset> {
        pipeline(backend)
            .build_dataset(&QuotaParameters::default(), SamplingInterval::default(), &range())
            .await
    }

    #[tokio::test]
    async fn test_dataset_has_two_series_per_cycle_per_chart() {
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, usage())
            .respond(RATE_EXPRESSION, rate());
        let dataset = build(backend).await.unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.usage_chart().len(), 4);
        assert_eq!(dataset.speed_chart().len(), 4);
        assert_eq!(dataset.series().len(), 8);

        let labels: Vec<String> = dataset.usage_chart().into_iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec!["2024-03 Usage", "2024-03 Usage Limit", "2024-04 Usage", "2024-04 Usage Limit"]
        );
        let labels: Vec<String> = dataset.speed_chart().into_iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec!["2024-03 Used Speed", "2024-03 Speed Limit", "2024-04 Used Speed", "2024-04 Speed Limit"]
        );
    }

    #[tokio::test]
    async fn test_derived_series_follow_the_model() {
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, usage())
            .respond(RATE_EXPRESSION, rate());
        let dataset = build(backend).await.unwrap();
        let model = QuotaModel::new(QuotaParameters::default(), CalendarCycle::utc());

        let march = dataset.cycle("2024-03".parse().unwrap()).unwrap();
        assert_eq!(march.usage.len(), 3);
        assert_eq!(timestamps(&march.usage_limit), timestamps(&march.usage));
        for (observed, limit) in march.usage.samples().iter().zip(march.usage_limit.samples()) {
            assert_eq!(limit.value, model.expected_usage(observed.timestamp));
        }

        assert_eq!(
            timestamps(&march.speed_limit),
            vec![ts("2024-03-01T12:00:00Z"), ts("2024-03-01T18:00:00Z")]
        );
        for sample in march.speed_limit.samples() {
            let used = march.usage.value_at(sample.timestamp).unwrap();
            assert_eq!(sample.value, model.speed_limit(sample.timestamp, used));
        }
        assert_eq!(march.speed_limit.label(DERIVED_LABEL), Some("speed_limit"));
        assert_eq!(march.usage_limit.label(DERIVED_LABEL), Some("usage_limit"));
    }

    #[tokio::test]
    async fn test_cycle_without_rate_gets_empty_rate_and_usage_aligned_limit() {
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, usage())
            .respond(RATE_EXPRESSION, rate());
        let dataset = build(backend).await.unwrap();

        let april = dataset.cycle("2024-04".parse().unwrap()).unwrap();
        assert!(april.rate.is_empty());
        assert_eq!(april.rate.label(DEFAULT_CYCLE_LABEL), Some("2024-04"));
        assert_eq!(timestamps(&april.speed_limit), vec![ts("2024-04-01T06:00:00Z")]);
    }

    #[tokio::test]
    async fn test_rate_only_cycle_is_dropped() {
        let mut rates = rate();
        rates.push(tagged("2024-01", &[("2024-01-15T00:00:00Z", 1.0)]));
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, usage())
            .respond(RATE_EXPRESSION, rates);
        let dataset = build(backend).await.unwrap();

        let tags: Vec<String> = dataset.cycles().keys().map(|t| t.to_string()).collect();
        assert_eq!(tags, vec!["2024-03", "2024-04"]);
    }

    #[tokio::test]
    async fn test_empty_results_give_empty_dataset() {
        let dataset = build(FakeBackend::default()).await.unwrap();
        assert!(dataset.is_empty());
        assert!(dataset.series().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_produces_no_dataset() {
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, usage())
            .fail_on(RATE_EXPRESSION);

        match build(backend).await {
            Err(ForecastError::Gateway(GatewayError::QueryFailed { message, .. })) => {
                assert_eq!(message, "backend unavailable");
            }
            other => panic!("expected QueryFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_cycle_tag_produces_no_dataset() {
        let mut series = usage();
        series.push(tagged("not-a-month", &[("2024-03-02T00:00:00Z", 1.0)]));
        let backend = FakeBackend::default()
            .respond(DEFAULT_USAGE_METRIC, series)
            .respond(RATE_EXPRESSION, rate());

        let err = build(backend).await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_charts_serialize_as_epoch_millis() {
        let model = QuotaModel::new(QuotaParameters::default(), CalendarCycle::utc());
        let mut grouped = BTreeMap::new();
        grouped.insert(
            "2024-03".parse().unwrap(),
            tagged("2024-03", &[("2024-03-01T00:00:00Z", 42.0)]),
        );
        let dataset = merge_cycles(&model, DEFAULT_CYCLE_LABEL, grouped, BTreeMap::new());

        let json = serde_json::to_value(dataset.charts()).unwrap();
        assert_eq!(json["usage"][0]["label"], "2024-03 Usage");
        assert_eq!(json["usage"][0]["points"][0][0], 1_709_251_200_000i64);
        assert_eq!(json["usage"][0]["points"][0][1], 42.0);
        assert_eq!(json["speed"][0]["points"].as_array().map(Vec::len), Some(0));
    }
}
