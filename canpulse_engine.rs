//! # CANpulse Engine - Telemetry Aggregation & Live Broadcast
//!
//! Turns decoded vehicle-bus samples (one row per decoded signal reading) into
//! statistical views and pushes a live subset of them to every connected observer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              CANPULSE ENGINE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SAMPLE STORE → {AGGREGATION, ANOMALY, CORRELATION, DISTRIBUTION, RATE}     │
//! │              → BROADCAST FANOUT → SUBSCRIBERS (/ws)                         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Stateless analytics**: every call recomputes from the sample store
//! - **Batched correlation**: one grouped pass, pairwise joins in memory
//! - **Bounded fan-out**: per-subscriber queues, no head-of-line blocking
//! - **Cost avoidance**: no store traffic while nobody is listening
//!
//! ## Author
//!
//! CANpulse Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{vec_deque, BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use futures::{SinkExt, StreamExt};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};
use dashmap::DashMap;
use arc_swap::ArcSwap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::json;

// ----------------------------------------------------------------------------
// Strings & Hashing
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use ahash::{AHashMap, AHashSet};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

// ----------------------------------------------------------------------------
// Async Traits, Identifiers, Configuration, CLI
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use uuid::Uuid;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "canpulse-engine";
pub const ENGINE_FULL_NAME: &str = "CANpulse Telemetry Engine";

// ----------------------------------------------------------------------------
// Broadcast Cadence
// ----------------------------------------------------------------------------

/// Default broadcast tick period (milliseconds)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Minimum allowed broadcast tick period (milliseconds)
pub const MIN_TICK_INTERVAL_MS: u64 = 50;

/// Environment overrides use this prefix, `__` separating nested keys
pub const CONFIG_ENV_PREFIX: &str = "CANPULSE_";

/// Freshness window for the live snapshot (milliseconds)
pub const DEFAULT_SNAPSHOT_FRESHNESS_MS: u64 = 10_000;

/// Tail window for live raw messages (milliseconds)
pub const DEFAULT_RAW_TAIL_MS: u64 = 2_000;

/// Maximum raw messages pushed per tick
pub const DEFAULT_RAW_TAIL_LIMIT: usize = 10;

/// Outbound frames buffered per subscriber before frames are dropped
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Store Access
// ----------------------------------------------------------------------------

/// Upper bound for a single store query (milliseconds)
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2_000;

/// Default in-memory retention (rows, 0 = unbounded)
pub const DEFAULT_MAX_SAMPLES: usize = 1_000_000;

// ----------------------------------------------------------------------------
// Analytics Defaults
// ----------------------------------------------------------------------------

/// Default Z-score threshold for anomaly detection
pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 3.0;

/// Anomaly responses never exceed this many rows
pub const DEFAULT_MAX_ANOMALIES: usize = 100;

/// Default histogram resolution
pub const DEFAULT_HISTOGRAM_BINS: usize = 20;

/// Default bucket for correlation series (milliseconds)
pub const DEFAULT_CORRELATION_BUCKET_MS: u64 = 1_000;

/// Default sub-interval for message-rate counting (milliseconds)
pub const DEFAULT_RATE_INTERVAL_MS: u64 = 1_000;

/// Default bucket for time series (milliseconds)
pub const DEFAULT_SERIES_BUCKET_MS: u64 = 1_000;

/// Default row cap for raw message queries
pub const DEFAULT_RAW_QUERY_LIMIT: usize = 1_000;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default listen address for the live channel
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:5000";

/// Default WebSocket path
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Maximum inbound WebSocket message size (bytes)
pub const MAX_WEBSOCKET_MESSAGE_SIZE: usize = 64 * 1024;

/// Idle connections are closed after this many seconds without inbound traffic
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Keep-alive ping period (seconds)
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 20;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Simulator
// ----------------------------------------------------------------------------

/// Default simulator step rate (Hz)
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 10.0;

/// Length of a classic CAN data field (bytes)
pub const CAN_FRAME_LEN: usize = 8;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Value types shared by every subsystem: timestamps, windows, samples,
// the injectable clock and subscriber identities.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// High-precision timestamp (nanoseconds since Unix epoch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

/// Saturating conversion of a duration into signed nanoseconds
#[inline]
fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

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

    /// Get the current wall-clock timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration_nanos(duration))
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Fractional seconds since the Unix epoch
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0.div_euclid(1_000_000_000) as f64 + self.0.rem_euclid(1_000_000_000) as f64 / 1e9
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
        Self(self.0.saturating_add(duration_nanos(duration)))
    }

    /// Subtract duration from timestamp
    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(duration)))
    }

    /// Check if timestamp is within an inclusive time range
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 <= end.0
    }

    /// Round down to the start of the epoch-aligned bucket containing this instant.
    ///
    /// Uses euclidean division so pre-epoch instants floor towards negative
    /// infinity like every other instant.
    #[inline]
    pub fn floor_to(&self, bucket: Duration) -> Self {
        let bucket_nanos = duration_nanos(bucket);
        if bucket_nanos <= 0 {
            return *self;
        }
        Self(self.0.div_euclid(bucket_nanos) * bucket_nanos)
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Maximum representable timestamp
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Minimum representable timestamp
    pub const MIN: Timestamp = Timestamp(i64::MIN);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration_nanos(duration))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

/// Atomic timestamp for lock-free bookkeeping
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Timestamp {
        Timestamp(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, ordering: AtomicOrdering) {
        self.0.store(ts.0, ordering);
    }

    /// Add a duration and return the new value
    #[inline]
    pub fn advance(&self, by: Duration) -> Timestamp {
        let delta = duration_nanos(by);
        Timestamp(self.0.fetch_add(delta, AtomicOrdering::AcqRel).saturating_add(delta))
    }

    /// Update to the given time if it is newer than the stored one
    #[inline]
    pub fn update_if_newer(&self, new: Timestamp) {
        self.0.fetch_max(new.0, AtomicOrdering::AcqRel);
    }
}

impl Default for AtomicTimestamp {
    fn default() -> Self {
        Self::new(Timestamp::EPOCH)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Time Ranges & Windows
// ----------------------------------------------------------------------------

/// Inclusive `[from, to]` interval of sample timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// The range covering `duration` back from `end`
    pub fn ending_at(end: Timestamp, duration: Duration) -> Self {
        Self {
            from: end.sub_duration(duration),
            to: end,
        }
    }

    /// Everything up to and including `end`
    pub fn until(end: Timestamp) -> Self {
        Self {
            from: Timestamp::MIN,
            to: end,
        }
    }

    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts.is_within(self.from, self.to)
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }
}

/// A relative lookback ending at "now", with an optional bucket granularity.
///
/// Windows always resolve against the injected [`Clock`], never against a
/// caller-supplied instant, so every analytic call is a function of the
/// store contents at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub duration: Duration,
    pub bucket: Option<Duration>,
}

impl Window {
    /// Create a window, rejecting zero-length lookbacks
    pub fn new(duration: Duration) -> QueryResult<Self> {
        if duration.is_zero() {
            return Err(QueryError::InvalidWindow {
                message: "window duration must be positive".to_string(),
            });
        }
        Ok(Self {
            duration,
            bucket: None,
        })
    }

    /// Lookback of `secs` seconds (clamped to at least one second)
    pub fn last_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs.max(1)),
            bucket: None,
        }
    }

    /// Lookback of `minutes` minutes (clamped to at least one minute)
    pub fn last_minutes(minutes: u64) -> Self {
        Self::last_secs(minutes.max(1) * 60)
    }

    /// Lookback of `millis` milliseconds (clamped to at least one millisecond)
    pub fn last_millis(millis: u64) -> Self {
        Self {
            duration: Duration::from_millis(millis.max(1)),
            bucket: None,
        }
    }

    pub fn with_bucket(mut self, bucket: Duration) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Resolve the window into an absolute inclusive range
    pub fn range_ending_at(&self, now: Timestamp) -> TimeRange {
        TimeRange::ending_at(now, self.duration)
    }

    /// Bucket granularity, validated to be non-zero
    pub fn bucket_or(&self, default: Duration) -> QueryResult<Duration> {
        let bucket = self.bucket.unwrap_or(default);
        if bucket.is_zero() {
            return Err(QueryError::InvalidParameter {
                name: "bucket",
                message: "bucket size must be positive".to_string(),
            });
        }
        Ok(bucket)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Samples
// ----------------------------------------------------------------------------

/// Signal names are short and heavily repeated; stored inline when possible
pub type SignalName = CompactString;

/// One decoded signal reading taken from a bus frame.
///
/// Immutable once appended to a store. `physical_value` is the engineering
/// value after scale/offset; `raw_value` is the integer from the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub bus_id: CompactString,
    pub signal_type: CompactString,
    pub signal_name: SignalName,
    pub raw_value: i64,
    pub physical_value: f64,
    pub unit: CompactString,
    pub payload_hex: String,
}

impl Sample {
    /// Minimal sample; the remaining descriptive fields start empty
    pub fn new(signal_name: impl Into<SignalName>, physical_value: f64, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            bus_id: CompactString::default(),
            signal_type: CompactString::default(),
            signal_name: signal_name.into(),
            raw_value: 0,
            physical_value,
            unit: CompactString::default(),
            payload_hex: String::new(),
        }
    }

    pub fn with_bus_id(mut self, bus_id: impl Into<CompactString>) -> Self {
        self.bus_id = bus_id.into();
        self
    }

    pub fn with_signal_type(mut self, signal_type: impl Into<CompactString>) -> Self {
        self.signal_type = signal_type.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<CompactString>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_raw_value(mut self, raw_value: i64) -> Self {
        self.raw_value = raw_value;
        self
    }

    pub fn with_payload_hex(mut self, payload_hex: impl Into<String>) -> Self {
        self.payload_hex = payload_hex.into();
        self
    }

    /// Check the invariants a store relies on
    pub fn validate(&self) -> StoreResult<()> {
        if self.signal_name.is_empty() {
            return Err(StoreError::InvalidSample {
                signal: String::new(),
                message: "signal name must not be empty".to_string(),
            });
        }
        if !self.physical_value.is_finite() {
            return Err(StoreError::InvalidSample {
                signal: self.signal_name.to_string(),
                message: format!("physical value {} is not finite", self.physical_value),
            });
        }
        if self.payload_hex.len() % 2 != 0
            || !self.payload_hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(StoreError::InvalidSample {
                signal: self.signal_name.to_string(),
                message: format!("payload '{}' is not an even-length hex string", self.payload_hex),
            });
        }
        Ok(())
    }

    /// Wire representation with an RFC 3339 timestamp
    pub fn to_record(&self) -> SampleRecord {
        self.record_at(RecordTime::Rfc3339(self.timestamp.to_datetime()))
    }

    /// Raw-tail wire representation, timestamped in epoch seconds
    pub fn to_raw_record(&self) -> SampleRecord {
        self.record_at(RecordTime::EpochSecs(self.timestamp.as_secs_f64()))
    }

    fn record_at(&self, timestamp: RecordTime) -> SampleRecord {
        SampleRecord {
            timestamp,
            bus_id: self.bus_id.clone(),
            signal_type: self.signal_type.clone(),
            signal_name: self.signal_name.clone(),
            raw_value: self.raw_value,
            physical_value: self.physical_value,
            unit: self.unit.clone(),
            payload_hex: self.payload_hex.clone(),
        }
    }
}

/// Record time on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordTime {
    Rfc3339(DateTime<Utc>),
    EpochSecs(f64),
}

/// Sample as it appears in JSON payloads.
///
/// Field names follow the dashboard's row format (`can_id`, `data_hex`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: RecordTime,
    #[serde(rename = "can_id")]
    pub bus_id: CompactString,
    pub signal_type: CompactString,
    pub signal_name: SignalName,
    pub raw_value: i64,
    pub physical_value: f64,
    pub unit: CompactString,
    #[serde(rename = "data_hex")]
    pub payload_hex: String,
}

// ----------------------------------------------------------------------------
// 3.4 Clock
// ----------------------------------------------------------------------------

/// Source of "now" for every window computation
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for deterministic tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicTimestamp,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicTimestamp::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, AtomicOrdering::Release);
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        self.now.advance(by)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(AtomicOrdering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Identifiers
// ----------------------------------------------------------------------------

/// Identity of one live-channel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem, each convertible into `EngineError`.
// Store and query failures are recoverable: the broadcaster skips the cycle
// and the next tick tries again.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Storage Errors ----
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // ---- Analytics Errors ----
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    // ---- Output Errors ----
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Store(e) => e.is_recoverable(),
            EngineError::Query(e) => e.is_recoverable(),
            EngineError::Output(e) => e.is_recoverable(),
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
            EngineError::AlreadyRunning(_) => false,
            EngineError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Store(_) => "store",
            EngineError::Query(_) => "query",
            EngineError::Output(_) => "output",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
            EngineError::AlreadyRunning(_) => "lifecycle",
            EngineError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            EngineError::Config(_) => RecoveryHint::FixConfiguration,
            EngineError::Store(e) => e.recovery_hint(),
            EngineError::Query(QueryError::Store(e)) => e.recovery_hint(),
            EngineError::Query(_) => RecoveryHint::Skip,
            EngineError::Output(e) => e.recovery_hint(),
            EngineError::AlreadyRunning(_) | EngineError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry on the next scheduled cycle
    RetryNextCycle,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Drop the subscriber and let it reconnect
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
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

    #[error("Failed to write configuration: {message}")]
    WriteFailed { message: String },
}

// ----------------------------------------------------------------------------
// 4.3 Store Errors
// ----------------------------------------------------------------------------

/// Errors raised while talking to a sample store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Sample store '{store}' unavailable: {message}")]
    Unavailable { store: String, message: String },

    #[error("Store query '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Store query '{operation}' failed: {message}")]
    QueryFailed { operation: &'static str, message: String },

    #[error("Invalid sample for signal '{signal}': {message}")]
    InvalidSample { signal: String, message: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::InvalidSample { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StoreError::Unavailable { .. } => RecoveryHint::RetryWithBackoff,
            StoreError::Timeout { .. } | StoreError::QueryFailed { .. } => {
                RecoveryHint::RetryNextCycle
            }
            StoreError::InvalidSample { .. } => RecoveryHint::Skip,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Query Errors
// ----------------------------------------------------------------------------

/// Errors from analytic operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Invalid window: {message}")]
    InvalidWindow { message: String },

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            QueryError::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Output Errors
// ----------------------------------------------------------------------------

/// Errors on the live channel side
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to send to subscriber {subscriber}: {message}")]
    SendFailed { subscriber: String, message: String },

    #[error("Subscriber {subscriber} disconnected")]
    Disconnected { subscriber: String },

    #[error("Failed to serialize message: {message}")]
    SerializationFailed { message: String },

    #[error("Failed to bind live channel on {address}: {message}")]
    BindFailed { address: String, message: String },
}

impl OutputError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, OutputError::BindFailed { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            OutputError::SendFailed { .. } | OutputError::Disconnected { .. } => {
                RecoveryHint::Reconnect
            }
            OutputError::SerializationFailed { .. } => RecoveryHint::Skip,
            OutputError::BindFailed { .. } => RecoveryHint::FixConfiguration,
        }
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(e: serde_json::Error) -> Self {
        OutputError::SerializationFailed {
            message: e.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type EngineResult<T> = Result<T, EngineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type QueryResult<T> = Result<T, QueryError>;
pub type OutputResult<T> = Result<T, OutputError>;

// ----------------------------------------------------------------------------
// 4.7 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
    pub last_error_time: AtomicTimestamp,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &EngineError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.last_error_time.store(Timestamp::now(), AtomicOrdering::Release);
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> ErrorStatsSummary {
        ErrorStatsSummary {
            total: self.total_errors(),
            recoverable: self.recoverable_count.load(AtomicOrdering::Relaxed),
            non_recoverable: self.non_recoverable_count.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorStatsSummary {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (CANPULSE_SECTION__FIELD)
// - Validation
// - Hot-swappable snapshots
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Sample store access
    #[serde(default)]
    pub store: StoreConfig,

    /// Broadcast loop settings
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Analytic defaults
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Live channel listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Built-in vehicle simulator
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract_layered(path, CONFIG_ENV_PREFIX)
    }

    /// Defaults, then the TOML file when it exists, then environment overrides.
    /// A missing file is not an error.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        Self::extract_layered(path.as_ref(), CONFIG_ENV_PREFIX)
    }

    fn extract_layered(path: &Path, env_prefix: &str) -> ConfigResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let figment = figment.merge(Env::prefixed(env_prefix).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.broadcast.tick_interval_ms < MIN_TICK_INTERVAL_MS {
            return Err(invalid(
                "broadcast.tick_interval_ms",
                format!("Tick interval must be at least {}ms", MIN_TICK_INTERVAL_MS),
            ));
        }
        if self.broadcast.snapshot_freshness_ms == 0 {
            return Err(invalid("broadcast.snapshot_freshness_ms", "must be positive"));
        }
        if self.broadcast.raw_tail_ms == 0 {
            return Err(invalid("broadcast.raw_tail_ms", "must be positive"));
        }
        if self.broadcast.subscriber_queue_capacity == 0 {
            return Err(invalid(
                "broadcast.subscriber_queue_capacity",
                "queue must hold at least one message",
            ));
        }
        if self.store.query_timeout_ms == 0 {
            return Err(invalid("store.query_timeout_ms", "must be positive"));
        }

        let analytics = &self.analytics;
        if !analytics.anomaly_threshold_sigma.is_finite() || analytics.anomaly_threshold_sigma < 0.0 {
            return Err(invalid(
                "analytics.anomaly_threshold_sigma",
                "must be a finite, non-negative number",
            ));
        }
        if analytics.max_anomalies == 0 {
            return Err(invalid("analytics.max_anomalies", "must be positive"));
        }
        if analytics.histogram_bins == 0 {
            return Err(invalid("analytics.histogram_bins", "must be positive"));
        }
        for (field, value) in [
            ("analytics.correlation_bucket_ms", analytics.correlation_bucket_ms),
            ("analytics.rate_interval_ms", analytics.rate_interval_ms),
            ("analytics.series_bucket_ms", analytics.series_bucket_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "bucket size must be positive"));
            }
        }

        if !self.server.path.starts_with('/') {
            return Err(invalid("server.path", "must start with '/'"));
        }
        if self.server.address.trim().is_empty() {
            return Err(invalid("server.address", "must not be empty"));
        }

        if !(self.simulator.sample_rate_hz > 0.0 && self.simulator.sample_rate_hz <= 1000.0) {
            return Err(invalid(
                "simulator.sample_rate_hz",
                "must be within (0, 1000]",
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(invalid("logging.level", format!("unknown level '{}'", other)));
            }
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(invalid("logging.format", format!("unknown format '{}'", other)));
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.tick_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.store.query_timeout_ms)
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Upper bound for a single store query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// In-memory retention in rows (0 = unbounded)
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout(),
            max_samples: default_max_samples(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Broadcast Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Broadcast tick period
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Only samples newer than this make it into the live snapshot
    #[serde(default = "default_snapshot_freshness")]
    pub snapshot_freshness_ms: u64,

    /// Lookback for the raw message tail
    #[serde(default = "default_raw_tail")]
    pub raw_tail_ms: u64,

    /// Maximum raw messages per tick
    #[serde(default = "default_raw_tail_limit")]
    pub raw_tail_limit: usize,

    /// Outbound frames buffered per subscriber
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval(),
            snapshot_freshness_ms: default_snapshot_freshness(),
            raw_tail_ms: default_raw_tail(),
            raw_tail_limit: default_raw_tail_limit(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.5 Analytics Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold_sigma: f64,

    #[serde(default = "default_max_anomalies")]
    pub max_anomalies: usize,

    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,

    #[serde(default = "default_correlation_bucket")]
    pub correlation_bucket_ms: u64,

    #[serde(default = "default_rate_interval")]
    pub rate_interval_ms: u64,

    #[serde(default = "default_series_bucket")]
    pub series_bucket_ms: u64,

    #[serde(default = "default_raw_query_limit")]
    pub raw_query_limit: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold_sigma: default_anomaly_threshold(),
            max_anomalies: default_max_anomalies(),
            histogram_bins: default_histogram_bins(),
            correlation_bucket_ms: default_correlation_bucket(),
            rate_interval_ms: default_rate_interval(),
            series_bucket_ms: default_series_bucket(),
            raw_query_limit: default_raw_query_limit(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Live Channel Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// WebSocket upgrade path
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Close connections without inbound traffic after this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Keep-alive ping period; pongs count as inbound traffic
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_listen_address(),
            path: default_ws_path(),
            idle_timeout_secs: default_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
            max_message_size: default_max_message_size(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.7 Simulator Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Start the simulator with `run` even without `--simulate`
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,

    /// Fixed RNG seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate_hz: default_sample_rate(),
            seed: None,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.8 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include source file and line
    #[serde(default)]
    pub source_location: bool,

    /// ANSI colors for the human-readable formats
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            source_location: false,
            colors: true,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.9 Default Value Functions
// ----------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_instance_name() -> String { ENGINE_NAME.to_string() }
fn default_shutdown_timeout() -> u64 { SHUTDOWN_GRACE_PERIOD_SECS }
fn default_query_timeout() -> u64 { DEFAULT_QUERY_TIMEOUT_MS }
fn default_max_samples() -> usize { DEFAULT_MAX_SAMPLES }
fn default_tick_interval() -> u64 { DEFAULT_TICK_INTERVAL_MS }
fn default_snapshot_freshness() -> u64 { DEFAULT_SNAPSHOT_FRESHNESS_MS }
fn default_raw_tail() -> u64 { DEFAULT_RAW_TAIL_MS }
fn default_raw_tail_limit() -> usize { DEFAULT_RAW_TAIL_LIMIT }
fn default_subscriber_queue_capacity() -> usize { DEFAULT_SUBSCRIBER_QUEUE_CAPACITY }
fn default_anomaly_threshold() -> f64 { DEFAULT_ZSCORE_THRESHOLD }
fn default_max_anomalies() -> usize { DEFAULT_MAX_ANOMALIES }
fn default_histogram_bins() -> usize { DEFAULT_HISTOGRAM_BINS }
fn default_correlation_bucket() -> u64 { DEFAULT_CORRELATION_BUCKET_MS }
fn default_rate_interval() -> u64 { DEFAULT_RATE_INTERVAL_MS }
fn default_series_bucket() -> u64 { DEFAULT_SERIES_BUCKET_MS }
fn default_raw_query_limit() -> usize { DEFAULT_RAW_QUERY_LIMIT }
fn default_listen_address() -> String { DEFAULT_LISTEN_ADDRESS.to_string() }
fn default_ws_path() -> String { DEFAULT_WS_PATH.to_string() }
fn default_idle_timeout() -> u64 { DEFAULT_IDLE_TIMEOUT_SECS }
fn default_ping_interval() -> u64 { DEFAULT_PING_INTERVAL_SECS }
fn default_max_message_size() -> usize { MAX_WEBSOCKET_MESSAGE_SIZE }
fn default_sample_rate() -> f64 { DEFAULT_SAMPLE_RATE_HZ }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

// ----------------------------------------------------------------------------
// 5.10 Configuration Manager
// ----------------------------------------------------------------------------

/// Holds the live configuration; readers get a cheap snapshot
#[derive(Debug)]
pub struct ConfigManager {
    config: ArcSwap<EngineConfig>,
    config_path: Option<PathBuf>,
    last_modified: AtomicTimestamp,
}

impl ConfigManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
            last_modified: AtomicTimestamp::new(Timestamp::now()),
        }
    }

    /// Create from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config = EngineConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    /// Replace the configuration after validating it
    pub fn update(&self, config: EngineConfig) -> ConfigResult<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        self.last_modified.store(Timestamp::now(), AtomicOrdering::Release);
        info!(target: "canpulse::init", "Configuration updated");
        Ok(())
    }

    /// Reload from file, if the manager was created from one
    pub fn reload(&self) -> ConfigResult<()> {
        if let Some(path) = &self.config_path {
            let config = EngineConfig::load(path)?;
            self.update(config)?;
        }
        Ok(())
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified.load(AtomicOrdering::Acquire)
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
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
                    .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "canpulse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past a threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "canpulse::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        } else {
            trace!(target: "canpulse::perf", operation = self.name, elapsed_ms = elapsed, "Operation finished");
        }

        elapsed
    }
}

// ============================================================================
// SECTION 7: SAMPLE STORE
// ============================================================================
// The store is an external collaborator: it is read by every analytic and
// by the broadcaster, and written by whatever ingests bus frames. The engine
// only depends on the read-side `SampleStore` trait; `InMemorySampleStore`
// is the bundled implementation used by the simulator and the tests.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Query Result Types
// ----------------------------------------------------------------------------

/// One `(bucket, signal)` group of a bucketed aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    /// Bucket start (aligned to multiples of the bucket size since the epoch)
    pub bucket: Timestamp,
    pub signal_name: SignalName,
    pub unit: CompactString,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Population summary of a set of values.
///
/// Two-pass: the mean is computed first, then the squared deviations, which
/// keeps the variance stable for large offsets such as RPM readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl SummaryStatistics {
    /// Returns `None` for an empty input
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            count: values.len() as u64,
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
        })
    }

    /// Absolute distance from the mean in standard deviations; `None` when σ = 0
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev > 0.0 {
            Some((value - self.mean).abs() / self.std_dev)
        } else {
            None
        }
    }
}

/// Descriptive statistics of one signal over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub signal_name: SignalName,
    pub unit: CompactString,
    #[serde(flatten)]
    pub summary: SummaryStatistics,
}

/// Catalog entry: one distinct signal known to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub signal_name: SignalName,
    pub signal_type: CompactString,
    pub unit: CompactString,
}

// ----------------------------------------------------------------------------
// 7.2 Store Trait
// ----------------------------------------------------------------------------

/// Read access to time-ordered samples.
///
/// All ranges are inclusive on both ends. Implementations must be safe for
/// concurrent use; every method may fail with a [`StoreError`].
#[async_trait]
pub trait SampleStore: Send + Sync + Debug {
    /// Store name for logs
    fn name(&self) -> &str;

    /// Samples in the range, ascending by time. `signal = None` means all signals.
    async fn samples(&self, signal: Option<&str>, range: TimeRange) -> StoreResult<Vec<Sample>>;

    /// Up to `limit` samples in the range, newest first
    async fn recent(&self, range: TimeRange, limit: usize) -> StoreResult<Vec<Sample>>;

    /// Per-(bucket, signal) aggregates, ordered by bucket then signal name
    async fn bucketed(
        &self,
        signal: Option<&str>,
        range: TimeRange,
        bucket: Duration,
    ) -> StoreResult<Vec<BucketRow>>;

    /// The most recent sample of every signal with at least one sample in range
    async fn latest_per_signal(&self, range: TimeRange) -> StoreResult<Vec<Sample>>;

    /// Population statistics of one signal; `None` when it has no samples in range
    async fn stats(&self, signal: &str, range: TimeRange) -> StoreResult<Option<SignalStats>>;

    /// Every distinct signal ever stored, ordered by name
    async fn signals(&self) -> StoreResult<Vec<SignalInfo>>;
}

// ----------------------------------------------------------------------------
// 7.3 In-Memory Store
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct StoredSample {
    /// Append sequence; breaks timestamp ties in favour of the later append
    seq: u64,
    sample: Sample,
}

/// Running aggregate of one bucketed group
#[derive(Debug)]
struct BucketAccumulator {
    unit: CompactString,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl BucketAccumulator {
    fn new(unit: &CompactString) -> Self {
        Self {
            unit: unit.clone(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    #[inline]
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Append-only sample log kept sorted by `(timestamp, sequence)`
#[derive(Debug)]
pub struct InMemorySampleStore {
    name: String,
    rows: RwLock<VecDeque<StoredSample>>,
    next_seq: AtomicU64,
    /// Oldest rows are dropped beyond this many (0 = unbounded)
    max_samples: usize,
}

impl InMemorySampleStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            max_samples: 0,
        }
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    /// Append one sample, keeping time order for late arrivals
    pub fn append(&self, sample: Sample) -> StoreResult<()> {
        sample.validate()?;
        let mut rows = self.rows.write();
        self.insert_locked(&mut rows, sample);
        self.enforce_retention(&mut rows);
        Ok(())
    }

    /// Append a batch atomically; nothing is stored if any sample is invalid
    pub fn append_batch<I>(&self, samples: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = Sample>,
    {
        let samples: Vec<Sample> = samples.into_iter().collect();
        for sample in &samples {
            sample.validate()?;
        }

        let appended = samples.len();
        let mut rows = self.rows.write();
        for sample in samples {
            self.insert_locked(&mut rows, sample);
        }
        self.enforce_retention(&mut rows);
        Ok(appended)
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn insert_locked(&self, rows: &mut VecDeque<StoredSample>, sample: Sample) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let ts = sample.timestamp;
        let pos = rows.partition_point(|r| r.sample.timestamp <= ts);
        rows.insert(pos, StoredSample { seq, sample });
    }

    fn enforce_retention(&self, rows: &mut VecDeque<StoredSample>) {
        if self.max_samples > 0 && rows.len() > self.max_samples {
            let excess = rows.len() - self.max_samples;
            // Front pops only; the retained rows never move.
            for _ in 0..excess {
                rows.pop_front();
            }
            trace!(target: "canpulse::store", store = %self.name, dropped = excess, "Retention trimmed oldest samples");
        }
    }

    /// The contiguous run of rows inside `range`
    fn window(rows: &VecDeque<StoredSample>, range: TimeRange) -> vec_deque::Iter<'_, StoredSample> {
        if range.is_empty() {
            return rows.range(0..0);
        }
        let lo = rows.partition_point(|r| r.sample.timestamp < range.from);
        let hi = rows.partition_point(|r| r.sample.timestamp <= range.to);
        rows.range(lo..hi.max(lo))
    }
}

#[inline]
fn signal_matches(filter: Option<&str>, sample: &Sample) -> bool {
    filter.map_or(true, |name| sample.signal_name == name)
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn samples(&self, signal: Option<&str>, range: TimeRange) -> StoreResult<Vec<Sample>> {
        let rows = self.rows.read();
        Ok(Self::window(&rows, range)
            .filter(|r| signal_matches(signal, &r.sample))
            .map(|r| r.sample.clone())
            .collect())
    }

    async fn recent(&self, range: TimeRange, limit: usize) -> StoreResult<Vec<Sample>> {
        let rows = self.rows.read();
        Ok(Self::window(&rows, range)
            .rev()
            .take(limit)
            .map(|r| r.sample.clone())
            .collect())
    }

    async fn bucketed(
        &self,
        signal: Option<&str>,
        range: TimeRange,
        bucket: Duration,
    ) -> StoreResult<Vec<BucketRow>> {
        if bucket.is_zero() {
            return Err(StoreError::QueryFailed {
                operation: "bucketed",
                message: "bucket size must be positive".to_string(),
            });
        }

        let rows = self.rows.read();
        let mut groups: BTreeMap<(Timestamp, SignalName), BucketAccumulator> = BTreeMap::new();
        for row in Self::window(&rows, range) {
            let sample = &row.sample;
            if !signal_matches(signal, sample) {
                continue;
            }
            groups
                .entry((sample.timestamp.floor_to(bucket), sample.signal_name.clone()))
                .or_insert_with(|| BucketAccumulator::new(&sample.unit))
                .push(sample.physical_value);
        }

        Ok(groups
            .into_iter()
            .map(|((bucket, signal_name), acc)| BucketRow {
                bucket,
                signal_name,
                unit: acc.unit,
                count: acc.count,
                avg: acc.sum / acc.count as f64,
                min: acc.min,
                max: acc.max,
            })
            .collect())
    }

    async fn latest_per_signal(&self, range: TimeRange) -> StoreResult<Vec<Sample>> {
        let rows = self.rows.read();
        // Rows are ordered by (timestamp, seq): the last one seen per signal wins.
        let mut latest: AHashMap<&str, &Sample> = AHashMap::new();
        for row in Self::window(&rows, range) {
            latest.insert(row.sample.signal_name.as_str(), &row.sample);
        }

        let mut out: Vec<Sample> = latest.values().map(|s| (*s).clone()).collect();
        out.sort_by(|a, b| a.signal_name.cmp(&b.signal_name));
        Ok(out)
    }

    async fn stats(&self, signal: &str, range: TimeRange) -> StoreResult<Option<SignalStats>> {
        let rows = self.rows.read();
        let mut unit = CompactString::default();
        let values: Vec<f64> = Self::window(&rows, range)
            .filter(|r| r.sample.signal_name == signal)
            .map(|r| {
                unit.clone_from(&r.sample.unit);
                r.sample.physical_value
            })
            .collect();

        Ok(SummaryStatistics::from_values(&values).map(|summary| SignalStats {
            signal_name: SignalName::from(signal),
            unit,
            summary,
        }))
    }

    async fn signals(&self) -> StoreResult<Vec<SignalInfo>> {
        let rows = self.rows.read();
        let mut catalog: BTreeMap<&str, &Sample> = BTreeMap::new();
        for row in rows.iter() {
            catalog.insert(row.sample.signal_name.as_str(), &row.sample);
        }
        Ok(catalog
            .into_values()
            .map(|s| SignalInfo {
                signal_name: s.signal_name.clone(),
                signal_type: s.signal_type.clone(),
                unit: s.unit.clone(),
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 7.4 Store Client (timeouts & query accounting)
// ----------------------------------------------------------------------------

/// Per-operation query counters
#[derive(Debug, Default)]
pub struct QueryCounters {
    samples: AtomicU64,
    recent: AtomicU64,
    bucketed: AtomicU64,
    latest: AtomicU64,
    stats: AtomicU64,
    signals: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

impl QueryCounters {
    pub fn snapshot(&self) -> QueryCountersSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        QueryCountersSnapshot {
            samples: load(&self.samples),
            recent: load(&self.recent),
            bucketed: load(&self.bucketed),
            latest: load(&self.latest),
            stats: load(&self.stats),
            signals: load(&self.signals),
            timeouts: load(&self.timeouts),
            failures: load(&self.failures),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryCountersSnapshot {
    pub samples: u64,
    pub recent: u64,
    pub bucketed: u64,
    pub latest: u64,
    pub stats: u64,
    pub signals: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl QueryCountersSnapshot {
    /// Every store round-trip issued, successful or not
    pub fn total(&self) -> u64 {
        self.samples + self.recent + self.bucketed + self.latest + self.stats + self.signals
    }
}

/// Shared handle on the store used by every engine.
///
/// Bounds each query with a timeout so a stalled store surfaces as
/// [`StoreError::Timeout`] instead of hanging a broadcast cycle.
#[derive(Debug, Clone)]
pub struct StoreClient {
    store: Arc<dyn SampleStore>,
    timeout: Duration,
    counters: Arc<QueryCounters>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn SampleStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            counters: Arc::new(QueryCounters::default()),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn counters(&self) -> QueryCountersSnapshot {
        self.counters.snapshot()
    }

    async fn guarded<T, F>(&self, operation: &'static str, counter: &AtomicU64, query: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        match timeout(self.timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "canpulse::store", store = %self.store.name(), operation, error = %e, "Store query failed");
                Err(e)
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
                Err(StoreError::Timeout {
                    operation,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn samples(&self, signal: Option<&str>, range: TimeRange) -> StoreResult<Vec<Sample>> {
        self.guarded("samples", &self.counters.samples, self.store.samples(signal, range))
            .await
    }

    pub async fn recent(&self, range: TimeRange, limit: usize) -> StoreResult<Vec<Sample>> {
        self.guarded("recent", &self.counters.recent, self.store.recent(range, limit))
            .await
    }

    pub async fn bucketed(
        &self,
        signal: Option<&str>,
        range: TimeRange,
        bucket: Duration,
    ) -> StoreResult<Vec<BucketRow>> {
        self.guarded(
            "bucketed",
            &self.counters.bucketed,
            self.store.bucketed(signal, range, bucket),
        )
        .await
    }

    pub async fn latest_per_signal(&self, range: TimeRange) -> StoreResult<Vec<Sample>> {
        self.guarded("latest_per_signal", &self.counters.latest, self.store.latest_per_signal(range))
            .await
    }

    pub async fn stats(&self, signal: &str, range: TimeRange) -> StoreResult<Option<SignalStats>> {
        self.guarded("stats", &self.counters.stats, self.store.stats(signal, range))
            .await
    }

    pub async fn signals(&self) -> StoreResult<Vec<SignalInfo>> {
        self.guarded("signals", &self.counters.signals, self.store.signals())
            .await
    }
}

// ============================================================================
// SECTION 8: AGGREGATION ENGINE
// ============================================================================
// Latest-value snapshots, bucketed time series, descriptive statistics and
// the signal catalog. Every call is a pure function of the store contents at
// call time; nothing is cached between calls.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Series Types
// ----------------------------------------------------------------------------

/// One bucket of a signal's time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: Timestamp,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// Ordered buckets of one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSeries {
    pub unit: CompactString,
    pub points: Vec<SeriesPoint>,
}

/// Bucketed series grouped by signal name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketedSeries {
    pub bucket: Duration,
    pub signals: BTreeMap<SignalName, SignalSeries>,
}

impl BucketedSeries {
    /// Group store rows by signal, buckets ascending
    pub fn from_rows(bucket: Duration, rows: Vec<BucketRow>) -> Self {
        let mut signals: BTreeMap<SignalName, SignalSeries> = BTreeMap::new();
        for row in rows {
            let series = signals
                .entry(row.signal_name)
                .or_insert_with(|| SignalSeries {
                    unit: row.unit.clone(),
                    points: Vec::new(),
                });
            series.points.push(SeriesPoint {
                time: row.bucket,
                avg: row.avg,
                min: row.min,
                max: row.max,
                count: row.count,
            });
        }
        for series in signals.values_mut() {
            series.points.sort_by_key(|p| p.time);
        }
        Self { bucket, signals }
    }

    pub fn get(&self, signal: &str) -> Option<&SignalSeries> {
        self.signals.get(signal)
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Total samples across every bucket of every signal
    pub fn sample_count(&self) -> u64 {
        self.signals
            .values()
            .flat_map(|s| s.points.iter())
            .map(|p| p.count)
            .sum()
    }
}

// ----------------------------------------------------------------------------
// 8.2 Aggregation Engine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_bucket: Duration,
}

impl AggregationEngine {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_bucket: Duration) -> Self {
        Self {
            store,
            clock,
            default_bucket,
        }
    }

    /// Most recent sample of every signal, regardless of age
    pub async fn latest_snapshot(&self) -> QueryResult<Vec<Sample>> {
        let range = TimeRange::until(self.clock.now());
        Ok(self.store.latest_per_signal(range).await?)
    }

    /// Most recent sample of every signal seen inside `window`
    pub async fn latest_snapshot_within(&self, window: &Window) -> QueryResult<Vec<Sample>> {
        let range = window.range_ending_at(self.clock.now());
        Ok(self.store.latest_per_signal(range).await?)
    }

    /// Per-bucket avg/min/max for one signal (or all when `signal` is `None`).
    ///
    /// Buckets without samples are absent. The bucket size comes from the
    /// window, falling back to the configured default.
    pub async fn bucketed_series(
        &self,
        signal: Option<&str>,
        window: &Window,
    ) -> QueryResult<BucketedSeries> {
        let bucket = window.bucket_or(self.default_bucket)?;
        let range = window.range_ending_at(self.clock.now());
        let rows = self.store.bucketed(signal, range, bucket).await?;
        Ok(BucketedSeries::from_rows(bucket, rows))
    }

    /// Population statistics of one signal; `None` when it has no samples in the window
    pub async fn descriptive_stats(
        &self,
        signal: &str,
        window: &Window,
    ) -> QueryResult<Option<SignalStats>> {
        let range = window.range_ending_at(self.clock.now());
        Ok(self.store.stats(signal, range).await?)
    }

    /// Distinct signals with their type and unit, ordered by name
    pub async fn signal_catalog(&self) -> QueryResult<Vec<SignalInfo>> {
        Ok(self.store.signals().await?)
    }
}

// ============================================================================
// SECTION 9: ANOMALY DETECTION
// ============================================================================

/// A sample flagged as an outlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub timestamp: Timestamp,
    pub signal_name: SignalName,
    pub physical_value: f64,
    pub unit: CompactString,
    /// Absolute deviation from the window mean, in standard deviations
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub signal_name: SignalName,
    pub threshold_sigma: f64,
    /// Window statistics the deviations were measured against
    pub statistics: Option<SummaryStatistics>,
    /// Newest first, at most the configured cap
    pub anomalies: Vec<AnomalyRecord>,
    /// More samples qualified than were returned
    pub truncated: bool,
}

impl AnomalyReport {
    /// Flag samples with `|value - mean| > threshold_sigma * σ`.
    ///
    /// `samples` must be ascending by time. A zero σ flags nothing.
    pub fn evaluate(signal: &str, samples: &[Sample], threshold_sigma: f64, limit: usize) -> Self {
        let values: Vec<f64> = samples.iter().map(|s| s.physical_value).collect();
        let statistics = SummaryStatistics::from_values(&values);

        let mut anomalies = Vec::new();
        if let Some(stats) = statistics.filter(|s| s.std_dev > 0.0) {
            let cutoff = threshold_sigma * stats.std_dev;
            anomalies = samples
                .iter()
                .rev()
                .filter(|s| (s.physical_value - stats.mean).abs() > cutoff)
                .map(|s| AnomalyRecord {
                    timestamp: s.timestamp,
                    signal_name: s.signal_name.clone(),
                    physical_value: s.physical_value,
                    unit: s.unit.clone(),
                    z_score: stats.z_score(s.physical_value).unwrap_or(0.0),
                })
                .collect();
        }

        let truncated = anomalies.len() > limit;
        anomalies.truncate(limit);

        Self {
            signal_name: SignalName::from(signal),
            threshold_sigma,
            statistics,
            anomalies,
            truncated,
        }
    }
}

/// Z-score outlier detection over a window
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_threshold: f64,
    max_results: usize,
}

impl AnomalyDetector {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_threshold: f64, max_results: usize) -> Self {
        Self {
            store,
            clock,
            default_threshold,
            max_results,
        }
    }

    pub async fn detect_anomalies(
        &self,
        signal: &str,
        window: &Window,
        threshold_sigma: f64,
    ) -> QueryResult<AnomalyReport> {
        if !threshold_sigma.is_finite() || threshold_sigma < 0.0 {
            return Err(QueryError::InvalidParameter {
                name: "threshold_sigma",
                message: format!("{} is not a finite, non-negative number", threshold_sigma),
            });
        }

        let range = window.range_ending_at(self.clock.now());
        let samples = self.store.samples(Some(signal), range).await?;
        let report = AnomalyReport::evaluate(signal, &samples, threshold_sigma, self.max_results);

        if !report.anomalies.is_empty() {
            debug!(
                target: "canpulse::analytics",
                signal,
                flagged = report.anomalies.len(),
                truncated = report.truncated,
                "Anomalies detected"
            );
        }
        Ok(report)
    }

    /// Detection at the configured default threshold
    pub async fn detect_default(&self, signal: &str, window: &Window) -> QueryResult<AnomalyReport> {
        self.detect_anomalies(signal, window, self.default_threshold).await
    }
}

// ============================================================================
// SECTION 10: CORRELATION ENGINE
// ============================================================================
// Pearson correlation of every unordered signal pair over bucket-averaged
// series. All series come from a single grouped store query; pairs are
// joined on bucket start in memory.
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub signal_a: SignalName,
    pub signal_b: SignalName,
    /// Pearson coefficient in [-1, 1]
    pub correlation: f64,
    /// Buckets present in both series
    pub joined_points: usize,
}

/// Pearson correlation; `None` below two points or with zero variance on either side
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Correlate every pair `(a, b)` with `a < b` by name.
///
/// Each series maps bucket start to bucket average. Pairs with fewer than two
/// shared buckets, or with a constant side, are omitted.
pub fn pairwise_correlations(series: &BTreeMap<SignalName, BTreeMap<Timestamp, f64>>) -> Vec<CorrelationRecord> {
    let entries: Vec<(&SignalName, &BTreeMap<Timestamp, f64>)> = series.iter().collect();
    let mut out = Vec::new();

    for (i, (name_a, points_a)) in entries.iter().enumerate() {
        for (name_b, points_b) in &entries[i + 1..] {
            let mut xs = Vec::with_capacity(points_a.len().min(points_b.len()));
            let mut ys = Vec::with_capacity(xs.capacity());
            for (bucket, a) in points_a.iter() {
                if let Some(b) = points_b.get(bucket) {
                    xs.push(*a);
                    ys.push(*b);
                }
            }

            if let Some(correlation) = pearson(&xs, &ys) {
                out.push(CorrelationRecord {
                    signal_a: (*name_a).clone(),
                    signal_b: (*name_b).clone(),
                    correlation,
                    joined_points: xs.len(),
                });
            }
        }
    }

    out
}

#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_bucket: Duration,
}

impl CorrelationEngine {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_bucket: Duration) -> Self {
        Self {
            store,
            clock,
            default_bucket,
        }
    }

    /// Pairwise correlations of all signals active in the window
    pub async fn correlation_matrix(&self, window: &Window) -> QueryResult<Vec<CorrelationRecord>> {
        let bucket = window.bucket_or(self.default_bucket)?;
        let range = window.range_ending_at(self.clock.now());
        let rows = self.store.bucketed(None, range, bucket).await?;

        let mut series: BTreeMap<SignalName, BTreeMap<Timestamp, f64>> = BTreeMap::new();
        for row in rows {
            series.entry(row.signal_name).or_default().insert(row.bucket, row.avg);
        }

        let records = pairwise_correlations(&series);
        debug!(
            target: "canpulse::analytics",
            signals = series.len(),
            pairs = records.len(),
            "Correlation matrix computed"
        );
        Ok(records)
    }
}

// ============================================================================
// SECTION 11: DISTRIBUTION ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    /// Zero-based bin index
    pub bin: usize,
    pub frequency: u64,
    pub bin_start: f64,
    pub bin_end: f64,
}

/// Equal-width histogram over `[min, max]` of the observed values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub signal_name: SignalName,
    pub bin_count: usize,
    pub min: f64,
    pub max: f64,
    pub total: u64,
    /// Non-empty bins only, ascending by index
    pub bins: Vec<HistogramBin>,
}

impl Histogram {
    /// Bin `values` into `bin_count` equal-width bins.
    ///
    /// The maximum lands in the last bin. When every value is equal, a
    /// single bin spanning `[v, v]` holds the whole count.
    pub fn from_values(signal: &str, values: &[f64], bin_count: usize) -> Option<Self> {
        if values.is_empty() || bin_count == 0 {
            return None;
        }

        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let total = values.len() as u64;

        let bins = if min == max {
            vec![HistogramBin {
                bin: 0,
                frequency: total,
                bin_start: min,
                bin_end: max,
            }]
        } else {
            let span = max - min;
            let width = span / bin_count as f64;
            // Occupied bins only; `bin_count` may far exceed the number of values.
            let mut counts: BTreeMap<usize, u64> = BTreeMap::new();
            for &v in values {
                let idx = (((v - min) / span) * bin_count as f64).floor() as usize;
                *counts.entry(idx.min(bin_count - 1)).or_insert(0) += 1;
            }

            counts
                .into_iter()
                .map(|(bin, frequency)| HistogramBin {
                    bin,
                    frequency,
                    bin_start: min + width * bin as f64,
                    bin_end: if bin == bin_count - 1 {
                        max
                    } else {
                        min + width * (bin + 1) as f64
                    },
                })
                .collect()
        };

        Some(Self {
            signal_name: SignalName::from(signal),
            bin_count,
            min,
            max,
            total,
            bins,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DistributionEngine {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_bins: usize,
}

impl DistributionEngine {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_bins: usize) -> Self {
        Self {
            store,
            clock,
            default_bins,
        }
    }

    /// Histogram of one signal; `None` when the window holds no samples
    pub async fn histogram(
        &self,
        signal: &str,
        window: &Window,
        bin_count: usize,
    ) -> QueryResult<Option<Histogram>> {
        if bin_count == 0 {
            return Err(QueryError::InvalidParameter {
                name: "bin_count",
                message: "at least one bin is required".to_string(),
            });
        }

        let range = window.range_ending_at(self.clock.now());
        let values: Vec<f64> = self
            .store
            .samples(Some(signal), range)
            .await?
            .iter()
            .map(|s| s.physical_value)
            .collect();

        Ok(Histogram::from_values(signal, &values, bin_count))
    }

    pub async fn histogram_default(&self, signal: &str, window: &Window) -> QueryResult<Option<Histogram>> {
        self.histogram(signal, window, self.default_bins).await
    }
}

// ============================================================================
// SECTION 12: MESSAGE RATE COUNTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    pub bucket: Timestamp,
    pub signal_name: SignalName,
    pub count: u64,
}

/// Per-signal sample counts per sub-interval
#[derive(Debug, Clone)]
pub struct MessageRateCounter {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_interval: Duration,
}

impl MessageRateCounter {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_interval: Duration) -> Self {
        Self {
            store,
            clock,
            default_interval,
        }
    }

    /// Counts per `(sub-interval, signal)`, ascending by bucket then name.
    /// Sub-intervals without samples are absent.
    pub async fn message_rate(&self, window: &Window) -> QueryResult<Vec<RateRecord>> {
        let interval = window.bucket_or(self.default_interval)?;
        let range = window.range_ending_at(self.clock.now());
        let mut records: Vec<RateRecord> = self
            .store
            .bucketed(None, range, interval)
            .await?
            .into_iter()
            .map(|row| RateRecord {
                bucket: row.bucket,
                signal_name: row.signal_name,
                count: row.count,
            })
            .collect();

        records.sort_by(|a, b| {
            a.bucket
                .cmp(&b.bucket)
                .then_with(|| a.signal_name.cmp(&b.signal_name))
        });
        Ok(records)
    }
}

// ============================================================================
// SECTION 13: RAW MESSAGE EXPLORER
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Filters
// ----------------------------------------------------------------------------

/// Selection over raw samples.
///
/// Empty lists match everything; non-empty lists are OR'ed within a field
/// and AND'ed across fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessageFilter {
    pub window: Window,
    /// Explicit absolute range; overrides `window` when set
    pub between: Option<TimeRange>,
    pub bus_ids: Vec<String>,
    pub signal_types: Vec<String>,
    pub signal_names: Vec<String>,
    /// Case-insensitive substring over bus id, type, name and payload
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl RawMessageFilter {
    pub fn last(window: Window) -> Self {
        Self {
            window,
            between: None,
            bus_ids: Vec::new(),
            signal_types: Vec::new(),
            signal_names: Vec::new(),
            search: None,
            limit: None,
        }
    }

    pub fn between(mut self, range: TimeRange) -> Self {
        self.between = Some(range);
        self
    }

    pub fn with_bus_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_signal_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signal_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_signal_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signal_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, sample: &Sample, needle: Option<&str>) -> bool {
        fn listed(list: &[String], value: &str) -> bool {
            list.is_empty() || list.iter().any(|v| v == value)
        }

        listed(&self.bus_ids, &sample.bus_id)
            && listed(&self.signal_types, &sample.signal_type)
            && listed(&self.signal_names, &sample.signal_name)
            && needle.map_or(true, |needle| {
                [
                    sample.bus_id.as_str(),
                    sample.signal_type.as_str(),
                    sample.signal_name.as_str(),
                    sample.payload_hex.as_str(),
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(needle))
            })
    }
}

/// Volume summary of a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub total_messages: u64,
    pub unique_bus_ids: usize,
    pub unique_signal_types: usize,
    pub unique_signals: usize,
    pub oldest: Option<Timestamp>,
    pub newest: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// 13.2 Explorer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RawMessageExplorer {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_limit: usize,
}

impl RawMessageExplorer {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_limit: usize) -> Self {
        Self {
            store,
            clock,
            default_limit,
        }
    }

    fn resolve(&self, filter: &RawMessageFilter) -> TimeRange {
        filter
            .between
            .unwrap_or_else(|| filter.window.range_ending_at(self.clock.now()))
    }

    /// Newest-first samples matching `filter`
    pub async fn raw_messages(&self, filter: &RawMessageFilter) -> QueryResult<Vec<Sample>> {
        let range = self.resolve(filter);
        if range.is_empty() {
            return Err(QueryError::InvalidWindow {
                message: format!("range starts after it ends ({} > {})", range.from, range.to),
            });
        }

        let limit = filter.limit.unwrap_or(self.default_limit);
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut samples = self.store.samples(None, range).await?;
        samples.reverse();
        samples.retain(|s| filter.matches(s, needle.as_deref()));
        samples.truncate(limit);
        Ok(samples)
    }

    /// The newest `limit` samples of the window, across all signals
    pub async fn recent_tail(&self, window: &Window, limit: usize) -> QueryResult<Vec<Sample>> {
        let range = window.range_ending_at(self.clock.now());
        Ok(self.store.recent(range, limit).await?)
    }

    /// Sorted distinct bus ids seen in the window
    pub async fn unique_bus_ids(&self, window: &Window) -> QueryResult<Vec<CompactString>> {
        let range = window.range_ending_at(self.clock.now());
        let ids: BTreeSet<CompactString> = self
            .store
            .samples(None, range)
            .await?
            .into_iter()
            .map(|s| s.bus_id)
            .filter(|id| !id.is_empty())
            .collect();
        Ok(ids.into_iter().collect())
    }

    pub async fn message_stats(&self, window: &Window) -> QueryResult<MessageStats> {
        let range = window.range_ending_at(self.clock.now());
        let samples = self.store.samples(None, range).await?;

        let mut bus_ids = AHashSet::new();
        let mut types = AHashSet::new();
        let mut names = AHashSet::new();
        for s in &samples {
            bus_ids.insert(s.bus_id.as_str());
            types.insert(s.signal_type.as_str());
            names.insert(s.signal_name.as_str());
        }

        Ok(MessageStats {
            total_messages: samples.len() as u64,
            unique_bus_ids: bus_ids.len(),
            unique_signal_types: types.len(),
            unique_signals: names.len(),
            oldest: samples.first().map(|s| s.timestamp),
            newest: samples.last().map(|s| s.timestamp),
        })
    }
}

// ============================================================================
// SECTION 14: ANALYTICS FACADE
// ============================================================================

/// One instance of every engine, sharing a store client and clock
#[derive(Debug, Clone)]
pub struct Analytics {
    pub aggregation: AggregationEngine,
    pub anomalies: AnomalyDetector,
    pub correlation: CorrelationEngine,
    pub distribution: DistributionEngine,
    pub rate: MessageRateCounter,
    pub explorer: RawMessageExplorer,
    store: StoreClient,
}

impl Analytics {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, config: &AnalyticsConfig) -> Self {
        Self {
            aggregation: AggregationEngine::new(
                store.clone(),
                clock.clone(),
                Duration::from_millis(config.series_bucket_ms),
            ),
            anomalies: AnomalyDetector::new(
                store.clone(),
                clock.clone(),
                config.anomaly_threshold_sigma,
                config.max_anomalies,
            ),
            correlation: CorrelationEngine::new(
                store.clone(),
                clock.clone(),
                Duration::from_millis(config.correlation_bucket_ms),
            ),
            distribution: DistributionEngine::new(store.clone(), clock.clone(), config.histogram_bins),
            rate: MessageRateCounter::new(
                store.clone(),
                clock.clone(),
                Duration::from_millis(config.rate_interval_ms),
            ),
            explorer: RawMessageExplorer::new(store.clone(), clock, config.raw_query_limit),
            store,
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }
}

// ============================================================================
// SECTION 15: BROADCAST SERVICE
// ============================================================================
// A single periodic task fetches the live snapshot and the raw tail once per
// tick and fans the encoded frames out to every subscriber's bounded queue.
// Delivery never waits on a subscriber: a full queue drops that frame for
// that subscriber only, a closed queue evicts it.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Wire Protocol
// ----------------------------------------------------------------------------

/// Server → client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Latest value of every fresh signal the subscriber allows, newest first
    Update {
        timestamp: DateTime<Utc>,
        data: Vec<SampleRecord>,
    },
    /// One recent raw sample
    RawMessage {
        timestamp: DateTime<Utc>,
        data: SampleRecord,
    },
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace the allow-list; an empty list means every signal
    Subscribe {
        #[serde(default)]
        data: Vec<String>,
    },
}

/// An encoded JSON text frame shared across subscriber queues
pub type Frame = Arc<str>;

fn encode(message: &ServerMessage) -> OutputResult<Frame> {
    Ok(Arc::from(serde_json::to_string(message)?))
}

// ----------------------------------------------------------------------------
// 15.2 Subscriber Registry
// ----------------------------------------------------------------------------

/// Result of offering frames to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered { sent: u64, dropped: u64 },
    Closed,
}

#[derive(Debug)]
struct SubscriberEntry {
    sender: mpsc::Sender<Frame>,
    /// Allowed signal names; empty allows everything
    filter: ArcSwap<AHashSet<SignalName>>,
    connected_at: Timestamp,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberEntry {
    /// Offer frames without waiting; stops at the first closed send
    fn offer<I>(&self, frames: I) -> Delivery
    where
        I: IntoIterator<Item = Frame>,
    {
        let mut sent = 0;
        let mut dropped = 0;
        for frame in frames {
            match self.sender.try_send(frame) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => return Delivery::Closed,
            }
        }
        self.delivered.fetch_add(sent, AtomicOrdering::Relaxed);
        self.dropped.fetch_add(dropped, AtomicOrdering::Relaxed);
        Delivery::Delivered { sent, dropped }
    }
}

#[inline]
fn allows(filter: &AHashSet<SignalName>, signal: &str) -> bool {
    filter.is_empty() || filter.contains(signal)
}

/// Per-subscriber view for health/introspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub connected_at: Timestamp,
    pub allowed_signals: Vec<SignalName>,
    pub delivered: u64,
    pub dropped: u64,
}

/// Live subscribers keyed by id
#[derive(Debug)]
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<SubscriberEntry>>,
    queue_capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a subscriber with an empty allow-list; frames arrive on the returned receiver
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Frame>) {
        let id = SubscriberId::new();
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(
            id,
            Arc::new(SubscriberEntry {
                sender,
                filter: ArcSwap::from_pointee(AHashSet::new()),
                connected_at: Timestamp::now(),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        );
        debug!(target: "canpulse::broadcast", subscriber = %id, total = self.len(), "Subscriber registered");
        (id, receiver)
    }

    /// Replace a subscriber's allow-list. Returns false for unknown ids.
    pub fn update_filter<I, S>(&self, id: SubscriberId, signals: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(entry) = self.subscribers.get(&id) else {
            return false;
        };
        let filter: AHashSet<SignalName> = signals
            .into_iter()
            .map(|s| SignalName::from(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        entry.filter.store(Arc::new(filter));
        true
    }

    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!(target: "canpulse::broadcast", subscriber = %id, total = self.len(), "Subscriber removed");
        }
        removed
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Current allow-list of a subscriber, sorted
    pub fn allowed_signals(&self, id: SubscriberId) -> Option<Vec<SignalName>> {
        self.subscribers.get(&id).map(|entry| {
            let mut names: Vec<SignalName> = entry.filter.load().iter().cloned().collect();
            names.sort();
            names
        })
    }

    pub fn subscriber_infos(&self) -> Vec<SubscriberInfo> {
        let mut infos: Vec<SubscriberInfo> = self
            .subscribers
            .iter()
            .map(|item| {
                let entry = item.value();
                let mut allowed: Vec<SignalName> = entry.filter.load().iter().cloned().collect();
                allowed.sort();
                SubscriberInfo {
                    id: *item.key(),
                    connected_at: entry.connected_at,
                    allowed_signals: allowed,
                    delivered: entry.delivered.load(AtomicOrdering::Relaxed),
                    dropped: entry.dropped.load(AtomicOrdering::Relaxed),
                }
            })
            .collect();
        infos.sort_by_key(|i| i.connected_at);
        infos
    }

    /// Point-in-time copy so fan-out never holds a shard lock while sending
    fn snapshot(&self) -> Vec<(SubscriberId, Arc<SubscriberEntry>)> {
        self.subscribers
            .iter()
            .map(|item| (*item.key(), Arc::clone(item.value())))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 15.3 Cycle Accounting
// ----------------------------------------------------------------------------

/// What one fan-out delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub subscribers: usize,
    pub snapshot_rows: usize,
    pub raw_rows: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nobody is listening; no store query was issued
    Skipped,
    Delivered(FanoutReport),
    /// The cycle was abandoned before any frame was sent
    Failed { reason: String },
}

#[derive(Debug, Default)]
pub struct BroadcastStats {
    cycles: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    evicted: AtomicU64,
    last_cycle: AtomicTimestamp,
}

impl BroadcastStats {
    fn record(&self, report: &FanoutReport) {
        self.frames_sent.fetch_add(report.frames_sent, AtomicOrdering::Relaxed);
        self.frames_dropped.fetch_add(report.frames_dropped, AtomicOrdering::Relaxed);
        self.evicted.fetch_add(report.evicted as u64, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> BroadcastStatsSnapshot {
        BroadcastStatsSnapshot {
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            skipped: self.skipped.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
            frames_sent: self.frames_sent.load(AtomicOrdering::Relaxed),
            frames_dropped: self.frames_dropped.load(AtomicOrdering::Relaxed),
            evicted: self.evicted.load(AtomicOrdering::Relaxed),
            last_cycle: self.last_cycle.load(AtomicOrdering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastStatsSnapshot {
    pub cycles: u64,
    pub skipped: u64,
    pub failed: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub evicted: u64,
    pub last_cycle: Timestamp,
}

// ----------------------------------------------------------------------------
// 15.4 Broadcast Service
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BroadcastState {
    Stopped,
    Running,
}

#[derive(Debug, Default)]
struct Lifecycle {
    token: Option<CancellationToken>,
    handle: Option<TokioJoinHandle<()>>,
}

/// Periodic snapshot + raw-tail fan-out
#[derive(Debug)]
pub struct BroadcastService {
    aggregation: AggregationEngine,
    explorer: RawMessageExplorer,
    registry: Arc<SubscriberRegistry>,
    config: BroadcastConfig,
    clock: Arc<dyn Clock>,
    stats: BroadcastStats,
    error_stats: Arc<ErrorStats>,
    lifecycle: Mutex<Lifecycle>,
}

impl BroadcastService {
    pub fn new(
        analytics: &Analytics,
        registry: Arc<SubscriberRegistry>,
        config: BroadcastConfig,
        clock: Arc<dyn Clock>,
        error_stats: Arc<ErrorStats>,
    ) -> Self {
        Self {
            aggregation: analytics.aggregation.clone(),
            explorer: analytics.explorer.clone(),
            registry,
            config,
            clock,
            stats: BroadcastStats::default(),
            error_stats,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BroadcastStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> BroadcastState {
        match &self.lifecycle.lock().token {
            Some(token) if !token.is_cancelled() => BroadcastState::Running,
            _ => BroadcastState::Stopped,
        }
    }

    /// Spawn the periodic loop. Stops when `shutdown` or [`Self::shutdown`] fires.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(&lifecycle.token, Some(token) if !token.is_cancelled()) {
            return Err(EngineError::AlreadyRunning("broadcast service"));
        }

        let token = shutdown.child_token();
        let service = Arc::clone(self);
        let loop_token = token.clone();
        lifecycle.handle = Some(tokio::spawn(async move {
            service.run_loop(loop_token).await;
        }));
        lifecycle.token = Some(token);

        info!(
            target: "canpulse::broadcast",
            tick_ms = self.config.tick_interval_ms,
            freshness_ms = self.config.snapshot_freshness_ms,
            raw_tail_ms = self.config.raw_tail_ms,
            raw_tail_limit = self.config.raw_tail_limit,
            "Broadcast service started"
        );
        Ok(())
    }

    /// Stop the loop and wait for the in-flight cycle to finish. Idempotent.
    pub async fn shutdown(&self) {
        let (token, handle) = {
            let mut lifecycle = self.lifecycle.lock();
            (lifecycle.token.take(), lifecycle.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(target: "canpulse::broadcast", error = %e, "Broadcast task ended abnormally");
            }
            info!(target: "canpulse::broadcast", "Broadcast service stopped");
        }
    }

    async fn run_loop(&self, token: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = self.run_cycle() => {}
                    }
                }
            }
        }
    }

    /// Run one tick: fetch once, deliver to everyone.
    ///
    /// With no subscribers this returns immediately without touching the
    /// store. A store failure abandons the cycle before any frame is sent.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.stats.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.last_cycle.store(self.clock.now(), AtomicOrdering::Release);

        if self.registry.is_empty() {
            self.stats.skipped.fetch_add(1, AtomicOrdering::Relaxed);
            trace!(target: "canpulse::broadcast", "No subscribers, skipping cycle");
            return CycleOutcome::Skipped;
        }

        let timer = PerfTimer::with_threshold("broadcast_cycle", self.config.tick_interval_ms);
        let freshness = Window::last_millis(self.config.snapshot_freshness_ms);
        let tail_window = Window::last_millis(self.config.raw_tail_ms);

        let fetched = tokio::try_join!(
            self.aggregation.latest_snapshot_within(&freshness),
            self.explorer.recent_tail(&tail_window, self.config.raw_tail_limit)
        );
        let (mut snapshot, tail) = match fetched {
            Ok(rows) => rows,
            Err(e) => return self.abandon(EngineError::from(e)),
        };

        snapshot.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.signal_name.cmp(&b.signal_name))
        });

        let outcome = match self.fan_out(&snapshot, &tail) {
            Ok(report) => {
                self.stats.record(&report);
                trace!(
                    target: "canpulse::broadcast",
                    subscribers = report.subscribers,
                    snapshot_rows = report.snapshot_rows,
                    raw_rows = report.raw_rows,
                    sent = report.frames_sent,
                    dropped = report.frames_dropped,
                    evicted = report.evicted,
                    "Broadcast cycle delivered"
                );
                CycleOutcome::Delivered(report)
            }
            Err(e) => self.abandon(EngineError::from(e)),
        };
        timer.stop();
        outcome
    }

    fn abandon(&self, error: EngineError) -> CycleOutcome {
        self.error_stats.record(&error);
        self.stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(
            target: "canpulse::broadcast",
            error = %error,
            category = error.category(),
            recoverable = error.is_recoverable(),
            "Broadcast cycle abandoned"
        );
        CycleOutcome::Failed {
            reason: error.to_string(),
        }
    }

    /// Encode once, deliver to every subscriber: update first, then raw messages.
    fn fan_out(&self, snapshot: &[Sample], tail: &[Sample]) -> OutputResult<FanoutReport> {
        let now = self.clock.now().to_datetime();

        let full_update = encode(&ServerMessage::Update {
            timestamp: now,
            data: snapshot.iter().map(Sample::to_record).collect(),
        })?;
        let raw_frames = tail
            .iter()
            .map(|s| {
                encode(&ServerMessage::RawMessage {
                    timestamp: s.timestamp.to_datetime(),
                    data: s.to_raw_record(),
                })
                .map(|frame| (s.signal_name.as_str(), frame))
            })
            .collect::<OutputResult<Vec<(&str, Frame)>>>()?;

        let mut report = FanoutReport {
            snapshot_rows: snapshot.len(),
            raw_rows: tail.len(),
            ..FanoutReport::default()
        };

        for (id, entry) in self.registry.snapshot() {
            report.subscribers += 1;
            let filter = entry.filter.load_full();

            let update = if filter.is_empty() {
                Arc::clone(&full_update)
            } else {
                encode(&ServerMessage::Update {
                    timestamp: now,
                    data: snapshot
                        .iter()
                        .filter(|s| allows(&filter, &s.signal_name))
                        .map(Sample::to_record)
                        .collect(),
                })?
            };

            let frames = std::iter::once(update).chain(
                raw_frames
                    .iter()
                    .filter(|(name, _)| allows(&filter, name))
                    .map(|(_, frame)| Arc::clone(frame)),
            );

            match entry.offer(frames) {
                Delivery::Delivered { sent, dropped } => {
                    report.frames_sent += sent;
                    report.frames_dropped += dropped;
                    if dropped > 0 {
                        debug!(target: "canpulse::broadcast", subscriber = %id, dropped, "Subscriber queue full");
                    }
                }
                Delivery::Closed => {
                    self.registry.remove(id);
                    report.evicted += 1;
                    debug!(target: "canpulse::broadcast", subscriber = %id, "Evicted closed subscriber");
                }
            }
        }

        Ok(report)
    }
}

// ============================================================================
// SECTION 16: LIVE CHANNEL SERVER
// ============================================================================
// axum router exposing the WebSocket subscription endpoint and a health
// probe. Each connection owns one registry entry for its whole lifetime.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Shared State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LiveState {
    registry: Arc<SubscriberRegistry>,
    idle_timeout: Duration,
    ping_interval: Duration,
    max_message_size: usize,
    shutdown: CancellationToken,
}

impl LiveState {
    pub fn new(registry: Arc<SubscriberRegistry>, config: &ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            max_message_size: config.max_message_size,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }
}

// ----------------------------------------------------------------------------
// 16.2 Router & Handlers
// ----------------------------------------------------------------------------

/// Build the live channel router (`<path>` for WebSocket, `/health`)
pub fn build_router(state: LiveState, path: &str) -> Router {
    Router::new()
        .route(path, get(websocket_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<LiveState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "subscribers": state.registry.len(),
    }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<LiveState>) -> Response {
    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one subscriber connection until close, error, idle timeout or shutdown
async fn handle_socket(socket: WebSocket, state: LiveState) {
    let (id, mut outbound) = state.registry.register();
    info!(target: "canpulse::live", subscriber = %id, subscribers = state.registry.len(), "Subscriber connected");

    let (mut sink, mut stream) = socket.split();
    let ping_every = state.ping_interval;

    let writer = tokio::spawn(async move {
        let mut ping = interval(ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = timeout(state.idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                debug!(target: "canpulse::live", subscriber = %id, "Idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(target: "canpulse::live", subscriber = %id, error = %e, "Read error");
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => handle_client_text(&state, id, &text),
            Ok(Some(Ok(_))) => {}
        }
    }

    state.registry.remove(id);
    writer.abort();
    info!(target: "canpulse::live", subscriber = %id, subscribers = state.registry.len(), "Subscriber disconnected");
}

fn handle_client_text(state: &LiveState, id: SubscriberId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { data }) => {
            state.registry.update_filter(id, &data);
            info!(target: "canpulse::live", subscriber = %id, signals = ?data, "Subscription updated");
        }
        Err(e) => {
            debug!(target: "canpulse::live", subscriber = %id, error = %e, "Ignoring malformed client message");
        }
    }
}

// ----------------------------------------------------------------------------
// 16.3 Serving
// ----------------------------------------------------------------------------

/// Bind the live channel listener
pub async fn bind_listener(address: &str) -> EngineResult<TokioTcpListener> {
    TokioTcpListener::bind(address).await.map_err(|e| {
        EngineError::Output(OutputError::BindFailed {
            address: address.to_string(),
            message: e.to_string(),
        })
    })
}

/// Serve until `shutdown` fires
pub async fn serve_live_channel(
    listener: TokioTcpListener,
    state: LiveState,
    path: &str,
    shutdown: CancellationToken,
) -> EngineResult<()> {
    let local = listener.local_addr()?;
    info!(target: "canpulse::live", address = %local, path, "Live channel listening");

    let router = build_router(state, path);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(target: "canpulse::live", "Live channel stopped");
    Ok(())
}

// ============================================================================
// SECTION 17: VEHICLE SIMULATOR
// ============================================================================
// Generates plausible powertrain telemetry so the engine can be exercised
// without a bus: engine on/off, throttle random walk, RPM inertia, speed,
// coolant warm-up, fuel burn and battery charge, each with gaussian noise.
// ============================================================================

/// Width of the encoded raw value inside the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadWidth {
    U8,
    U16,
}

/// Encoding of one simulated signal
#[derive(Debug, Clone, Copy)]
struct SignalSpec {
    bus_id: u16,
    signal_type: &'static str,
    name: &'static str,
    unit: &'static str,
    scale: f64,
    offset: f64,
    width: PayloadWidth,
}

const SIMULATED_SIGNALS: [SignalSpec; 6] = [
    SignalSpec { bus_id: 0x100, signal_type: "ENGINE", name: "RPM", unit: "rpm", scale: 0.25, offset: 0.0, width: PayloadWidth::U16 },
    SignalSpec { bus_id: 0x101, signal_type: "VEHICLE", name: "Speed", unit: "km/h", scale: 0.01, offset: 0.0, width: PayloadWidth::U16 },
    SignalSpec { bus_id: 0x102, signal_type: "ENGINE", name: "CoolantTemp", unit: "°C", scale: 1.0, offset: -40.0, width: PayloadWidth::U8 },
    SignalSpec { bus_id: 0x103, signal_type: "ENGINE", name: "ThrottlePosition", unit: "%", scale: 0.39, offset: 0.0, width: PayloadWidth::U8 },
    SignalSpec { bus_id: 0x104, signal_type: "FUEL", name: "FuelLevel", unit: "%", scale: 0.39, offset: 0.0, width: PayloadWidth::U8 },
    SignalSpec { bus_id: 0x105, signal_type: "ELECTRICAL", name: "BatteryVoltage", unit: "V", scale: 0.01, offset: 0.0, width: PayloadWidth::U16 },
];

const IDLE_RPM: f64 = 800.0;
const MAX_RPM: f64 = 6000.0;
const ENGINE_TOGGLE_PROBABILITY: f64 = 0.001;

impl SignalSpec {
    /// Scale a physical value into a frame, padded to 8 bytes
    fn encode(&self, value: f64, timestamp: Timestamp) -> Sample {
        let raw = ((value - self.offset) / self.scale).round();
        let (raw, bytes) = match self.width {
            PayloadWidth::U8 => {
                let raw = raw.clamp(0.0, u8::MAX as f64) as u8;
                (raw as i64, vec![raw])
            }
            PayloadWidth::U16 => {
                let raw = raw.clamp(0.0, u16::MAX as f64) as u16;
                (raw as i64, raw.to_be_bytes().to_vec())
            }
        };

        let mut frame = [0u8; CAN_FRAME_LEN];
        frame[..bytes.len()].copy_from_slice(&bytes);
        let payload_hex: String = frame.iter().map(|b| format!("{:02x}", b)).collect();

        Sample::new(self.name, value, timestamp)
            .with_bus_id(format!("0x{:03X}", self.bus_id))
            .with_signal_type(self.signal_type)
            .with_unit(self.unit)
            .with_raw_value(raw)
            .with_payload_hex(payload_hex)
    }
}

/// Physical state of the simulated vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleState {
    pub engine_running: bool,
    pub rpm: f64,
    pub speed: f64,
    pub throttle: f64,
    pub coolant_temp: f64,
    pub fuel_level: f64,
    pub battery_voltage: f64,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            engine_running: true,
            rpm: IDLE_RPM,
            speed: 0.0,
            throttle: 0.0,
            coolant_temp: 20.0,
            fuel_level: 75.0,
            battery_voltage: 12.6,
        }
    }
}

impl VehicleState {
    /// Advance the physics by `dt` seconds
    fn step<R: Rng>(&mut self, rng: &mut R, dt: f64) {
        if rng.gen_bool(ENGINE_TOGGLE_PROBABILITY) {
            self.engine_running = !self.engine_running;
        }

        if self.engine_running {
            self.throttle = (self.throttle + rng.gen_range(-5.0..10.0) * dt).clamp(0.0, 100.0);
            let target_rpm = IDLE_RPM + self.throttle / 100.0 * (MAX_RPM - IDLE_RPM);
            self.rpm += (target_rpm - self.rpm) * 0.1;

            let target_speed = ((self.rpm - IDLE_RPM) / 100.0).max(0.0);
            self.speed += (target_speed - self.speed) * 0.05;

            self.coolant_temp += (85.0 - self.coolant_temp) * 0.01;
            self.fuel_level = (self.fuel_level - self.throttle / 100.0 * 0.001).max(0.0);
            self.battery_voltage = (self.battery_voltage + 0.001).min(14.2);
        } else {
            self.rpm = 0.0;
            self.throttle = 0.0;
            self.speed = (self.speed - 0.5 * dt).max(0.0);
            self.coolant_temp += (20.0 - self.coolant_temp) * 0.001;
            self.battery_voltage = (self.battery_voltage - 0.0001).max(11.8);
        }
    }
}

/// Deterministic when seeded
#[derive(Debug)]
pub struct VehicleSimulator {
    state: VehicleState,
    rng: StdRng,
}

impl VehicleSimulator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: VehicleState::default(),
            rng,
        }
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        z * sigma
    }

    /// Advance `dt` seconds and emit one sample per signal, stamped `now`
    pub fn step(&mut self, now: Timestamp, dt: f64) -> Vec<Sample> {
        self.state.step(&mut self.rng, dt);

        let running = self.state.engine_running;
        let rpm = if running { (self.state.rpm + self.noise(20.0)).max(0.0) } else { 0.0 };
        let speed = (self.state.speed + self.noise(0.5)).max(0.0);
        let coolant = self.state.coolant_temp + self.noise(0.5);
        let battery = self.state.battery_voltage + self.noise(0.05);

        let values = [
            rpm,
            speed,
            coolant,
            self.state.throttle,
            self.state.fuel_level,
            battery,
        ];

        SIMULATED_SIGNALS
            .iter()
            .zip(values)
            .map(|(spec, value)| spec.encode(value, now))
            .collect()
    }
}

/// Feed the store at `sample_rate_hz` until `shutdown` fires
pub fn spawn_simulator(
    store: Arc<InMemorySampleStore>,
    clock: Arc<dyn Clock>,
    config: SimulatorConfig,
    shutdown: CancellationToken,
) -> TokioJoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / config.sample_rate_hz);
        let dt = period.as_secs_f64();
        let mut simulator = VehicleSimulator::new(config.seed);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "canpulse::simulator",
            rate_hz = config.sample_rate_hz,
            signals = SIMULATED_SIGNALS.len(),
            "Vehicle simulator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let samples = simulator.step(clock.now(), dt);
                    if let Err(e) = store.append_batch(samples) {
                        warn!(target: "canpulse::simulator", error = %e, "Failed to append simulated samples");
                    }
                }
            }
        }

        info!(target: "canpulse::simulator", "Vehicle simulator stopped");
    })
}

// ============================================================================
// SECTION 18: ENGINE RUNTIME
// ============================================================================

/// Point-in-time engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub samples_stored: usize,
    pub subscribers: usize,
    pub broadcast: BroadcastStatsSnapshot,
    pub queries: QueryCountersSnapshot,
    pub errors: ErrorStatsSummary,
}

/// Owns every component and drives them until shutdown
#[derive(Debug)]
pub struct Engine {
    config: Arc<ConfigManager>,
    store: Arc<InMemorySampleStore>,
    clock: Arc<dyn Clock>,
    analytics: Arc<Analytics>,
    registry: Arc<SubscriberRegistry>,
    broadcast: Arc<BroadcastService>,
    error_stats: Arc<ErrorStats>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemorySampleStore::new("memory").with_max_samples(config.store.max_samples));
        let client = StoreClient::new(store.clone(), config.query_timeout());
        let analytics = Arc::new(Analytics::new(client, clock.clone(), &config.analytics));
        let registry = Arc::new(SubscriberRegistry::new(config.broadcast.subscriber_queue_capacity));
        let error_stats = Arc::new(ErrorStats::new());
        let broadcast = Arc::new(BroadcastService::new(
            &analytics,
            registry.clone(),
            config.broadcast.clone(),
            clock.clone(),
            error_stats.clone(),
        ));

        Ok(Self {
            config: Arc::new(ConfigManager::new(config)),
            store,
            clock,
            analytics,
            registry,
            broadcast,
            error_stats,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        })
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    pub fn store(&self) -> &Arc<InMemorySampleStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn broadcast(&self) -> &Arc<BroadcastService> {
        &self.broadcast
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        info!(target: "canpulse::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            samples_stored: self.store.len(),
            subscribers: self.registry.len(),
            broadcast: self.broadcast.stats(),
            queries: self.analytics.store().counters(),
            errors: self.error_stats.summary(),
        }
    }

    /// Run until SIGINT/SIGTERM or [`Self::shutdown`]
    pub async fn run(&self, simulate: bool) -> EngineResult<()> {
        let config = self.config.get();
        info!(
            target: "canpulse::engine",
            instance = %config.engine.instance_name,
            version = ENGINE_VERSION,
            "Starting {}",
            ENGINE_FULL_NAME
        );

        tokio::spawn(wait_for_shutdown_signal(self.shutdown.clone()));

        if config.broadcast.enabled {
            self.broadcast.start(&self.shutdown)?;
        }

        let simulator = (simulate || config.simulator.enabled).then(|| {
            spawn_simulator(
                self.store.clone(),
                self.clock.clone(),
                config.simulator.clone(),
                self.shutdown.clone(),
            )
        });

        let served = if config.server.enabled {
            match bind_listener(&config.server.address).await {
                Ok(listener) => {
                    let state = LiveState::new(self.registry.clone(), &config.server, self.shutdown.clone());
                    serve_live_channel(listener, state, &config.server.path, self.shutdown.clone()).await
                }
                Err(e) => Err(e),
            }
        } else {
            self.shutdown.cancelled().await;
            Ok(())
        };

        if let Err(e) = &served {
            error!(target: "canpulse::engine", error = %e, "Live channel failed");
            self.error_stats.record(e);
        }

        self.shutdown.cancel();
        let grace = Duration::from_secs(config.engine.shutdown_timeout_secs);
        if timeout(grace, self.broadcast.shutdown()).await.is_err() {
            warn!(target: "canpulse::engine", grace_secs = grace.as_secs(), "Broadcast did not stop within grace period");
        }
        if let Some(handle) = simulator {
            if timeout(grace, handle).await.is_err() {
                warn!(target: "canpulse::engine", "Simulator did not stop within grace period");
            }
        }

        let stats = self.stats();
        info!(
            target: "canpulse::engine",
            uptime_secs = stats.uptime_secs,
            cycles = stats.broadcast.cycles,
            frames_sent = stats.broadcast.frames_sent,
            errors = stats.errors.total,
            "Engine stopped"
        );

        served
    }
}

/// Cancel `token` on SIGINT or SIGTERM
async fn wait_for_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(target: "canpulse::engine", error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => info!(target: "canpulse::engine", "Received SIGINT"),
        _ = terminate => info!(target: "canpulse::engine", "Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

// ============================================================================
// SECTION 19: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// CANpulse - Telemetry Aggregation & Live Broadcast
#[derive(Parser, Debug)]
#[command(name = "canpulse")]
#[command(author = "CANpulse Team")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Vehicle-bus telemetry aggregation and real-time broadcast engine")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "canpulse.toml", env = "CANPULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, env = "CANPULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode (verbose logging)
    #[arg(short, long)]
    pub debug: bool,

    /// Command to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the engine (default)
    Run {
        /// Feed the store from the built-in vehicle simulator
        #[arg(long)]
        simulate: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "canpulse.toml")]
        output: PathBuf,
    },

    /// Show version information
    Version,
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid");
            if verbose {
                println!();
                println!("{:#?}", config);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration is invalid: {}", e);
            Err(e.into())
        }
    }
}

fn handle_generate_config(output: &Path) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();
    fs::write(output, &config_str)
        .map_err(|e| ConfigError::WriteFailed {
            message: e.to_string(),
        })
        .with_context(|| format!("writing {}", output.display()))?;
    println!("✅ Generated default configuration: {}", output.display());
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  Package: {}", ENGINE_NAME);
    println!("  Target: {}", std::env::consts::ARCH);
    println!("  OS: {}", std::env::consts::OS);
}

// ============================================================================
// SECTION 20: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let simulate = match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output);
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        Some(Commands::Run { simulate }) => *simulate,
        None => false,
    };

    let config_missing = !cli.config.exists();
    let mut config = EngineConfig::load_layered(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging).context("initializing logging")?;
    if config_missing {
        warn!(
            target: "canpulse::init",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    let engine = Engine::new(config).context("building engine")?;
    engine.run(simulate).await?;
    Ok(())
}

// ============================================================================
// SECTION 21: TESTS
// ============================================================================


#[cfg(test)]
mod analytics_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    /// Whole-second base instant so 1 s buckets start exactly at offset 0
    const BASE_SECS: i64 = 1_700_000_000;

    fn at(offset_ms: i64) -> Timestamp {
        Timestamp::from_millis(BASE_SECS * 1000 + offset_ms)
    }

    fn fixture() -> (Arc<InMemorySampleStore>, Arc<ManualClock>, Analytics) {
        let store = Arc::new(InMemorySampleStore::new("test"));
        let clock = Arc::new(ManualClock::new(at(0)));
        let client = StoreClient::new(store.clone(), Duration::from_secs(1));
        let analytics = Analytics::new(client, clock.clone(), &AnalyticsConfig::default());
        (store, clock, analytics)
    }

    fn put(store: &InMemorySampleStore, name: &str, value: f64, offset_ms: i64) {
        store
            .append(
                Sample::new(name, value, at(offset_ms))
                    .with_bus_id("0x100")
                    .with_signal_type("ENGINE")
                    .with_unit("rpm"),
            )
            .unwrap();
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ---- Aggregation ----

    #[tokio::test]
    async fn latest_snapshot_returns_newest_sample_per_signal() {
        let (store, _clock, analytics) = fixture();
        put(&store, "RPM", 1000.0, -3000);
        put(&store, "Speed", 50.0, -2000);
        put(&store, "RPM", 2000.0, -1000);

        let snapshot = analytics.aggregation.latest_snapshot().await.unwrap();
        let rows: Vec<(&str, f64)> = snapshot
            .iter()
            .map(|s| (s.signal_name.as_str(), s.physical_value))
            .collect();
        assert_eq!(rows, vec![("RPM", 2000.0), ("Speed", 50.0)]);
    }

    #[tokio::test]
    async fn latest_snapshot_prefers_last_appended_on_equal_timestamps() {
        let (store, _clock, analytics) = fixture();
        put(&store, "RPM", 100.0, -500);
        put(&store, "RPM", 200.0, -500);

        let snapshot = analytics.aggregation.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].physical_value, 200.0);
    }

    #[tokio::test]
    async fn latest_snapshot_within_drops_stale_signals() {
        let (store, _clock, analytics) = fixture();
        put(&store, "CoolantTemp", 80.0, -20_000);
        put(&store, "Speed", 50.0, -1000);

        let fresh = analytics
            .aggregation
            .latest_snapshot_within(&Window::last_secs(10))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].signal_name, "Speed");

        let all = analytics.aggregation.latest_snapshot().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn latest_snapshot_of_empty_store_is_empty() {
        let (_store, _clock, analytics) = fixture();
        assert!(analytics.aggregation.latest_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bucketed_series_averages_within_aligned_buckets() {
        let (store, clock, analytics) = fixture();
        put(&store, "RPM", 1000.0, 200);
        put(&store, "RPM", 2000.0, 700);
        put(&store, "RPM", 3000.0, 1100);
        clock.set(at(2000));

        let window = Window::last_secs(10).with_bucket(Duration::from_secs(1));
        let series = analytics
            .aggregation
            .bucketed_series(Some("RPM"), &window)
            .await
            .unwrap();

        let rpm = series.get("RPM").unwrap();
        assert_eq!(rpm.unit, "rpm");
        assert_eq!(
            rpm.points,
            vec![
                SeriesPoint {
                    time: Timestamp::from_secs(BASE_SECS),
                    avg: 1500.0,
                    min: 1000.0,
                    max: 2000.0,
                    count: 2,
                },
                SeriesPoint {
                    time: Timestamp::from_secs(BASE_SECS + 1),
                    avg: 3000.0,
                    min: 3000.0,
                    max: 3000.0,
                    count: 1,
                },
            ]
        );
        assert_eq!(series.sample_count(), 3);
    }

    #[tokio::test]
    async fn bucketed_series_is_idempotent_without_new_samples() {
        let (store, _clock, analytics) = fixture();
        for i in 0..20 {
            put(&store, "RPM", 1000.0 + i as f64 * 10.0, -i * 250);
            put(&store, "Speed", i as f64, -i * 300);
        }

        let window = Window::last_secs(30).with_bucket(Duration::from_secs(2));
        let first = analytics.aggregation.bucketed_series(None, &window).await.unwrap();
        let second = analytics.aggregation.bucketed_series(None, &window).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.signals.len(), 2);
        assert_eq!(first.sample_count(), 40);
    }

    #[tokio::test]
    async fn bucketed_series_rejects_zero_bucket() {
        let (_store, _clock, analytics) = fixture();
        let window = Window::last_secs(10).with_bucket(Duration::ZERO);
        let result = analytics.aggregation.bucketed_series(None, &window).await;
        assert!(matches!(result, Err(QueryError::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn descriptive_stats_uses_population_deviation() {
        let (store, _clock, analytics) = fixture();
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            put(&store, "Speed", *v, -(i as i64) * 100);
        }

        let stats = analytics
            .aggregation
            .descriptive_stats("Speed", &Window::last_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.signal_name, "Speed");
        assert_eq!(stats.summary.count, 8);
        assert_eq!(stats.summary.mean, 5.0);
        assert_eq!(stats.summary.std_dev, 2.0);
        assert_eq!((stats.summary.min, stats.summary.max), (2.0, 9.0));

        let missing = analytics
            .aggregation
            .descriptive_stats("Nope", &Window::last_secs(60))
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn signal_catalog_lists_distinct_signals_by_name() {
        let (store, _clock, analytics) = fixture();
        store
            .append(Sample::new("Speed", 1.0, at(-10)).with_signal_type("VEHICLE").with_unit("km/h"))
            .unwrap();
        store
            .append(Sample::new("BatteryVoltage", 12.0, at(-5)).with_signal_type("ELECTRICAL").with_unit("V"))
            .unwrap();
        store
            .append(Sample::new("Speed", 2.0, at(-1)).with_signal_type("VEHICLE").with_unit("km/h"))
            .unwrap();

        let catalog = analytics.aggregation.signal_catalog().await.unwrap();
        assert_eq!(
            catalog,
            vec![
                SignalInfo {
                    signal_name: "BatteryVoltage".into(),
                    signal_type: "ELECTRICAL".into(),
                    unit: "V".into(),
                },
                SignalInfo {
                    signal_name: "Speed".into(),
                    signal_type: "VEHICLE".into(),
                    unit: "km/h".into(),
                },
            ]
        );
    }

    // ---- Anomalies ----

    #[tokio::test]
    async fn rpm_spike_is_flagged_against_a_steady_baseline() {
        let (store, _clock, analytics) = fixture();
        let mut offset = -60_000;
        for _ in 0..6 {
            for v in [1000.0, 1010.0, 1005.0, 1008.0] {
                put(&store, "RPM", v, offset);
                offset += 1000;
            }
        }
        put(&store, "RPM", 5000.0, -100);

        let report = analytics
            .anomalies
            .detect_default("RPM", &Window::last_minutes(5))
            .await
            .unwrap();

        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].physical_value, 5000.0);
        assert!(report.anomalies[0].z_score > 3.0);
        assert!(!report.truncated);
        assert_eq!(report.statistics.map(|s| s.count), Some(25));
    }

    #[tokio::test]
    async fn five_sample_spike_needs_a_lower_threshold() {
        let (store, _clock, analytics) = fixture();
        for (i, v) in [1000.0, 1010.0, 1005.0, 1008.0, 5000.0].iter().enumerate() {
            put(&store, "RPM", *v, -5000 + i as i64 * 1000);
        }
        let window = Window::last_secs(60);

        // (n-1)/sqrt(n) = 1.79 is the largest z-score five samples can reach
        let strict = analytics.anomalies.detect_anomalies("RPM", &window, 3.0).await.unwrap();
        assert!(strict.anomalies.is_empty());

        let loose = analytics.anomalies.detect_anomalies("RPM", &window, 1.5).await.unwrap();
        let flagged: Vec<f64> = loose.anomalies.iter().map(|a| a.physical_value).collect();
        assert_eq!(flagged, vec![5000.0]);
    }

    #[tokio::test]
    async fn constant_signal_has_no_anomalies() {
        let (store, _clock, analytics) = fixture();
        for i in 0..10 {
            put(&store, "FuelLevel", 50.0, -i * 100);
        }
        let report = analytics
            .anomalies
            .detect_anomalies("FuelLevel", &Window::last_secs(60), 0.0)
            .await
            .unwrap();
        assert!(report.anomalies.is_empty());
        assert_eq!(report.statistics.map(|s| s.std_dev), Some(0.0));
    }

    #[tokio::test]
    async fn anomaly_threshold_must_be_non_negative() {
        let (_store, _clock, analytics) = fixture();
        let result = analytics
            .anomalies
            .detect_anomalies("RPM", &Window::last_secs(60), -1.0)
            .await;
        assert!(matches!(
            result,
            Err(QueryError::InvalidParameter { name: "threshold_sigma", .. })
        ));
    }

    #[test]
    fn anomaly_report_is_newest_first_and_capped() {
        let mut samples: Vec<Sample> = (0..10)
            .map(|i| Sample::new("X", 0.0, Timestamp::from_secs(i)))
            .collect();
        for i in 10..13 {
            samples.push(Sample::new("X", 100.0, Timestamp::from_secs(i)));
        }

        let report = AnomalyReport::evaluate("X", &samples, 1.0, 2);
        assert!(report.truncated);
        let times: Vec<Timestamp> = report.anomalies.iter().map(|a| a.timestamp).collect();
        assert_eq!(times, vec![Timestamp::from_secs(12), Timestamp::from_secs(11)]);
    }

    // ---- Correlation ----

    #[tokio::test]
    async fn correlation_matrix_uses_one_grouped_query() {
        let (store, clock, analytics) = fixture();
        let a = [1.0, 2.0, 3.0, 4.0];
        for (i, &v) in a.iter().enumerate() {
            let offset = i as i64 * 1000 + 100;
            put(&store, "A", v, offset);
            put(&store, "B", v * 2.0, offset);
            put(&store, "C", 10.0 - v * 2.0, offset);
            put(&store, "D", 5.0, offset);
        }
        clock.set(at(5000));

        let records = analytics
            .correlation
            .correlation_matrix(&Window::last_secs(60))
            .await
            .unwrap();

        let pairs: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.signal_a.as_str(), r.signal_b.as_str()))
            .collect();
        assert_eq!(pairs, vec![("A", "B"), ("A", "C"), ("B", "C")]);
        assert!(approx(records[0].correlation, 1.0));
        assert!(approx(records[1].correlation, -1.0));
        assert!(approx(records[2].correlation, -1.0));
        assert!(records.iter().all(|r| r.joined_points == 4));

        let counters = analytics.store().counters();
        assert_eq!(counters.bucketed, 1);
        assert_eq!(counters.total(), 1);
    }

    #[tokio::test]
    async fn correlation_omits_pairs_without_shared_buckets() {
        let (store, clock, analytics) = fixture();
        put(&store, "X", 1.0, 100);
        put(&store, "X", 2.0, 1100);
        put(&store, "Y", 1.0, 2100);
        put(&store, "Y", 3.0, 3100);
        clock.set(at(4000));

        let records = analytics
            .correlation
            .correlation_matrix(&Window::last_secs(60))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn pearson_requires_two_points_and_variance() {
        assert_eq!(pearson(&[1.0], &[2.0]), None);
        assert_eq!(pearson(&[1.0, 1.0], &[2.0, 3.0]), None);
        let r = pearson(&[1.0, 2.0, 3.0], &[1.0, 2.0, 2.5]).unwrap();
        assert!(r > 0.9 && r <= 1.0);
    }

    // ---- Distribution ----

    #[tokio::test]
    async fn histogram_places_maximum_in_last_bin() {
        let (store, _clock, analytics) = fixture();
        for (i, v) in [0.0, 1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            put(&store, "Speed", *v, -(i as i64) * 100);
        }

        let histogram = analytics
            .distribution
            .histogram("Speed", &Window::last_secs(60), 4)
            .await
            .unwrap()
            .unwrap();

        let shape: Vec<(usize, u64, f64, f64)> = histogram
            .bins
            .iter()
            .map(|b| (b.bin, b.frequency, b.bin_start, b.bin_end))
            .collect();
        assert_eq!(
            shape,
            vec![
                (0, 1, 0.0, 1.0),
                (1, 1, 1.0, 2.0),
                (2, 1, 2.0, 3.0),
                (3, 2, 3.0, 4.0),
            ]
        );
        assert_eq!(histogram.total, 5);
    }

    #[tokio::test]
    async fn histogram_rejects_zero_bins_and_reports_no_data() {
        let (_store, _clock, analytics) = fixture();
        let window = Window::last_secs(60);
        assert!(matches!(
            analytics.distribution.histogram("Speed", &window, 0).await,
            Err(QueryError::InvalidParameter { name: "bin_count", .. })
        ));
        assert_eq!(analytics.distribution.histogram_default("Speed", &window).await.unwrap(), None);
    }

    #[test]
    fn histogram_of_constant_values_is_a_single_bin() {
        let histogram = Histogram::from_values("T", &[7.0, 7.0, 7.0], 20).unwrap();
        assert_eq!(
            histogram.bins,
            vec![HistogramBin {
                bin: 0,
                frequency: 3,
                bin_start: 7.0,
                bin_end: 7.0,
            }]
        );
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(20)]
    #[case(1000)]
    fn histogram_omits_empty_bins(#[case] bins: usize) {
        let values = [0.0, 0.5, 10.0, 10.0, 99.0, 100.0];
        let histogram = Histogram::from_values("V", &values, bins).unwrap();
        assert!(histogram.bins.iter().all(|b| b.frequency > 0 && b.bin < bins));
        assert_eq!(histogram.bins.iter().map(|b| b.frequency).sum::<u64>(), 6);
        assert!(histogram.bins.windows(2).all(|w| w[0].bin < w[1].bin));
    }

    #[test]
    fn histogram_with_huge_bin_count_only_tracks_occupied_bins() {
        let bins = usize::MAX / 2;
        let histogram = Histogram::from_values("V", &[0.0, 0.0, 1.0], bins).unwrap();

        assert_eq!(histogram.bin_count, bins);
        assert_eq!(histogram.total, 3);
        assert_eq!(histogram.bins.len(), 2);
        assert_eq!((histogram.bins[0].bin, histogram.bins[0].frequency), (0, 2));
        assert_eq!(histogram.bins[0].bin_start, 0.0);
        assert_eq!((histogram.bins[1].bin, histogram.bins[1].frequency), (bins - 1, 1));
        assert_eq!(histogram.bins[1].bin_end, 1.0);
    }

    // ---- Message rate ----

    #[tokio::test]
    async fn message_rate_counts_per_second_per_signal() {
        let (store, clock, analytics) = fixture();
        put(&store, "RPM", 1.0, 100);
        put(&store, "Speed", 1.0, 300);
        put(&store, "RPM", 1.0, 500);
        put(&store, "RPM", 1.0, 1200);
        clock.set(at(2000));

        let rates = analytics.rate.message_rate(&Window::last_secs(10)).await.unwrap();
        assert_eq!(
            rates,
            vec![
                RateRecord {
                    bucket: Timestamp::from_secs(BASE_SECS),
                    signal_name: "RPM".into(),
                    count: 2,
                },
                RateRecord {
                    bucket: Timestamp::from_secs(BASE_SECS),
                    signal_name: "Speed".into(),
                    count: 1,
                },
                RateRecord {
                    bucket: Timestamp::from_secs(BASE_SECS + 1),
                    signal_name: "RPM".into(),
                    count: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn message_rate_honours_window_bucket() {
        let (store, clock, analytics) = fixture();
        for i in 0..10 {
            put(&store, "RPM", 1.0, i * 500);
        }
        clock.set(at(5000));

        let window = Window::last_secs(60).with_bucket(Duration::from_secs(5));
        let rates = analytics.rate.message_rate(&window).await.unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].count, 10);
    }

    // ---- Raw message explorer ----

    fn seed_raw(store: &InMemorySampleStore) {
        let rows = [
            ("0x100", "ENGINE", "RPM", "0bb8000000000000", -4000),
            ("0x101", "VEHICLE", "Speed", "1388000000000000", -3000),
            ("0x102", "ENGINE", "CoolantTemp", "7d00000000000000", -2000),
            ("0x100", "ENGINE", "RPM", "0FA0000000000000", -1000),
        ];
        for (bus, kind, name, payload, offset) in rows {
            store
                .append(
                    Sample::new(name, 1.0, at(offset))
                        .with_bus_id(bus)
                        .with_signal_type(kind)
                        .with_payload_hex(payload),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn raw_messages_filter_and_order_newest_first() {
        let (store, _clock, analytics) = fixture();
        seed_raw(&store);
        let explorer = &analytics.explorer;
        let window = Window::last_secs(60);

        let all = explorer.raw_messages(&RawMessageFilter::last(window)).await.unwrap();
        let times: Vec<Timestamp> = all.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![at(-1000), at(-2000), at(-3000), at(-4000)]);

        let engine = explorer
            .raw_messages(&RawMessageFilter::last(window).with_signal_types(["ENGINE"]).with_limit(2))
            .await
            .unwrap();
        let names: Vec<&str> = engine.iter().map(|s| s.signal_name.as_str()).collect();
        assert_eq!(names, vec!["RPM", "CoolantTemp"]);

        let by_bus = explorer
            .raw_messages(&RawMessageFilter::last(window).with_bus_ids(["0x101", "0x102"]))
            .await
            .unwrap();
        assert_eq!(by_bus.len(), 2);

        let searched = explorer
            .raw_messages(&RawMessageFilter::last(window).with_search("0fa0"))
            .await
            .unwrap();
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].timestamp, at(-1000));

        let by_name = explorer
            .raw_messages(&RawMessageFilter::last(window).with_search("coolant"))
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);

        let between = explorer
            .raw_messages(&RawMessageFilter::last(window).between(TimeRange::new(at(-3500), at(-1500))))
            .await
            .unwrap();
        assert_eq!(between.len(), 2);
    }

    #[tokio::test]
    async fn raw_messages_reject_inverted_range() {
        let (_store, _clock, analytics) = fixture();
        let filter = RawMessageFilter::last(Window::last_secs(60)).between(TimeRange::new(at(0), at(-1000)));
        assert!(matches!(
            analytics.explorer.raw_messages(&filter).await,
            Err(QueryError::InvalidWindow { .. })
        ));
    }

    #[tokio::test]
    async fn message_stats_and_unique_bus_ids() {
        let (store, _clock, analytics) = fixture();
        seed_raw(&store);
        let window = Window::last_secs(60);

        let stats = analytics.explorer.message_stats(&window).await.unwrap();
        assert_eq!(
            stats,
            MessageStats {
                total_messages: 4,
                unique_bus_ids: 3,
                unique_signal_types: 2,
                unique_signals: 3,
                oldest: Some(at(-4000)),
                newest: Some(at(-1000)),
            }
        );

        let ids = analytics.explorer.unique_bus_ids(&window).await.unwrap();
        assert_eq!(ids, vec!["0x100", "0x101", "0x102"]);

        let empty = analytics.explorer.message_stats(&Window::last_millis(10)).await.unwrap();
        assert_eq!(empty.total_messages, 0);
        assert_eq!(empty.newest, None);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn histogram_frequencies_sum_to_sample_count(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 1..200),
            bins in 1usize..64,
        ) {
            let histogram = Histogram::from_values("X", &values, bins).unwrap();
            prop_assert_eq!(
                histogram.bins.iter().map(|b| b.frequency).sum::<u64>(),
                values.len() as u64
            );
            prop_assert!(histogram.bins.iter().all(|b| b.bin < bins && b.bin_start <= b.bin_end));
        }

        #[test]
        fn rate_counts_sum_to_samples_in_window(
            offsets in prop::collection::vec(0i64..20_000, 0..150),
            interval_ms in 1u64..5_000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let now = Timestamp::from_secs(1_700_000_000);
            let (counted, expected) = runtime.block_on(async {
                let store = Arc::new(InMemorySampleStore::new("prop"));
                for (i, offset) in offsets.iter().enumerate() {
                    let name = if i % 2 == 0 { "A" } else { "B" };
                    store
                        .append(Sample::new(name, 1.0, now.sub_duration(Duration::from_millis(*offset as u64))))
                        .unwrap();
                }
                let client = StoreClient::new(store, Duration::from_secs(1));
                let counter = MessageRateCounter::new(
                    client,
                    Arc::new(ManualClock::new(now)),
                    Duration::from_millis(interval_ms),
                );
                let records = counter.message_rate(&Window::last_secs(10)).await.unwrap();
                let counted: u64 = records.iter().map(|r| r.count).sum();
                let expected = offsets.iter().filter(|o| **o <= 10_000).count() as u64;
                (counted, expected)
            });

            prop_assert_eq!(counted, expected);
        }

        #[test]
        fn anomalies_are_exactly_the_samples_beyond_the_cutoff(
            raw in prop::collection::vec(-1_000i32..1_000, 1..120),
            threshold in 0.0f64..4.0,
            limit in 1usize..50,
        ) {
            // Integer sums keep μ and σ exact: n·|x - μ| against n·t·σ.
            let n = raw.len() as i64;
            let sum: i64 = raw.iter().map(|&v| v as i64).sum();
            let sum_sq: i64 = raw.iter().map(|&v| (v as i64).pow(2)).sum();
            let spread = ((n * sum_sq - sum * sum) as f64).sqrt();
            let cutoff = threshold * spread;
            let deviation = |v: i32| ((n * v as i64 - sum) as f64).abs();
            if spread > 0.0 {
                prop_assume!(raw.iter().all(|&v| (deviation(v) - cutoff).abs() > 1e-6 * (1.0 + cutoff)));
            }

            let samples: Vec<Sample> = raw
                .iter()
                .enumerate()
                .map(|(i, &v)| Sample::new("S", v as f64, Timestamp::from_secs(i as i64)))
                .collect();
            let report = AnomalyReport::evaluate("S", &samples, threshold, limit);

            let mut expected: Vec<Timestamp> = (0..raw.len())
                .rev()
                .filter(|&i| spread > 0.0 && deviation(raw[i]) > cutoff)
                .map(|i| Timestamp::from_secs(i as i64))
                .collect();
            let truncated = expected.len() > limit;
            expected.truncate(limit);

            let flagged: Vec<Timestamp> = report.anomalies.iter().map(|a| a.timestamp).collect();
            prop_assert_eq!(flagged, expected);
            prop_assert_eq!(report.truncated, truncated);
            if spread == 0.0 {
                prop_assert!(report.anomalies.is_empty());
            }
        }

        #[test]
        fn pearson_stays_in_unit_interval(
            pairs in prop::collection::vec((-1.0e3f64..1.0e3, -1.0e3f64..1.0e3), 0..50),
        ) {
            let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
            if let Some(r) = pearson(&xs, &ys) {
                prop_assert!((-1.0..=1.0).contains(&r));
            }
        }

        #[test]
        fn floor_to_returns_containing_bucket_start(
            nanos in -1_000_000_000_000_000_000i64..1_000_000_000_000_000_000,
            bucket_ms in 1u64..100_000,
        ) {
            let ts = Timestamp::from_nanos(nanos);
            let bucket = Duration::from_millis(bucket_ms);
            let start = ts.floor_to(bucket);
            prop_assert!(start <= ts);
            prop_assert!(ts < start.add_duration(bucket));
            prop_assert_eq!(start.as_nanos().rem_euclid(bucket.as_nanos() as i64), 0);
        }
    }
}
