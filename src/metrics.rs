//! Connector metrics.
//!
//! The connector reports its signals through the [`MetricRecorder`] trait so
//! that embedding applications can bridge them into whatever telemetry
//! pipeline they run. A built-in lock-free recorder ([`ConnectorMetrics`])
//! based on atomic counters is installed by default and can be read as a
//! snapshot or in Prometheus exposition format.
//!
//! Signals:
//! - `dial_count`: dial attempts, tagged by auth type, cache hit, outcome
//! - `dial_latencies`: per-dial latency of successful dials
//! - `open_connections`: currently open connections (up-down)
//! - `bytes_sent_count` / `bytes_received_count`: post-handshake traffic
//! - `refresh_count`: refresh operations, tagged by cache flavor and outcome

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic ordering used for metrics (Relaxed is sufficient for counters).
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// How a dial attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStatus {
    /// The dial produced a connected, authenticated stream.
    Success,
    /// The caller supplied a bad instance URI or endpoint kind.
    UserError,
    /// Connection info could not be retrieved from the cache.
    CacheError,
    /// The TCP connect (or keep-alive setup) failed.
    TcpError,
    /// The TLS handshake failed.
    TlsError,
    /// The metadata exchange failed.
    MdxError,
}

impl DialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialStatus::Success => "success",
            DialStatus::UserError => "user-error",
            DialStatus::CacheError => "cache-error",
            DialStatus::TcpError => "tcp-error",
            DialStatus::TlsError => "tls-error",
            DialStatus::MdxError => "mdx-error",
        }
    }
}

/// Which authentication mode a dial used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Database-native authentication.
    Native,
    /// Automatic IAM authentication.
    Iam,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Native => "native",
            AuthKind::Iam => "iam",
        }
    }
}

/// Which cache flavor performed a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    RefreshAhead,
    Lazy,
}

impl RefreshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::RefreshAhead => "refresh-ahead",
            RefreshKind::Lazy => "lazy",
        }
    }
}

/// Sink for connector signals.
///
/// Implementations must be cheap and non-blocking; recording happens on the
/// dial path.
pub trait MetricRecorder: Send + Sync {
    /// Record a dial attempt and its outcome.
    fn record_dial_count(&self, status: DialStatus, auth: AuthKind, cache_hit: bool);

    /// Record the latency of a successful dial, in milliseconds.
    fn record_dial_latency(&self, latency_ms: u64);

    /// Record a connection opened.
    fn record_open_connection(&self, auth: AuthKind);

    /// Record a connection closed.
    fn record_closed_connection(&self, auth: AuthKind);

    /// Record bytes written to the instance.
    fn record_bytes_tx(&self, bytes: u64);

    /// Record bytes read from the instance.
    fn record_bytes_rx(&self, bytes: u64);

    /// Record the outcome of a refresh operation.
    fn record_refresh_count(&self, kind: RefreshKind, success: bool);
}

/// A recorder that drops every signal. Used when built-in telemetry is
/// opted out and no replacement recorder is supplied.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl MetricRecorder for NullRecorder {
    fn record_dial_count(&self, _: DialStatus, _: AuthKind, _: bool) {}
    fn record_dial_latency(&self, _: u64) {}
    fn record_open_connection(&self, _: AuthKind) {}
    fn record_closed_connection(&self, _: AuthKind) {}
    fn record_bytes_tx(&self, _: u64) {}
    fn record_bytes_rx(&self, _: u64) {}
    fn record_refresh_count(&self, _: RefreshKind, _: bool) {}
}

/// Built-in metrics collection.
///
/// All counters are atomics; recording never takes a lock.
#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    // ========================================================================
    // Dial Metrics
    // ========================================================================
    /// Successful dials
    pub dial_successes: AtomicU64,
    /// Dials that failed on user input (bad URI, missing endpoint kind)
    pub dial_user_errors: AtomicU64,
    /// Dials that failed retrieving connection info
    pub dial_cache_errors: AtomicU64,
    /// Dials that failed during TCP connect
    pub dial_tcp_errors: AtomicU64,
    /// Dials that failed during the TLS handshake
    pub dial_tls_errors: AtomicU64,
    /// Dials that failed during the metadata exchange
    pub dial_mdx_errors: AtomicU64,
    /// Dials that found a primed cache entry
    pub dial_cache_hits: AtomicU64,
    /// Count and sum of successful-dial latencies (milliseconds)
    pub dial_latency_count: AtomicU64,
    pub dial_latency_total_ms: AtomicU64,

    // ========================================================================
    // Connection Metrics
    // ========================================================================
    /// Currently open connections
    pub open_connections: AtomicU64,
    /// Bytes written to instances
    pub bytes_tx: AtomicU64,
    /// Bytes read from instances
    pub bytes_rx: AtomicU64,

    // ========================================================================
    // Refresh Metrics
    // ========================================================================
    /// Successful refresh-ahead refreshes
    pub refresh_ahead_successes: AtomicU64,
    /// Failed refresh-ahead refreshes
    pub refresh_ahead_failures: AtomicU64,
    /// Successful lazy refreshes
    pub lazy_successes: AtomicU64,
    /// Failed lazy refreshes
    pub lazy_failures: AtomicU64,
}

impl ConnectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared metrics instance.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dial_successes: self.dial_successes.load(METRIC_ORDERING),
            dial_user_errors: self.dial_user_errors.load(METRIC_ORDERING),
            dial_cache_errors: self.dial_cache_errors.load(METRIC_ORDERING),
            dial_tcp_errors: self.dial_tcp_errors.load(METRIC_ORDERING),
            dial_tls_errors: self.dial_tls_errors.load(METRIC_ORDERING),
            dial_mdx_errors: self.dial_mdx_errors.load(METRIC_ORDERING),
            dial_cache_hits: self.dial_cache_hits.load(METRIC_ORDERING),
            dial_latency_count: self.dial_latency_count.load(METRIC_ORDERING),
            dial_latency_total_ms: self.dial_latency_total_ms.load(METRIC_ORDERING),
            open_connections: self.open_connections.load(METRIC_ORDERING),
            bytes_tx: self.bytes_tx.load(METRIC_ORDERING),
            bytes_rx: self.bytes_rx.load(METRIC_ORDERING),
            refresh_ahead_successes: self.refresh_ahead_successes.load(METRIC_ORDERING),
            refresh_ahead_failures: self.refresh_ahead_failures.load(METRIC_ORDERING),
            lazy_successes: self.lazy_successes.load(METRIC_ORDERING),
            lazy_failures: self.lazy_failures.load(METRIC_ORDERING),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::with_capacity(2048);

        output.push_str("# HELP connector_dial_total Dial attempts by outcome\n");
        output.push_str("# TYPE connector_dial_total counter\n");
        for (status, value) in [
            ("success", s.dial_successes),
            ("user-error", s.dial_user_errors),
            ("cache-error", s.dial_cache_errors),
            ("tcp-error", s.dial_tcp_errors),
            ("tls-error", s.dial_tls_errors),
            ("mdx-error", s.dial_mdx_errors),
        ] {
            output.push_str(&format!(
                "connector_dial_total{{status=\"{}\"}} {}\n",
                status, value
            ));
        }

        output.push_str("# HELP connector_dial_cache_hits_total Dials served by a primed cache\n");
        output.push_str("# TYPE connector_dial_cache_hits_total counter\n");
        output.push_str(&format!(
            "connector_dial_cache_hits_total {}\n",
            s.dial_cache_hits
        ));

        output.push_str("# HELP connector_dial_latency_ms_sum Total dial latency\n");
        output.push_str("# TYPE connector_dial_latency_ms_sum counter\n");
        output.push_str(&format!(
            "connector_dial_latency_ms_sum {}\n",
            s.dial_latency_total_ms
        ));
        output.push_str("# HELP connector_dial_latency_ms_count Latency sample count\n");
        output.push_str("# TYPE connector_dial_latency_ms_count counter\n");
        output.push_str(&format!(
            "connector_dial_latency_ms_count {}\n",
            s.dial_latency_count
        ));

        output.push_str("# HELP connector_open_connections Current open connections\n");
        output.push_str("# TYPE connector_open_connections gauge\n");
        output.push_str(&format!("connector_open_connections {}\n", s.open_connections));

        output.push_str("# HELP connector_bytes_sent_total Bytes written to instances\n");
        output.push_str("# TYPE connector_bytes_sent_total counter\n");
        output.push_str(&format!("connector_bytes_sent_total {}\n", s.bytes_tx));
        output.push_str("# HELP connector_bytes_received_total Bytes read from instances\n");
        output.push_str("# TYPE connector_bytes_received_total counter\n");
        output.push_str(&format!("connector_bytes_received_total {}\n", s.bytes_rx));

        output.push_str("# HELP connector_refresh_total Refresh operations by type and outcome\n");
        output.push_str("# TYPE connector_refresh_total counter\n");
        for (kind, outcome, value) in [
            ("refresh-ahead", "success", s.refresh_ahead_successes),
            ("refresh-ahead", "failure", s.refresh_ahead_failures),
            ("lazy", "success", s.lazy_successes),
            ("lazy", "failure", s.lazy_failures),
        ] {
            output.push_str(&format!(
                "connector_refresh_total{{refresh_type=\"{}\",status=\"{}\"}} {}\n",
                kind, outcome, value
            ));
        }

        output
    }
}

impl MetricRecorder for ConnectorMetrics {
    fn record_dial_count(&self, status: DialStatus, _auth: AuthKind, cache_hit: bool) {
        let counter = match status {
            DialStatus::Success => &self.dial_successes,
            DialStatus::UserError => &self.dial_user_errors,
            DialStatus::CacheError => &self.dial_cache_errors,
            DialStatus::TcpError => &self.dial_tcp_errors,
            DialStatus::TlsError => &self.dial_tls_errors,
            DialStatus::MdxError => &self.dial_mdx_errors,
        };
        counter.fetch_add(1, METRIC_ORDERING);
        if cache_hit {
            self.dial_cache_hits.fetch_add(1, METRIC_ORDERING);
        }
    }

    fn record_dial_latency(&self, latency_ms: u64) {
        self.dial_latency_count.fetch_add(1, METRIC_ORDERING);
        self.dial_latency_total_ms
            .fetch_add(latency_ms, METRIC_ORDERING);
    }

    fn record_open_connection(&self, _auth: AuthKind) {
        self.open_connections.fetch_add(1, METRIC_ORDERING);
    }

    fn record_closed_connection(&self, _auth: AuthKind) {
        self.open_connections.fetch_sub(1, METRIC_ORDERING);
    }

    fn record_bytes_tx(&self, bytes: u64) {
        self.bytes_tx.fetch_add(bytes, METRIC_ORDERING);
    }

    fn record_bytes_rx(&self, bytes: u64) {
        self.bytes_rx.fetch_add(bytes, METRIC_ORDERING);
    }

    fn record_refresh_count(&self, kind: RefreshKind, success: bool) {
        let counter = match (kind, success) {
            (RefreshKind::RefreshAhead, true) => &self.refresh_ahead_successes,
            (RefreshKind::RefreshAhead, false) => &self.refresh_ahead_failures,
            (RefreshKind::Lazy, true) => &self.lazy_successes,
            (RefreshKind::Lazy, false) => &self.lazy_failures,
        };
        counter.fetch_add(1, METRIC_ORDERING);
    }
}

/// Plain-value copy of [`ConnectorMetrics`] for display or serialization.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub dial_successes: u64,
    pub dial_user_errors: u64,
    pub dial_cache_errors: u64,
    pub dial_tcp_errors: u64,
    pub dial_tls_errors: u64,
    pub dial_mdx_errors: u64,
    pub dial_cache_hits: u64,
    pub dial_latency_count: u64,
    pub dial_latency_total_ms: u64,
    pub open_connections: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub refresh_ahead_successes: u64,
    pub refresh_ahead_failures: u64,
    pub lazy_successes: u64,
    pub lazy_failures: u64,
}
