/*!
Logging and metrics setup for Warden.

Logging goes through `tracing`; [`init_observability`] installs the global
subscriber. With the `metrics` feature, transition, backup and capture counters
are kept in a process-local Prometheus registry that the operator can dump with
[`WardenMetrics::gather_metrics`]. Nothing is transmitted.
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{Result, WardenError};

/// Default filter directive when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "warden=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<WardenMetrics>> = OnceLock::new();

/// Prometheus metrics for lifecycle and snapshot operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct WardenMetrics {
    pub transitions_total: IntCounterVec,
    pub transition_failures_total: IntCounterVec,
    pub backups_created_total: IntCounter,
    pub lock_contention_total: IntCounter,
    pub snapshot_capture_seconds: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl WardenMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let metric_err = |name: &str, e: prometheus::Error| {
            WardenError::storage(format!("Failed to set up metric {name}: {e}"))
        };

        let transitions_total = IntCounterVec::new(
            Opts::new("warden_transitions_total", "Lifecycle transitions attempted"),
            &["action"],
        )
        .map_err(|e| metric_err("warden_transitions_total", e))?;
        let transition_failures_total = IntCounterVec::new(
            Opts::new(
                "warden_transition_failures_total",
                "Lifecycle transitions that failed",
            ),
            &["action"],
        )
        .map_err(|e| metric_err("warden_transition_failures_total", e))?;
        let backups_created_total =
            IntCounter::new("warden_backups_created_total", "Backup records written")
                .map_err(|e| metric_err("warden_backups_created_total", e))?;
        let lock_contention_total = IntCounter::new(
            "warden_lock_contention_total",
            "Identity lock acquisitions that had to wait",
        )
        .map_err(|e| metric_err("warden_lock_contention_total", e))?;
        let snapshot_capture_seconds = Histogram::with_opts(HistogramOpts::new(
            "warden_snapshot_capture_seconds",
            "Wall time of snapshot captures in seconds",
        ))
        .map_err(|e| metric_err("warden_snapshot_capture_seconds", e))?;

        registry
            .register(Box::new(transitions_total.clone()))
            .map_err(|e| metric_err("warden_transitions_total", e))?;
        registry
            .register(Box::new(transition_failures_total.clone()))
            .map_err(|e| metric_err("warden_transition_failures_total", e))?;
        registry
            .register(Box::new(backups_created_total.clone()))
            .map_err(|e| metric_err("warden_backups_created_total", e))?;
        registry
            .register(Box::new(lock_contention_total.clone()))
            .map_err(|e| metric_err("warden_lock_contention_total", e))?;
        registry
            .register(Box::new(snapshot_capture_seconds.clone()))
            .map_err(|e| metric_err("warden_snapshot_capture_seconds", e))?;

        Ok(Self {
            transitions_total,
            transition_failures_total,
            backups_created_total,
            lock_contention_total,
            snapshot_capture_seconds,
            registry,
        })
    }

    /// Global metrics instance, or `None` if registration failed
    pub fn global() -> Option<&'static WardenMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!("Metrics disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    /// Render every metric in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| WardenError::storage(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| WardenError::storage(format!("Metrics are not UTF-8: {e}")))
    }
}

pub(crate) fn record_transition(action: &str, success: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = WardenMetrics::global() {
        metrics.transitions_total.with_label_values(&[action]).inc();
        if !success {
            metrics
                .transition_failures_total
                .with_label_values(&[action])
                .inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (action, success);
}

pub(crate) fn record_backup_created() {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = WardenMetrics::global() {
        metrics.backups_created_total.inc();
    }
}

pub(crate) fn record_lock_contention() {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = WardenMetrics::global() {
        metrics.lock_contention_total.inc();
    }
}

pub(crate) fn record_capture_duration(elapsed: Duration) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = WardenMetrics::global() {
        metrics.snapshot_capture_seconds.observe(elapsed.as_secs_f64());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = elapsed;
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `warden=info` directive. With `json` set,
/// events are emitted as one JSON object per line, otherwise in the compact
/// human format.
pub fn init_observability(json: bool) -> Result<()> {
    init_with_directive(json, DEFAULT_DIRECTIVE)
}

/// Like [`init_observability`] with an explicit default directive
pub fn init_with_directive(json: bool, directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    WardenMetrics::global();

    let directive = directive
        .parse()
        .map_err(|e| WardenError::validation(format!("Invalid log directive {directive}: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false)
                .with_writer(std::io::stderr),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        );
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        WardenError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Warden observability initialized");
    Ok(())
}
