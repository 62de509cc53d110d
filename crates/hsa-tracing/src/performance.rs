//! Timing spans and transfer events for hot runtime paths
//!
//! Used on the copy, fill and allocation paths. A disabled span costs one
//! atomic load on drop.
//!
//! ## Example
//!
//! ```rust
//! use hsa_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("blit_copy", Some(100));
//! // copy 4 KiB ...
//! drop(span); // logged only if it took at least 100us
//!
//! record_transfer(4096, "H2D", 250);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

// u64::MAX encodes "no threshold".
static DEFAULT_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Globally enable or disable performance span logging.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether performance span logging is currently enabled.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Threshold applied to spans created without an explicit one.
pub fn set_default_threshold(threshold_us: Option<u64>) {
    DEFAULT_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

fn default_threshold() -> Option<u64> {
    match DEFAULT_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// RAII guard that measures its own lifetime and logs it on drop.
///
/// The entry is emitted at debug level inside a `perf` span carrying the
/// operation name, and only when the elapsed time reaches the threshold.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a span. `threshold_us` of `None` falls back to the global
    /// default threshold, which itself may be unset (always log).
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self {
            name,
            threshold_us: threshold_us.or_else(default_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// Name the span was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the underlying `perf` span.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a region allocation.
pub fn record_allocation(size_bytes: usize, region: &str, alignment: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes,
        region,
        alignment,
        duration_us,
        "memory_allocation"
    );
}

/// Record a data transfer with its bandwidth.
///
/// `direction` is one of `H2H`, `H2D`, `D2H`, `D2D`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    tracing::debug!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_mbps = bandwidth_mbps(bytes, duration_us),
        "data_transfer"
    );
}

fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("test_span", Some(5));
        assert_eq!(span.name(), "test_span");
        assert_eq!(span.threshold_us, Some(5));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::new("sleepy", None);
        thread::sleep(Duration::from_millis(10));
        assert!(span.elapsed_us() >= 10_000);
    }

    #[test]
    fn record_helpers_emit_without_subscriber() {
        record_allocation(4096, "system", 4096, 12);
        record_transfer(4096, "H2D", 250);
        record_transfer(4096, "D2D", 0);
    }

    #[test]
    fn bandwidth_is_mib_per_second() {
        // 1 MiB in 1ms = 1000 MiB/s
        let mbps = bandwidth_mbps(1024 * 1024, 1000);
        assert!((mbps - 1000.0).abs() < 0.01);
        assert_eq!(bandwidth_mbps(1024, 0), 0.0);
    }
}
