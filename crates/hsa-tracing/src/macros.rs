//! `perf_span!` and `perf_event!`

/// Create a [`crate::performance::PerformanceSpan`] and emit a debug event
/// carrying the given fields.
///
/// ```rust
/// use hsa_tracing::perf_span;
///
/// {
///     let _span = perf_span!("fill", words = 1024);
///     // fill 1024 words ...
/// } // duration logged here
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let span = $crate::performance::PerformanceSpan::new($name, None);
        {
            let _entered = span.enter();
            $crate::debug!($($field = $value),+, "performance_span_start");
        }
        span
    }};
}

/// Emit a standardised performance event at debug level.
///
/// ```rust
/// use hsa_tracing::perf_event;
///
/// perf_event!("staging_chunk", bytes = 4096, chunk = 3);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}
