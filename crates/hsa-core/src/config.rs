//! Runtime configuration

use std::env;
use std::time::Duration;

/// Tunables read once when a runtime is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Block on signal notifications. When false every wait also re-checks
    /// its condition each `poll_interval`.
    pub use_interrupt_wait: bool,
    /// Upper bound on a single blocking wait slice in polling mode.
    pub poll_interval: Duration,
    /// Chunk size of the staging buffer used for unpinnable user memory.
    pub staging_buffer_size: usize,
    /// Try to page-lock user memory before falling back to staging.
    pub enable_pinned_copy: bool,
    /// How long shutdown waits for the async event thread before detaching it.
    pub monitor_join_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            use_interrupt_wait: true,
            poll_interval: Duration::from_micros(200),
            staging_buffer_size: 4 * 1024 * 1024,
            enable_pinned_copy: true,
            monitor_join_timeout: Duration::from_millis(5_000),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration using environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `HSA_ENABLE_INTERRUPT` - `0` switches signal waits to polling
    /// - `HSA_POLL_INTERVAL_US` - polling slice in microseconds
    /// - `HSA_STAGING_BUFFER_SIZE` - staging chunk size in bytes
    /// - `HSA_ENABLE_PINNED_COPY` - `0` always stages user memory
    /// - `HSA_MONITOR_JOIN_TIMEOUT_MS` - async event thread join bound
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = env_flag("HSA_ENABLE_INTERRUPT") {
            config.use_interrupt_wait = enabled;
        }

        if let Some(us) = env_number("HSA_POLL_INTERVAL_US") {
            if us > 0 {
                config.poll_interval = Duration::from_micros(us);
            }
        }

        if let Some(size) = env_number("HSA_STAGING_BUFFER_SIZE") {
            if size > 0 {
                config.staging_buffer_size = size as usize;
            }
        }

        if let Some(enabled) = env_flag("HSA_ENABLE_PINNED_COPY") {
            config.enable_pinned_copy = enabled;
        }

        if let Some(ms) = env_number("HSA_MONITOR_JOIN_TIMEOUT_MS") {
            config.monitor_join_timeout = Duration::from_millis(ms);
        }

        config
    }

    /// Longest single block a signal wait may perform, if bounded.
    pub(crate) fn wait_slice(&self) -> Option<Duration> {
        if self.use_interrupt_wait {
            None
        } else {
            Some(self.poll_interval)
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim() {
        "0" => Some(false),
        "1" => Some(true),
        other if other.eq_ignore_ascii_case("false") => Some(false),
        other if other.eq_ignore_ascii_case("true") => Some(true),
        _ => None,
    }
}

fn env_number(key: &str) -> Option<u64> {
    env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "HSA_ENABLE_INTERRUPT",
        "HSA_POLL_INTERVAL_US",
        "HSA_STAGING_BUFFER_SIZE",
        "HSA_ENABLE_PINNED_COPY",
        "HSA_MONITOR_JOIN_TIMEOUT_MS",
    ];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        reset_env();
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
        assert_eq!(RuntimeConfig::default().wait_slice(), None);
    }

    #[test]
    #[serial]
    fn reads_overrides() {
        reset_env();
        env::set_var("HSA_ENABLE_INTERRUPT", "0");
        env::set_var("HSA_POLL_INTERVAL_US", "50");
        env::set_var("HSA_STAGING_BUFFER_SIZE", "65536");
        env::set_var("HSA_ENABLE_PINNED_COPY", "false");
        env::set_var("HSA_MONITOR_JOIN_TIMEOUT_MS", "100");

        let config = RuntimeConfig::from_env();
        assert!(!config.use_interrupt_wait);
        assert_eq!(config.poll_interval, Duration::from_micros(50));
        assert_eq!(config.wait_slice(), Some(Duration::from_micros(50)));
        assert_eq!(config.staging_buffer_size, 65536);
        assert!(!config.enable_pinned_copy);
        assert_eq!(config.monitor_join_timeout, Duration::from_millis(100));

        reset_env();
    }

    #[test]
    #[serial]
    fn ignores_garbage() {
        reset_env();
        env::set_var("HSA_ENABLE_INTERRUPT", "maybe");
        env::set_var("HSA_STAGING_BUFFER_SIZE", "0");
        env::set_var("HSA_POLL_INTERVAL_US", "-3");

        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());

        reset_env();
    }
}
