//! Store configuration and injected time source

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time used to stamp loaded snapshots.
///
/// Injected through [`StoreConfig`] so tests can control `loaded_at`
/// ordering without sleeping.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Clock backed by [`SystemTime`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Configuration for a [`Store`](crate::Store)
#[derive(Clone)]
pub struct StoreConfig {
    /// Label attached to every log event emitted by the store (default: "store")
    pub label: String,
    /// Time source for snapshot timestamps (default: [`SystemClock`])
    pub clock: Arc<dyn Clock>,
    /// Fail staleness resolution with `CycleDetected` on cyclic ledgers
    /// (default: true)
    pub detect_cycles: bool,
}

impl StoreConfig {
    /// Set the log label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable or disable cycle detection
    pub fn with_cycle_detection(mut self, enabled: bool) -> Self {
        self.detect_cycles = enabled;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            label: "store".to_string(),
            clock: Arc::new(SystemClock),
            detect_cycles: true,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("label", &self.label)
            .field("detect_cycles", &self.detect_cycles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.label, "store");
        assert!(config.detect_cycles);
        assert!(config.clock.now_ms() > 0);
    }

    #[test]
    fn test_builder_setters() {
        let config = StoreConfig::default()
            .with_label("ui")
            .with_clock(Arc::new(FixedClock(7)))
            .with_cycle_detection(false);
        assert_eq!(config.label, "ui");
        assert_eq!(config.clock.now_ms(), 7);
        assert!(!config.detect_cycles);
        assert!(format!("{config:?}").contains("ui"));
    }
}
