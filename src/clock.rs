use chrono::{DateTime, Utc};

/// Source of wall-clock time.
///
/// The coordinator and workers read time through this trait so that
/// retry-delay arithmetic and lease checks are deterministic under test.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
