use chrono::{DateTime, Duration, Utc};

/// Time source injected into the engine so periodic checks and window math
/// can be driven deterministically in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Lazily evaluated periodic check: "due" at most once per interval.
///
/// The engine has no independent timers; cadence depends on how often
/// signals arrive and the gate is consulted.
#[derive(Debug, Clone)]
pub struct IntervalGate {
    every: Duration,
    last: Option<DateTime<Utc>>,
}

impl IntervalGate {
    pub fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    /// True if the interval has elapsed since the last `mark` (or never marked)
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) => now - last >= self.every,
            None => true,
        }
    }

    pub fn mark(&mut self, now: DateTime<Utc>) {
        self.last = Some(now);
    }
}
