use chrono::Utc;

/// Wall clock in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Wall clock driven by tokio's (pausable) monotonic time, so alarms sleeping
/// on tokio timers and the wall time they compare against advance together.
#[cfg(test)]
pub struct MockClock {
    base_ms: std::sync::Mutex<i64>,
    start: tokio::time::Instant,
}

#[cfg(test)]
impl MockClock {
    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            base_ms: std::sync::Mutex::new(base_ms),
            start: tokio::time::Instant::now(),
        }
    }

    /// Jump wall time without moving tokio time (clock change, restart gap)
    pub fn jump(&self, delta_ms: i64) {
        *self.base_ms.lock().unwrap() += delta_ms;
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        let elapsed = self.start.elapsed().as_millis() as i64;
        *self.base_ms.lock().unwrap() + elapsed
    }
}
