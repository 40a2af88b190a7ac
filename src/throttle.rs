/// Counter-based throttle for log lines that would otherwise flood under
/// sustained failure. The first event passes, then every `every`th after.
#[derive(Debug)]
pub struct LogThrottle {
    every: u64,
    count: u64,
}

impl LogThrottle {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Record one event. Returns true when the caller should emit its log line.
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        (self.count - 1) % self.every == 0
    }

    /// Total events recorded so far, for inclusion in the log message.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Re-arm the throttle so the next event logs again.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
