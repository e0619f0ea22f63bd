use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Lock-free counters and gauges, rendered in a line-oriented text format
/// over the HTTP exposer's `/metrics` route.
#[derive(Default)]
pub struct Metrics {
    submitted: AtomicI64,
    rejected: AtomicI64,
    running: AtomicI64,
    succeeded: AtomicI64,
    failed: AtomicI64,
    timeout: AtomicI64,
    launch_failed: AtomicI64,
    pressure_blocked: AtomicI64,
    pressure_active: AtomicBool,
    queue_wait_ms_total: AtomicI64,
    queue_wait_count: AtomicI64,
    queue_wait_ms_max: AtomicI64,
    pending: AtomicI64,
}

/// A consistent-per-field (but not cross-field) read of every counter and
/// gauge at one instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub submitted: i64,
    pub rejected: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub timeout: i64,
    pub launch_failed: i64,
    pub pressure_blocked: i64,
    pub pressure_active: bool,
    pub queue_wait_ms_total: i64,
    pub queue_wait_count: i64,
    pub queue_wait_ms_max: i64,
    pub pending: i64,
}

impl Metrics {
    pub fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_running(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_running(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
    pub fn inc_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_launch_failed(&self) {
        self.launch_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_pressure_blocked(&self) {
        self.pressure_blocked.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_pressure_active(&self, active: bool) {
        self.pressure_active.store(active, Ordering::Relaxed);
    }
    pub fn set_pending(&self, n: i64) {
        self.pending.store(n, Ordering::Relaxed);
    }

    /// Adds `ms` to the running total, increments the sample count, and
    /// monotonically raises the max via a compare-and-swap loop.
    pub fn record_queue_wait(&self, ms: i64) {
        self.queue_wait_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.queue_wait_count.fetch_add(1, Ordering::Relaxed);
        let mut prev = self.queue_wait_ms_max.load(Ordering::Relaxed);
        while ms > prev {
            match self.queue_wait_ms_max.compare_exchange_weak(
                prev,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            launch_failed: self.launch_failed.load(Ordering::Relaxed),
            pressure_blocked: self.pressure_blocked.load(Ordering::Relaxed),
            pressure_active: self.pressure_active.load(Ordering::Relaxed),
            queue_wait_ms_total: self.queue_wait_ms_total.load(Ordering::Relaxed),
            queue_wait_count: self.queue_wait_count.load(Ordering::Relaxed),
            queue_wait_ms_max: self.queue_wait_ms_max.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    pub fn to_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "# TYPE tasks_total counter\n\
             tasks_total{{status=\"submitted\"}} {}\n\
             tasks_total{{status=\"rejected\"}} {}\n\
             tasks_total{{status=\"succeeded\"}} {}\n\
             tasks_total{{status=\"failed\"}} {}\n\
             tasks_total{{status=\"timeout\"}} {}\n\
             tasks_total{{status=\"launch_failed\"}} {}\n\
             # TYPE tasks_running_current gauge\n\
             tasks_running_current {}\n\
             # TYPE tasks_pending_current gauge\n\
             tasks_pending_current {}\n\
             # TYPE tasks_pressure_blocked_total counter\n\
             tasks_pressure_blocked_total {}\n\
             # TYPE tasks_pressure_active gauge\n\
             tasks_pressure_active {}\n\
             # TYPE tasks_queue_wait_ms_total counter\n\
             tasks_queue_wait_ms_total {}\n\
             # TYPE tasks_queue_wait_count counter\n\
             tasks_queue_wait_count {}\n\
             # TYPE tasks_queue_wait_ms_max gauge\n\
             tasks_queue_wait_ms_max {}\n",
            s.submitted,
            s.rejected,
            s.succeeded,
            s.failed,
            s.timeout,
            s.launch_failed,
            s.running,
            s.pending,
            s.pressure_blocked,
            s.pressure_active as i64,
            s.queue_wait_ms_total,
            s.queue_wait_count,
            s.queue_wait_ms_max,
        )
    }
}
