use std::time::Duration;

/// Per-worker counters, reported once when the worker stops.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    pub groups: u64,
    pub tasks: u64,
    pub compute_time: Duration,
}

impl WorkerMetrics {
    #[inline]
    pub fn add_group(&mut self, tasks: usize) {
        self.groups += 1;
        self.tasks += tasks as u64;
    }

    #[inline]
    pub fn add_compute(&mut self, elapsed: Duration) {
        self.compute_time += elapsed;
    }
}
