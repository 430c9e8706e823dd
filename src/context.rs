use std::{sync::Arc, time::Instant};

use log::trace;

use crate::{
    broadcast::StateSub,
    device::{Device, Stream},
    metrics::WorkerMetrics,
    pool::WorkerFn,
    task::{Task, TaskOutput},
};

/// Per-worker cache of everything expensive to resolve.
///
/// Device and stream handles, the worker function (with any result transform
/// already baked in), and the merged shared-state copy all live here for the
/// lifetime of the worker thread, so none of it is re-resolved per task.
/// Replaces thread-local attribute storage with an explicit struct owned by
/// the worker loop.
pub struct WorkerContext {
    worker_id: usize,
    device: Device,
    stream: Stream,
    worker_fn: Arc<WorkerFn>,
    states: StateSub,
    metrics: WorkerMetrics,
}

impl WorkerContext {
    pub(crate) fn new(
        worker_id: usize,
        device: Device,
        worker_fn: Arc<WorkerFn>,
        states: StateSub,
    ) -> Self {
        Self {
            worker_id,
            device,
            stream: Stream::new(device),
            worker_fn,
            states,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Runs the worker function over one group of same-batch tasks.
    ///
    /// Resolves the shared state through the cache first; any failure — state
    /// protocol or evaluator — is rendered into the output rather than
    /// unwinding the worker thread.
    pub(crate) fn compute(&mut self, batch_index: usize, group: &[Task]) -> TaskOutput {
        let started = Instant::now();
        let token = self.stream.advance();

        let outcome = match self.states.current(batch_index) {
            Ok(state) => (self.worker_fn)(group, state, self.device).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        self.metrics.add_group(group.len());
        self.metrics.add_compute(started.elapsed());
        trace!(
            worker_id = self.worker_id,
            batch_index = batch_index,
            stream_token = token,
            tasks = group.len();
            "task group computed"
        );

        TaskOutput {
            worker_id: self.worker_id,
            batch_index,
            count: group.len(),
            outcome,
        }
    }
}
