use std::{collections::HashSet, sync::Arc};

use log::{debug, warn};
use ndarray::Array1;

use crate::{
    error::Result,
    evaluator::Evaluator,
    partition::{Partitioner, Transformed},
    queue::ComputationQueue,
    specs::DispatchSpec,
    state::{ParamMap, StateUpdate},
    task::{ResultMap, Sample, SampleId, Value},
};

/// Where the hook currently sits in one step of the enclosing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
    Dispatching,
}

/// Coordinator façade for per-sample computations.
///
/// The enclosing training/inference loop drives it at fixed points:
/// `before_batch` clears stale pending state, `after_forward` partitions and
/// dispatches the batch and publishes its shared state, and
/// `after_optimizer_step` cancels the in-flight work cheaply when the step
/// was skipped. The hook never calls back into the loop.
pub struct SampleComputationHook {
    evaluator: Arc<dyn Evaluator>,
    queue: ComputationQueue,
    partitioner: Partitioner,
    phase: Phase,
}

impl SampleComputationHook {
    pub fn new(evaluator: Arc<dyn Evaluator>, spec: DispatchSpec) -> Self {
        Self {
            evaluator,
            queue: ComputationQueue::new(spec),
            partitioner: Partitioner::new(),
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_sample_selector(
        &mut self,
        selector: impl Fn(SampleId, &Array1<f32>) -> bool + Send + 'static,
    ) {
        self.partitioner.set_selector(selector);
    }

    /// Restricts computation to the given sample ids.
    pub fn set_computed_indices(&mut self, indices: HashSet<SampleId>) {
        self.partitioner.set_computed_indices(indices);
    }

    pub fn set_input_transform(
        &mut self,
        transform: impl Fn(&Sample) -> Result<Transformed> + Send + 'static,
    ) {
        self.partitioner.set_transform(transform);
    }

    /// Worker-side result post-map; must be installed before the first batch.
    pub fn set_result_transform(
        &mut self,
        f: impl Fn(SampleId, Value) -> Value + Send + Sync + 'static,
    ) -> Result<()> {
        self.queue.set_result_transform(f)
    }

    /// Replaces the built-in accumulator with a caller-owned sink.
    pub fn set_result_collection_fun(&mut self, f: impl FnMut(ResultMap) + Send + 'static) {
        self.queue.set_result_collection_fun(f);
    }

    /// Clears any stale pending state left by a prior aborted step.
    ///
    /// A step that completed (or was explicitly skipped) parks the hook in
    /// `Idle`; results still pending then belong to the caller and are kept
    /// for the next fetch. Arriving here still in `Dispatching` means the
    /// prior step never reached `after_optimizer_step`, so whatever it left
    /// in flight is dropped.
    pub fn before_batch(&mut self) -> Result<()> {
        if self.phase == Phase::Dispatching && self.queue.has_unfetched_result() {
            warn!("dropping results left by an aborted step");
            self.queue.fetch(true)?;
        }
        self.transition(Phase::Armed);
        Ok(())
    }

    /// Partitions the batch, submits the resulting tasks and publishes the
    /// batch's shared state — the full snapshot at index 0, a parameter
    /// delta afterward.
    ///
    /// A batch whose every sample is filtered out dispatches nothing and
    /// publishes nothing.
    pub fn after_forward(
        &mut self,
        batch_index: usize,
        samples: Vec<Sample>,
        params: &ParamMap,
    ) -> Result<()> {
        let tasks = self
            .partitioner
            .partition(batch_index, samples, self.queue.worker_num())?;
        if tasks.is_empty() {
            debug!(batch_index = batch_index; "no samples selected");
            return Ok(());
        }

        // Results of the previous batch are folded in before new tasks go
        // out, so the accumulator never mixes unfetched generations.
        self.queue.fetch(false)?;

        let submitted = tasks.len();
        for task in tasks {
            self.queue.add_task(task)?;
        }

        let update = if batch_index == 0 {
            StateUpdate::snapshot(Arc::clone(&self.evaluator), params.clone())
        } else {
            StateUpdate::delta(batch_index, params.clone())
        };
        self.queue.publish(update)?;

        debug!(batch_index = batch_index, tasks = submitted; "batch dispatched");
        self.transition(Phase::Dispatching);
        Ok(())
    }

    /// Cancels the outstanding work when the optimizer step was skipped
    /// upstream; the results would reflect a state the run rolled back.
    pub fn after_optimizer_step(&mut self, step_skipped: bool) -> Result<()> {
        if step_skipped {
            warn!("optimizer step skipped, discarding results");
            self.queue.fetch(true)?;
        }
        self.transition(Phase::Idle);
        Ok(())
    }

    /// Drains every available result, merged with previously fetched ones.
    pub fn result_dict(&mut self) -> Result<&ResultMap> {
        if self.phase == Phase::Dispatching {
            self.transition(Phase::Idle);
        }
        self.queue.result_dict()
    }

    pub fn has_unfetched_result(&self) -> bool {
        self.queue.has_unfetched_result()
    }

    /// Fetches-and-discards anything pending, then clears the accumulator.
    /// Call between runs and at teardown.
    pub fn reset_result(&mut self) -> Result<()> {
        self.queue.reset_result()
    }

    /// Explicit teardown alias used by callers that only hold the hook to
    /// stop its pool.
    pub fn release_queue(&mut self) -> Result<()> {
        self.reset()
    }

    /// Full teardown: rejects unfetched results, then clears the accumulator
    /// and releases the pool and broadcast bus.
    pub fn reset(&mut self) -> Result<()> {
        self.queue.reset()?;
        self.transition(Phase::Idle);
        Ok(())
    }

    fn transition(&mut self, next: Phase) {
        if self.phase != next {
            debug!(from:? = self.phase, to:? = next; "phase change");
            self.phase = next;
        }
    }
}
