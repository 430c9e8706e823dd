use std::sync::Arc;

use log::{debug, warn};
use ndarray::{Array1, Array2};

use crate::{
    error::{DispatchErr, Result},
    evaluator::Evaluator,
    hook::Phase,
    queue::ComputationQueue,
    specs::DispatchSpec,
    state::{ParamMap, StateUpdate},
    task::{ResultMap, SampleId, Task, TaskPayload, Value},
};

/// Produces the batch-level vectors to fan out (e.g. HVP seed vectors);
/// polled once per batch.
pub type DataFun = dyn FnMut() -> Vec<Array1<f32>> + Send;

/// Coordinator façade for batch-level computations.
///
/// Instead of partitioning samples, each batch fans a caller-supplied list
/// of vectors out across the pool; every task carries the full batch plus a
/// chunk of vectors, and results are keyed by vector position.
pub struct BatchComputationHook {
    evaluator: Arc<dyn Evaluator>,
    queue: ComputationQueue,
    data_fun: Option<Box<DataFun>>,
    phase: Phase,
}

impl BatchComputationHook {
    pub fn new(evaluator: Arc<dyn Evaluator>, spec: DispatchSpec) -> Self {
        Self {
            evaluator,
            queue: ComputationQueue::new(spec),
            data_fun: None,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_data_fun(&mut self, f: impl FnMut() -> Vec<Array1<f32>> + Send + 'static) {
        self.data_fun = Some(Box::new(f));
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
    pub fn before_batch(&mut self) -> Result<()> {
        if self.phase == Phase::Dispatching && self.queue.has_unfetched_result() {
            warn!("dropping results left by an aborted step");
            self.queue.fetch(true)?;
        }
        self.phase = Phase::Armed;
        Ok(())
    }

    /// Polls the data function and fans its vectors out across the pool,
    /// then publishes the batch's shared state.
    ///
    /// # Errors
    /// Fails fast when no data function was configured. An empty vector list
    /// dispatches nothing.
    pub fn after_forward(
        &mut self,
        batch_index: usize,
        inputs: Array2<f32>,
        targets: Array2<f32>,
        params: &ParamMap,
    ) -> Result<()> {
        let data_fun = self.data_fun.as_mut().ok_or(DispatchErr::Config {
            what: "batch hook used without a data function",
        })?;

        let vectors = data_fun();
        if vectors.is_empty() {
            debug!(batch_index = batch_index; "data function produced nothing");
            return Ok(());
        }

        self.queue.reset_result()?;

        let submitted = self.submit_chunks(batch_index, inputs, targets, vectors)?;

        let update = if batch_index == 0 {
            StateUpdate::snapshot(Arc::clone(&self.evaluator), params.clone())
        } else {
            StateUpdate::delta(batch_index, params.clone())
        };
        self.queue.publish(update)?;

        debug!(batch_index = batch_index, tasks = submitted; "batch dispatched");
        self.phase = Phase::Dispatching;
        Ok(())
    }

    /// Chunks the vectors evenly across the worker count; chunk boundaries
    /// become the `first_id` offsets that key the results.
    fn submit_chunks(
        &mut self,
        batch_index: usize,
        inputs: Array2<f32>,
        targets: Array2<f32>,
        mut vectors: Vec<Array1<f32>>,
    ) -> Result<usize> {
        let total = vectors.len();
        let chunks = self.queue.worker_num().get().min(total);
        let base = total / chunks;
        let extra = total % chunks;

        let mut first_id: SampleId = 0;
        for i in 0..chunks {
            let size = base + usize::from(i < extra);
            let rest = vectors.split_off(size);

            self.queue.add_task(Task::new(
                batch_index,
                TaskPayload::Vectors {
                    inputs: inputs.clone(),
                    targets: targets.clone(),
                    first_id,
                    vectors,
                },
            ))?;

            first_id += size as SampleId;
            vectors = rest;
        }

        Ok(chunks)
    }

    /// Cancels the outstanding work when the optimizer step was skipped
    /// upstream.
    pub fn after_optimizer_step(&mut self, step_skipped: bool) -> Result<()> {
        if step_skipped {
            warn!("optimizer step skipped, discarding results");
            self.queue.fetch(true)?;
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Drains every available result, merged with previously fetched ones.
    pub fn result_dict(&mut self) -> Result<&ResultMap> {
        self.phase = Phase::Idle;
        self.queue.result_dict()
    }

    pub fn has_unfetched_result(&self) -> bool {
        self.queue.has_unfetched_result()
    }

    /// Fetches-and-discards anything pending, then clears the accumulator.
    pub fn reset_result(&mut self) -> Result<()> {
        self.queue.reset_result()
    }

    /// Explicit teardown alias.
    pub fn release_queue(&mut self) -> Result<()> {
        self.reset()
    }

    /// Full teardown: rejects unfetched results, then releases the pool.
    pub fn reset(&mut self) -> Result<()> {
        self.queue.reset()?;
        self.phase = Phase::Idle;
        Ok(())
    }
}
