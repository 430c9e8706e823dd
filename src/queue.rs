use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use log::{debug, warn};

use crate::{
    device::Device,
    error::{DispatchErr, Result},
    pool::{WorkerFn, WorkerPool},
    specs::DispatchSpec,
    state::{CachedState, StateUpdate},
    task::{ResultMap, SampleId, Task, Value},
};

/// Coordinator-side sink fed with each result batch instead of the built-in
/// accumulator.
pub type CollectionFun = dyn FnMut(ResultMap) + Send;

/// Per-sample post-map applied on the worker, cached in its context.
pub type ResultTransform = dyn Fn(SampleId, Value) -> Value + Send + Sync;

/// Coordinator side of the dispatch engine.
///
/// Owns the pending-task counter and the result accumulator, and lazily
/// starts the worker pool on first use. `add_task` never blocks; results are
/// pulled on demand and either merged or discarded.
pub struct ComputationQueue {
    spec: DispatchSpec,
    pool: Option<WorkerPool>,
    transform: Option<Arc<ResultTransform>>,
    collection_fun: Option<Box<CollectionFun>>,
    pending: usize,
    results: ResultMap,
}

impl ComputationQueue {
    pub fn new(spec: DispatchSpec) -> Self {
        Self {
            spec,
            pool: None,
            transform: None,
            collection_fun: None,
            pending: 0,
            results: ResultMap::new(),
        }
    }

    pub fn worker_num(&self) -> NonZeroUsize {
        match &self.pool {
            Some(pool) => pool.worker_num(),
            None => self.spec.resolve_worker_num(),
        }
    }

    /// Installs a worker-side result transform.
    ///
    /// # Errors
    /// The transform is baked into the worker function at pool start, so it
    /// must be set before the first task.
    pub fn set_result_transform(
        &mut self,
        f: impl Fn(SampleId, Value) -> Value + Send + Sync + 'static,
    ) -> Result<()> {
        if self.pool.is_some() {
            return Err(DispatchErr::Config {
                what: "result transform set after the pool started",
            });
        }
        self.transform = Some(Arc::new(f));
        Ok(())
    }

    /// Routes fetched result batches to `f` instead of the accumulator.
    pub fn set_result_collection_fun(&mut self, f: impl FnMut(ResultMap) + Send + 'static) {
        self.collection_fun = Some(Box::new(f));
    }

    /// Submits one task, starting the pool on first use. Never waits for a
    /// result.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        self.pool()?.submit(task)?;
        self.pending += 1;
        Ok(())
    }

    /// Publishes a one-shot state update for the batch being dispatched.
    pub fn publish(&mut self, update: StateUpdate) -> Result<()> {
        let batch_index = update.batch_index();
        let started = Instant::now();
        self.pool()?.publish(update)?;
        debug!(
            batch_index = batch_index,
            elapsed_us = started.elapsed().as_micros() as u64;
            "one-shot broadcast"
        );
        Ok(())
    }

    pub fn has_unfetched_result(&self) -> bool {
        self.pending != 0
    }

    /// Tasks submitted and not yet covered by a received result.
    pub fn pending_tasks(&self) -> usize {
        self.pending
    }

    /// Drains the result channel until nothing is pending.
    ///
    /// With `drop` set, everything received is discarded — the cancellation
    /// path for a skipped step. Otherwise each result batch is merged into
    /// the accumulator (or handed to the collection function), and a failure
    /// result is propagated after its count is accounted for.
    pub fn fetch(&mut self, drop: bool) -> Result<()> {
        let wait = self.spec.result_wait();

        while self.pending != 0 {
            let Some(pool) = &self.pool else {
                return Err(DispatchErr::Disconnected { channel: "result" });
            };

            let out = pool.recv_output(wait, self.pending)?;
            if out.count > self.pending {
                return Err(DispatchErr::PendingUnderflow {
                    pending: self.pending,
                    reported: out.count,
                });
            }
            self.pending -= out.count;

            match out.outcome {
                Ok(map) => {
                    if drop {
                        continue;
                    }
                    match &mut self.collection_fun {
                        Some(f) => f(map),
                        // Ids are unique per batch, so a plain union is
                        // commutative across workers.
                        None => self.results.extend(map),
                    }
                }
                Err(detail) => {
                    if drop {
                        warn!(
                            worker_id = out.worker_id,
                            batch_index = out.batch_index;
                            "discarding failed result"
                        );
                        continue;
                    }
                    return Err(DispatchErr::WorkerFailure {
                        worker_id: out.worker_id,
                        batch_index: out.batch_index,
                        detail,
                    });
                }
            }
        }

        Ok(())
    }

    /// Fetches everything outstanding and returns the merged results.
    pub fn result_dict(&mut self) -> Result<&ResultMap> {
        self.fetch(false)?;
        Ok(&self.results)
    }

    /// Fetches-and-discards anything pending, then clears the accumulator.
    pub fn reset_result(&mut self) -> Result<()> {
        self.fetch(true)?;
        self.results.clear();
        Ok(())
    }

    /// Full teardown: rejects unfetched results, then releases the pool.
    pub fn reset(&mut self) -> Result<()> {
        if self.pending != 0 {
            return Err(DispatchErr::ReleaseWithPending {
                pending: self.pending,
            });
        }

        self.results.clear();
        if let Some(pool) = self.pool.take() {
            pool.release()?;
        }
        Ok(())
    }

    fn pool(&mut self) -> Result<&mut WorkerPool> {
        if self.pool.is_none() {
            let worker_fn = build_worker_fn(self.transform.clone());
            self.pool = Some(WorkerPool::start(&self.spec, worker_fn)?);
        }

        match &mut self.pool {
            Some(pool) => Ok(pool),
            None => Err(DispatchErr::Disconnected { channel: "task" }),
        }
    }
}

/// One worker invocation: evaluate each task in the group with the cached
/// state, applying the result transform where configured.
fn build_worker_fn(transform: Option<Arc<ResultTransform>>) -> Arc<WorkerFn> {
    Arc::new(move |group: &[Task], state: &CachedState, device: Device| {
        let mut merged = ResultMap::new();

        for task in group {
            let computed = state.evaluator.evaluate(&state.params, &task.payload, device)?;
            match &transform {
                Some(t) => {
                    merged.reserve(computed.len());
                    for (id, value) in computed {
                        merged.insert(id, t(id, value));
                    }
                }
                None => merged.extend(computed),
            }
        }

        Ok(merged)
    })
}
