use std::collections::HashMap;

use ndarray::{Array1, Array2};

/// Identifier of one sample (or derived sample) within a batch.
pub type SampleId = u64;

/// Value computed for one sample: a flat tensor, or a single-element array
/// for scalar results.
pub type Value = Array1<f32>;

/// Per-sample results keyed by id. Ids are unique within a batch, so merging
/// maps from different workers is commutative.
pub type ResultMap = HashMap<SampleId, Value>;

/// One element of a batch as handed over by the training loop.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: SampleId,
    pub input: Array1<f32>,
    pub target: Array1<f32>,
}

impl Sample {
    pub fn new(id: SampleId, input: Array1<f32>, target: Array1<f32>) -> Self {
        Self { id, input, target }
    }
}

/// Work carried by one task.
#[derive(Debug)]
pub enum TaskPayload {
    /// Per-sample work: one evaluator invocation covers the whole group.
    Samples(Vec<Sample>),
    /// Batch-level work: the full batch plus a chunk of seed vectors, with
    /// results keyed by vector position starting at `first_id`.
    Vectors {
        inputs: Array2<f32>,
        targets: Array2<f32>,
        first_id: SampleId,
        vectors: Vec<Array1<f32>>,
    },
}

/// One unit of dispatched computation.
///
/// Owned by the coordinator until enqueued; ownership transfers to whichever
/// worker dequeues it.
#[derive(Debug)]
pub struct Task {
    pub batch_index: usize,
    pub payload: TaskPayload,
}

impl Task {
    pub fn new(batch_index: usize, payload: TaskPayload) -> Self {
        Self {
            batch_index,
            payload,
        }
    }
}

/// Message consumed by worker threads on the task channel.
#[derive(Debug)]
pub enum TaskMsg {
    Compute(Task),
    Stop,
}

/// Result of one worker invocation, covering `count` dequeued tasks.
///
/// Owned by the worker until handed back on the result channel. Failures are
/// shipped as rendered detail so the coordinator can decide abort-vs-skip.
#[derive(Debug)]
pub struct TaskOutput {
    pub worker_id: usize,
    pub batch_index: usize,
    pub count: usize,
    pub outcome: std::result::Result<ResultMap, String>,
}
