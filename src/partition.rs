use std::{collections::HashSet, num::NonZeroUsize};

use ndarray::Array1;

use crate::{
    error::Result,
    task::{Sample, SampleId, Task, TaskPayload},
};

/// Predicate deciding whether a sample is computed at all.
pub type SampleSelector = dyn Fn(SampleId, &Array1<f32>) -> bool + Send;

/// Outcome of the input transform for one selected sample.
#[derive(Debug)]
pub enum Transformed {
    /// Keep the sample as-is.
    Keep,
    /// Replace it with zero or more derived samples, each carrying its own
    /// id, input and target.
    Expand(Vec<Sample>),
}

/// Input-rewriting transform; an unsupported shape fails the whole batch
/// before any task is submitted.
pub type InputTransform = dyn Fn(&Sample) -> Result<Transformed> + Send;

/// Turns one logical batch into per-worker task chunks.
#[derive(Default)]
pub struct Partitioner {
    selector: Option<Box<SampleSelector>>,
    transform: Option<Box<InputTransform>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_selector(&mut self, selector: impl Fn(SampleId, &Array1<f32>) -> bool + Send + 'static) {
        self.selector = Some(Box::new(selector));
    }

    /// Restricts computation to the given sample ids.
    pub fn set_computed_indices(&mut self, indices: HashSet<SampleId>) {
        self.set_selector(move |id, _input| indices.contains(&id));
    }

    pub fn set_transform(&mut self, transform: impl Fn(&Sample) -> Result<Transformed> + Send + 'static) {
        self.transform = Some(Box::new(transform));
    }

    /// Applies selection and transformation, then chunks the survivors into
    /// tasks balanced across `worker_num` workers.
    ///
    /// # Returns
    /// Zero tasks when every sample was filtered out; otherwise up to
    /// `worker_num` tasks whose sizes differ by at most one.
    pub fn partition(
        &self,
        batch_index: usize,
        samples: Vec<Sample>,
        worker_num: NonZeroUsize,
    ) -> Result<Vec<Task>> {
        let mut processed: Vec<Sample> = Vec::with_capacity(samples.len());

        for sample in samples {
            if let Some(selector) = &self.selector
                && !selector(sample.id, &sample.input)
            {
                continue;
            }

            match &self.transform {
                None => processed.push(sample),
                Some(transform) => match transform(&sample)? {
                    Transformed::Keep => processed.push(sample),
                    Transformed::Expand(derived) => processed.extend(derived),
                },
            }
        }

        Ok(chunk_evenly(processed, worker_num)
            .into_iter()
            .map(|group| Task::new(batch_index, TaskPayload::Samples(group)))
            .collect())
    }
}

/// Splits `samples` into at most `worker_num` non-empty chunks whose sizes
/// differ by at most one.
fn chunk_evenly(mut samples: Vec<Sample>, worker_num: NonZeroUsize) -> Vec<Vec<Sample>> {
    let total = samples.len();
    if total == 0 {
        return Vec::new();
    }

    let chunks = worker_num.get().min(total);
    let base = total / chunks;
    let extra = total % chunks;

    let mut out = Vec::with_capacity(chunks);
    for i in 0..chunks {
        let size = base + usize::from(i < extra);
        let rest = samples.split_off(size);
        out.push(samples);
        samples = rest;
    }

    out
}
