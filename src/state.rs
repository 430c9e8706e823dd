use std::{collections::BTreeMap, sync::Arc};

use ndarray::{Array1, Zip};

use crate::evaluator::Evaluator;

/// Named flat parameter buffers of the model under evaluation.
pub type ParamMap = BTreeMap<String, Array1<f32>>;

/// Full evaluator snapshot published at batch index 0.
pub struct Snapshot {
    pub evaluator: Arc<dyn Evaluator>,
    pub params: ParamMap,
}

/// One-shot state update published on the broadcast bus.
///
/// Exactly one `Snapshot` exists, at index 0; later indices carry parameter
/// deltas merged by name into each worker's cached copy. Refcounted payloads
/// keep the fan-out to N workers cheap.
#[derive(Clone)]
pub enum StateUpdate {
    Snapshot {
        batch_index: usize,
        snapshot: Arc<Snapshot>,
    },
    Delta {
        batch_index: usize,
        params: Arc<ParamMap>,
    },
}

impl StateUpdate {
    /// The batch-0 full snapshot.
    pub fn snapshot(evaluator: Arc<dyn Evaluator>, params: ParamMap) -> Self {
        Self::Snapshot {
            batch_index: 0,
            snapshot: Arc::new(Snapshot { evaluator, params }),
        }
    }

    /// A parameter-only update for a later batch.
    pub fn delta(batch_index: usize, params: ParamMap) -> Self {
        Self::Delta {
            batch_index,
            params: Arc::new(params),
        }
    }

    pub fn batch_index(&self) -> usize {
        match self {
            StateUpdate::Snapshot { batch_index, .. } => *batch_index,
            StateUpdate::Delta { batch_index, .. } => *batch_index,
        }
    }
}

/// A worker's locally owned merged copy of the shared state.
///
/// The snapshot parameters are cloned out of the shared payload exactly once,
/// at index 0; every later delta is merged in place. Never shared between
/// workers.
pub struct CachedState {
    pub batch_index: usize,
    pub evaluator: Arc<dyn Evaluator>,
    pub params: ParamMap,
}

impl std::fmt::Debug for CachedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedState")
            .field("batch_index", &self.batch_index)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl CachedState {
    pub fn from_snapshot(batch_index: usize, snapshot: &Snapshot) -> Self {
        Self {
            batch_index,
            evaluator: Arc::clone(&snapshot.evaluator),
            params: snapshot.params.clone(),
        }
    }

    /// Merges a delta into the cached parameters and advances the version.
    ///
    /// Buffers that kept their shape are overwritten elementwise in parallel;
    /// renamed or reshaped entries are replaced wholesale.
    pub fn apply(&mut self, batch_index: usize, delta: &ParamMap) {
        for (name, src) in delta {
            let replace = match self.params.get_mut(name) {
                Some(dst) if dst.len() == src.len() => {
                    Zip::from(dst.view_mut())
                        .and(src.view())
                        .par_for_each(|d, &s| *d = s);
                    false
                }
                _ => true,
            };

            if replace {
                self.params.insert(name.clone(), src.clone());
            }
        }

        self.batch_index = batch_index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::Device,
        error::Result,
        task::{ResultMap, TaskPayload},
    };

    struct NoopEvaluator;

    impl Evaluator for NoopEvaluator {
        fn evaluate(
            &self,
            _params: &ParamMap,
            _payload: &TaskPayload,
            _device: Device,
        ) -> Result<ResultMap> {
            Ok(ResultMap::new())
        }
    }

    fn params(marker: f32) -> ParamMap {
        ParamMap::from([
            ("weight".to_string(), Array1::from_elem(4, 1.0)),
            ("marker".to_string(), Array1::from_elem(1, marker)),
        ])
    }

    #[test]
    fn delta_overwrites_only_named_buffers() {
        let snapshot = Snapshot {
            evaluator: Arc::new(NoopEvaluator),
            params: params(1.0),
        };
        let mut cached = CachedState::from_snapshot(0, &snapshot);

        let delta = ParamMap::from([("marker".to_string(), Array1::from_elem(1, 2.0))]);
        cached.apply(1, &delta);

        assert_eq!(cached.batch_index, 1);
        assert_eq!(cached.params["marker"][0], 2.0);
        assert_eq!(cached.params["weight"], snapshot.params["weight"]);
    }

    #[test]
    fn reshaped_delta_replaces_the_buffer() {
        let snapshot = Snapshot {
            evaluator: Arc::new(NoopEvaluator),
            params: params(1.0),
        };
        let mut cached = CachedState::from_snapshot(0, &snapshot);

        let delta = ParamMap::from([("weight".to_string(), Array1::from_elem(6, 3.0))]);
        cached.apply(1, &delta);

        assert_eq!(cached.params["weight"].len(), 6);
        assert_eq!(cached.params["weight"][5], 3.0);
    }
}
