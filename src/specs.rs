use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

use crate::device::device_count;

const DEFAULT_GROUP_CAP: NonZeroUsize = NonZeroUsize::new(16).unwrap();
const DEFAULT_RESULT_WAIT_SECS: u64 = 30;

/// Sizing and timing knobs for the dispatch engine.
///
/// Every field has a working default; specs are plain data and can be read
/// from JSON at the binary boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSpec {
    /// Worker count; falls back to the detected device count.
    pub worker_num: Option<NonZeroUsize>,
    /// Most same-batch tasks a worker folds into one invocation.
    pub group_cap: NonZeroUsize,
    /// Bound on one result wait before escalating a wedged worker.
    pub result_wait_secs: u64,
}

impl Default for DispatchSpec {
    fn default() -> Self {
        Self {
            worker_num: None,
            group_cap: DEFAULT_GROUP_CAP,
            result_wait_secs: DEFAULT_RESULT_WAIT_SECS,
        }
    }
}

impl DispatchSpec {
    pub fn resolve_worker_num(&self) -> NonZeroUsize {
        self.worker_num.unwrap_or_else(device_count)
    }

    pub fn result_wait(&self) -> Duration {
        Duration::from_secs(self.result_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let spec: DispatchSpec = serde_json::from_str("{\"worker_num\": 2}").unwrap();
        assert_eq!(spec.worker_num, NonZeroUsize::new(2));
        assert_eq!(spec.group_cap, DEFAULT_GROUP_CAP);
        assert_eq!(spec.result_wait_secs, DEFAULT_RESULT_WAIT_SECS);
    }

    #[test]
    fn explicit_worker_num_wins_over_detection() {
        let spec = DispatchSpec {
            worker_num: NonZeroUsize::new(3),
            ..Default::default()
        };
        assert_eq!(spec.resolve_worker_num(), NonZeroUsize::new(3).unwrap());
    }
}
