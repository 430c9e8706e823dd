use crate::{
    device::Device,
    error::Result,
    state::ParamMap,
    task::{ResultMap, TaskPayload},
};

/// The numeric computation run inside a worker.
///
/// Supplied by the caller and shipped to the pool inside the batch-0 state
/// snapshot; invoked once per task group with the worker's locally cached
/// parameters. Implementations that only support one payload kind should
/// reject the other with a `Config` error.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        params: &ParamMap,
        payload: &TaskPayload,
        device: Device,
    ) -> Result<ResultMap>;
}
