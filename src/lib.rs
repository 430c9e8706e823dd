pub mod batch;
pub mod broadcast;
pub mod context;
pub mod device;
pub mod error;
pub mod evaluator;
pub mod hook;
pub mod metrics;
pub mod partition;
pub mod pool;
pub mod queue;
pub mod specs;
pub mod state;
pub mod task;

pub use batch::BatchComputationHook;
pub use device::Device;
pub use error::{DispatchErr, Result};
pub use evaluator::Evaluator;
pub use hook::{Phase, SampleComputationHook};
pub use partition::{Partitioner, Transformed};
pub use queue::ComputationQueue;
pub use specs::DispatchSpec;
pub use state::{ParamMap, StateUpdate};
pub use task::{ResultMap, Sample, SampleId, Task, TaskPayload, Value};
