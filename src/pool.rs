use std::{
    num::NonZeroUsize,
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::debug;
use parking_lot::Mutex;

use crate::{
    broadcast::StateBus,
    context::WorkerContext,
    device::{Device, device_count},
    error::{DispatchErr, Result},
    specs::DispatchSpec,
    state::{CachedState, StateUpdate},
    task::{ResultMap, Task, TaskMsg, TaskOutput},
};

/// Invocation run by a worker over one group of same-batch tasks.
pub type WorkerFn = dyn Fn(&[Task], &CachedState, Device) -> Result<ResultMap> + Send + Sync;

type SharedTaskRx = Arc<Mutex<mpsc::Receiver<TaskMsg>>>;

/// Pool of persistent device-bound worker threads.
///
/// Workers consume one shared task channel and produce one result channel.
/// All other state flows through the broadcast bus; workers share no mutable
/// heap with each other or the coordinator.
pub struct WorkerPool {
    task_tx: mpsc::Sender<TaskMsg>,
    result_rx: mpsc::Receiver<TaskOutput>,
    bus: StateBus,
    workers: Vec<JoinHandle<()>>,
    worker_num: NonZeroUsize,
}

impl WorkerPool {
    /// Allocates the channels and spawns one worker per device.
    ///
    /// # Arguments
    /// * `spec` - Pool sizing and timing knobs.
    /// * `worker_fn` - The invocation each worker runs per task group;
    ///   resolved once per worker and cached in its context.
    pub fn start(spec: &DispatchSpec, worker_fn: Arc<WorkerFn>) -> Result<Self> {
        let worker_num = spec.resolve_worker_num();
        let devices = device_count();
        let group_cap = spec.group_cap.get();

        let (task_tx, task_rx) = mpsc::channel();
        let task_rx: SharedTaskRx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::channel();
        let (bus, subs) = StateBus::new(worker_num.get());

        let mut workers = Vec::with_capacity(worker_num.get());
        for (worker_id, states) in subs.into_iter().enumerate() {
            let device = Device::new(worker_id % devices.get());
            let ctx = WorkerContext::new(worker_id, device, Arc::clone(&worker_fn), states);
            let tasks = Arc::clone(&task_rx);
            let results = result_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("dispatch-worker-{worker_id}"))
                .spawn(move || worker_loop(ctx, tasks, results, group_cap))?;
            workers.push(handle);
        }

        debug!(
            worker_num = worker_num.get(),
            devices = devices.get();
            "worker pool started"
        );

        Ok(Self {
            task_tx,
            result_rx,
            bus,
            workers,
            worker_num,
        })
    }

    pub fn worker_num(&self) -> NonZeroUsize {
        self.worker_num
    }

    /// Enqueues one task without waiting for any result.
    pub fn submit(&self, task: Task) -> Result<()> {
        self.task_tx
            .send(TaskMsg::Compute(task))
            .map_err(|_| DispatchErr::Disconnected { channel: "task" })
    }

    /// Waits for the next worker output, up to `wait`.
    ///
    /// A wedged worker surfaces as `ResultTimeout` instead of stalling the
    /// coordinator forever.
    pub fn recv_output(&self, wait: Duration, pending: usize) -> Result<TaskOutput> {
        self.result_rx.recv_timeout(wait).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => DispatchErr::ResultTimeout {
                pending,
                waited_secs: wait.as_secs(),
            },
            mpsc::RecvTimeoutError::Disconnected => {
                DispatchErr::Disconnected { channel: "result" }
            }
        })
    }

    /// Publishes a one-shot state update to every worker.
    pub fn publish(&mut self, update: StateUpdate) -> Result<()> {
        self.bus.publish(update)
    }

    /// Stops all workers and joins them.
    ///
    /// The caller must have drained every pending result first; with nothing
    /// in flight the stop messages queue behind no work.
    pub fn release(self) -> Result<()> {
        for _ in 0..self.workers.len() {
            // A worker that already exited leaves its stop unconsumed; the
            // channel disconnect below unblocks the rest either way.
            let _ = self.task_tx.send(TaskMsg::Stop);
        }
        drop(self.task_tx);

        for (worker_id, handle) in self.workers.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| DispatchErr::WorkerPanicked { worker_id })?;
        }

        debug!("worker pool released");
        Ok(())
    }
}

/// The blocking loop run by each worker thread.
///
/// After one task is received, further immediately available tasks of the
/// same batch index are folded into the group (up to `group_cap`) and
/// answered with a single output reporting the combined count.
fn worker_loop(
    mut ctx: WorkerContext,
    tasks: SharedTaskRx,
    results: mpsc::Sender<TaskOutput>,
    group_cap: usize,
) {
    let mut carry: Option<TaskMsg> = None;

    loop {
        let msg = match carry.take() {
            Some(msg) => msg,
            None => match tasks.lock().recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        let task = match msg {
            TaskMsg::Compute(task) => task,
            TaskMsg::Stop => break,
        };

        let batch_index = task.batch_index;
        let mut group = vec![task];

        while group.len() < group_cap {
            match tasks.lock().try_recv() {
                Ok(TaskMsg::Compute(next)) if next.batch_index == batch_index => {
                    group.push(next);
                }
                Ok(other) => {
                    carry = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        let output = ctx.compute(batch_index, &group);
        if results.send(output).is_err() {
            // Coordinator went away; nothing left to report to.
            break;
        }
    }

    let metrics = ctx.metrics().clone();
    debug!(
        worker_id = ctx.worker_id(),
        groups = metrics.groups,
        tasks = metrics.tasks,
        compute_ms = metrics.compute_time.as_millis() as u64;
        "worker stopped"
    );
}
