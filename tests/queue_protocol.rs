use std::{num::NonZeroUsize, sync::Arc};

use ndarray::Array1;

use compute_dispatch::{
    ComputationQueue, Device, DispatchErr, DispatchSpec, Evaluator, ParamMap, ResultMap, Sample,
    SampleId, StateUpdate, Task, TaskPayload, error::Result,
};

/// Deterministic evaluator: every sample maps to its input doubled.
struct Doubler;

impl Evaluator for Doubler {
    fn evaluate(
        &self,
        _params: &ParamMap,
        payload: &TaskPayload,
        _device: Device,
    ) -> Result<ResultMap> {
        match payload {
            TaskPayload::Samples(samples) => Ok(samples
                .iter()
                .map(|s| (s.id, &s.input * 2.0))
                .collect()),
            TaskPayload::Vectors { .. } => Err(DispatchErr::Config {
                what: "per-sample payloads only",
            }),
        }
    }
}

/// Fails the whole group whenever it contains the poisoned id.
struct Poisoned(SampleId);

impl Evaluator for Poisoned {
    fn evaluate(
        &self,
        params: &ParamMap,
        payload: &TaskPayload,
        device: Device,
    ) -> Result<ResultMap> {
        if let TaskPayload::Samples(samples) = payload
            && samples.iter().any(|s| s.id == self.0)
        {
            return Err(DispatchErr::UnsupportedSample {
                sample_id: self.0,
                detail: "poisoned".to_string(),
            });
        }
        Doubler.evaluate(params, payload, device)
    }
}

fn spec(workers: usize) -> DispatchSpec {
    DispatchSpec {
        worker_num: NonZeroUsize::new(workers),
        result_wait_secs: 5,
        ..Default::default()
    }
}

fn task(batch_index: usize, ids: &[SampleId]) -> Task {
    let samples = ids
        .iter()
        .map(|&id| {
            Sample::new(
                id,
                Array1::from_elem(2, id as f32),
                Array1::from_elem(1, 0.0),
            )
        })
        .collect();
    Task::new(batch_index, TaskPayload::Samples(samples))
}

fn snapshot(evaluator: impl Evaluator + 'static) -> StateUpdate {
    StateUpdate::snapshot(Arc::new(evaluator), ParamMap::new())
}

#[test]
fn pending_counter_matches_submissions_minus_reports() {
    let mut queue = ComputationQueue::new(spec(2));

    for id in 0..4 {
        queue.add_task(task(0, &[id])).unwrap();
    }
    assert_eq!(queue.pending_tasks(), 4);
    assert!(queue.has_unfetched_result());

    queue.publish(snapshot(Doubler)).unwrap();

    let results = queue.result_dict().unwrap().clone();
    assert_eq!(results.len(), 4);
    assert_eq!(results[&3], Array1::from_elem(2, 6.0));
    assert_eq!(queue.pending_tasks(), 0);
    assert!(!queue.has_unfetched_result());

    queue.reset().unwrap();
}

#[test]
fn dropping_leaves_the_accumulator_untouched() {
    let mut queue = ComputationQueue::new(spec(2));

    queue.add_task(task(0, &[0, 1])).unwrap();
    queue.publish(snapshot(Doubler)).unwrap();
    let kept = queue.result_dict().unwrap().clone();
    assert_eq!(kept.len(), 2);

    for id in 10..13 {
        queue.add_task(task(1, &[id])).unwrap();
    }
    queue
        .publish(StateUpdate::delta(1, ParamMap::new()))
        .unwrap();

    queue.fetch(true).unwrap();
    assert_eq!(queue.pending_tasks(), 0);
    assert_eq!(*queue.result_dict().unwrap(), kept);

    queue.reset().unwrap();
}

#[test]
fn merged_results_do_not_depend_on_submission_order() {
    let orders: [&[SampleId]; 2] = [&[1, 2, 3], &[3, 1, 2]];
    let mut merged = Vec::new();

    for order in orders {
        let mut queue = ComputationQueue::new(spec(2));
        for &id in order {
            queue.add_task(task(0, &[id])).unwrap();
        }
        queue.publish(snapshot(Doubler)).unwrap();
        merged.push(queue.result_dict().unwrap().clone());
        queue.reset().unwrap();
    }

    assert_eq!(merged[0], merged[1]);
}

#[test]
fn collection_fun_replaces_the_accumulator() {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut queue = ComputationQueue::new(spec(1));
    queue.set_result_collection_fun(move |map| {
        let _ = tx.send(map.len());
    });

    queue.add_task(task(0, &[7, 8])).unwrap();
    queue.publish(snapshot(Doubler)).unwrap();

    queue.fetch(false).unwrap();
    assert!(queue.result_dict().unwrap().is_empty());
    assert_eq!(rx.try_iter().sum::<usize>(), 2);

    queue.reset().unwrap();
}

#[test]
fn worker_failure_surfaces_from_fetch() {
    let mut queue = ComputationQueue::new(spec(1));

    queue.add_task(task(0, &[13])).unwrap();
    queue.publish(snapshot(Poisoned(13))).unwrap();

    let err = queue.fetch(false).unwrap_err();
    assert!(matches!(
        err,
        DispatchErr::WorkerFailure { batch_index: 0, .. }
    ));

    assert_eq!(queue.pending_tasks(), 0);
    queue.reset().unwrap();
}

#[test]
fn release_rejects_unfetched_results() {
    let mut queue = ComputationQueue::new(spec(1));

    queue.add_task(task(0, &[0])).unwrap();
    let err = queue.reset().unwrap_err();
    assert!(matches!(err, DispatchErr::ReleaseWithPending { pending: 1 }));

    queue.publish(snapshot(Doubler)).unwrap();
    queue.reset_result().unwrap();
    queue.reset().unwrap();
}

#[test]
fn wedged_worker_escalates_as_timeout() {
    let mut queue = ComputationQueue::new(DispatchSpec {
        worker_num: NonZeroUsize::new(1),
        result_wait_secs: 1,
        ..Default::default()
    });

    // No state is published, so the worker blocks and no result can arrive.
    queue.add_task(task(0, &[0])).unwrap();
    let err = queue.fetch(false).unwrap_err();
    assert!(matches!(err, DispatchErr::ResultTimeout { pending: 1, .. }));

    queue.publish(snapshot(Doubler)).unwrap();
    queue.reset_result().unwrap();
    queue.reset().unwrap();
}

#[test]
fn result_transform_is_applied_on_the_worker() {
    let mut queue = ComputationQueue::new(spec(1));
    queue
        .set_result_transform(|_id, value| value * 10.0)
        .unwrap();

    queue.add_task(task(0, &[2])).unwrap();
    queue.publish(snapshot(Doubler)).unwrap();

    let results = queue.result_dict().unwrap().clone();
    assert_eq!(results[&2], Array1::from_elem(2, 40.0));

    queue.reset().unwrap();
}

#[test]
fn transforms_cannot_change_after_start() {
    let mut queue = ComputationQueue::new(spec(1));

    queue.add_task(task(0, &[0])).unwrap();
    let err = queue.set_result_transform(|_, v| v).unwrap_err();
    assert!(matches!(err, DispatchErr::Config { .. }));

    queue.publish(snapshot(Doubler)).unwrap();
    queue.reset_result().unwrap();
    queue.reset().unwrap();
}
