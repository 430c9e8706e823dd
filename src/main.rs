use std::{env, io, sync::Arc};

use log::info;
use ndarray::Array1;
use rand::Rng;
use rayon::prelude::*;

use compute_dispatch::{
    Device, DispatchErr, DispatchSpec, Evaluator, ParamMap, ResultMap, Sample,
    SampleComputationHook, TaskPayload, error::Result,
};

const SPEC_ENV: &str = "DISPATCH_SPEC";
const FEATURES: usize = 8;
const BATCH_SIZE: u64 = 32;
const BATCHES: usize = 4;

/// Per-sample gradient of a squared-error linear model: for each sample,
/// grad = (w · x − y) · x.
struct SquaredErrorGrad;

impl Evaluator for SquaredErrorGrad {
    fn evaluate(
        &self,
        params: &ParamMap,
        payload: &TaskPayload,
        _device: Device,
    ) -> Result<ResultMap> {
        let weight = params
            .get("weight")
            .ok_or(DispatchErr::Config {
                what: "evaluator expects a `weight` parameter",
            })?;

        match payload {
            TaskPayload::Samples(samples) => Ok(samples
                .iter()
                .map(|s| {
                    let residual = weight.dot(&s.input) - s.target[0];
                    (s.id, &s.input * residual)
                })
                .collect()),
            TaskPayload::Vectors { .. } => Err(DispatchErr::Config {
                what: "evaluator only supports per-sample payloads",
            }),
        }
    }
}

fn synth_batch(batch_index: usize) -> Vec<Sample> {
    let mut rng = rand::rng();
    let offset = batch_index as u64 * BATCH_SIZE;

    (0..BATCH_SIZE)
        .map(|i| {
            let input = Array1::from_iter((0..FEATURES).map(|_| rng.random::<f32>()));
            let target = Array1::from_elem(1, rng.random::<f32>());
            Sample::new(offset + i, input, target)
        })
        .collect()
}

fn main() -> io::Result<()> {
    env_logger::init();

    let spec: DispatchSpec = match env::var(SPEC_ENV) {
        Ok(raw) => serde_json::from_str(&raw).map_err(io::Error::other)?,
        Err(_) => DispatchSpec::default(),
    };
    info!(worker_num = spec.resolve_worker_num().get(); "starting demo run");

    let mut hook = SampleComputationHook::new(Arc::new(SquaredErrorGrad), spec);
    let mut rng = rand::rng();
    let mut params = ParamMap::from([(
        "weight".to_string(),
        Array1::from_iter((0..FEATURES).map(|_| rng.random::<f32>() - 0.5)),
    )]);

    for batch_index in 0..BATCHES {
        hook.before_batch()?;
        hook.after_forward(batch_index, synth_batch(batch_index), &params)?;

        // The last batch plays a diverged step: cancel instead of consuming.
        let step_skipped = batch_index == BATCHES - 1;
        if step_skipped {
            hook.after_optimizer_step(true)?;
            continue;
        }

        let results = hook.result_dict()?;
        let grad_norm = results
            .par_iter()
            .map(|(_, g)| g.dot(g))
            .sum::<f32>()
            .sqrt();
        info!(
            batch_index = batch_index,
            results = results.len(),
            grad_norm = grad_norm;
            "batch computed"
        );

        // Toy update so each batch publishes a fresh parameter delta.
        if let Some(weight) = params.get_mut("weight") {
            weight.mapv_inplace(|w| w * 0.9);
        }
        hook.after_optimizer_step(false)?;
    }

    hook.reset()?;
    info!("demo finished");
    Ok(())
}
