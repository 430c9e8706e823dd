use std::sync::mpsc;

use log::debug;

use crate::{
    error::{DispatchErr, Result},
    state::{CachedState, StateUpdate},
};

/// Coordinator side of the one-shot state channel.
///
/// Publishes refcounted updates to every worker's subscription. Indices must
/// strictly increase starting at 0; the first publish must be the full
/// snapshot and every later one a delta. Gaps are legal (a batch that
/// produced no tasks publishes nothing) — workers observe the publish stream
/// itself in order, with nothing skipped.
pub struct StateBus {
    taps: Vec<mpsc::Sender<StateUpdate>>,
    last: Option<usize>,
}

impl StateBus {
    /// Creates the bus together with one subscription per worker.
    pub fn new(worker_num: usize) -> (Self, Vec<StateSub>) {
        let mut taps = Vec::with_capacity(worker_num);
        let mut subs = Vec::with_capacity(worker_num);

        for _ in 0..worker_num {
            let (tx, rx) = mpsc::channel();
            taps.push(tx);
            subs.push(StateSub::new(rx));
        }

        (Self { taps, last: None }, subs)
    }

    /// Publishes one update to every worker.
    ///
    /// # Errors
    /// Returns an error when the index ordering or the snapshot/delta
    /// protocol is violated, or when all workers have already stopped.
    pub fn publish(&mut self, update: StateUpdate) -> Result<()> {
        let got = update.batch_index();
        let min = self.last.map_or(0, |last| last + 1);
        if got < min {
            return Err(DispatchErr::PublishOutOfOrder { got, min });
        }

        match (&update, self.last) {
            (StateUpdate::Snapshot { .. }, Some(_)) => {
                return Err(DispatchErr::SnapshotReplay { batch_index: got });
            }
            (StateUpdate::Snapshot { .. }, None) if got != 0 => {
                return Err(DispatchErr::PublishOutOfOrder { got, min: 0 });
            }
            (StateUpdate::Delta { .. }, None) => {
                return Err(DispatchErr::MissingSnapshot { batch_index: got });
            }
            _ => {}
        }

        let mut delivered = 0;
        for tap in &self.taps {
            if tap.send(update.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(DispatchErr::Disconnected { channel: "state" });
        }

        self.last = Some(got);
        debug!(batch_index = got, delivered = delivered; "one-shot state published");
        Ok(())
    }
}

/// Worker side of the one-shot state channel.
///
/// Holds the worker's merged state copy, keyed by the batch index it was last
/// advanced to. The common case — many tasks per batch — returns the cached
/// copy without touching the channel at all.
pub struct StateSub {
    rx: mpsc::Receiver<StateUpdate>,
    cached: Option<CachedState>,
    refreshes: u64,
}

impl StateSub {
    fn new(rx: mpsc::Receiver<StateUpdate>) -> Self {
        Self {
            rx,
            cached: None,
            refreshes: 0,
        }
    }

    /// Number of times the channel was actually drained.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Returns the state for `batch_index`, draining the channel only when
    /// the cached version is older than the request.
    ///
    /// # Errors
    /// Returns an error when the cache already advanced past the request,
    /// when an update arrives beyond the requested index, or when the
    /// publisher went away before the request could be satisfied.
    pub fn current(&mut self, batch_index: usize) -> Result<&CachedState> {
        let refresh = match &self.cached {
            Some(c) if c.batch_index == batch_index => false,
            Some(c) if c.batch_index > batch_index => {
                return Err(DispatchErr::StaleState {
                    cached: c.batch_index,
                    requested: batch_index,
                });
            }
            _ => true,
        };

        if refresh {
            self.drain_to(batch_index)?;
            self.refreshes += 1;
        }

        match &self.cached {
            Some(c) => Ok(c),
            None => Err(DispatchErr::MissingSnapshot { batch_index }),
        }
    }

    /// Applies published updates in arrival order until the cache reaches
    /// `batch_index`, blocking for updates not yet published.
    fn drain_to(&mut self, batch_index: usize) -> Result<()> {
        loop {
            if let Some(c) = &self.cached
                && c.batch_index == batch_index
            {
                return Ok(());
            }

            let update = self
                .rx
                .recv()
                .map_err(|_| DispatchErr::Disconnected { channel: "state" })?;

            let got = update.batch_index();
            if got > batch_index {
                return Err(DispatchErr::StateSkipped {
                    got,
                    requested: batch_index,
                });
            }

            match update {
                StateUpdate::Snapshot { snapshot, .. } => match self.cached {
                    None => self.cached = Some(CachedState::from_snapshot(got, &snapshot)),
                    Some(_) => return Err(DispatchErr::SnapshotReplay { batch_index: got }),
                },
                StateUpdate::Delta { params, .. } => match &mut self.cached {
                    Some(cached) => cached.apply(got, &params),
                    None => return Err(DispatchErr::MissingSnapshot { batch_index: got }),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::Array1;

    use super::*;
    use crate::{
        device::Device,
        evaluator::Evaluator,
        state::{ParamMap, Snapshot},
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

    fn marker(value: f32) -> ParamMap {
        ParamMap::from([("marker".to_string(), Array1::from_elem(1, value))])
    }

    fn snapshot(value: f32) -> StateUpdate {
        StateUpdate::snapshot(Arc::new(NoopEvaluator), marker(value))
    }

    #[test]
    fn requesting_the_same_index_twice_drains_once() {
        let (mut bus, mut subs) = StateBus::new(1);
        bus.publish(snapshot(1.0)).unwrap();
        bus.publish(StateUpdate::delta(1, marker(2.0))).unwrap();
        bus.publish(StateUpdate::delta(2, marker(3.0))).unwrap();

        let sub = &mut subs[0];
        let first = sub.current(2).unwrap().params["marker"].clone();
        let second = sub.current(2).unwrap().params["marker"].clone();

        assert_eq!(first, second);
        assert_eq!(first[0], 3.0);
        assert_eq!(sub.refresh_count(), 1);
    }

    #[test]
    fn publish_gaps_are_applied_in_order() {
        let (mut bus, mut subs) = StateBus::new(1);
        bus.publish(snapshot(1.0)).unwrap();
        bus.publish(StateUpdate::delta(3, marker(4.0))).unwrap();

        let state = subs[0].current(3).unwrap();
        assert_eq!(state.batch_index, 3);
        assert_eq!(state.params["marker"][0], 4.0);
    }

    #[test]
    fn first_publish_must_be_the_snapshot() {
        let (mut bus, _subs) = StateBus::new(1);
        let err = bus.publish(StateUpdate::delta(0, marker(1.0))).unwrap_err();
        assert!(matches!(err, DispatchErr::MissingSnapshot { batch_index: 0 }));
    }

    #[test]
    fn republishing_an_index_is_rejected() {
        let (mut bus, _subs) = StateBus::new(1);
        bus.publish(snapshot(1.0)).unwrap();
        bus.publish(StateUpdate::delta(1, marker(2.0))).unwrap();

        let err = bus.publish(StateUpdate::delta(1, marker(2.5))).unwrap_err();
        assert!(matches!(
            err,
            DispatchErr::PublishOutOfOrder { got: 1, min: 2 }
        ));
    }

    #[test]
    fn update_past_the_request_is_a_protocol_breach() {
        let (mut bus, mut subs) = StateBus::new(1);
        bus.publish(snapshot(1.0)).unwrap();
        bus.publish(StateUpdate::delta(2, marker(2.0))).unwrap();

        subs[0].current(0).unwrap();
        let err = subs[0].current(1).unwrap_err();
        assert!(matches!(
            err,
            DispatchErr::StateSkipped {
                got: 2,
                requested: 1
            }
        ));
    }

    #[test]
    fn stale_requests_are_rejected() {
        let (mut bus, mut subs) = StateBus::new(1);
        bus.publish(snapshot(1.0)).unwrap();
        bus.publish(StateUpdate::delta(1, marker(2.0))).unwrap();

        subs[0].current(1).unwrap();
        let err = subs[0].current(0).unwrap_err();
        assert!(matches!(
            err,
            DispatchErr::StaleState {
                cached: 1,
                requested: 0
            }
        ));
    }
}
