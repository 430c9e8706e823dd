use std::{error::Error, fmt, io};

use crate::task::SampleId;

/// The result type used across the whole dispatch engine.
pub type Result<T> = std::result::Result<T, DispatchErr>;

/// Dispatch engine failures.
///
/// Configuration and partition errors surface before any task is submitted;
/// worker failures travel back on the result channel; the remaining variants
/// are internal-consistency breaches with no recovery path.
#[derive(Debug)]
pub enum DispatchErr {
    Io(io::Error),
    Config {
        what: &'static str,
    },
    UnsupportedSample {
        sample_id: SampleId,
        detail: String,
    },
    WorkerFailure {
        worker_id: usize,
        batch_index: usize,
        detail: String,
    },
    PublishOutOfOrder {
        got: usize,
        min: usize,
    },
    SnapshotReplay {
        batch_index: usize,
    },
    MissingSnapshot {
        batch_index: usize,
    },
    StateSkipped {
        got: usize,
        requested: usize,
    },
    StaleState {
        cached: usize,
        requested: usize,
    },
    PendingUnderflow {
        pending: usize,
        reported: usize,
    },
    ReleaseWithPending {
        pending: usize,
    },
    WorkerPanicked {
        worker_id: usize,
    },
    ResultTimeout {
        pending: usize,
        waited_secs: u64,
    },
    Disconnected {
        channel: &'static str,
    },
}

impl fmt::Display for DispatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchErr::Io(e) => write!(f, "io error: {e}"),
            DispatchErr::Config { what } => {
                write!(f, "invalid configuration: {what}")
            }
            DispatchErr::UnsupportedSample { sample_id, detail } => {
                write!(f, "unsupported shape for sample {sample_id}: {detail}")
            }
            DispatchErr::WorkerFailure {
                worker_id,
                batch_index,
                detail,
            } => write!(
                f,
                "worker {worker_id} failed at batch {batch_index}: {detail}"
            ),
            DispatchErr::PublishOutOfOrder { got, min } => write!(
                f,
                "state published out of order: got index {got}, expected at least {min}"
            ),
            DispatchErr::SnapshotReplay { batch_index } => write!(
                f,
                "full snapshot republished at batch {batch_index}, only deltas may follow index 0"
            ),
            DispatchErr::MissingSnapshot { batch_index } => write!(
                f,
                "delta at batch {batch_index} arrived before any full snapshot"
            ),
            DispatchErr::StateSkipped { got, requested } => write!(
                f,
                "state update {got} arrived past the requested index {requested}"
            ),
            DispatchErr::StaleState { cached, requested } => write!(
                f,
                "task requested state {requested} but the cache already advanced to {cached}"
            ),
            DispatchErr::PendingUnderflow { pending, reported } => write!(
                f,
                "result reported {reported} tasks with only {pending} pending"
            ),
            DispatchErr::ReleaseWithPending { pending } => {
                write!(f, "released with {pending} unfetched results")
            }
            DispatchErr::WorkerPanicked { worker_id } => {
                write!(f, "worker {worker_id} panicked")
            }
            DispatchErr::ResultTimeout {
                pending,
                waited_secs,
            } => write!(
                f,
                "no result within {waited_secs}s, {pending} tasks still pending"
            ),
            DispatchErr::Disconnected { channel } => {
                write!(f, "{channel} channel disconnected")
            }
        }
    }
}

impl Error for DispatchErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DispatchErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<DispatchErr> for io::Error {
    fn from(value: DispatchErr) -> Self {
        match value {
            DispatchErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
