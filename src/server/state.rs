//! Serving/training phase gate.
//!
//! Inference and training are mutually exclusive: completions run against the
//! currently promoted adapter, and a GRPO step must see no in-flight
//! completions while it swaps weights. The gate makes that exclusion an
//! explicit two-phase state machine with an observable wait queue. Requests
//! admitted while `Serving` hold a permit stamped with the adapter version
//! they will be served from; requests arriving during `Training` queue in
//! FIFO order and are released, stamped with the new version, when the step
//! commits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Phases and permits
// ---------------------------------------------------------------------------

/// The two phases a model server alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServePhase {
    /// Completions are admitted immediately.
    Serving,
    /// A training step owns the weights; new completions queue.
    Training,
}

/// Admission token for one inference request.
///
/// Holds the adapter version the request is served from. Dropping the permit
/// marks the request complete; the last permit to drop during a training
/// transition unblocks the trainer.
#[derive(Debug)]
pub struct InferencePermit {
    version: Option<u64>,
    gate: Arc<GateInner>,
}

impl InferencePermit {
    /// Adapter version this request is pinned to, `None` before the first
    /// checkpoint exists (the base model is serving).
    pub fn version(&self) -> Option<u64> {
        self.version
    }
}

impl Drop for InferencePermit {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 && state.phase == ServePhase::Training {
            self.gate.drained.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GateState {
    phase: ServePhase,
    version: Option<u64>,
    in_flight: usize,
    queue: VecDeque<oneshot::Sender<InferencePermit>>,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
    drained: Notify,
}

/// Coordinates admission of inference requests against training steps.
#[derive(Debug, Clone)]
pub struct InferenceGate {
    inner: Arc<GateInner>,
}

impl InferenceGate {
    /// Create a gate in the `Serving` phase at `initial_version`.
    pub fn new(initial_version: Option<u64>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    phase: ServePhase::Serving,
                    version: initial_version,
                    in_flight: 0,
                    queue: VecDeque::new(),
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Admit one inference request.
    ///
    /// Returns immediately while serving; during training the caller joins
    /// the FIFO queue and resumes when the step commits. The returned permit
    /// carries the version the request will be served from.
    pub async fn admit(&self) -> InferencePermit {
        let receiver = {
            let mut state = self.inner.state.lock().unwrap();
            match state.phase {
                ServePhase::Serving => {
                    state.in_flight += 1;
                    return InferencePermit {
                        version: state.version,
                        gate: self.inner.clone(),
                    };
                }
                ServePhase::Training => {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(tx);
                    debug!(queue_depth = state.queue.len(), "request queued for training");
                    rx
                }
            }
        };
        // The sender half lives in the queue until finish_training releases
        // it with a fresh permit.
        receiver.await.expect("gate dropped with queued requests")
    }

    /// Enter the `Training` phase.
    ///
    /// New requests start queueing immediately; this call resolves once every
    /// in-flight permit has dropped, at which point the trainer owns the
    /// weights exclusively.
    pub async fn begin_training(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            ensure!(
                state.phase == ServePhase::Serving,
                "cannot begin training: a step is already in progress"
            );
            state.phase = ServePhase::Training;
            info!(in_flight = state.in_flight, "draining in-flight requests");
        }
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.in_flight == 0 {
                    return Ok(());
                }
            }
            self.inner.drained.notified().await;
        }
    }

    /// Leave the `Training` phase, promoting `new_version` as the serving
    /// adapter, and release every queued request in FIFO order.
    pub fn finish_training(&self, new_version: u64) -> Result<()> {
        let released = {
            let mut state = self.inner.state.lock().unwrap();
            ensure!(
                state.phase == ServePhase::Training,
                "finish_training called outside a training step"
            );
            ensure!(
                state.version.is_none_or(|v| new_version > v),
                "checkpoint version must increase: {:?} -> {new_version}",
                state.version
            );
            state.version = Some(new_version);
            state.phase = ServePhase::Serving;

            let mut released = Vec::with_capacity(state.queue.len());
            while let Some(tx) = state.queue.pop_front() {
                state.in_flight += 1;
                released.push((
                    tx,
                    InferencePermit {
                        version: state.version,
                        gate: self.inner.clone(),
                    },
                ));
            }
            released
        };

        let queued = released.len();
        for (tx, permit) in released {
            // A failed send means the waiter gave up; dropping the permit
            // releases its in-flight slot.
            let _ = tx.send(permit);
        }
        info!(version = new_version, released = queued, "serving resumed");
        Ok(())
    }

    /// Abort a training step without promoting a new version; queued
    /// requests are released against the previous adapter.
    pub fn abort_training(&self) -> Result<()> {
        let released = {
            let mut state = self.inner.state.lock().unwrap();
            ensure!(
                state.phase == ServePhase::Training,
                "abort_training called outside a training step"
            );
            state.phase = ServePhase::Serving;

            let mut released = Vec::with_capacity(state.queue.len());
            while let Some(tx) = state.queue.pop_front() {
                state.in_flight += 1;
                released.push((
                    tx,
                    InferencePermit {
                        version: state.version,
                        gate: self.inner.clone(),
                    },
                ));
            }
            released
        };
        for (tx, permit) in released {
            let _ = tx.send(permit);
        }
        Ok(())
    }

    /// Current phase.
    pub fn phase(&self) -> ServePhase {
        self.inner.state.lock().unwrap().phase
    }

    /// Version of the adapter currently being served.
    pub fn serving_version(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().version
    }

    /// Number of requests waiting for the current training step to finish.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Number of admitted requests that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight
    }
}
