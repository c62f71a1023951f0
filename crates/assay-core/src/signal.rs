//! Wet-lab result intake
//!
//! External systems hand results to a [`SignalSender`]; a single intake task
//! forwards them to the engine in arrival order and replies with the ack.

use crate::engine::WorkflowEngine;
use crate::error::EngineError;
use assay_kernel::{ExperimentResult, SignalAck};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct Delivery {
    result: ExperimentResult,
    reply: oneshot::Sender<Result<SignalAck, EngineError>>,
}

/// Cloneable handle for submitting results
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Delivery>,
}

impl std::fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SignalSender {
    /// Submit a result and wait for the engine's answer
    ///
    /// # Errors
    /// `IntakeClosed` once the intake task is gone, otherwise whatever
    /// [`WorkflowEngine::signal_workflow`] returned.
    pub async fn send(&self, result: ExperimentResult) -> Result<SignalAck, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Delivery { result, reply })
            .await
            .map_err(|_| EngineError::IntakeClosed)?;
        answer.await.map_err(|_| EngineError::IntakeClosed)?
    }
}

/// Serialises result delivery into the engine
pub struct SignalIntake {
    engine: Arc<WorkflowEngine>,
    rx: mpsc::Receiver<Delivery>,
}

impl SignalIntake {
    /// Create intake and its sender; `capacity` bounds queued results
    #[must_use]
    pub fn new(engine: Arc<WorkflowEngine>, capacity: usize) -> (Self, SignalSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { engine, rx }, SignalSender { tx })
    }

    /// Intake sized from the engine's configuration, already running
    pub fn spawn(engine: Arc<WorkflowEngine>) -> (JoinHandle<()>, SignalSender) {
        let capacity = engine.signal_buffer();
        let (intake, sender) = Self::new(engine, capacity);
        (tokio::spawn(intake.run()), sender)
    }

    /// Forward results until every sender is dropped
    pub async fn run(mut self) {
        while let Some(Delivery { result, reply }) = self.rx.recv().await {
            let experiment_id = result.experiment_id.clone();
            let outcome = self.engine.signal_workflow(result).await;
            match &outcome {
                Ok(ack) => {
                    tracing::debug!(%experiment_id, receipt = ?ack.receipt, "signal delivered");
                }
                Err(e) => tracing::warn!(%experiment_id, error = %e, "signal rejected"),
            }
            // Sender may have stopped waiting
            let _ = reply.send(outcome);
        }
        tracing::debug!("signal intake closed");
    }
}
