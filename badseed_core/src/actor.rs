// Serialized access to the reconciler. Every run (scheduled or triggered)
// is a message to one task, so runs never interleave inside this process.

use crate::error::CoreError;
use crate::reconciler::{IngestOutcome, PollOutcome, Reconciler, SweepOutcome};
use crate::webhook::WebhookBatch;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub enum ReconcilerRequest {
    Poll {
        resp: oneshot::Sender<Result<PollOutcome, CoreError>>,
    },
    Sweep {
        resp: oneshot::Sender<Result<SweepOutcome, CoreError>>,
    },
    Ingest {
        batch: WebhookBatch,
        resp: oneshot::Sender<Result<IngestOutcome, CoreError>>,
    },
}

#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcilerRequest>,
}

impl ReconcilerHandle {
    /// Spawn the worker task owning `reconciler`. The task ends when every
    /// handle has been dropped.
    pub fn spawn(reconciler: Reconciler, queue: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ReconcilerRequest>(queue.max(1));
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    ReconcilerRequest::Poll { resp } => {
                        debug!("Reconciler: poll");
                        let _ = resp.send(reconciler.poll().await);
                    }
                    ReconcilerRequest::Sweep { resp } => {
                        debug!("Reconciler: sweep");
                        let _ = resp.send(reconciler.sweep().await);
                    }
                    ReconcilerRequest::Ingest { batch, resp } => {
                        debug!("Reconciler: ingest {} transfers", batch.transfers.len());
                        let _ = resp.send(reconciler.ingest(batch.transfers, batch.last).await);
                    }
                }
            }
            info!("Reconciler task stopped");
        });
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, CoreError>>) -> ReconcilerRequest,
    ) -> Result<T, CoreError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| CoreError::Init("reconciler task is not running".to_string()))?;
        resp_rx
            .await
            .map_err(|_| CoreError::Init("reconciler task dropped the request".to_string()))?
    }

    pub async fn poll(&self) -> Result<PollOutcome, CoreError> {
        self.request(|resp| ReconcilerRequest::Poll { resp }).await
    }

    pub async fn sweep(&self) -> Result<SweepOutcome, CoreError> {
        self.request(|resp| ReconcilerRequest::Sweep { resp }).await
    }

    pub async fn ingest(&self, batch: WebhookBatch) -> Result<IngestOutcome, CoreError> {
        self.request(|resp| ReconcilerRequest::Ingest { batch, resp }).await
    }
}
