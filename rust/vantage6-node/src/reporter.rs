//! Delivery of the outcomes of the runs to the server.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;
use vantage6_core::{crypto::Cryptor, ResultUpdate};

use crate::{
    backend::Completion,
    node::{NodeError, NodeIdentity},
    queue::TaskQueue,
    server::ServerApi,
    socket::{ClientEvent, ContainerFailure, SocketHandle},
};

/// Encrypts the output of every finished run for the organization that
/// created the task, and reports it.
pub struct Reporter<S> {
    server: Arc<S>,
    cryptor: Arc<dyn Cryptor>,
    queue: Arc<TaskQueue>,
    socket: SocketHandle,
    identity: NodeIdentity,
}

impl<S> Reporter<S>
where
    S: ServerApi,
{
    pub fn new(
        server: Arc<S>,
        cryptor: Arc<dyn Cryptor>,
        queue: Arc<TaskQueue>,
        socket: SocketHandle,
        identity: NodeIdentity,
    ) -> Self {
        Self {
            server,
            cryptor,
            queue,
            socket,
            identity,
        }
    }

    /// Reports the completions until the backend is dropped.
    ///
    /// # Errors
    /// Returns on a fatal error, or when the completion channel is closed.
    pub async fn run(self, mut completions: mpsc::UnboundedReceiver<Completion>) -> Result<(), NodeError> {
        while let Some(completion) = completions.recv().await {
            let result_id = completion.result_id;
            let span = info_span!("report", result_id, task_id = completion.task_id);
            let outcome = self.report(completion).instrument(span).await;
            self.queue.complete(result_id).await;
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("failed to report result {}: {}", result_id, e),
            }
        }
        Err(NodeError::Stopped("container backend"))
    }

    pub async fn report(&self, completion: Completion) -> Result<(), NodeError> {
        if completion.failed() {
            warn!("the container exited with status {}", completion.status_code);
            let failure = ContainerFailure {
                node_id: self.identity.node_id(),
                status_code: completion.status_code,
                result_id: completion.result_id,
                collaboration_id: self.identity.collaboration_id,
            };
            if !self.socket.emit(ClientEvent::ContainerFailed(failure)) {
                warn!("the event channel is closed");
            }
        }

        let task = self.server.get_task(completion.task_id).await?;
        let initiator = self.server.get_organization(task.init_org_id).await?;
        let public_key = initiator.public_key.unwrap_or_default();
        let result = self
            .cryptor
            .encrypt_bytes_to_str(&completion.output, &public_key)?;

        let update = ResultUpdate {
            result: Some(result),
            log: Some(completion.log),
            started_at: None,
            finished_at: Some(Utc::now()),
        };
        self.server.patch_result(completion.result_id, update).await?;
        info!("reported the result to organization {}", initiator.id);
        Ok(())
    }
}
