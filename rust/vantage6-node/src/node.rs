//! The node coordinator.
//!
//! Startup goes through the following steps:
//!
//! 1. authentication with the API key, retried until it succeeds,
//! 2. identification of the node, its organization and its collaboration,
//! 3. encryption setup, selecting the cryptor of the collaboration,
//! 4. a full sync of the queue with the open results at the server.
//!
//! Afterwards the [`Node`] serves the event channel and runs the main loop,
//! which takes results off the queue and starts their algorithm containers.

use std::{collections::HashMap, error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;
use vantage6_client::ClientError;
use vantage6_core::{
    crypto::{CryptoError, Cryptor, DummyCryptor, SealedBoxCryptor},
    PrincipalKind,
    ResultRecord,
    ResultUpdate,
    TaskResult,
    WhoAmI,
};

use crate::{
    backend::{BackendError, ContainerBackend, ContainerRun},
    queue::TaskQueue,
    server::ServerApi,
    settings::{resolve_database, EncryptionSettings, SettingsError},
    socket::{KillOrder, KillRequest, SocketError, SocketHandler},
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("server request failed: {0}")]
    Client(#[from] ClientError),
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("no cryptor is configured")]
    MissingCryptor,
    #[error("collaboration {0} is encrypted, but encryption is disabled at this node")]
    EncryptionRequired(u64),
    #[error("no database is configured for label {0}")]
    MissingDatabase(String),
    #[error("container backend failed: {0}")]
    Backend(#[from] BackendError),
    #[error("event channel failed: {0}")]
    Socket(#[from] SocketError),
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("failed to build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("the {0} stopped")]
    Stopped(&'static str),
    #[error("a service of the node panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl NodeError {
    /// Whether the error must stop the node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Client(ClientError::Authentication(_))
                | NodeError::Client(ClientError::RefreshNotAllowed)
                | NodeError::MissingCryptor
                | NodeError::EncryptionRequired(_)
                | NodeError::Socket(SocketError::Refresh(_))
                | NodeError::Stopped(_)
                | NodeError::Join(_)
        )
    }
}

/// Who the node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub whoami: WhoAmI,
    pub collaboration_id: u64,
}

impl NodeIdentity {
    pub fn node_id(&self) -> u64 {
        self.whoami.id
    }

    pub fn organization_id(&self) -> u64 {
        self.whoami.organization_id
    }

    /// The rooms of the event channel the node is in.
    pub fn rooms(&self) -> Vec<String> {
        vec![
            format!("collaboration_{}", self.collaboration_id),
            format!("node_{}", self.node_id()),
        ]
    }
}

/// Authenticates with `api_key`, every `retry_delay` until it succeeds.
/// Returns the node id.
pub async fn authenticate<S>(server: &S, api_key: &str, retry_delay: Duration) -> u64
where
    S: ServerApi + ?Sized,
{
    loop {
        match server.authenticate(api_key).await {
            Ok(node_id) => {
                info!("authenticated as node {}", node_id);
                return node_id;
            }
            Err(e) => {
                error!("authentication failed: {}, retrying in {:?}", e, retry_delay);
                time::sleep(retry_delay).await;
            }
        }
    }
}

/// Looks up the node `node_id` and its organization.
pub async fn whoami<S>(server: &S, node_id: u64) -> Result<NodeIdentity, NodeError>
where
    S: ServerApi + ?Sized,
{
    let node = server.get_node(node_id).await?;
    let organization = server.get_organization(node.organization_id).await?;
    info!(
        "node {} ({}) of organization {} ({}) in collaboration {}",
        node.name, node.id, organization.name, organization.id, node.collaboration_id
    );
    Ok(NodeIdentity {
        whoami: WhoAmI {
            kind: PrincipalKind::Node,
            id: node.id,
            name: node.name,
            organization_id: organization.id,
            organization_name: organization.name,
        },
        collaboration_id: node.collaboration_id,
    })
}

/// Selects the cryptor of the collaboration of the node.
///
/// For an encrypted collaboration the private key is loaded, or created, and
/// the public key of the organization is updated at the server when it
/// differs from the local one.
pub async fn setup_encryption<S>(
    server: &S,
    settings: &EncryptionSettings,
    identity: &NodeIdentity,
) -> Result<Arc<dyn Cryptor>, NodeError>
where
    S: ServerApi + ?Sized,
{
    let collaboration = server.get_collaboration(identity.collaboration_id).await?;
    if !collaboration.encrypted {
        warn!("collaboration {} is not encrypted", collaboration.id);
        return Ok(Arc::new(DummyCryptor));
    }
    if settings.disabled {
        return Err(NodeError::EncryptionRequired(collaboration.id));
    }

    let cryptor = SealedBoxCryptor::load_or_create(&settings.private_key)?;
    let organization = server.get_organization(identity.organization_id()).await?;
    let up_to_date = organization
        .public_key
        .as_deref()
        .map_or(false, |key| cryptor.verify_public_key(key));
    if !up_to_date {
        if let Some(public_key) = cryptor.public_key_str() {
            info!("uploading the public key of organization {}", organization.id);
            server
                .set_organization_public_key(organization.id, public_key)
                .await?;
        }
    }
    Ok(Arc::new(cryptor))
}

pub struct Node<S, B> {
    server: Arc<S>,
    backend: B,
    queue: Arc<TaskQueue>,
    cryptor: Option<Arc<dyn Cryptor>>,
    identity: NodeIdentity,
    databases: HashMap<String, String>,
    allow_unencrypted_fallback: bool,
    poll_timeout: Duration,
}

impl<S, B> Node<S, B>
where
    S: ServerApi,
    B: ContainerBackend,
{
    pub fn new(
        server: Arc<S>,
        backend: B,
        queue: Arc<TaskQueue>,
        cryptor: Option<Arc<dyn Cryptor>>,
        identity: NodeIdentity,
        databases: HashMap<String, String>,
    ) -> Self {
        Self {
            server,
            backend,
            queue,
            cryptor,
            identity,
            databases,
            allow_unencrypted_fallback: true,
            poll_timeout: Duration::from_secs(1),
        }
    }

    /// Whether inputs that fail to decrypt are processed as unencrypted
    /// inputs.
    pub fn allow_unencrypted_fallback(mut self, allow: bool) -> Self {
        self.allow_unencrypted_fallback = allow;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn cryptor(&self) -> Result<&dyn Cryptor, NodeError> {
        self.cryptor.as_deref().ok_or(NodeError::MissingCryptor)
    }

    fn decrypt_input(&self, record: &ResultRecord) -> Result<Vec<u8>, NodeError> {
        let input = match &record.input {
            Some(input) => input,
            None => return Ok(Vec::new()),
        };
        match self.cryptor()?.decrypt_str_to_bytes(input) {
            Ok(input) => Ok(input),
            Err(e) if self.allow_unencrypted_fallback => {
                warn!(
                    "failed to decrypt the input of result {}: {}, assuming it is unencrypted",
                    record.id, e
                );
                Ok(base64::decode(input.trim()).unwrap_or_else(|_| input.as_bytes().to_vec()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Turns the open results into queue items. Results whose input can't
    /// be read are logged and left out.
    fn to_queue_items(&self, records: Vec<ResultRecord>) -> Result<Vec<TaskResult>, NodeError> {
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            match self.decrypt_input(&record) {
                Ok(input) => items.push(TaskResult::from_record(record, input)),
                Err(NodeError::MissingCryptor) => return Err(NodeError::MissingCryptor),
                Err(e) => error!("skipping result {}: {}", record.id, e),
            }
        }
        Ok(items)
    }

    /// Fetches the open result of `task_id` for this node and queues it.
    /// Returns the number of queued results.
    pub async fn get_task_and_add_to_queue(&self, task_id: u64) -> Result<usize, NodeError> {
        let records = self
            .server
            .open_results(self.identity.node_id(), Some(task_id))
            .await?;
        let mut queued = 0;
        for item in self.to_queue_items(records)? {
            if self.queue.enqueue(item).await {
                queued += 1;
            }
        }
        debug!("queued {} results of task {}", queued, task_id);
        Ok(queued)
    }

    /// Replaces the queue by the open results of this node at the server.
    pub async fn resync_with_server(&self) -> Result<usize, NodeError> {
        let records = self
            .server
            .open_results(self.identity.node_id(), None)
            .await?;
        let items = self.to_queue_items(records)?;
        let queued = self.queue.replace(items).await;
        info!("synced with the server: {} results queued", queued);
        Ok(queued)
    }

    /// Marks the result as started and hands it to the container backend.
    pub async fn start_task(&self, item: TaskResult) -> Result<(), NodeError> {
        self.cryptor()?;
        info!("starting {}", item.task.image);

        let started = ResultUpdate {
            started_at: Some(Utc::now()),
            ..ResultUpdate::default()
        };
        self.server.patch_result(item.id, started).await?;
        let token = self
            .server
            .request_container_token(item.task.id, item.task.image.clone())
            .await?;
        let database_uri = resolve_database(&self.databases, &item.database_label)
            .ok_or_else(|| NodeError::MissingDatabase(item.database_label.clone()))?
            .to_string();

        self.backend
            .run(ContainerRun {
                result_id: item.id,
                run_id: item.run_id,
                task: item.task,
                token,
                database_uri,
                input: item.input,
            })
            .await?;
        Ok(())
    }

    /// Starts the queued results one after the other. A result that fails
    /// to start is logged and released.
    ///
    /// # Errors
    /// Returns only on a fatal error.
    pub async fn run_main_loop(&self) -> Result<(), NodeError> {
        loop {
            let item = match self.queue.pop(self.poll_timeout).await {
                Some(item) => item,
                None => continue,
            };
            let result_id = item.id;
            let span = info_span!("task", result_id, task_id = item.task.id);
            match self.start_task(item).instrument(span).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("failed to start result {}: {}", result_id, e);
                    self.queue.complete(result_id).await;
                }
            }
        }
    }

    async fn kill(&self, request: KillRequest) {
        match request.order_for(self.identity.node_id()) {
            Some(KillOrder::All) => {
                let killed = self.backend.kill_all().await;
                info!("killed {} containers", killed);
            }
            Some(KillOrder::Results(results)) => {
                for result_id in results {
                    if !self.backend.kill(result_id).await {
                        warn!("result {} is not running", result_id);
                    }
                }
            }
            None => debug!("ignoring a kill request for other nodes"),
        }
    }
}

#[async_trait]
impl<S, B> SocketHandler for Node<S, B>
where
    S: ServerApi,
    B: ContainerBackend,
{
    async fn access_token(&self) -> Option<String> {
        self.server.access_token().await
    }

    async fn on_new_task(&self, task_id: u64) {
        if let Err(e) = self.get_task_and_add_to_queue(task_id).await {
            error!("failed to queue task {}: {}", task_id, e);
        }
    }

    async fn on_kill(&self, request: KillRequest) {
        self.kill(request).await
    }

    async fn refresh_token(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.server.refresh_token().await.map_err(Into::into)
    }

    async fn resync(&self) {
        if let Err(e) = self.resync_with_server().await {
            error!("failed to sync with the server: {}", e);
        }
    }
}
