use std::{
    collections::HashMap,
    error::Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use vantage6_client::{ClientError, Request};
use vantage6_core::{
    Collaboration,
    NodeRecord,
    Organization,
    PrincipalKind,
    ResultRecord,
    ResultUpdate,
    TaskRecord,
    TaskRef,
    WhoAmI,
};

use crate::{
    node::NodeIdentity,
    server::ServerApi,
    socket::{KillRequest, SocketHandler},
};

pub const NODE_ID: u64 = 3;
pub const ORGANIZATION_ID: u64 = 2;
pub const COLLABORATION_ID: u64 = 1;

pub fn identity() -> NodeIdentity {
    NodeIdentity {
        whoami: WhoAmI {
            kind: PrincipalKind::Node,
            id: NODE_ID,
            name: "node of hospital".to_string(),
            organization_id: ORGANIZATION_ID,
            organization_name: "hospital".to_string(),
        },
        collaboration_id: COLLABORATION_ID,
    }
}

pub fn task_ref(task_id: u64) -> TaskRef {
    TaskRef {
        id: task_id,
        image: format!("harbor/algorithm-{}", task_id),
        collaboration_id: COLLABORATION_ID,
        job_id: task_id,
        parent_id: None,
    }
}

/// An open result of task `task_id` with a base64 plaintext input.
pub fn result_record(id: u64, task_id: u64, input: &[u8]) -> ResultRecord {
    ResultRecord {
        id,
        task: task_ref(task_id),
        input: Some(base64::encode(input)),
        database: None,
        run_id: Some(id + 100),
        organization_id: Some(ORGANIZATION_ID),
        started_at: None,
        finished_at: None,
    }
}

/// An in-memory server.
#[derive(Debug, Default)]
pub struct FakeServer {
    pub open: Mutex<Vec<ResultRecord>>,
    pub tasks: Mutex<HashMap<u64, TaskRecord>>,
    pub organizations: Mutex<HashMap<u64, Organization>>,
    pub collaborations: Mutex<HashMap<u64, Collaboration>>,
    pub patches: Mutex<Vec<(u64, ResultUpdate)>>,
    pub forwarded: Mutex<Vec<Request>>,
    pub refreshes: AtomicUsize,
    pub syncs: AtomicUsize,
}

impl FakeServer {
    pub fn with_open(results: Vec<ResultRecord>) -> Self {
        let server = Self::default();
        for result in &results {
            server.tasks.lock().unwrap().insert(
                result.task.id,
                TaskRecord {
                    task: result.task.clone(),
                    init_org_id: ORGANIZATION_ID,
                    name: None,
                    database: None,
                },
            );
        }
        *server.open.lock().unwrap() = results;
        server.organizations.lock().unwrap().insert(
            ORGANIZATION_ID,
            Organization {
                id: ORGANIZATION_ID,
                name: "hospital".to_string(),
                public_key: None,
            },
        );
        server
    }

    pub fn add_open(&self, result: ResultRecord) {
        self.tasks.lock().unwrap().insert(
            result.task.id,
            TaskRecord {
                task: result.task.clone(),
                init_org_id: ORGANIZATION_ID,
                name: None,
                database: None,
            },
        );
        self.open.lock().unwrap().push(result);
    }

    pub fn patches(&self) -> Vec<(u64, ResultUpdate)> {
        self.patches.lock().unwrap().clone()
    }
}

fn not_found(what: &str) -> ClientError {
    ClientError::Status {
        status: 404,
        body: json!({ "msg": format!("{} not found", what) }),
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn authenticate(&self, _: &str) -> Result<u64, ClientError> {
        Ok(NODE_ID)
    }

    async fn refresh_token(&self) -> Result<(), ClientError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        Some(format!("access-{}", self.refreshes.load(Ordering::SeqCst)))
    }

    async fn get_node(&self, id: u64) -> Result<NodeRecord, ClientError> {
        Ok(NodeRecord {
            id,
            name: "node of hospital".to_string(),
            organization_id: ORGANIZATION_ID,
            collaboration_id: COLLABORATION_ID,
        })
    }

    async fn get_organization(&self, id: u64) -> Result<Organization, ClientError> {
        self.organizations
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("organization"))
    }

    async fn set_organization_public_key(&self, id: u64, public_key: String) -> Result<(), ClientError> {
        let mut organizations = self.organizations.lock().unwrap();
        let organization = organizations.get_mut(&id).ok_or_else(|| not_found("organization"))?;
        organization.public_key = Some(public_key);
        Ok(())
    }

    async fn get_collaboration(&self, id: u64) -> Result<Collaboration, ClientError> {
        self.collaborations
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("collaboration"))
    }

    async fn get_task(&self, id: u64) -> Result<TaskRecord, ClientError> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("task"))
    }

    /// Counts a full sync once the open results were read.
    async fn open_results(&self, _: u64, task_id: Option<u64>) -> Result<Vec<ResultRecord>, ClientError> {
        let open: Vec<ResultRecord> = self
            .open
            .lock()
            .unwrap()
            .iter()
            .filter(|result| task_id.map_or(true, |id| result.task.id == id))
            .cloned()
            .collect();
        if task_id.is_none() {
            self.syncs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(open)
    }

    async fn patch_result(&self, id: u64, update: ResultUpdate) -> Result<(), ClientError> {
        if update.finished_at.is_some() {
            self.open.lock().unwrap().retain(|result| result.id != id);
        }
        self.patches.lock().unwrap().push((id, update));
        Ok(())
    }

    async fn request_container_token(&self, task_id: u64, _: String) -> Result<String, ClientError> {
        Ok(format!("container-token-{}", task_id))
    }

    async fn forward(&self, request: Request) -> Result<Value, ClientError> {
        self.forwarded.lock().unwrap().push(request);
        Ok(Value::Null)
    }
}

/// A handler that ignores every event.
pub struct NullHandler;

#[async_trait]
impl SocketHandler for NullHandler {
    async fn access_token(&self) -> Option<String> {
        None
    }

    async fn on_new_task(&self, _: u64) {}

    async fn on_kill(&self, _: KillRequest) {}

    async fn refresh_token(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn resync(&self) {}
}
