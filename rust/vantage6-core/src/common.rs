//! Records exchanged with the central server.
//!
//! The shapes follow the JSON bodies of the server API: identifiers of related
//! entities are flattened into `<entity>_id` fields and list endpoints wrap
//! their items in a [`Page`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_DATABASE;

/// A read-only view of a task, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: u64,
    pub image: String,
    pub collaboration_id: u64,
    pub job_id: u64,
    #[serde(default)]
    pub parent_id: Option<u64>,
}

/// A task with the fields the node needs beyond [`TaskRef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub task: TaskRef,
    /// The organization that created the task. Results are encrypted for it.
    pub init_org_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    /// The database label the task should run against.
    #[serde(default)]
    pub database: Option<String>,
}

/// A result (run) of a task at a single node, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: u64,
    pub task: TaskRef,
    /// Base64 ciphertext, or base64 plaintext for unencrypted collaborations.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Identifies the run; defaults to the result id when absent.
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub organization_id: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A task result waiting in the node queue.
///
/// Its input has already been passed through the cryptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub id: u64,
    pub task: TaskRef,
    pub input: Vec<u8>,
    pub database_label: String,
    pub run_id: u64,
}

impl TaskResult {
    /// Builds a queue item from a server record and its decoded input.
    pub fn from_record(record: ResultRecord, input: Vec<u8>) -> Self {
        let ResultRecord {
            id,
            task,
            database,
            run_id,
            ..
        } = record;
        Self {
            id,
            task,
            input,
            database_label: database.unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            run_id: run_id.unwrap_or(id),
        }
    }
}

/// The body of a `PATCH result/{id}` request. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUpdate {
    /// Ciphertext string, already encrypted for the initiating organization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Base64 encoded public key, if the organization uploaded one.
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub organization_id: u64,
    pub collaboration_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Whether inputs and results are encrypted in this collaboration.
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
    #[serde(default)]
    pub organization_ids: Vec<u64>,
}

fn default_encrypted() -> bool {
    true
}

/// Pagination links of a list response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default, rename = "self")]
    pub current: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
}

/// A page of a list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub links: Links,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn task() -> TaskRef {
        TaskRef {
            id: 42,
            image: "harbor/average".into(),
            collaboration_id: 1,
            job_id: 42,
            parent_id: None,
        }
    }

    #[test]
    fn test_task_result_defaults() {
        let record = ResultRecord {
            id: 7,
            task: task(),
            input: None,
            database: None,
            run_id: None,
            organization_id: None,
            started_at: None,
            finished_at: None,
        };
        let result = TaskResult::from_record(record, b"input".to_vec());
        assert_eq!(result.run_id, 7);
        assert_eq!(result.database_label, DEFAULT_DATABASE);
        assert_eq!(result.input, b"input".to_vec());
    }

    #[test]
    fn test_page_deserialization() {
        let body = json!({
            "data": [{"id": 3, "task": task()}],
            "links": {"self": "/api/result?page=1", "next": "/api/result?page=2"}
        });
        let page: Page<ResultRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.links.next.as_deref(), Some("/api/result?page=2"));
        assert_eq!(page.links.current.as_deref(), Some("/api/result?page=1"));
    }

    #[test]
    fn test_result_update_skips_absent_fields() {
        let update = ResultUpdate {
            log: Some("done".into()),
            ..ResultUpdate::default()
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({"log": "done"}));
    }

    #[test]
    fn test_task_record_flattens_task() {
        let body = json!({
            "id": 42,
            "image": "harbor/average",
            "collaboration_id": 1,
            "job_id": 42,
            "init_org_id": 5,
        });
        let record: TaskRecord = serde_json::from_value(body).unwrap();
        assert_eq!(record.task, task());
        assert_eq!(record.init_org_id, 5);
        assert!(record.database.is_none());
    }
}
