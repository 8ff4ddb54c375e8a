//! The server endpoints a node talks to.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use vantage6_core::{
    Collaboration,
    Links,
    NodeRecord,
    Organization,
    Page,
    ResultRecord,
    ResultUpdate,
    TaskRecord,
};

use crate::{Client, ClientError, HttpBackend, Request};

impl<H> Client<H>
where
    H: HttpBackend,
{
    /// Gets `endpoint` and deserializes the response.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ClientError> {
        let body = self.request(Request::get(endpoint)).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn get_node(&self, id: u64) -> Result<NodeRecord, ClientError> {
        self.get_json(&format!("node/{}", id)).await
    }

    pub async fn get_organization(&self, id: u64) -> Result<Organization, ClientError> {
        self.get_json(&format!("organization/{}", id)).await
    }

    pub async fn get_collaboration(&self, id: u64) -> Result<Collaboration, ClientError> {
        self.get_json(&format!("collaboration/{}", id)).await
    }

    pub async fn get_task(&self, id: u64) -> Result<TaskRecord, ClientError> {
        self.get_json(&format!("task/{}", id)).await
    }

    /// Publishes `public_key` (base64) at organization `id`.
    pub async fn set_organization_public_key(&self, id: u64, public_key: &str) -> Result<(), ClientError> {
        let request = Request::patch(format!("organization/{}", id)).json(json!({ "public_key": public_key }));
        self.request(request).await.map(|_| ())
    }

    pub async fn patch_result(&self, id: u64, update: &ResultUpdate) -> Result<(), ClientError> {
        let request = Request::patch(format!("result/{}", id)).json(serde_json::to_value(update)?);
        self.request(request).await.map(|_| ())
    }

    /// Requests a token for the algorithm container that will run `task_id`.
    pub async fn request_container_token(&self, task_id: u64, image: &str) -> Result<String, ClientError> {
        let request = Request::post("token/container").json(json!({
            "task_id": task_id,
            "image": image,
        }));
        let body = self.request(request).await?;
        match body.get("container_token").and_then(Value::as_str) {
            Some(token) => Ok(token.to_string()),
            None => Err(ClientError::Authentication(
                "no container token in the response".to_string(),
            )),
        }
    }

    /// The open results assigned to node `node_id`, optionally restricted to
    /// a single task. Results that can't be parsed are logged and skipped.
    pub async fn open_results(&self, node_id: u64, task_id: Option<u64>) -> Result<Vec<ResultRecord>, ClientError> {
        let mut request = Request::get("result")
            .param("state", "open")
            .param("node_id", node_id);
        if let Some(task_id) = task_id {
            request = request.param("task_id", task_id);
        }
        let rows = self.paginate(request).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<ResultRecord>(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("skipping malformed result: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Collects the items of all the pages, following the `links.next` of
    /// every page. Endpoints that answer with a bare list are a single page.
    pub async fn paginate(&self, first: Request) -> Result<Vec<Value>, ClientError> {
        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut request = first;
        loop {
            let page = match self.request(request).await? {
                Value::Array(data) => Page {
                    data,
                    links: Links::default(),
                },
                body => serde_json::from_value::<Page<Value>>(body)?,
            };
            items.extend(page.data);
            match page.links.next {
                Some(next) if !next.is_empty() => {
                    if !visited.insert(next.clone()) {
                        warn!("pagination link {} was already visited", next);
                        return Ok(items);
                    }
                    debug!("following pagination link {}", next);
                    request = Request::get(next);
                }
                _ => return Ok(items),
            }
        }
    }
}
