//! The part of the server API the node relies on.

use async_trait::async_trait;
use serde_json::Value;
use vantage6_client::{AuthOutcome, Client, ClientError, HttpBackend, Request};
use vantage6_core::{
    ClaimedIdentity,
    Collaboration,
    NodeRecord,
    Organization,
    ResultRecord,
    ResultUpdate,
    TaskRecord,
};

/// The server calls of the node.
///
/// It is implemented by the HTTP [`Client`], and mocked in the tests of the
/// coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServerApi: Send + Sync + 'static {
    /// Authenticates with `api_key` and returns the id of the node.
    async fn authenticate(&self, api_key: &str) -> Result<u64, ClientError>;
    /// Exchanges the refresh token for a new access token.
    async fn refresh_token(&self) -> Result<(), ClientError>;
    /// The current access token.
    async fn access_token(&self) -> Option<String>;

    async fn get_node(&self, id: u64) -> Result<NodeRecord, ClientError>;
    async fn get_organization(&self, id: u64) -> Result<Organization, ClientError>;
    async fn set_organization_public_key(&self, id: u64, public_key: String) -> Result<(), ClientError>;
    async fn get_collaboration(&self, id: u64) -> Result<Collaboration, ClientError>;
    async fn get_task(&self, id: u64) -> Result<TaskRecord, ClientError>;

    /// The open results of node `node_id`, across all the pages.
    async fn open_results(&self, node_id: u64, task_id: Option<u64>) -> Result<Vec<ResultRecord>, ClientError>;
    async fn patch_result(&self, id: u64, update: ResultUpdate) -> Result<(), ClientError>;
    async fn request_container_token(&self, task_id: u64, image: String) -> Result<String, ClientError>;

    /// Issues an arbitrary request on behalf of an algorithm container.
    async fn forward(&self, request: Request) -> Result<Value, ClientError>;
}

#[async_trait]
impl<H> ServerApi for Client<H>
where
    H: HttpBackend + 'static,
{
    async fn authenticate(&self, api_key: &str) -> Result<u64, ClientError> {
        match self.authenticate_node(api_key).await? {
            AuthOutcome::Authenticated => match self.identity() {
                Some(ClaimedIdentity::Node(id)) => Ok(*id),
                _ => Err(ClientError::Authentication(
                    "the token does not belong to a node".to_string(),
                )),
            },
            AuthOutcome::TwoFactorSetupRequired { .. } => Err(ClientError::Authentication(
                "nodes don't support two-factor authentication".to_string(),
            )),
        }
    }

    async fn refresh_token(&self) -> Result<(), ClientError> {
        Client::refresh_token(self).await
    }

    async fn access_token(&self) -> Option<String> {
        Client::access_token(self).await
    }

    async fn get_node(&self, id: u64) -> Result<NodeRecord, ClientError> {
        Client::get_node(self, id).await
    }

    async fn get_organization(&self, id: u64) -> Result<Organization, ClientError> {
        Client::get_organization(self, id).await
    }

    async fn set_organization_public_key(&self, id: u64, public_key: String) -> Result<(), ClientError> {
        Client::set_organization_public_key(self, id, &public_key).await
    }

    async fn get_collaboration(&self, id: u64) -> Result<Collaboration, ClientError> {
        Client::get_collaboration(self, id).await
    }

    async fn get_task(&self, id: u64) -> Result<TaskRecord, ClientError> {
        Client::get_task(self, id).await
    }

    async fn open_results(&self, node_id: u64, task_id: Option<u64>) -> Result<Vec<ResultRecord>, ClientError> {
        Client::open_results(self, node_id, task_id).await
    }

    async fn patch_result(&self, id: u64, update: ResultUpdate) -> Result<(), ClientError> {
        Client::patch_result(self, id, &update).await
    }

    async fn request_container_token(&self, task_id: u64, image: String) -> Result<String, ClientError> {
        Client::request_container_token(self, task_id, &image).await
    }

    async fn forward(&self, request: Request) -> Result<Value, ClientError> {
        self.request(request).await
    }
}
