use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use vantage6_core::PrincipalKind;

use crate::{Client, ClientSettings, HttpBackend, HttpRequest, HttpResponse, TransportError};

/// A backend that answers with scripted responses and records the requests.
#[derive(Debug, Default, Clone)]
pub struct FakeBackend {
    responses: Arc<Mutex<VecDeque<Result<HttpResponse, TransportError>>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl FakeBackend {
    pub fn push(&self, status: u16, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(HttpResponse::new(status, body)));
    }

    pub fn push_err(&self, error: TransportError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpBackend for FakeBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(404, json!({"msg": "no scripted response"}))))
    }
}

fn token_with(payload: Value) -> String {
    let header = base64::encode_config(br#"{"alg":"HS256","typ":"JWT"}"#, base64::URL_SAFE_NO_PAD);
    let payload = base64::encode_config(payload.to_string(), base64::URL_SAFE_NO_PAD);
    format!("{}.{}.signature", header, payload)
}

pub fn node_token(node_id: u64) -> String {
    token_with(json!({"sub": node_id, "user_claims": {"type": "node", "roles": ["node"]}}))
}

pub fn container_token() -> String {
    token_with(json!({
        "sub": {
            "node_id": 3,
            "organization_id": 2,
            "collaboration_id": 1,
            "task_id": 42,
            "image": "harbor/average",
        },
        "user_claims": {"type": "container"},
    }))
}

/// A node client that authenticated as node `3` against `backend`.
pub async fn node_client(backend: &FakeBackend) -> Client<FakeBackend> {
    let client = Client::new(
        backend.clone(),
        ClientSettings::new("http://localhost:5000/api"),
        PrincipalKind::Node,
    )
    .unwrap();
    backend.push(
        200,
        json!({
            "access_token": node_token(3),
            "refresh_token": "refresh",
            "refresh_url": "/api/token/refresh",
        }),
    );
    client.authenticate_node("api-key").await.unwrap();
    client
}
