//! The proxy server algorithm containers reach the server through.
//!
//! Containers run on an isolated network and never see the credentials of
//! the node. Every request is forwarded as-is with the bearer token of the
//! container, except that:
//!
//! - `POST task` bodies get the `input` of every organization encrypted for
//!   that organization,
//! - `GET result` and `GET result/{id}` responses get their `result` fields
//!   decrypted with the cryptor of the node.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};
use vantage6_client::{ClientError, Method, Request};
use vantage6_core::{
    crypto::{CryptoError, Cryptor},
    Organization,
};
use warp::{
    http::{self, StatusCode},
    path::FullPath,
    reply::{Reply, Response},
    Filter,
};

use crate::server::ServerApi;

#[derive(Debug, Error)]
/// Errors of the proxy server.
pub enum ProxyError {
    #[error("the request has no authorization header")]
    Unauthorized,
    #[error("method {0} is not supported")]
    Method(String),
    #[error("invalid JSON body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("invalid input encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Server(#[from] ClientError),
}

impl ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::Method(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Body(_) | ProxyError::Encoding(_) => StatusCode::BAD_REQUEST,
            ProxyError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Server(ClientError::Status { status, body }) => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                return warp::reply::with_status(warp::reply::json(body), status).into_response();
            }
            ProxyError::Server(_) => StatusCode::BAD_GATEWAY,
        };
        warp::reply::with_status(warp::reply::json(&json!({ "msg": self.to_string() })), status)
            .into_response()
    }
}

fn client_method(method: &http::Method) -> Result<Method, ProxyError> {
    match method.as_str() {
        "GET" => Ok(Method::Get),
        "POST" => Ok(Method::Post),
        "PUT" => Ok(Method::Put),
        "PATCH" => Ok(Method::Patch),
        "DELETE" => Ok(Method::Delete),
        other => Err(ProxyError::Method(other.to_string())),
    }
}

pub struct Proxy<S> {
    server: Arc<S>,
    cryptor: Arc<dyn Cryptor>,
}

impl<S> Proxy<S>
where
    S: ServerApi,
{
    pub fn new(server: Arc<S>, cryptor: Arc<dyn Cryptor>) -> Self {
        Self { server, cryptor }
    }

    fn request(method: Method, endpoint: &str, authorization: &str) -> Request {
        Request::new(method, endpoint)
            .header("Authorization", authorization)
            .unauthenticated()
            .no_retry()
    }

    /// Forwards a request of a container to the server.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        query: &str,
        authorization: Option<String>,
        body: &[u8],
    ) -> Result<Value, ProxyError> {
        let authorization = authorization.ok_or(ProxyError::Unauthorized)?;
        let endpoint = path.trim_start_matches('/');
        debug!("forwarding {} {}", method, endpoint);

        let mut json = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_slice::<Value>(body)?)
        };
        if method == Method::Post && endpoint == "task" {
            if let Some(json) = json.as_mut() {
                self.encrypt_task_input(json, &authorization).await?;
            }
        }

        let mut request = Self::request(method, endpoint, &authorization);
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            request = request.param(key, value);
        }
        if let Some(json) = json {
            request = request.json(json);
        }
        let mut response = self.server.forward(request).await?;

        if method == Method::Get && (endpoint == "result" || endpoint.starts_with("result/")) {
            self.decrypt_results(&mut response);
        }
        Ok(response)
    }

    async fn public_key(&self, organization_id: u64, authorization: &str) -> Result<String, ProxyError> {
        let request = Self::request(
            Method::Get,
            &format!("organization/{}", organization_id),
            authorization,
        );
        let organization: Organization = serde_json::from_value(self.server.forward(request).await?)?;
        Ok(organization.public_key.unwrap_or_default())
    }

    /// Encrypts the base64 `input` of each organization of a new task.
    async fn encrypt_task_input(&self, task: &mut Value, authorization: &str) -> Result<(), ProxyError> {
        let organizations = match task.get_mut("organizations").and_then(Value::as_array_mut) {
            Some(organizations) => organizations,
            None => return Ok(()),
        };
        for organization in organizations {
            let id = match organization.get("id").and_then(Value::as_u64) {
                Some(id) => id,
                None => continue,
            };
            let input = match organization.get("input").and_then(Value::as_str) {
                Some(input) => base64::decode(input.trim())?,
                None => continue,
            };
            let public_key = self.public_key(id, authorization).await?;
            let encrypted = self.cryptor.encrypt_bytes_to_str(&input, &public_key)?;
            organization["input"] = Value::String(encrypted);
        }
        Ok(())
    }

    fn decrypt_results(&self, body: &mut Value) {
        if let Some(results) = body.get_mut("data").and_then(Value::as_array_mut) {
            results.iter_mut().for_each(|result| self.decrypt_result(result));
            return;
        }
        if let Some(results) = body.as_array_mut() {
            results.iter_mut().for_each(|result| self.decrypt_result(result));
            return;
        }
        self.decrypt_result(body);
    }

    /// Replaces the encrypted `result` by its base64 plaintext.
    fn decrypt_result(&self, result: &mut Value) {
        if let Some(Value::String(encrypted)) = result.get_mut("result") {
            match self.cryptor.decrypt_str_to_bytes(encrypted) {
                Ok(plaintext) => *encrypted = base64::encode(plaintext),
                Err(e) => warn!("failed to decrypt a result: {}", e),
            }
        }
    }
}

/// The routes of the proxy server: every request is forwarded.
pub fn routes<S>(proxy: Arc<Proxy<S>>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone
where
    S: ServerApi,
{
    let raw_query = warp::query::raw()
        .or(warp::any().map(String::new))
        .unify();
    warp::method()
        .and(warp::path::full())
        .and(raw_query)
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .and(with_proxy(proxy))
        .and_then(handle_forward)
        .recover(handle_reject)
        .unify()
        .with(warp::trace::named("proxy"))
}

/// Starts the proxy server at `bind_address`.
pub async fn serve<S>(bind_address: SocketAddr, proxy: Proxy<S>)
where
    S: ServerApi,
{
    warp::serve(routes(Arc::new(proxy))).run(bind_address).await
}

async fn handle_forward<S>(
    method: http::Method,
    path: FullPath,
    query: String,
    authorization: Option<String>,
    body: Bytes,
    proxy: Arc<Proxy<S>>,
) -> Result<Response, Infallible>
where
    S: ServerApi,
{
    let forwarded = match client_method(&method) {
        Ok(method) => {
            proxy
                .forward(method, path.as_str(), &query, authorization, &body)
                .await
        }
        Err(e) => Err(e),
    };
    Ok(match forwarded {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => {
            warn!("failed to forward {} {}: {}", method, path.as_str(), e);
            e.into_response()
        }
    })
}

/// Converts a proxy into a `warp` filter.
fn with_proxy<S>(proxy: Arc<Proxy<S>>) -> impl Filter<Extract = (Arc<Proxy<S>>,), Error = Infallible> + Clone
where
    S: ServerApi,
{
    warp::any().map(move || proxy.clone())
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<Response, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok(warp::reply::with_status(Vec::new(), code).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use vantage6_core::crypto::{DummyCryptor, SealedBoxCryptor};

    use super::*;
    use crate::server::MockServerApi;

    fn proxy(server: MockServerApi, cryptor: Arc<dyn Cryptor>) -> Arc<Proxy<MockServerApi>> {
        Arc::new(Proxy::new(Arc::new(server), cryptor))
    }

    fn forwarded_as_container(request: &Request) -> bool {
        request
            .headers()
            .iter()
            .any(|(name, value)| name == "Authorization" && value == "Bearer container")
            && !request.is_authenticated()
            && !request.retries()
    }

    #[tokio::test]
    async fn test_request_is_forwarded_with_the_container_token() {
        let mut server = MockServerApi::new();
        server
            .expect_forward()
            .withf(|request| {
                request.method() == Method::Get
                    && request.endpoint() == "node"
                    && request.params() == [("organization_id".to_string(), "2".to_string())]
                    && forwarded_as_container(request)
            })
            .times(1)
            .returning(|_| Ok(json!([{"id": 3}])));
        let routes = routes(proxy(server, Arc::new(DummyCryptor)));

        let response = warp::test::request()
            .method("GET")
            .path("/node?organization_id=2")
            .header("authorization", "Bearer container")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body, json!([{"id": 3}]));
    }

    #[tokio::test]
    async fn test_missing_authorization_is_rejected() {
        let mut server = MockServerApi::new();
        server.expect_forward().never();
        let routes = routes(proxy(server, Arc::new(DummyCryptor)));

        let response = warp::test::request().method("GET").path("/task/1").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected() {
        let mut server = MockServerApi::new();
        server.expect_forward().never();
        let routes = routes(proxy(server, Arc::new(DummyCryptor)));

        let response = warp::test::request()
            .method("OPTIONS")
            .path("/task")
            .header("authorization", "Bearer container")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_server_errors_are_passed_on() {
        let mut server = MockServerApi::new();
        server.expect_forward().returning(|_| {
            Err(ClientError::Status {
                status: 403,
                body: json!({"msg": "You don't have the rule (task, collaboration, create)"}),
            })
        });
        let routes = routes(proxy(server, Arc::new(DummyCryptor)));

        let response = warp::test::request()
            .method("POST")
            .path("/task")
            .header("authorization", "Bearer container")
            .json(&json!({"image": "harbor/average"}))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["msg"], "You don't have the rule (task, collaboration, create)");
    }

    #[tokio::test]
    async fn test_task_input_is_encrypted_per_organization() {
        let organization = SealedBoxCryptor::generate().unwrap();
        let public_key = organization.public_key_str().unwrap();
        let posted = Arc::new(Mutex::new(None));

        let mut server = MockServerApi::new();
        server
            .expect_forward()
            .withf(|request| request.endpoint() == "organization/2" && forwarded_as_container(request))
            .times(1)
            .returning(move |_| Ok(json!({"id": 2, "name": "hospital", "public_key": public_key})));
        let captured = posted.clone();
        server
            .expect_forward()
            .withf(|request| request.method() == Method::Post && request.endpoint() == "task")
            .times(1)
            .returning(move |request| {
                *captured.lock().unwrap() = request.body().cloned();
                Ok(json!({"id": 43}))
            });
        let proxy = proxy(server, Arc::new(SealedBoxCryptor::generate().unwrap()));

        let body = json!({
            "image": "harbor/average",
            "collaboration_id": 1,
            "organizations": [{"id": 2, "input": base64::encode(b"partial")}],
        });
        let response = proxy
            .forward(
                Method::Post,
                "/task",
                "",
                Some("Bearer container".to_string()),
                body.to_string().as_bytes(),
            )
            .await
            .unwrap();
        assert_eq!(response, json!({"id": 43}));

        let posted = posted.lock().unwrap().clone().unwrap();
        let input = posted["organizations"][0]["input"].as_str().unwrap();
        assert_eq!(organization.decrypt_str_to_bytes(input).unwrap(), b"partial".to_vec());
    }

    #[tokio::test]
    async fn test_results_are_decrypted() {
        let node = SealedBoxCryptor::generate().unwrap();
        let encrypted = node
            .encrypt_bytes_to_str(b"mean: 4.2", &node.public_key_str().unwrap())
            .unwrap();

        let mut server = MockServerApi::new();
        server.expect_forward().returning(move |_| {
            Ok(json!({
                "data": [
                    {"id": 1, "result": encrypted.clone()},
                    {"id": 2, "result": null},
                ],
                "links": {"next": null},
            }))
        });
        let proxy = proxy(server, Arc::new(node));

        let response = proxy
            .forward(Method::Get, "/result", "task_id=4", Some("Bearer container".to_string()), b"")
            .await
            .unwrap();
        assert_eq!(response["data"][0]["result"], base64::encode(b"mean: 4.2"));
        assert!(response["data"][1]["result"].is_null());
    }
}
