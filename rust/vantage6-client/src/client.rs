use std::{sync::Arc, time::Duration};

use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, error, info, warn};
use url::Url;
use vantage6_core::identity::{ClaimedIdentity, ClaimsError, PrincipalKind, TokenClaims, WhoAmI};

use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Method, TransportError};

/// Error returned by a [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("failed to reach the server after {0} attempts")]
    ConnectionAttemptsExceeded(u32),

    #[error("the server responded with status {status}: {body}")]
    Status { status: u16, body: Value },

    #[error("failed to deserialize data: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("containers cannot refresh their token")]
    RefreshNotAllowed,

    #[error("the client is not authenticated")]
    NotAuthenticated,

    #[error("invalid token: {0}")]
    Claims(#[from] ClaimsError),
}

impl ClientError {
    /// The HTTP status, if the server answered with an error status.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Settings of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// The root of the server API, e.g. `https://server.example:5000/api`.
    pub api_url: String,
    /// How often a request is attempted when the server can't be reached.
    /// `None` retries forever.
    pub attempts_on_timeout: Option<u32>,
    /// The delay between two connection attempts.
    pub retry_delay: Duration,
}

impl ClientSettings {
    pub fn new<S: Into<String>>(api_url: S) -> Self {
        Self {
            api_url: api_url.into(),
            attempts_on_timeout: None,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// The outcome of a successful authentication call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The tokens have been stored and the client can issue requests.
    Authenticated,
    /// The user must first set up two-factor authentication.
    TwoFactorSetupRequired {
        qr_uri: String,
        otp_secret: Option<String>,
    },
}

/// A request against the server API.
#[derive(Debug, Clone)]
pub struct Request {
    endpoint: String,
    method: Method,
    json: Option<Value>,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    retry: bool,
    authenticated: bool,
}

impl Request {
    /// Creates a request. `endpoint` is resolved against the API root, unless
    /// it is an absolute path or URL.
    pub fn new<S: Into<String>>(method: Method, endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            json: None,
            params: Vec::new(),
            headers: Vec::new(),
            retry: true,
            authenticated: true,
        }
    }

    pub fn get<S: Into<String>>(endpoint: S) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn post<S: Into<String>>(endpoint: S) -> Self {
        Self::new(Method::Post, endpoint)
    }

    pub fn patch<S: Into<String>>(endpoint: S) -> Self {
        Self::new(Method::Patch, endpoint)
    }

    pub fn json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn param<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Don't refresh the token and retry when the server answers with an error.
    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Don't send the access token.
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn body(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn retries(&self) -> bool {
        self.retry
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
    refresh_url: Option<String>,
    /// Incremented every time the access token changes.
    generation: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_url: Option<String>,
}

struct Inner<H> {
    http: H,
    base_url: Url,
    settings: ClientSettings,
    kind: PrincipalKind,
    tokens: Mutex<Tokens>,
    identity: OnceCell<ClaimedIdentity>,
    whoami: OnceCell<WhoAmI>,
}

/// A client that communicates with the server API via HTTP(S).
///
/// Cloning a client is cheap, and all the clones share the same tokens: a
/// refresh by one of them is seen by all.
pub struct Client<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for Client<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H> Client<H>
where
    H: HttpBackend,
{
    /// Creates a client for a principal of the given kind.
    ///
    /// # Errors
    /// Fails if the API URL is invalid.
    pub fn new(http: H, settings: ClientSettings, kind: PrincipalKind) -> Result<Self, ClientError> {
        Self::with_tokens(http, settings, kind, Tokens::default())
    }

    /// Creates a client for an algorithm container. Its identity is derived
    /// once from the token.
    pub fn container<S: Into<String>>(
        http: H,
        settings: ClientSettings,
        container_token: S,
    ) -> Result<Self, ClientError> {
        let token = container_token.into();
        let identity = TokenClaims::from_token(&token)?.identity()?;
        if identity.kind() != PrincipalKind::Container {
            return Err(ClientError::Authentication(format!(
                "received a token for a {} instead of a container",
                identity.kind()
            )));
        }
        let tokens = Tokens {
            access: Some(token),
            generation: 1,
            ..Tokens::default()
        };
        let client = Self::with_tokens(http, settings, PrincipalKind::Container, tokens)?;
        let _ = client.inner.identity.set(identity);
        Ok(client)
    }

    fn with_tokens(
        http: H,
        settings: ClientSettings,
        kind: PrincipalKind,
        tokens: Tokens,
    ) -> Result<Self, ClientError> {
        let mut api_url = settings.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let base_url = Url::parse(&api_url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url,
                settings,
                kind,
                tokens: Mutex::new(tokens),
                identity: OnceCell::new(),
                whoami: OnceCell::new(),
            }),
        })
    }

    pub fn kind(&self) -> PrincipalKind {
        self.inner.kind
    }

    /// The identity the access token was issued to.
    pub fn identity(&self) -> Option<&ClaimedIdentity> {
        self.inner.identity.get()
    }

    pub fn whoami(&self) -> Option<&WhoAmI> {
        self.inner.whoami.get()
    }

    /// Stores who this client is. This can only be done once, later calls
    /// return `false` and leave the identity untouched.
    pub fn set_whoami(&self, whoami: WhoAmI) -> bool {
        self.inner.whoami.set(whoami).is_ok()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.tokens.lock().await.access.clone()
    }

    /// Sends a request and returns the JSON body of the response.
    ///
    /// If the server answers with a status above `210` the error body is
    /// logged. Unless the request opted out, the access token is then
    /// refreshed and the request is sent once more. A second failure is
    /// returned to the caller.
    ///
    /// # Errors
    /// Fails when the server answers with an error status, when the server
    /// can't be reached within the configured attempts, or when refreshing
    /// the token fails.
    pub async fn request(&self, request: Request) -> Result<Value, ClientError> {
        let mut first_try = true;
        loop {
            let (token, generation) = {
                let tokens = self.inner.tokens.lock().await;
                (tokens.access.clone(), tokens.generation)
            };
            let http_request = self.resolve(&request, token.as_deref())?;
            let HttpResponse { status, body } = self.dispatch(http_request).await?;
            if status <= 210 {
                return Ok(body);
            }
            error!(
                "{} {} failed with status {}: {}",
                request.method, request.endpoint, status, body
            );
            if request.retry && first_try {
                first_try = false;
                self.refresh_if_unchanged(generation).await?;
                continue;
            }
            return Err(ClientError::Status { status, body });
        }
    }

    /// Authenticates with the given credentials at `path`.
    ///
    /// # Errors
    /// Fails if the server rejects the credentials or returns a token that
    /// was issued to another kind of principal.
    pub async fn authenticate(&self, credentials: Value, path: &str) -> Result<AuthOutcome, ClientError> {
        let request = Request::post(path)
            .json(credentials)
            .unauthenticated()
            .no_retry();
        let body = match self.request(request).await {
            Ok(body) => body,
            Err(ClientError::Status { status, body }) => {
                let msg = body
                    .get("msg")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("the server responded with status {}", status));
                return Err(ClientError::Authentication(msg));
            }
            Err(e) => return Err(e),
        };

        if let Some(qr_uri) = body.get("qr_uri").and_then(Value::as_str) {
            info!("two-factor authentication must be set up before logging in");
            return Ok(AuthOutcome::TwoFactorSetupRequired {
                qr_uri: qr_uri.to_string(),
                otp_secret: body
                    .get("otp_secret")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let TokenResponse {
            access_token,
            refresh_token,
            refresh_url,
        } = serde_json::from_value(body)?;
        let identity = TokenClaims::from_token(&access_token)?.identity()?;
        if identity.kind() != self.inner.kind {
            return Err(ClientError::Authentication(format!(
                "received a token for a {} while authenticating a {}",
                identity.kind(),
                self.inner.kind
            )));
        }
        if let Err(identity) = self.inner.identity.set(identity) {
            if let Some(current) = self.inner.identity.get().filter(|current| **current != identity) {
                error!("received a token for {:?} while authenticated as {:?}", identity, current);
                return Err(ClientError::Authentication(format!(
                    "the client is authenticated as {:?} already",
                    current
                )));
            }
        }

        let mut tokens = self.inner.tokens.lock().await;
        tokens.access = Some(access_token);
        tokens.refresh = refresh_token;
        tokens.refresh_url = refresh_url;
        tokens.generation += 1;
        info!("successfully authenticated as {}", self.inner.kind);
        Ok(AuthOutcome::Authenticated)
    }

    /// Authenticates a node with its API key.
    pub async fn authenticate_node(&self, api_key: &str) -> Result<AuthOutcome, ClientError> {
        self.authenticate(json!({ "api_key": api_key }), "token/node")
            .await
    }

    /// Obtains a new access token with the refresh token received at
    /// authentication.
    ///
    /// # Errors
    /// Fails immediately for container clients. Fails with
    /// [`ClientError::Authentication`] if the server refuses the refresh.
    pub async fn refresh_token(&self) -> Result<(), ClientError> {
        self.ensure_refreshable()?;
        let mut tokens = self.inner.tokens.lock().await;
        self.refresh_locked(&mut tokens).await
    }

    /// Refreshes the token unless it changed since `generation` was read,
    /// which means another task refreshed it in the meantime.
    async fn refresh_if_unchanged(&self, generation: u64) -> Result<(), ClientError> {
        self.ensure_refreshable()?;
        let mut tokens = self.inner.tokens.lock().await;
        if tokens.generation != generation {
            debug!("access token already refreshed");
            return Ok(());
        }
        self.refresh_locked(&mut tokens).await
    }

    fn ensure_refreshable(&self) -> Result<(), ClientError> {
        if self.inner.kind == PrincipalKind::Container {
            error!("refusing to refresh the token of a container");
            return Err(ClientError::RefreshNotAllowed);
        }
        Ok(())
    }

    async fn refresh_locked(&self, tokens: &mut Tokens) -> Result<(), ClientError> {
        let (refresh_token, refresh_url) = match (&tokens.refresh, &tokens.refresh_url) {
            (Some(token), Some(url)) => (token.clone(), url.clone()),
            _ => return Err(ClientError::NotAuthenticated),
        };
        info!("refreshing the access token");
        let request = Request::post(refresh_url).unauthenticated().no_retry();
        let http_request = self.resolve(&request, None).map(|mut http_request| {
            http_request
                .headers
                .push(("Authorization".to_string(), format!("Bearer {}", refresh_token)));
            http_request
        })?;
        let HttpResponse { status, body } = self
            .dispatch(http_request)
            .await
            .map_err(|e| ClientError::Authentication(format!("{}", e)))?;
        if status > 210 {
            error!("failed to refresh the access token ({}): {}", status, body);
            return Err(ClientError::Authentication(format!(
                "the refresh was rejected with status {}",
                status
            )));
        }
        let TokenResponse {
            access_token,
            refresh_token,
            refresh_url,
        } = serde_json::from_value(body)?;
        tokens.access = Some(access_token);
        if refresh_token.is_some() {
            tokens.refresh = refresh_token;
        }
        if refresh_url.is_some() {
            tokens.refresh_url = refresh_url;
        }
        tokens.generation += 1;
        Ok(())
    }

    /// Turns a [`Request`] into an [`HttpRequest`].
    fn resolve(&self, request: &Request, token: Option<&str>) -> Result<HttpRequest, ClientError> {
        // absolute paths (e.g. pagination links) replace the API path
        let mut url = self.inner.base_url.join(&request.endpoint)?;
        if !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.params {
                pairs.append_pair(key, value);
            }
        }

        let overrides_auth = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        let mut headers = Vec::with_capacity(request.headers.len() + 1);
        match token {
            Some(token) if request.authenticated && !overrides_auth => {
                headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
            }
            _ => {}
        }
        headers.extend(request.headers.iter().cloned());

        Ok(HttpRequest {
            method: request.method,
            url,
            headers,
            json: request.json.clone(),
        })
    }

    /// Sends the request, retrying while the server can't be reached.
    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut attempts = 0_u32;
        loop {
            match self.inner.http.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Connection(reason)) => {
                    attempts += 1;
                    if let Some(max) = self.inner.settings.attempts_on_timeout {
                        if attempts >= max {
                            error!("giving up on {} after {} attempts", request.url, attempts);
                            return Err(ClientError::ConnectionAttemptsExceeded(attempts));
                        }
                    }
                    warn!(
                        "could not reach {}: {} (retrying in {:?})",
                        request.url, reason, self.inner.settings.retry_delay
                    );
                    sleep(self.inner.settings.retry_delay).await;
                }
                Err(TransportError::Other(reason)) => return Err(ClientError::Transport(reason)),
            }
        }
    }
}
