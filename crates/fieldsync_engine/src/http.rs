//! HTTP transport implementation.
//!
//! Bodies are JSON. The HTTP client itself is abstracted behind
//! [`HttpClient`] so the transport runs the same over `reqwest` and over an
//! in-process [`LoopbackClient`].

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use fieldsync_protocol::{
    ErrorBody, PullRequest, PullResponse, PushRequest, PushResponse, WireMessage, PULL_PATH,
    PUSH_PATH,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpReply {
    /// A `200 OK` reply.
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }
}

/// HTTP client abstraction.
///
/// Implementations return `Err` only when no response was received at all;
/// error statuses come back as an [`HttpReply`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a JSON `POST` with an optional bearer token.
    async fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> SyncResult<HttpReply>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Network reachability as reported by the host application.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Records a connectivity change.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn set_error(&self, err: &SyncError) {
        *self.last_error.write() = Some(err.to_string());
    }

    async fn post_json<Req, Res>(&self, path: &str, token: &str, request: &Req) -> SyncResult<Res>
    where
        Req: WireMessage + Sync,
        Res: WireMessage,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, path);
        let result = match self.client.post(&url, Some(token), body).await {
            Ok(reply) => decode_reply(reply),
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(err) => {
                debug!(url = %url, error = %err, "sync request failed");
                self.set_error(err);
            }
        }
        result
    }
}

fn decode_reply<Res: WireMessage>(reply: HttpReply) -> SyncResult<Res> {
    if (200..300).contains(&reply.status) {
        return Ok(Res::decode(&reply.body)?);
    }

    let message = ErrorBody::decode(&reply.body)
        .map(|body| body.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(&reply.body).into_owned());
    let message = format!("HTTP {}: {}", reply.status, message);
    Err(match reply.status {
        401 | 403 => SyncError::AuthenticationFailed(message),
        400..=499 => SyncError::Rejected(message),
        _ => SyncError::ServerError(message),
    })
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn pull(&self, token: &str, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post_json(PULL_PATH, token, request).await
    }

    async fn push(&self, token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_json(PUSH_PATH, token, request).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}

/// [`HttpClient`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> SyncResult<HttpReply> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::transport_retryable(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        Ok(HttpReply {
            status,
            body: body.to_vec(),
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response.
    async fn handle_post(&self, path: &str, bearer: Option<&str>, body: &[u8]) -> HttpReply;
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server requests are routed to.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, bearer: Option<&str>, body: Vec<u8>) -> SyncResult<HttpReply> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle_post(path, bearer, &body).await)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
