//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pulls one page of changes from the server.
    async fn pull(&self, token: &str, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Pushes folded outbox changes to the server.
    async fn push(&self, token: &str, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Checks whether the network is believed to be reachable.
    fn is_connected(&self) -> bool;
}

/// A mock transport for testing.
///
/// Pull responses are served from a queue; an empty queue fails the pull.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    pull_responses: Mutex<VecDeque<SyncResult<PullResponse>>>,
    push_response: Mutex<Option<PushResponse>>,
    push_failure: Mutex<Option<String>>,
    pulls: Mutex<Vec<PullRequest>>,
    pushes: Mutex<Vec<PushRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new, connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            pull_responses: Mutex::new(VecDeque::new()),
            push_response: Mutex::new(None),
            push_failure: Mutex::new(None),
            pulls: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    /// Queues a pull response.
    pub fn queue_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(Ok(response));
    }

    /// Queues a pull failure.
    pub fn queue_pull_error(&self, error: SyncError) {
        self.pull_responses.lock().push_back(Err(error));
    }

    /// Sets the push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Makes every push fail with a retryable transport error until cleared.
    pub fn fail_pushes(&self, message: Option<&str>) {
        *self.push_failure.lock() = message.map(str::to_string);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Push requests received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn pull(&self, _token: &str, request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pulls.lock().push(request.clone());
        self.pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("no mock pull response queued".into())))
    }

    async fn push(&self, _token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pushes.lock().push(request.clone());
        if let Some(message) = self.push_failure.lock().clone() {
            return Err(SyncError::transport_retryable(message));
        }
        self.push_response
            .lock()
            .ok_or_else(|| SyncError::Protocol("no mock push response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
