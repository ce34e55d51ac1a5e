//! Mock implementations for testing without a server or a screen
//!
//! # Usage
//!
//! ```no_run
//! use inkview_client::mock::{MockTransport, RecordingPresenter};
//! use serde_json::json;
//!
//! let transport = MockTransport::new();
//! transport.push_json("/api/setup", 200, json!({"status": 200, "image_url": "a.png", "api_key": "k1"}));
//!
//! let presenter = RecordingPresenter::new();
//! ```

use crate::{ApiRequest, ApiResponse, ClientError, Presenter, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Transport that answers from scripted responses and records every request.
///
/// Responses are queued per URL path and consumed in order. A request to a
/// path with no queued response gets an HTTP 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, VecDeque<ApiResponse>>>,
    requests: Mutex<Vec<ApiRequest>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response for `path`
    pub fn push_response(&self, path: &str, status: u16, body: impl Into<String>) {
        lock(&self.responses)
            .entry(path.to_string())
            .or_default()
            .push_back(ApiResponse::new(status, body));
    }

    /// Queue a JSON response for `path`
    pub fn push_json(&self, path: &str, status: u16, body: serde_json::Value) {
        self.push_response(path, status, body.to_string());
    }

    /// All requests seen so far, oldest first
    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    /// Requests whose URL path is `path`
    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.url.path() == path)
            .cloned()
            .collect()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Hold every subsequent request in flight until the returned handle is notified.
    ///
    /// Each `notify_one` releases one request.
    pub fn hold_requests(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let path = request.url.path().to_string();
        lock(&self.requests).push(request);

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let response = lock(&self.responses)
            .get_mut(&path)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| ApiResponse::new(404, ""));

        Ok(response)
    }
}

/// One call made on a [`RecordingPresenter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterCall {
    ShowImage(String),
    SetControls(bool),
    Alert(String),
}

/// Presenter that records every call
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    calls: Mutex<Vec<PresenterCall>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PresenterCall> {
        lock(&self.calls).clone()
    }

    /// Image URLs shown, oldest first
    pub fn images(&self) -> Vec<String> {
        self.filter(|call| match call {
            PresenterCall::ShowImage(url) => Some(url.clone()),
            _ => None,
        })
    }

    /// Control states signalled, oldest first
    pub fn controls(&self) -> Vec<bool> {
        self.filter(|call| match call {
            PresenterCall::SetControls(running) => Some(*running),
            _ => None,
        })
    }

    pub fn alerts(&self) -> Vec<String> {
        self.filter(|call| match call {
            PresenterCall::Alert(message) => Some(message.clone()),
            _ => None,
        })
    }

    /// Most recently shown image
    pub fn current_image(&self) -> Option<String> {
        self.images().pop()
    }

    fn filter<T>(&self, f: impl Fn(&PresenterCall) -> Option<T>) -> Vec<T> {
        lock(&self.calls).iter().filter_map(f).collect()
    }

    fn record(&self, call: PresenterCall) {
        lock(&self.calls).push(call);
    }
}

impl Presenter for RecordingPresenter {
    fn show_image(&self, url: &str) {
        self.record(PresenterCall::ShowImage(url.to_string()));
    }

    fn set_controls_enabled(&self, running: bool) {
        self.record(PresenterCall::SetControls(running));
    }

    fn alert(&self, message: &str) {
        self.record(PresenterCall::Alert(message.to_string()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
