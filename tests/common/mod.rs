//! Common test infrastructure for `reqscript`.
//!
//! Provides a canned network executor (no mocks of the engine itself; the
//! real bridge, tracker and drain loop run against it) plus a
//! current-thread async runner for the engine's thread-bound futures.

use async_trait::async_trait;
use reqscript::{Error, NetworkExecutor, RawResponse, RequestDescriptor};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Runs an engine future to completion on a current-thread tokio runtime.
///
/// Engine futures are not `Send`, so `block_on` is the right shape here.
#[allow(dead_code)]
pub fn run_async<T>(future: impl Future<Output = T>) -> T {
    init_logging();
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("build test runtime")
        .block_on(future)
}

/// Opt-in tracing output for debugging a failing scenario
/// (`RUST_LOG=reqscript=trace cargo test`).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One canned answer for a route.
pub struct CannedRoute {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

#[allow(dead_code)]
impl CannedRoute {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: body.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Canned network executor keyed by exact URL. Unrouted URLs fail the way a
/// dead host would, and every request is recorded for inspection.
#[derive(Default)]
pub struct MockExecutor {
    routes: HashMap<String, CannedRoute>,
    requests: Mutex<Vec<RequestDescriptor>>,
}

#[allow(dead_code)]
impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn route(mut self, url: &str, canned: CannedRoute) -> Self {
        self.routes.insert(url.to_string(), canned);
        self
    }

    /// Requests seen so far, in dispatch order.
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl NetworkExecutor for MockExecutor {
    async fn execute(&self, request: RequestDescriptor) -> reqscript::Result<RawResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let Some(canned) = self.routes.get(&request.url) else {
            return Err(Error::network(format!("no route for {}", request.url)));
        };
        if canned.delay > Duration::ZERO {
            tokio::time::sleep(canned.delay).await;
        }
        Ok(
            RawResponse::from_bytes(canned.status, canned.headers.clone(), canned.body.clone()),
        )
    }
}

/// The request under edit in most scenarios.
#[allow(dead_code)]
pub fn sample_request() -> RequestDescriptor {
    reqscript::to_network_request(
        "https://api.test/base",
        &serde_json::json!({"method": "GET", "headers": {"Accept": "application/json"}}),
    )
}
