//! Shared utilities for integration tests.
//!
//! Provides snapshot builders and an HTTP target stub served by axum.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use cloudevents::{Event, EventBuilder, EventBuilderV10};

use cellbroker::targets::{CellTenant, CellTenantType, Queue, State as ResourceState, Target};

/// HTTP target that fails its first `fail_first` requests with 500 and
/// records the `ce-id` of every request.
#[derive(Clone, Default)]
pub struct TargetStub {
    fail_first: usize,
    calls: Arc<AtomicUsize>,
    ids: Arc<Mutex<Vec<String>>>,
}

impl TargetStub {
    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Serve on an ephemeral port and return the URL.
    pub async fn serve(&self) -> String {
        let router = Router::new()
            .route("/", post(handle))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/")
    }
}

async fn handle(State(stub): State<TargetStub>, headers: HeaderMap) -> StatusCode {
    let call = stub.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(id) = headers.get("ce-id").and_then(|v| v.to_str().ok()) {
        stub.ids.lock().unwrap().push(id.to_string());
    }
    if call < stub.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::ACCEPTED
    }
}

pub fn tenant(namespace: &str, name: &str) -> CellTenant {
    CellTenant {
        id: format!("{namespace}-{name}"),
        tenant_type: CellTenantType::Broker as i32,
        namespace: namespace.to_string(),
        name: name.to_string(),
        address: "http://127.0.0.1:1/".to_string(),
        decouple_queue: Some(Queue::new(
            format!("decouple-{name}"),
            format!("decouple-{name}-sub"),
        )),
        state: ResourceState::Ready as i32,
        ..Default::default()
    }
}

pub fn target(name: &str, address: &str) -> Target {
    Target {
        id: format!("target-{name}"),
        name: name.to_string(),
        address: address.to_string(),
        retry_queue: Some(Queue::new(
            format!("retry-{name}"),
            format!("retry-{name}-sub"),
        )),
        state: ResourceState::Ready as i32,
        ..Default::default()
    }
}

pub fn event(id: &str, ty: &str) -> Event {
    EventBuilderV10::new()
        .id(id)
        .ty(ty)
        .source("/integration")
        .data("application/json", serde_json::json!({"n": id}))
        .build()
        .unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
