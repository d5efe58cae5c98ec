//! Test fixtures and recording implementations.
//!
//! Snapshot builders with deterministic ids, a processor that records what
//! it sees, and an HTTP stub endpoint served by axum on an ephemeral port.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use cloudevents::{AttributesReader, Event, EventBuilder, EventBuilderV10};

use crate::processors::{Link, ProcessError, ProcessRequest, Processor, Result as ProcessResult};
use crate::targets::{CellTenant, CellTenantType, Queue, State as ResourceState, Target, TargetsConfig};

// ============================================================================
// Snapshot fixtures
// ============================================================================

/// Ready broker tenant with a decouple queue and an unreachable address.
pub fn make_tenant(namespace: &str, name: &str) -> CellTenant {
    CellTenant {
        id: format!("{namespace}-{name}"),
        tenant_type: CellTenantType::Broker as i32,
        namespace: namespace.to_string(),
        name: name.to_string(),
        address: format!("http://127.0.0.1:1/{namespace}/{name}"),
        decouple_queue: Some(Queue::new(
            format!("decouple-{namespace}-{name}"),
            format!("decouple-{namespace}-{name}-sub"),
        )),
        targets: Default::default(),
        state: ResourceState::Ready as i32,
    }
}

/// Ready target with a retry queue and an empty (match-all) filter.
pub fn make_target(name: &str, address: &str) -> Target {
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

/// Snapshot with the single broker tenant `ns/default` owning `targets`.
pub fn make_targets_config(targets: &[&str]) -> TargetsConfig {
    let tenant = targets.iter().fold(make_tenant("ns", "default"), |tenant, name| {
        tenant.with_target(make_target(name, &format!("http://127.0.0.1:1/{name}")))
    });
    TargetsConfig::default().with_tenant(tenant)
}

/// JSON event of type `dev.cellbroker.test`.
pub fn make_event(id: &str) -> Event {
    EventBuilderV10::new()
        .id(id)
        .ty("dev.cellbroker.test")
        .source("/cellbroker/tests")
        .data("application/json", serde_json::json!({"hello": "world"}))
        .build()
        .expect("valid test event")
}

// ============================================================================
// Recording processor
// ============================================================================

/// Records every request/event pair, then passes on to the next processor.
pub struct RecordingProcessor {
    link: Link,
    name: &'static str,
    seen: Mutex<Vec<(ProcessRequest, Event)>>,
    fail_for: Option<String>,
    delay: Option<Duration>,
}

impl RecordingProcessor {
    pub fn new(name: &'static str) -> Self {
        Self {
            link: Link::default(),
            name,
            seen: Mutex::new(Vec::new()),
            fail_for: None,
            delay: None,
        }
    }

    /// Fails requests whose target is named `target`.
    pub fn failing_for(name: &'static str, target: &str) -> Self {
        Self {
            fail_for: Some(target.to_string()),
            ..Self::new(name)
        }
    }

    /// Sleeps before recording.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn seen(&self) -> Vec<(ProcessRequest, Event)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn link(&self) -> &Link {
        &self.link
    }

    async fn process(&self, request: &ProcessRequest, event: &Event) -> ProcessResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push((request.clone(), event.clone()));

        let target_name = request.target.as_ref().map(|t| t.name());
        if let (Some(fail), Some(name)) = (&self.fail_for, target_name) {
            if fail == name {
                return Err(ProcessError::Delivery {
                    target: name.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }
        self.next().process(request, event).await
    }
}

// ============================================================================
// HTTP stub endpoint
// ============================================================================

/// HTTP endpoint answering every POST with a fixed status and optional
/// binary-mode reply event, recording request headers.
#[derive(Clone)]
pub struct StubEndpoint {
    status: StatusCode,
    reply: Option<Event>,
    requests: Arc<Mutex<Vec<HeaderMap>>>,
}

impl StubEndpoint {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reply: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_reply(mut self, reply: Event) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Headers of every request received so far.
    pub fn requests(&self) -> Vec<HeaderMap> {
        self.requests.lock().unwrap().clone()
    }

    /// Serve on an ephemeral port and return the base URL.
    pub async fn serve(&self) -> String {
        let router = Router::new()
            .route("/", post(handle_stub))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/")
    }
}

async fn handle_stub(State(stub): State<StubEndpoint>, headers: HeaderMap, _body: Bytes) -> Response {
    stub.requests.lock().unwrap().push(headers);

    let Some(reply) = stub.reply.as_ref().filter(|_| stub.status.is_success()) else {
        return stub.status.into_response();
    };

    let mut builder = Response::builder()
        .status(stub.status)
        .header("ce-specversion", "1.0")
        .header("ce-id", reply.id())
        .header("ce-type", reply.ty())
        .header("ce-source", reply.source().to_string())
        .header("content-type", "application/json");
    for (name, value) in reply.iter_extensions() {
        builder = builder.header(format!("ce-{name}"), value.to_string());
    }
    builder
        .body(axum::body::Body::from("{\"reply\":true}"))
        .expect("valid stub response")
}
