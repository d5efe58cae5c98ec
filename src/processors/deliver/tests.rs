use super::*;
use crate::event::{decode_message, HOPS_ATTRIBUTE};
use crate::processors::chain_processors;
use crate::queue::ChannelQueue;
use crate::targets::{CellTenantKey, TargetsConfig};
use crate::test_utils::{make_event, make_target, make_tenant, RecordingProcessor, StubEndpoint};
use axum::http::StatusCode;
use cloudevents::{EventBuilder, EventBuilderV10};

const RETRY_TOPIC: &str = "retry-t";

struct Fixture {
    queue: Arc<ChannelQueue>,
    head: Arc<dyn Processor>,
    after: Arc<RecordingProcessor>,
}

/// One tenant `ns/b` whose only target `t` points at `target_url`.
fn fixture(target_url: &str, tenant_url: &str, retry: bool) -> Fixture {
    let mut tenant = make_tenant("ns", "b").with_target(make_target("t", target_url));
    tenant.address = tenant_url.to_string();
    let cache = Arc::new(TargetsCache::new(TargetsConfig::default().with_tenant(tenant)));

    let queue = Arc::new(ChannelQueue::default());
    let deliver = DeliverProcessor::new(Client::new(), cache, queue.clone())
        .with_retry_on_failure(retry)
        .with_delivery_timeout(Duration::from_secs(5));
    let after = Arc::new(RecordingProcessor::new("after"));
    let head = chain_processors(vec![Arc::new(deliver), after.clone()]);

    Fixture { queue, head, after }
}

fn request() -> ProcessRequest {
    ProcessRequest::for_target(CellTenantKey::broker("ns", "b").target_key("t"))
}

fn with_hops(id: &str, hops: i64) -> Event {
    let mut event = make_event(id);
    set_remaining_hops(&mut event, hops);
    event
}

fn reply_event() -> Event {
    EventBuilderV10::new()
        .id("reply-1")
        .ty("dev.cellbroker.reply")
        .source("/target")
        .build()
        .unwrap()
}

// ============================================================================
// Delivery Tests
// ============================================================================

#[tokio::test]
async fn test_successful_delivery_calls_next() {
    let target = StubEndpoint::ok();
    let url = target.serve().await;
    let f = fixture(&url, "http://127.0.0.1:1/", false);

    f.head.process(&request(), &make_event("1")).await.unwrap();

    assert_eq!(target.requests().len(), 1);
    assert_eq!(f.after.seen().len(), 1);
}

#[tokio::test]
async fn test_hop_counter_is_stripped_before_sending() {
    let target = StubEndpoint::ok();
    let url = target.serve().await;
    let f = fixture(&url, "http://127.0.0.1:1/", false);

    f.head.process(&request(), &with_hops("1", 5)).await.unwrap();

    let headers = &target.requests()[0];
    assert_eq!(headers.get("ce-id").unwrap(), "1");
    assert!(headers.get(format!("ce-{HOPS_ATTRIBUTE}")).is_none());
}

#[tokio::test]
async fn test_failure_without_retry_is_an_error() {
    let target = StubEndpoint::new(StatusCode::INTERNAL_SERVER_ERROR);
    let url = target.serve().await;
    let f = fixture(&url, "http://127.0.0.1:1/", false);

    let result = f.head.process(&request(), &make_event("1")).await;

    assert!(matches!(result, Err(ProcessError::Delivery { .. })));
    assert!(f.queue.published(RETRY_TOPIC).await.is_empty());
    assert!(f.after.seen().is_empty());
}

#[tokio::test]
async fn test_failure_with_retry_publishes_original_once() {
    let target = StubEndpoint::new(StatusCode::SERVICE_UNAVAILABLE);
    let url = target.serve().await;
    let f = fixture(&url, "http://127.0.0.1:1/", true);
    let original = with_hops("orig", 9);

    f.head.process(&request(), &original).await.unwrap();

    let published = f.queue.published(RETRY_TOPIC).await;
    assert_eq!(published.len(), 1);
    let retried = decode_message(&published[0]).unwrap();
    assert_eq!(retried.id(), "orig");
    assert_eq!(retried.ty(), original.ty());
    assert_eq!(remaining_hops(&retried), Some(9));
    // The hand-off short-circuits the chain.
    assert!(f.after.seen().is_empty());
}

#[tokio::test]
async fn test_transport_error_with_retry_is_handed_off() {
    let f = fixture("http://127.0.0.1:1/", "http://127.0.0.1:1/", true);

    f.head.process(&request(), &make_event("1")).await.unwrap();
    assert_eq!(f.queue.published(RETRY_TOPIC).await.len(), 1);
}

#[tokio::test]
async fn test_retry_without_retry_queue_is_an_error() {
    let target = StubEndpoint::new(StatusCode::BAD_GATEWAY);
    let url = target.serve().await;

    let mut tenant = make_tenant("ns", "b");
    let mut t = make_target("t", &url);
    t.retry_queue = None;
    tenant = tenant.with_target(t);
    let cache = Arc::new(TargetsCache::new(TargetsConfig::default().with_tenant(tenant)));
    let deliver = DeliverProcessor::new(Client::new(), cache, Arc::new(ChannelQueue::default()))
        .with_retry_on_failure(true);

    let result = deliver.process(&request(), &make_event("1")).await;
    assert!(matches!(result, Err(ProcessError::NoRetryQueue(_))));
}

#[tokio::test]
async fn test_missing_target_is_success() {
    let f = fixture("http://127.0.0.1:1/", "http://127.0.0.1:1/", false);
    let request = ProcessRequest::for_target(CellTenantKey::broker("ns", "b").target_key("gone"));

    f.head.process(&request, &make_event("1")).await.unwrap();

    let request = ProcessRequest::for_target(CellTenantKey::broker("ns", "gone").target_key("t"));
    f.head.process(&request, &make_event("1")).await.unwrap();
    assert!(f.after.seen().is_empty());
}

// ============================================================================
// Reply Tests
// ============================================================================

#[tokio::test]
async fn test_reply_forwarded_with_one_less_hop() {
    let tenant = StubEndpoint::ok();
    let tenant_url = tenant.serve().await;
    let target = StubEndpoint::ok().with_reply(reply_event());
    let target_url = target.serve().await;
    let f = fixture(&target_url, &tenant_url, false);

    f.head.process(&request(), &with_hops("1", 1)).await.unwrap();

    let forwarded = tenant.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].get("ce-id").unwrap(), "reply-1");
    assert_eq!(forwarded[0].get(format!("ce-{HOPS_ATTRIBUTE}")).unwrap(), "0");
    assert_eq!(f.after.seen().len(), 1);
}

#[tokio::test]
async fn test_reply_dropped_when_no_hops_left() {
    let tenant = StubEndpoint::ok();
    let tenant_url = tenant.serve().await;
    let target = StubEndpoint::ok().with_reply(reply_event());
    let target_url = target.serve().await;
    let f = fixture(&target_url, &tenant_url, false);

    f.head.process(&request(), &with_hops("1", 0)).await.unwrap();

    assert_eq!(target.requests().len(), 1);
    assert!(tenant.requests().is_empty());
    assert_eq!(f.after.seen().len(), 1);
}

#[tokio::test]
async fn test_reply_without_hops_uses_default_budget() {
    let tenant = StubEndpoint::ok();
    let tenant_url = tenant.serve().await;
    let target = StubEndpoint::ok().with_reply(reply_event());
    let target_url = target.serve().await;
    let f = fixture(&target_url, &tenant_url, false);

    f.head.process(&request(), &make_event("1")).await.unwrap();

    let forwarded = tenant.requests();
    assert_eq!(
        forwarded[0].get(format!("ce-{HOPS_ATTRIBUTE}")).unwrap(),
        &(DEFAULT_HOPS - 1).to_string()
    );
}

#[tokio::test]
async fn test_failed_forward_retries_original() {
    let tenant = StubEndpoint::new(StatusCode::INTERNAL_SERVER_ERROR);
    let tenant_url = tenant.serve().await;
    let target = StubEndpoint::ok().with_reply(reply_event());
    let target_url = target.serve().await;
    let f = fixture(&target_url, &tenant_url, true);

    f.head.process(&request(), &with_hops("orig", 3)).await.unwrap();

    let published = f.queue.published(RETRY_TOPIC).await;
    assert_eq!(published.len(), 1);
    assert_eq!(decode_message(&published[0]).unwrap().id(), "orig");
}

#[tokio::test]
async fn test_reply_handling_runs_on_spawned_task() {
    let tenant = StubEndpoint::ok();
    let tenant_url = tenant.serve().await;
    let target = StubEndpoint::ok().with_reply(reply_event());
    let target_url = target.serve().await;
    let f = fixture(&target_url, &tenant_url, false);

    let head = f.head.clone();
    tokio::spawn(async move { head.process(&request(), &with_hops("1", 2)).await })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(tenant.requests().len(), 1);
}
