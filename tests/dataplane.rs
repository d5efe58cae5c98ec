//! End-to-end data plane tests over the in-process channel queue.
//!
//! Events enter through the decouple sink, are fanned out by the fan-out
//! pool to HTTP targets, and failed deliveries come back through the retry
//! pool. The targets snapshot is loaded from a file the way it is in
//! production.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cellbroker::config::{IngressConfig, PoolConfig};
use cellbroker::ingress::{DecoupleSink, SendOutcome};
use cellbroker::pool::{fanout_pool, retry_pool, FanoutFlavor, RetryFlavor, SyncPool};
use cellbroker::queue::{ChannelQueue, ChannelQueueConfig, QueueService};
use cellbroker::targets::volume::VolumeLoader;
use cellbroker::targets::{CellTenant, CellTenantKey, TargetsCache, TargetsConfig};

use common::{event, eventually, target, tenant, TargetStub};

const WAIT: Duration = Duration::from_secs(5);

struct DataPlane {
    cache: Arc<TargetsCache>,
    loader: VolumeLoader,
    fanout: Arc<SyncPool<FanoutFlavor>>,
    retry: Arc<SyncPool<RetryFlavor>>,
    sink: DecoupleSink,
    cancel: CancellationToken,
}

impl DataPlane {
    fn new(snapshot_path: &Path, ingress: IngressConfig) -> Self {
        let cache = Arc::new(TargetsCache::empty());
        let queue: Arc<dyn QueueService> = Arc::new(ChannelQueue::new(ChannelQueueConfig {
            redelivery_delay: Duration::from_millis(50),
        }));
        let client = reqwest::Client::new();
        let config = PoolConfig {
            handler_concurrency: 2,
            ..Default::default()
        };

        let fanout = Arc::new(fanout_pool(cache.clone(), queue.clone(), client.clone(), &config));
        let retry = Arc::new(retry_pool(cache.clone(), queue.clone(), client, &config));
        let loader = VolumeLoader::new(snapshot_path, cache.clone())
            .with_signal(fanout.signal())
            .with_signal(retry.signal());
        let sink = DecoupleSink::new(cache.clone(), queue, &ingress);

        Self {
            cache,
            loader,
            fanout,
            retry,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    fn start(&self) {
        let fanout = self.fanout.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { fanout.run(cancel).await });
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { retry.run(cancel).await });
    }

    async fn wait_for_handlers(&self, fanout: usize, retry: usize) -> bool {
        eventually(WAIT, || self.fanout.len() == fanout && self.retry.len() == retry).await
    }
}

impl Drop for DataPlane {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn write_snapshot(path: &Path, tenant: CellTenant) {
    let snapshot = TargetsConfig::default().with_tenant(tenant);
    std::fs::write(path, snapshot.to_bytes()).unwrap();
}

fn tenant_key() -> CellTenantKey {
    CellTenantKey::broker("ns", "default")
}

#[tokio::test]
async fn test_event_reaches_every_target() {
    let first = TargetStub::default();
    let second = TargetStub::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets");
    write_snapshot(
        &path,
        tenant("ns", "default")
            .with_target(target("first", &first.serve().await))
            .with_target(target("second", &second.serve().await)),
    );

    let plane = DataPlane::new(&path, IngressConfig::default());
    plane.start();
    assert!(plane.loader.load_once().await.unwrap());
    assert!(plane.wait_for_handlers(1, 2).await);

    let outcome = plane.sink.send(&tenant_key(), event("e1", "dev.test")).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Published(_)));

    assert!(eventually(WAIT, || first.ids() == ["e1"] && second.ids() == ["e1"]).await);
}

#[tokio::test]
async fn test_failed_delivery_is_retried_through_retry_queue() {
    let healthy = TargetStub::default();
    let flaky = TargetStub::failing_first(1);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets");
    write_snapshot(
        &path,
        tenant("ns", "default")
            .with_target(target("healthy", &healthy.serve().await))
            .with_target(target("flaky", &flaky.serve().await)),
    );

    let plane = DataPlane::new(&path, IngressConfig::default());
    plane.start();
    plane.loader.load_once().await.unwrap();
    assert!(plane.wait_for_handlers(1, 2).await);

    plane.sink.send(&tenant_key(), event("e1", "dev.test")).await.unwrap();

    // The first attempt fails and the retry pool redelivers the same event.
    assert!(eventually(WAIT, || flaky.ids() == ["e1", "e1"]).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(healthy.ids(), ["e1"]);
    assert_eq!(flaky.calls(), 2);
}

#[tokio::test]
async fn test_target_filters_route_events() {
    let everything = TargetStub::default();
    let picky = TargetStub::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets");

    let mut picky_target = target("picky", &picky.serve().await);
    picky_target
        .filter_attributes
        .insert("type".to_string(), "dev.wanted".to_string());
    write_snapshot(
        &path,
        tenant("ns", "default")
            .with_target(target("everything", &everything.serve().await))
            .with_target(picky_target),
    );

    let plane = DataPlane::new(&path, IngressConfig::default());
    plane.start();
    plane.loader.load_once().await.unwrap();
    assert!(plane.wait_for_handlers(1, 2).await);

    plane.sink.send(&tenant_key(), event("e1", "dev.other")).await.unwrap();
    plane.sink.send(&tenant_key(), event("e2", "dev.wanted")).await.unwrap();

    assert!(eventually(WAIT, || everything.ids().len() == 2 && picky.ids().len() == 1).await);
    assert_eq!(picky.ids(), ["e2"]);
}

#[tokio::test]
async fn test_ingress_filtering_drops_unwanted_events() {
    let picky = TargetStub::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets");

    let mut picky_target = target("picky", &picky.serve().await);
    picky_target
        .filter_attributes
        .insert("type".to_string(), "dev.wanted".to_string());
    write_snapshot(&path, tenant("ns", "default").with_target(picky_target));

    let ingress = IngressConfig {
        enable_event_filtering: true,
        ..Default::default()
    };
    let plane = DataPlane::new(&path, ingress);
    plane.start();
    plane.loader.load_once().await.unwrap();
    assert!(plane.wait_for_handlers(1, 1).await);

    let outcome = plane.sink.send(&tenant_key(), event("e1", "dev.other")).await.unwrap();
    assert_eq!(outcome, SendOutcome::Filtered);

    plane.sink.send(&tenant_key(), event("e2", "dev.wanted")).await.unwrap();
    assert!(eventually(WAIT, || picky.ids() == ["e2"]).await);
}

#[tokio::test]
async fn test_snapshot_update_reconciles_pools() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets");
    write_snapshot(
        &path,
        tenant("ns", "default")
            .with_target(target("a", "http://127.0.0.1:1/"))
            .with_target(target("b", "http://127.0.0.1:1/")),
    );

    let plane = DataPlane::new(&path, IngressConfig::default());
    plane.start();
    plane.loader.load_once().await.unwrap();
    assert!(plane.wait_for_handlers(1, 2).await);

    // Unchanged bytes do not count as a new snapshot.
    assert!(!plane.loader.load_once().await.unwrap());

    write_snapshot(
        &path,
        tenant("ns", "default").with_target(target("b", "http://127.0.0.1:1/")),
    );
    assert!(plane.loader.load_once().await.unwrap());
    assert!(plane.wait_for_handlers(1, 1).await);

    let remaining: Vec<String> = plane.retry.keys().iter().map(|k| k.name().to_string()).collect();
    assert_eq!(remaining, ["b"]);

    std::fs::write(&path, TargetsConfig::default().to_bytes()).unwrap();
    plane.loader.load_once().await.unwrap();
    assert!(plane.wait_for_handlers(0, 0).await);
    assert!(plane.cache.load().is_empty());
}
