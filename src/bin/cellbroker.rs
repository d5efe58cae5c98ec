//! cellbroker: data-plane process
//!
//! Runs the fan-out and retry pools against the targets snapshot mounted by
//! the control plane.
//!
//! ## Architecture
//! ```text
//! [control plane] --(snapshot file)--> [VolumeLoader] --> TargetsCache
//!                                              |
//!                                   notify     v
//!                        +------------- fan-out pool --(decouple queues)--> targets
//!                        +------------- retry pool ----(retry queues)-----> targets
//! ```
//!
//! ## Configuration
//! - CELLBROKER_CONFIG: Path to a YAML config file (optional)
//! - CELLBROKER__*: Overrides for individual settings
//! - CELLBROKER_LOG: Log filter (default: info)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use cellbroker::config::Config;
use cellbroker::pool::{fanout_pool, retry_pool};
use cellbroker::queue::init_queue_service;
use cellbroker::targets::volume::VolumeLoader;
use cellbroker::targets::TargetsCache;
use cellbroker::utils::bootstrap::{cancel_on_ctrl_c, init_tracing, join_tasks};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let cache = Arc::new(TargetsCache::empty());
    let queue = init_queue_service(&config.queue).await?;
    let client = reqwest::Client::builder().build()?;

    let fanout = Arc::new(fanout_pool(
        cache.clone(),
        queue.clone(),
        client.clone(),
        &config.fanout,
    ));
    let retry = Arc::new(retry_pool(cache.clone(), queue.clone(), client, &config.retry));

    let loader = VolumeLoader::new(&config.targets.path, cache.clone())
        .with_poll_interval(config.targets.poll_interval())
        .with_signal(fanout.signal())
        .with_signal(retry.signal());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let loader_task = loader.spawn(cancel.clone());
    let fanout_task = {
        let pool = fanout.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };
    let retry_task = {
        let pool = retry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };

    info!(
        targets = %config.targets.path,
        queue = ?config.queue.queue_type,
        "cellbroker started"
    );

    join_tasks(vec![
        ("loader", loader_task),
        ("fanout pool", fanout_task),
        ("retry pool", retry_task),
    ])
    .await;

    info!("cellbroker stopped");
    Ok(())
}
