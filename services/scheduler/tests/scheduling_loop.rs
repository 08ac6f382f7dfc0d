//! Placement passes of the scheduler worker end to end: list, assume, bind,
//! reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sked_id::{ObjectKey, ObjectKind};
use sked_scheduler::api_cache::{CacheView, CacheViewConfig};
use sked_scheduler::api_calls::{CallKind, RelevanceTable};
use sked_scheduler::binder::{BindMode, Binder};
use sked_scheduler::cache::Cache;
use sked_scheduler::client::{ApiClient, ApiError, InMemoryClient};
use sked_scheduler::dispatcher::Dispatcher;
use sked_scheduler::framework::Handle;
use sked_scheduler::model::ObjectState;
use sked_scheduler::scheduler::{PassStats, SchedulerWorker};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn cluster(nodes: usize, pods: usize) -> InMemoryClient {
    let nodes = (0..nodes).map(|i| ObjectState::new(ObjectKey::node(format!("node-{i}")), "n"));
    let pods = (0..pods).map(|i| {
        let name = format!("pod-{i}");
        ObjectState::new(ObjectKey::pod("default", name.clone()), name)
    });
    InMemoryClient::with_objects(nodes.chain(pods))
}

struct Setup {
    client: Arc<InMemoryClient>,
    cache: Arc<Cache>,
    dispatcher: Option<Dispatcher>,
    worker: SchedulerWorker,
}

fn setup(client: InMemoryClient, mode: BindMode) -> Setup {
    let client = Arc::new(client);
    let dispatcher = mode.is_async().then(|| {
        let dispatcher = Dispatcher::new(client.clone(), 64, RelevanceTable::standard());
        dispatcher.run();
        dispatcher
    });

    let cache = Cache::new(&CancellationToken::new(), Duration::from_secs(30), dispatcher.clone());
    let view = CacheView::new(CacheViewConfig::default(), cache.clone());
    let handle = Handle::new(client.clone()).with_api_cacher(view.clone());
    let binder = Binder::new(handle, mode).unwrap();

    Setup {
        client: client.clone(),
        cache,
        dispatcher,
        worker: SchedulerWorker::new(client, view, binder, Duration::from_millis(10)),
    }
}

async fn pods_per_node(client: &InMemoryClient) -> BTreeMap<String, usize> {
    let mut load = BTreeMap::new();
    for pod in client.list(ObjectKind::Pod).await.unwrap() {
        if let Some(node) = pod.node_name {
            *load.entry(node).or_default() += 1;
        }
    }
    load
}

#[tokio::test]
async fn test_sync_pass_spreads_pods() {
    let setup = setup(cluster(2, 4), BindMode::Sync);

    let stats = setup.worker.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        stats,
        PassStats {
            pending: 4,
            bound: 4,
            failed: 0,
            unschedulable: 0
        }
    );

    let load = pods_per_node(&setup.client).await;
    assert_eq!(load.get("node-0"), Some(&2));
    assert_eq!(load.get("node-1"), Some(&2));
    assert_eq!(setup.cache.assumed_count(), 0);
}

#[tokio::test]
async fn test_async_pass_counts_assumed_placements() {
    let setup = setup(cluster(3, 6), BindMode::Async);

    let stats = setup.worker.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.bound, 6);

    // a second pass before the calls land must not place anything twice
    let again = setup.worker.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(again.bound, 0);

    let dispatcher = setup.dispatcher.expect("async mode has a dispatcher");
    let report = dispatcher.close().await;
    assert_eq!(report.dropped, 0);

    let load = pods_per_node(&setup.client).await;
    assert_eq!(load.values().copied().collect::<Vec<_>>(), vec![2, 2, 2]);
    assert_eq!(setup.client.bindings().await.len(), 6);
}

#[tokio::test]
async fn test_failed_bindings_are_retried_next_pass() {
    let client = cluster(2, 3);
    client.fail_calls(CallKind::Bind, ApiError::Transport("binding error".to_string()));
    let setup = setup(client, BindMode::AsyncAwait);
    let ctx = CancellationToken::new();

    let first = setup.worker.run_pass(&ctx).await.unwrap();
    assert_eq!(first.failed, 3);
    assert_eq!(setup.cache.assumed_count(), 0);

    setup.client.clear_failures();
    let second = setup.worker.run_pass(&ctx).await.unwrap();
    assert_eq!(second.bound, 3);
    assert_eq!(pods_per_node(&setup.client).await.values().sum::<usize>(), 3);

    if let Some(dispatcher) = setup.dispatcher {
        dispatcher.close().await;
    }
}

#[tokio::test]
async fn test_no_nodes_leaves_pods_pending() {
    let setup = setup(cluster(0, 2), BindMode::Sync);

    let stats = setup.worker.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.unschedulable, 2);
    assert_eq!(stats.bound, 0);
    assert!(setup.client.bindings().await.is_empty());
}

#[tokio::test]
async fn test_worker_stops_on_shutdown() {
    let setup = setup(cluster(1, 1), BindMode::Sync);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = setup.client.clone();

    let worker = setup.worker;
    let task = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("worker stops promptly")
        .unwrap();

    let pod = client
        .get(&ObjectKey::pod("default", "pod-0"))
        .await
        .unwrap();
    assert_eq!(pod.node_name.as_deref(), Some("node-0"));
}
