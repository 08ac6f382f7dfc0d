//! Scheduler background worker.
//!
//! Runs a placement pass on a periodic interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sked_id::ObjectKind;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::api_cache::CacheView;
use crate::binder::Binder;
use crate::cache::Cache;
use crate::client::{ApiClient, ApiError};
use crate::framework::CycleState;
use crate::model::ObjectState;

/// Statistics from one placement pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub pending: usize,
    pub bound: usize,
    pub failed: usize,
    pub unschedulable: usize,
}

/// Scheduler worker that places unbound pods.
pub struct SchedulerWorker {
    client: Arc<dyn ApiClient>,
    view: CacheView,
    binder: Binder,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(
        client: Arc<dyn ApiClient>,
        view: CacheView,
        binder: Binder,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            view,
            binder,
            interval,
        }
    }

    fn cache(&self) -> &Arc<Cache> {
        self.view.cache()
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            bind_mode = %self.binder.mode(),
            "Starting scheduler worker"
        );

        // Cancelled on shutdown so a pass blocked on the dispatcher stops.
        let ctx = CancellationToken::new();
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_pass(&ctx).await {
                        error!(error = %e, "Scheduling pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        ctx.cancel();
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single placement pass.
    #[instrument(skip(self, ctx))]
    pub async fn run_pass(&self, ctx: &CancellationToken) -> Result<PassStats, ApiError> {
        let mut stats = PassStats::default();

        self.sync(ObjectKind::Node).await?;
        self.sync(ObjectKind::Pod).await?;

        let nodes: Vec<String> = self
            .view
            .list(ObjectKind::Node)
            .into_iter()
            .map(|node| node.key.name().to_string())
            .collect();

        let pods = self.view.list(ObjectKind::Pod);
        let mut load = pods_per_node(&nodes, &pods);

        for pod in pods.iter().filter(|pod| !pod.is_bound()) {
            stats.pending += 1;

            let Some(node) = least_loaded(&load) else {
                stats.unschedulable += 1;
                continue;
            };

            let cycle = CycleState::new();
            self.cache()
                .assume(pod.clone().with_node(node.clone()), self.cache().ttl());

            match self.binder.bind(ctx, &cycle, pod, &node).await {
                Ok(_) => {
                    stats.bound += 1;
                    *load.entry(node).or_default() += 1;
                }
                Err(e) => {
                    debug!(key = %pod.key, error = %e, "Pod left for the next pass");
                    stats.failed += 1;
                }
            }
        }

        if stats.unschedulable > 0 {
            warn!(
                unschedulable = stats.unschedulable,
                "No nodes available for pending pods"
            );
        }
        if stats.pending > 0 {
            info!(
                pending = stats.pending,
                bound = stats.bound,
                failed = stats.failed,
                assumed = self.cache().assumed_count(),
                "Scheduling pass complete"
            );
        }

        Ok(stats)
    }

    /// Refresh confirmed state for `kind` from the remote API.
    async fn sync(&self, kind: ObjectKind) -> Result<(), ApiError> {
        let remote = self.client.list(kind).await?;

        let known = self.cache().list(kind, false);
        for stale in known
            .iter()
            .filter(|k| remote.binary_search_by(|r| r.key.cmp(&k.key)).is_err())
        {
            self.cache().observe_deleted(&stale.key);
        }

        for object in remote {
            self.cache().observe(object);
        }
        Ok(())
    }
}

/// Pods per node, counting assumed placements. Every node appears.
fn pods_per_node(nodes: &[String], pods: &[ObjectState]) -> BTreeMap<String, usize> {
    let mut load: BTreeMap<String, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
    for node in pods.iter().filter_map(|pod| pod.node_name.as_ref()) {
        if let Some(count) = load.get_mut(node) {
            *count += 1;
        }
    }
    load
}

/// Node with the fewest pods; ties go to the first by name.
fn least_loaded(load: &BTreeMap<String, usize>) -> Option<String> {
    load.iter()
        .min_by_key(|(_, count)| **count)
        .map(|(node, _)| node.clone())
}

#[cfg(test)]
mod tests {
    use sked_id::ObjectKey;

    use super::*;

    fn pod(name: &str, node: Option<&str>) -> ObjectState {
        let pod = ObjectState::new(ObjectKey::pod("ns", name), name);
        match node {
            Some(node) => pod.with_node(node),
            None => pod,
        }
    }

    #[test]
    fn test_pods_per_node_ignores_unknown_nodes() {
        let nodes = vec!["a".to_string(), "b".to_string()];
        let pods = [pod("p1", Some("a")), pod("p2", Some("gone")), pod("p3", None)];
        let load = pods_per_node(&nodes, &pods);
        assert_eq!(load.get("a"), Some(&1));
        assert_eq!(load.get("b"), Some(&0));
        assert_eq!(load.len(), 2);
    }

    #[test]
    fn test_least_loaded_breaks_ties_by_name() {
        let load = BTreeMap::from([
            ("b".to_string(), 1),
            ("c".to_string(), 0),
            ("a".to_string(), 0),
        ]);
        assert_eq!(least_loaded(&load).as_deref(), Some("a"));
        assert_eq!(least_loaded(&BTreeMap::new()), None);
    }
}
