//! Sharded ingest workers
//!
//! Each worker owns a bounded queue. Messages are assigned to a worker by a
//! stable hash of the device serial in their topic, so one serial is always
//! handled by the same worker, in arrival order, while different serials are
//! handled in parallel.

use dockwatch_core::DeviceSn;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::reconciler::Reconciler;
use crate::router::{Route, RouteError, Router};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("ingest pipeline is shut down")]
    Closed,
}

#[derive(Debug)]
struct Inbound {
    route: Route,
    payload: Vec<u8>,
}

/// Running ingest workers
pub struct IngestPipeline {
    senders: Vec<mpsc::Sender<Inbound>>,
    workers: Vec<JoinHandle<()>>,
    reconciler: Arc<Reconciler>,
}

/// Worker index for a serial
pub fn shard_for(sn: &DeviceSn, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    sn.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

impl IngestPipeline {
    /// Start the workers; must be called inside a tokio runtime
    pub fn spawn(router: Arc<Router>, reconciler: Arc<Reconciler>, config: &IngestConfig) -> Self {
        let workers = config.workers.max(1);
        let depth = config.queue_depth.max(1);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(depth);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx, router.clone(), reconciler.clone())));
        }
        info!(workers, queue_depth = depth, "Ingest pipeline started");

        Self {
            senders,
            workers: handles,
            reconciler,
        }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue one raw message; waits while the owning worker's queue is full
    pub async fn submit(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        let route = Route::parse(topic)?;
        let shard = shard_for(&route.sn, self.senders.len());
        self.senders[shard]
            .send(Inbound {
                route,
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| IngestError::Closed)
    }

    /// Close the queues and wait for queued messages and their side effects
    /// to drain
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Ingest worker ended abnormally");
            }
        }
        self.reconciler.settle().await;
        info!("Ingest pipeline stopped");
    }
}

async fn run_worker(index: usize, mut rx: mpsc::Receiver<Inbound>, router: Arc<Router>, reconciler: Arc<Reconciler>) {
    debug!(worker = index, "Ingest worker started");
    while let Some(message) = rx.recv().await {
        let event = match router.dispatch(&message.route, &message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(worker = index, topic = %message.route.topic, error = %e, "Dropping message");
                continue;
            }
        };
        if let Err(e) = reconciler.apply(event).await {
            warn!(worker = index, device = %message.route.sn, error = %e, "Reconcile failed");
        }
    }
    debug!(worker = index, "Ingest worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{BroadcastPublisher, CollabError, EventKind, MemoryPersistence};
    use crate::config::ReconcilerConfig;
    use crate::registry::GatewayRegistry;
    use crate::router::RouteContext;
    use crate::store::PresenceStore;
    use crate::subscription::{TopicSubscriptions, TopicTransport};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl TopicTransport for NullTransport {
        async fn subscribe(&self, _: &[String]) -> Result<(), CollabError> {
            Ok(())
        }

        async fn unsubscribe(&self, _: &[String]) -> Result<(), CollabError> {
            Ok(())
        }
    }

    fn pipeline(workers: usize) -> (IngestPipeline, Arc<PresenceStore>, BroadcastPublisher) {
        let store = Arc::new(PresenceStore::new());
        let registry = Arc::new(GatewayRegistry::new());
        let publisher = BroadcastPublisher::new(1024);
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(TopicSubscriptions::new(NullTransport)),
            Arc::new(publisher.clone()),
            Arc::new(MemoryPersistence::new()),
        )
        .with_registry(registry.clone())
        .with_config(ReconcilerConfig {
            default_workspace_id: Some("ws-1".to_string()),
            ..Default::default()
        });
        let router = Router::standard(RouteContext::new(store.clone(), registry));
        let config = IngestConfig {
            workers,
            queue_depth: 8,
        };
        (
            IngestPipeline::spawn(Arc::new(router), Arc::new(reconciler), &config),
            store,
            publisher,
        )
    }

    #[test]
    fn test_shard_is_stable() {
        let sn = DeviceSn::from("1581F6Q8D");
        assert_eq!(shard_for(&sn, 4), shard_for(&sn, 4));
        assert!(shard_for(&sn, 4) < 4);
        assert_eq!(shard_for(&sn, 0), 0);
    }

    #[tokio::test]
    async fn test_per_serial_order_is_preserved() {
        let (pipeline, store, publisher) = pipeline(3);
        let mut events = publisher.subscribe();

        for height in 0..40 {
            let payload = format!(r#"{{"data": {{"height": {}.0, "attitudeHead": 1.0}}}}"#, height);
            pipeline
                .submit("thing/product/drone-1/osd", payload.as_bytes())
                .await
                .unwrap();
            let other = format!(r#"{{"data": {{"height": {}.0, "attitudeHead": 2.0}}}}"#, 100 + height);
            pipeline
                .submit("thing/product/drone-2/osd", other.as_bytes())
                .await
                .unwrap();
        }
        pipeline.shutdown().await;

        let last = |sn: &str| {
            store
                .get(&DeviceSn::from(sn))
                .unwrap()
                .record
                .telemetry
                .unwrap()
                .height
        };
        assert_eq!(last("drone-1"), Some(39.0));
        assert_eq!(last("drone-2"), Some(139.0));

        let mut online = 0;
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::DeviceOnline {
                online += 1;
            }
        }
        assert_eq!(online, 2);
    }

    #[tokio::test]
    async fn test_topology_through_pipeline() {
        let (pipeline, store, _publisher) = pipeline(2);
        let payload = br#"{"method": "update_topo", "data": {"domain": "3", "type": 3, "subType": 0,
            "subDevices": [{"sn": "drone-1", "domain": "0", "type": 91, "subType": 1, "index": "A"}]}}"#;
        pipeline.submit("sys/product/dock-1/status", payload).await.unwrap();
        pipeline
            .submit("thing/product/dock-1/state", br#"{"data": {"firmware_version": "10.01.0305"}}"#)
            .await
            .unwrap();
        // Garbage is logged and dropped without stopping the worker
        pipeline.submit("sys/product/dock-2/status", b"garbage").await.unwrap();
        pipeline.submit("sys/product/dock-2/status", br#"{"method": "update_topo"}"#).await.unwrap();
        pipeline.shutdown().await;

        let drone = store.get(&DeviceSn::from("drone-1")).unwrap().record.device;
        assert!(drone.online);
        assert_eq!(drone.parent_sn, Some(DeviceSn::from("dock-1")));
        let dock = store.get(&DeviceSn::from("dock-1")).unwrap().record.device;
        assert_eq!(dock.firmware_version.as_deref(), Some("10.01.0305"));
        assert!(!store.get(&DeviceSn::from("dock-2")).unwrap().record.device.online);
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected_at_submit() {
        let (pipeline, _store, _publisher) = pipeline(1);
        assert!(matches!(
            pipeline.submit("thing/product/x/events", b"{}").await,
            Err(IngestError::Route(RouteError::UnknownTopic(_)))
        ));
        pipeline.shutdown().await;
    }
}
