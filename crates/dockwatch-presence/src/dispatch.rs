//! Background delivery of side effects
//!
//! Committed plans hand their external calls to one queue. A single worker
//! drains it in submission order, so an unsubscribe queued before a subscribe
//! is delivered before it, while the caller never waits on a collaborator.

use dockwatch_core::{Device, DeviceSn};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::collab::{EventKind, EventPublisher, GatewayRef, PersistenceStore, SubscriptionManager};

/// A call to an external collaborator
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Subscribe(GatewayRef),
    Unsubscribe(DeviceSn),
    Publish {
        workspace_id: Option<String>,
        kind: EventKind,
        sn: DeviceSn,
        payload: Value,
    },
}

enum Job {
    Deliver { persist: Vec<Device>, deliveries: Vec<Delivery> },
    Settle(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Sinks {
    subscriptions: Arc<dyn SubscriptionManager>,
    publisher: Arc<dyn EventPublisher>,
    persistence: Arc<dyn PersistenceStore>,
}

impl Sinks {
    /// Best effort: failures are logged and never undo the committed state
    async fn deliver(&self, persist: Vec<Device>, deliveries: Vec<Delivery>) {
        for device in &persist {
            if let Err(e) = self.persistence.upsert(device).await {
                warn!(device = %device.sn, error = %e, "Failed to persist device");
            }
        }

        for delivery in deliveries {
            match delivery {
                Delivery::Subscribe(gateway) => {
                    if let Err(e) = self.subscriptions.subscribe(&gateway).await {
                        warn!(gateway = %gateway.sn, error = %e, "Subscribe failed");
                    }
                }
                Delivery::Unsubscribe(sn) => {
                    if let Err(e) = self.subscriptions.unsubscribe(&sn).await {
                        warn!(device = %sn, error = %e, "Unsubscribe failed");
                    }
                }
                Delivery::Publish {
                    workspace_id,
                    kind,
                    sn,
                    payload,
                } => match workspace_id {
                    Some(ws) => {
                        if let Err(e) = self.publisher.publish(&ws, kind, &sn, payload).await {
                            warn!(device = %sn, event = %kind, error = %e, "Publish failed");
                        }
                    }
                    None => {
                        warn!(device = %sn, event = %kind, "Device is not bound to a workspace, skipping event");
                    }
                },
            }
        }
    }
}

/// Ordered side-effect queue; the worker starts with the first submission
pub(crate) struct EffectQueue {
    sinks: Sinks,
    tx: OnceLock<mpsc::UnboundedSender<Job>>,
}

impl EffectQueue {
    pub(crate) fn new(
        subscriptions: Arc<dyn SubscriptionManager>,
        publisher: Arc<dyn EventPublisher>,
        persistence: Arc<dyn PersistenceStore>,
    ) -> Self {
        Self {
            sinks: Sinks {
                subscriptions,
                publisher,
                persistence,
            },
            tx: OnceLock::new(),
        }
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn PersistenceStore> {
        &self.sinks.persistence
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Job> {
        self.tx.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run(rx, self.sinks.clone()));
            tx
        })
    }

    /// Queue one committed plan's calls; must be called inside a tokio runtime
    pub(crate) fn submit(&self, persist: Vec<Device>, deliveries: Vec<Delivery>) {
        if persist.is_empty() && deliveries.is_empty() {
            return;
        }
        if self
            .sender()
            .send(Job::Deliver { persist, deliveries })
            .is_err()
        {
            warn!("Effect worker is gone, dropping side effects");
        }
    }

    /// Wait until everything submitted so far has been delivered
    pub(crate) async fn settle(&self) {
        let Some(tx) = self.tx.get() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if tx.send(Job::Settle(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Job>, sinks: Sinks) {
    debug!("Effect worker started");
    while let Some(job) = rx.recv().await {
        match job {
            Job::Deliver { persist, deliveries } => sinks.deliver(persist, deliveries).await,
            Job::Settle(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Effect worker stopped");
}
