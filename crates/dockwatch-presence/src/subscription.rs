//! Subscription manager that maps devices onto wire topics

use async_trait::async_trait;
use dockwatch_core::DeviceSn;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::collab::{CollabError, GatewayRef, SubscriptionManager};

/// Topic names for a device serial
pub mod topics {
    pub fn osd(sn: &str) -> String {
        format!("thing/product/{}/osd", sn)
    }

    pub fn state(sn: &str) -> String {
        format!("thing/product/{}/state", sn)
    }

    pub fn services_reply(sn: &str) -> String {
        format!("thing/product/{}/services_reply", sn)
    }

    pub fn events(sn: &str) -> String {
        format!("thing/product/{}/events", sn)
    }

    pub fn requests(sn: &str) -> String {
        format!("thing/product/{}/requests", sn)
    }

    pub fn status(sn: &str) -> String {
        format!("sys/product/{}/status", sn)
    }
}

/// Topics every device publishes on
pub fn device_topics(sn: &DeviceSn) -> Vec<String> {
    vec![topics::osd(sn.as_str()), topics::state(sn.as_str())]
}

/// Topics a gateway publishes on, its own device topics included
pub fn gateway_topics(sn: &DeviceSn) -> Vec<String> {
    let sn = sn.as_str();
    vec![
        topics::osd(sn),
        topics::state(sn),
        topics::services_reply(sn),
        topics::events(sn),
        topics::requests(sn),
        topics::status(sn),
    ]
}

/// The wire client that actually (un)subscribes topics
#[async_trait]
pub trait TopicTransport: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), CollabError>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), CollabError>;
}

/// [`SubscriptionManager`] over a [`TopicTransport`], tracking active topics
///
/// A topic is sent to the transport only when it is not already active, so a
/// repeated subscribe costs nothing on the wire.
pub struct TopicSubscriptions<T> {
    transport: T,
    active: Mutex<BTreeSet<String>>,
}

impl<T: TopicTransport> TopicSubscriptions<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            active: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Active topics, sorted
    pub fn active_topics(&self) -> Vec<String> {
        self.active.lock().iter().cloned().collect()
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.active.lock().contains(topic)
    }

    /// Mark `wanted` active and return the ones that were not yet
    fn reserve(&self, wanted: Vec<String>) -> Vec<String> {
        let mut active = self.active.lock();
        wanted.into_iter().filter(|t| active.insert(t.clone())).collect()
    }

    fn release(&self, topics: &[String]) {
        let mut active = self.active.lock();
        for topic in topics {
            active.remove(topic);
        }
    }
}

#[async_trait]
impl<T: TopicTransport> SubscriptionManager for TopicSubscriptions<T> {
    async fn subscribe(&self, gateway: &GatewayRef) -> Result<(), CollabError> {
        let mut wanted = gateway_topics(&gateway.sn);
        if let Some(sub) = &gateway.sub_device {
            wanted.extend(device_topics(&sub.sn));
        }

        let fresh = self.reserve(wanted);
        if fresh.is_empty() {
            return Ok(());
        }
        debug!(gateway = %gateway.sn, topics = fresh.len(), "Subscribing topics");
        if let Err(e) = self.transport.subscribe(&fresh).await {
            warn!(gateway = %gateway.sn, error = %e, "Topic subscribe failed");
            self.release(&fresh);
            return Err(e);
        }
        Ok(())
    }

    async fn unsubscribe(&self, sn: &DeviceSn) -> Result<(), CollabError> {
        let dropped: Vec<String> = {
            let mut active = self.active.lock();
            device_topics(sn)
                .into_iter()
                .filter(|t| active.remove(t))
                .collect()
        };
        if dropped.is_empty() {
            return Ok(());
        }
        debug!(device = %sn, topics = dropped.len(), "Unsubscribing topics");
        self.transport.unsubscribe(&dropped).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::SubDeviceRef;
    use dockwatch_core::{DeviceDomain, ModelKey};

    #[derive(Default)]
    struct RecordingTransport {
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TopicTransport for RecordingTransport {
        async fn subscribe(&self, topics: &[String]) -> Result<(), CollabError> {
            if self.fail {
                return Err(CollabError::Subscription("broker unavailable".to_string()));
            }
            self.subscribed.lock().extend_from_slice(topics);
            Ok(())
        }

        async fn unsubscribe(&self, topics: &[String]) -> Result<(), CollabError> {
            self.unsubscribed.lock().extend_from_slice(topics);
            Ok(())
        }
    }

    fn dock_with_drone() -> GatewayRef {
        GatewayRef {
            sn: DeviceSn::from("dock-1"),
            model_key: ModelKey::new(DeviceDomain::Dock, 3, 0),
            thing_version: None,
            sub_device: Some(SubDeviceRef {
                sn: DeviceSn::from("drone-1"),
                model_key: ModelKey::new(DeviceDomain::Drone, 91, 1),
            }),
        }
    }

    #[tokio::test]
    async fn test_subscribe_gateway_and_sub_device() {
        let subs = TopicSubscriptions::new(RecordingTransport::default());
        subs.subscribe(&dock_with_drone()).await.unwrap();

        let sent = subs.transport().subscribed.lock().clone();
        assert_eq!(sent.len(), 8);
        assert!(sent.contains(&"sys/product/dock-1/status".to_string()));
        assert!(sent.contains(&"thing/product/drone-1/osd".to_string()));
        assert!(!sent.contains(&"thing/product/drone-1/services_reply".to_string()));

        // Second subscribe sends nothing new
        subs.subscribe(&dock_with_drone()).await.unwrap();
        assert_eq!(subs.transport().subscribed.lock().len(), 8);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_only_device_topics() {
        let subs = TopicSubscriptions::new(RecordingTransport::default());
        subs.subscribe(&dock_with_drone()).await.unwrap();
        subs.unsubscribe(&DeviceSn::from("drone-1")).await.unwrap();

        assert!(!subs.is_active("thing/product/drone-1/osd"));
        assert!(subs.is_active("thing/product/dock-1/osd"));
        assert_eq!(subs.transport().unsubscribed.lock().len(), 2);

        // Unknown device: nothing to send
        subs.unsubscribe(&DeviceSn::from("drone-1")).await.unwrap();
        assert_eq!(subs.transport().unsubscribed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_retryable() {
        let subs = TopicSubscriptions::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        assert!(subs.subscribe(&dock_with_drone()).await.is_err());
        assert!(subs.active_topics().is_empty());
    }
}
