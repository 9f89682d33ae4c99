//! Classification of topology updates into online and offline signals

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::topology::{TopologyData, TopologyUpdateEnvelope, METHOD_UPDATE_TOPO};

/// What a topology update means for presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Online,
    Offline,
}

/// Decides whether a well-formed, non-empty topology update is really a gateway
/// shutting down. Only consulted after the unambiguous rules have passed.
pub trait ShutdownPredicate: Send + Sync {
    fn looks_like_shutdown(&self, envelope: &TopologyUpdateEnvelope, data: &TopologyData) -> bool;
}

impl<F> ShutdownPredicate for F
where
    F: Fn(&TopologyUpdateEnvelope, &TopologyData) -> bool + Send + Sync,
{
    fn looks_like_shutdown(&self, envelope: &TopologyUpdateEnvelope, data: &TopologyData) -> bool {
        self(envelope, data)
    }
}

/// Default heuristic: a gateway sending `update_topo` whose announced
/// sub-devices include no drone is treated as shutting down.
///
/// This is lossy. Firmware that announces payload-only topologies on a live
/// gateway will be misread as offline; swap in another predicate for such fleets.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayHeartbeatHeuristic;

impl ShutdownPredicate for GatewayHeartbeatHeuristic {
    fn looks_like_shutdown(&self, envelope: &TopologyUpdateEnvelope, data: &TopologyData) -> bool {
        data.domain.is_gateway()
            && !data.sub_devices.is_empty()
            && envelope.method == METHOD_UPDATE_TOPO
            && !data
                .sub_devices
                .iter()
                .any(|sub| sub.domain.is_some_and(|d| d.is_sub_device()))
    }
}

/// Never reinterprets a non-empty topology as a shutdown
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverShutdown;

impl ShutdownPredicate for NeverShutdown {
    fn looks_like_shutdown(&self, _: &TopologyUpdateEnvelope, _: &TopologyData) -> bool {
        false
    }
}

/// Topology classifier with a replaceable shutdown predicate
pub struct Classifier {
    shutdown: Box<dyn ShutdownPredicate>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(GatewayHeartbeatHeuristic)
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

impl Classifier {
    pub fn new(shutdown: impl ShutdownPredicate + 'static) -> Self {
        Self {
            shutdown: Box::new(shutdown),
        }
    }

    /// Classify an envelope. Precedence:
    /// 1. no data: offline
    /// 2. no sub-devices: offline (the attached drone detached)
    /// 3. shutdown predicate matches: offline
    /// 4. otherwise online
    pub fn classify(&self, envelope: &TopologyUpdateEnvelope) -> Signal {
        let Some(data) = &envelope.data else {
            return Signal::Offline;
        };
        if data.sub_devices.is_empty() {
            return Signal::Offline;
        }
        if self.shutdown.looks_like_shutdown(envelope, data) {
            debug!(gateway = %envelope.from, subs = data.sub_devices.len(), "Topology update read as gateway shutdown");
            return Signal::Offline;
        }
        Signal::Online
    }
}

/// Classify with the default heuristic
pub fn classify(envelope: &TopologyUpdateEnvelope) -> Signal {
    Classifier::default().classify(envelope)
}
