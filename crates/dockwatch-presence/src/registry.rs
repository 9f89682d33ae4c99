//! Registry of active gateway sessions

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dockwatch_core::DeviceSn;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::collab::GatewayRef;

/// A gateway that is currently announcing itself
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySession {
    pub session_id: Uuid,
    pub gateway: GatewayRef,
    pub registered_at: DateTime<Utc>,
}

impl GatewaySession {
    pub fn sub_device_sn(&self) -> Option<&DeviceSn> {
        self.gateway.sub_device.as_ref().map(|sub| &sub.sn)
    }
}

/// Active gateway sessions, keyed by gateway serial
///
/// Shared by `Arc` between the reconciler, which keeps it current, and the
/// router, which reads it to classify telemetry.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    sessions: DashMap<DeviceSn, GatewaySession>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a gateway. A refresh keeps the existing session id.
    pub fn register(&self, gateway: GatewayRef, now: DateTime<Utc>) -> GatewaySession {
        let mut entry = self
            .sessions
            .entry(gateway.sn.clone())
            .or_insert_with(|| {
                let session_id = Uuid::new_v4();
                debug!(gateway = %gateway.sn, session = %session_id, "Gateway session opened");
                GatewaySession {
                    session_id,
                    gateway: gateway.clone(),
                    registered_at: now,
                }
            });
        entry.gateway = gateway;
        entry.clone()
    }

    pub fn get(&self, sn: &DeviceSn) -> Option<GatewaySession> {
        self.sessions.get(sn).map(|s| s.clone())
    }

    pub fn remove(&self, sn: &DeviceSn) -> Option<GatewaySession> {
        let removed = self.sessions.remove(sn).map(|(_, session)| session);
        if let Some(session) = &removed {
            debug!(gateway = %sn, session = %session.session_id, "Gateway session closed");
        }
        removed
    }

    /// Forget `child` on every session that lists it as its sub-device
    pub fn detach(&self, child: &DeviceSn) {
        for mut session in self.sessions.iter_mut() {
            if session.sub_device_sn() == Some(child) {
                session.gateway.sub_device = None;
            }
        }
    }

    /// Gateway currently hosting `child`
    pub fn gateway_of(&self, child: &DeviceSn) -> Option<DeviceSn> {
        self.sessions
            .iter()
            .find(|session| session.sub_device_sn() == Some(child))
            .map(|session| session.key().clone())
    }

    pub fn sessions(&self) -> Vec<GatewaySession> {
        let mut sessions: Vec<GatewaySession> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.gateway.sn.cmp(&b.gateway.sn));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session
    pub fn clear(&self) {
        self.sessions.clear();
    }
}
