//! Topic routing and the message-kind dispatch table
//!
//! Parsers are registered per [`MessageKind`] when the router is built; there
//! is no per-topic subclassing. A parser turns one raw message into a
//! [`PresenceEvent`] for the reconciler.

use dockwatch_core::telemetry::infer_class;
use dockwatch_core::{DeviceClass, DeviceSn, TopologyUpdateEnvelope};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::reconciler::{PresenceEvent, StateUpdate};
use crate::registry::GatewayRegistry;
use crate::store::PresenceStore;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("unrecognised topic: {0}")]
    UnknownTopic(String),
    #[error("no parser registered for {0:?} messages")]
    NoParser(MessageKind),
    #[error("malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
    #[error("unsupported status method {method:?} from {sn}")]
    UnsupportedMethod { sn: DeviceSn, method: String },
    #[error("cannot tell which kind of device {0} is")]
    UnknownClass(DeviceSn),
}

/// Kind of inbound message, derived from its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `sys/product/{sn}/status`
    Status,
    /// `thing/product/{sn}/osd`
    Osd,
    /// `thing/product/{sn}/state`
    State,
}

/// A parsed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: MessageKind,
    pub sn: DeviceSn,
    pub topic: String,
}

impl Route {
    pub fn parse(topic: &str) -> Result<Self, RouteError> {
        let parts: Vec<&str> = topic.split('/').collect();
        let kind = match parts.as_slice() {
            ["sys", "product", sn, "status"] if !sn.is_empty() => MessageKind::Status,
            ["thing", "product", sn, "osd"] if !sn.is_empty() => MessageKind::Osd,
            ["thing", "product", sn, "state"] if !sn.is_empty() => MessageKind::State,
            _ => return Err(RouteError::UnknownTopic(topic.to_string())),
        };
        Ok(Self {
            kind,
            sn: DeviceSn::from(parts[2]),
            topic: topic.to_string(),
        })
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> RouteError {
        RouteError::Malformed {
            topic: self.topic.clone(),
            reason: reason.to_string(),
        }
    }
}

/// State the parsers may consult
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub store: Arc<PresenceStore>,
    pub registry: Arc<GatewayRegistry>,
}

impl RouteContext {
    pub fn new(store: Arc<PresenceStore>, registry: Arc<GatewayRegistry>) -> Self {
        Self { store, registry }
    }

    /// Telemetry class of `sn`: recorded domain first, then the registry, then
    /// the payload itself
    pub fn resolve_class(&self, sn: &DeviceSn, payload: &Value) -> Option<DeviceClass> {
        if let Some(known) = self.store.get(sn) {
            if let Some(class) = DeviceClass::from_domain(known.record.device.domain) {
                return Some(class);
            }
        }
        if let Some(session) = self.registry.get(sn) {
            return DeviceClass::from_domain(session.gateway.model_key.domain);
        }
        if self.registry.gateway_of(sn).is_some() {
            return Some(DeviceClass::Drone);
        }
        infer_class(payload)
    }
}

pub type Parser = fn(&RouteContext, &Route, &[u8]) -> Result<PresenceEvent, RouteError>;

/// Dispatch table from message kind to parser
pub struct Router {
    context: RouteContext,
    parsers: HashMap<MessageKind, Parser>,
}

impl Router {
    /// Empty table; every kind must be registered explicitly
    pub fn new(context: RouteContext) -> Self {
        Self {
            context,
            parsers: HashMap::new(),
        }
    }

    /// Table with the status, OSD and state parsers
    pub fn standard(context: RouteContext) -> Self {
        Self::new(context)
            .register(MessageKind::Status, parse_status)
            .register(MessageKind::Osd, parse_osd)
            .register(MessageKind::State, parse_state)
    }

    pub fn register(mut self, kind: MessageKind, parser: Parser) -> Self {
        self.parsers.insert(kind, parser);
        self
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.parsers.contains_key(&kind)
    }

    pub fn context(&self) -> &RouteContext {
        &self.context
    }

    /// Parse a message whose topic is already resolved
    pub fn dispatch(&self, route: &Route, payload: &[u8]) -> Result<PresenceEvent, RouteError> {
        let parser = self
            .parsers
            .get(&route.kind)
            .ok_or(RouteError::NoParser(route.kind))?;
        parser(&self.context, route, payload)
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<PresenceEvent, RouteError> {
        self.dispatch(&Route::parse(topic)?, payload)
    }
}

/// Topology update from a gateway's status topic
pub fn parse_status(_: &RouteContext, route: &Route, payload: &[u8]) -> Result<PresenceEvent, RouteError> {
    let mut envelope = TopologyUpdateEnvelope::from_slice(payload).map_err(|e| route.malformed(e))?;
    if envelope.method != dockwatch_core::topology::METHOD_UPDATE_TOPO {
        return Err(RouteError::UnsupportedMethod {
            sn: route.sn.clone(),
            method: envelope.method,
        });
    }
    // The topic is authoritative for the sender
    envelope.from = route.sn.clone();
    Ok(PresenceEvent::Topology(envelope))
}

/// OSD telemetry; the reading sits under `data` when the message is enveloped
pub fn parse_osd(context: &RouteContext, route: &Route, payload: &[u8]) -> Result<PresenceEvent, RouteError> {
    let message: Value = serde_json::from_slice(payload).map_err(|e| route.malformed(e))?;
    let reading = match message.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => message,
    };
    if !reading.is_object() {
        return Err(route.malformed("telemetry is not a JSON object"));
    }

    let class = context
        .resolve_class(&route.sn, &reading)
        .ok_or_else(|| RouteError::UnknownClass(route.sn.clone()))?;
    let payload = serde_json::to_vec(&reading).map_err(|e| route.malformed(e))?;
    Ok(PresenceEvent::Telemetry {
        sn: route.sn.clone(),
        class,
        payload,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateReport {
    #[serde(alias = "controlSource")]
    control_source: Option<String>,
    #[serde(alias = "firmwareVersion")]
    firmware_version: Option<String>,
}

/// Attribute changes from the state topic; reports that carry none of the
/// tracked attributes become empty updates
pub fn parse_state(_: &RouteContext, route: &Route, payload: &[u8]) -> Result<PresenceEvent, RouteError> {
    let message: Value = serde_json::from_slice(payload).map_err(|e| route.malformed(e))?;
    let data = match message.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => message,
    };
    if !data.is_object() {
        return Err(route.malformed("state report is not a JSON object"));
    }
    let report: StateReport = serde_json::from_value(data).map_err(|e| route.malformed(e))?;
    Ok(PresenceEvent::State {
        sn: route.sn.clone(),
        update: StateUpdate {
            control_source: report.control_source,
            firmware_version: report.firmware_version,
        },
    })
}
