//! Topology update envelopes and the gateway/sub-device graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::{numeric_code, Device, DeviceDomain, DeviceSn, ModelKey};

/// Method name carried by topology updates
pub const METHOD_UPDATE_TOPO: &str = "update_topo";

/// A topology update as received on a gateway's status topic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyUpdateEnvelope {
    /// Serial of the sending gateway (filled from the topic when absent in the body)
    #[serde(default)]
    pub from: DeviceSn,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub bid: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Option<TopologyData>,
}

impl TopologyUpdateEnvelope {
    /// Parse an envelope from raw JSON bytes
    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Gateway description plus the sub-devices it currently announces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyData {
    pub domain: DeviceDomain,
    #[serde(rename = "type", deserialize_with = "numeric_code")]
    pub device_type: u32,
    #[serde(default, deserialize_with = "numeric_code")]
    pub sub_type: u32,
    #[serde(default)]
    pub thing_version: Option<String>,
    #[serde(default)]
    pub sub_devices: Vec<SubDeviceAnnouncement>,
}

impl TopologyData {
    pub fn gateway_key(&self) -> ModelKey {
        ModelKey::new(self.domain, self.device_type, self.sub_type)
    }

    /// The sub-device this gateway is hosting; gateways carry at most one
    pub fn primary_sub_device(&self) -> Option<&SubDeviceAnnouncement> {
        self.sub_devices.first()
    }

    /// Build a fresh gateway record from this announcement
    pub fn gateway_device(&self, sn: &DeviceSn, now: DateTime<Utc>) -> Device {
        let mut device = Device::new(sn.clone(), self.gateway_key(), now);
        device.thing_version = self.thing_version.clone();
        device.control_source = self
            .primary_sub_device()
            .and_then(|sub| sub.control_source_index.clone());
        device
    }
}

/// One sub-device entry of a topology update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubDeviceAnnouncement {
    pub sn: DeviceSn,
    #[serde(default)]
    pub domain: Option<DeviceDomain>,
    #[serde(rename = "type", default, deserialize_with = "numeric_code")]
    pub device_type: u32,
    #[serde(default, deserialize_with = "numeric_code")]
    pub sub_type: u32,
    #[serde(default)]
    pub thing_version: Option<String>,
    #[serde(default, alias = "index")]
    pub control_source_index: Option<String>,
}

impl SubDeviceAnnouncement {
    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(
            self.domain.unwrap_or(DeviceDomain::Drone),
            self.device_type,
            self.sub_type,
        )
    }

    /// Build a fresh sub-device record from this announcement
    pub fn to_device(&self, now: DateTime<Utc>) -> Device {
        let mut device = Device::new(self.sn.clone(), self.model_key(), now);
        device.thing_version = self.thing_version.clone();
        device.control_source = self.control_source_index.clone();
        device
    }
}

/// A node in the topology graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub sn: DeviceSn,
    pub model_key: ModelKey,
    pub online: bool,
    /// Is this a gateway node
    pub is_gateway: bool,
    /// Attached sub-devices
    pub children: Vec<DeviceSn>,
}

/// Read-only view of who is attached to whom
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    nodes: BTreeMap<DeviceSn, TopologyNode>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from stored devices
    ///
    /// A child edge is only drawn when the gateway's `child_device_sn` and the
    /// child's `parent_sn` agree, so a half-written pair never shows up.
    pub fn from_devices(devices: &[Device]) -> Self {
        let mut topology = Self::new();

        for device in devices {
            topology.add_node(TopologyNode {
                sn: device.sn.clone(),
                model_key: device.model_key(),
                online: device.online,
                is_gateway: device.is_gateway(),
                children: Vec::new(),
            });
        }

        for device in devices.iter().filter(|d| d.is_gateway()) {
            let Some(child_sn) = &device.child_device_sn else {
                continue;
            };
            let agrees = devices
                .iter()
                .any(|d| &d.sn == child_sn && d.parent_sn.as_ref() == Some(&device.sn));
            if agrees {
                topology.add_child(&device.sn, child_sn);
            }
        }

        topology
    }

    pub fn add_node(&mut self, node: TopologyNode) {
        self.nodes.insert(node.sn.clone(), node);
    }

    pub fn add_child(&mut self, parent: &DeviceSn, child: &DeviceSn) {
        if let Some(node) = self.nodes.get_mut(parent) {
            if !node.children.contains(child) {
                node.children.push(child.clone());
            }
        }
    }

    pub fn get_node(&self, sn: &DeviceSn) -> Option<&TopologyNode> {
        self.nodes.get(sn)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    /// Gateway nodes, in serial order
    pub fn gateways(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values().filter(|n| n.is_gateway)
    }

    pub fn children(&self, sn: &DeviceSn) -> Vec<&TopologyNode> {
        self.nodes
            .get(sn)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|c| self.nodes.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parent gateway of a sub-device
    pub fn parent_of(&self, sn: &DeviceSn) -> Option<&TopologyNode> {
        self.gateways().find(|g| g.children.contains(sn))
    }
}
