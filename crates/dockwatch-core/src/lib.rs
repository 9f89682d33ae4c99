//! Dockwatch Core - Device model, topology classification, and telemetry normalization
//!
//! This crate holds the pure, I/O-free parts of Dockwatch:
//! - Device identity, domains, and the logical presence state
//! - Topology update envelopes and the gateway/sub-device graph
//! - Classification of ambiguous topology updates into online/offline signals
//! - Normalization of both telemetry wire dialects into one canonical record

pub mod classify;
pub mod device;
pub mod telemetry;
pub mod topology;

pub use classify::{classify, Classifier, GatewayHeartbeatHeuristic, NeverShutdown, ShutdownPredicate, Signal};
pub use device::{Device, DeviceClass, DeviceDomain, DeviceSn, GatewayKind, LogicalState, ModelKey};
pub use telemetry::{
    normalize, normalize_as, normalize_value, CanonicalTelemetry, DecodeFailure, Dialect, Normalized,
    SubDeviceReport,
};
pub use topology::{SubDeviceAnnouncement, Topology, TopologyData, TopologyNode, TopologyUpdateEnvelope};
