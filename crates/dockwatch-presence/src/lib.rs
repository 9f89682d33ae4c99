//! Dockwatch Presence - Presence state, topology reconciliation, and ingest
//!
//! This crate holds the stateful side of Dockwatch:
//! - Presence store with per-serial compare-and-set and batch commits
//! - Reconciler, the single entry point that turns signals into transitions
//! - Collaborator traits for subscriptions, event fan-out, and durable storage
//! - Gateway registry, topic subscriptions, and the message router
//! - Sharded ingest workers that keep per-serial ordering
//! - Configuration and tracing setup for host services

pub mod clock;
pub mod collab;
pub mod config;
mod dispatch;
pub mod ingest;
pub mod logging;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod store;
pub mod subscription;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    BroadcastPublisher, CollabError, EventKind, EventPublisher, GatewayRef, JsonFilePersistence, MemoryPersistence,
    PersistenceError, PersistenceStore, PublishedEvent, SubDeviceRef, SubscriptionManager,
};
pub use config::{load_config, Config, ConfigError, IngestConfig, LoggingConfig, ReconcilerConfig};
pub use ingest::{IngestError, IngestPipeline};
pub use logging::init_tracing;
pub use reconciler::{Outcome, PresenceEvent, ReconcileError, Reconciler, StateUpdate, Transition};
pub use registry::{GatewayRegistry, GatewaySession};
pub use router::{MessageKind, Route, RouteContext, RouteError, Router};
pub use store::{PresenceRecord, PresenceStore, Versioned, Write};
pub use subscription::{TopicSubscriptions, TopicTransport};
