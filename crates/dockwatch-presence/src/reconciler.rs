//! Topology reconciler
//!
//! Every signal, explicit topology update or implicit liveness from telemetry,
//! enters through [`Reconciler::apply`]. A step reads the current records,
//! plans the new records plus the side effects the change implies, and commits
//! the records with one batch compare-and-set. Losing a version race discards
//! the plan and re-plans against fresh state. Side effects are queued only
//! after a successful commit, and only for plans that changed presence, so
//! redundant signals never produce a second subscribe or event. Registry
//! updates apply immediately; external calls are delivered in the background
//! in commit order.

use chrono::{DateTime, Utc};
use dockwatch_core::telemetry::{normalize, normalize_as, SubDeviceReport};
use dockwatch_core::{
    CanonicalTelemetry, Classifier, DecodeFailure, Device, DeviceClass, DeviceDomain, DeviceSn, ModelKey, Signal,
    TopologyUpdateEnvelope,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collab::{EventKind, EventPublisher, GatewayRef, PersistenceStore, SubscriptionManager};
use crate::config::ReconcilerConfig;
use crate::dispatch::{Delivery, EffectQueue};
use crate::registry::GatewayRegistry;
use crate::store::{PresenceRecord, PresenceStore, Versioned, Write};

/// A signal about one device
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Topology update from a gateway's status topic
    Topology(TopologyUpdateEnvelope),
    /// Raw telemetry; its arrival alone proves the device is alive
    Telemetry {
        sn: DeviceSn,
        class: DeviceClass,
        payload: Vec<u8>,
    },
    /// An external health check found the device idle
    Silence { sn: DeviceSn },
    /// Attribute report from the device's state topic
    State { sn: DeviceSn, update: StateUpdate },
}

/// Attributes a device reports on its state topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// Control source index, e.g. "A"
    pub control_source: Option<String>,
    pub firmware_version: Option<String>,
}

impl StateUpdate {
    /// Drop blank values, which devices send when the attribute is unknown
    fn meaningful(self) -> Self {
        let keep = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Self {
            control_source: keep(self.control_source),
            firmware_version: keep(self.firmware_version),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.control_source.is_none() && self.firmware_version.is_none()
    }
}

impl PresenceEvent {
    /// Serial the event is ordered by
    pub fn sn(&self) -> &DeviceSn {
        match self {
            Self::Topology(envelope) => &envelope.from,
            Self::Telemetry { sn, .. } | Self::Silence { sn } | Self::State { sn, .. } => sn,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Decode(#[from] DecodeFailure),
    #[error("topology update has no sender serial")]
    MissingSender,
    #[error("{0} announced itself as its own sub-device")]
    SelfParent(DeviceSn),
    #[error("version conflict on {sn} after {attempts} attempts")]
    Conflict { sn: DeviceSn, attempts: u32 },
}

/// A presence change committed by one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Sub-device seen for the first time, attached to its gateway
    FirstSight { gateway: DeviceSn, sub_device: DeviceSn },
    /// Known sub-device (re)attached under the gateway it already had
    Attached { gateway: DeviceSn, sub_device: DeviceSn },
    Reparented {
        sub_device: DeviceSn,
        from: DeviceSn,
        to: DeviceSn,
    },
    /// Nothing changed but login time and last seen
    Reannounced { gateway: DeviceSn, sub_device: DeviceSn },
    GatewayOffline { gateway: DeviceSn },
    /// Offline signal from a gateway with no record yet
    CreatedOffline { gateway: DeviceSn },
    SubDeviceOffline { gateway: DeviceSn, sub_device: DeviceSn },
    /// Telemetry from a device not marked online
    CameOnline { sn: DeviceSn },
    Silenced { sn: DeviceSn },
    /// Reported attributes changed; presence did not
    Updated { sn: DeviceSn },
}

/// Result of [`Reconciler::apply`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub transitions: Vec<Transition>,
    /// Commit attempts of the last step, 1 when uncontended
    pub attempts: u32,
    /// Normalized telemetry, for telemetry events
    pub telemetry: Option<CanonicalTelemetry>,
}

impl Outcome {
    /// True when presence did not change (re-announcements and attribute
    /// updates included)
    pub fn is_unchanged(&self) -> bool {
        self.transitions
            .iter()
            .all(|t| matches!(t, Transition::Reannounced { .. } | Transition::Updated { .. }))
    }
}

#[derive(Debug, Clone)]
enum Effect {
    Subscribe(GatewayRef),
    Unsubscribe(DeviceSn),
    Publish {
        workspace_id: Option<String>,
        kind: EventKind,
        sn: DeviceSn,
        payload: Value,
    },
    Register(GatewayRef),
    Deregister(DeviceSn),
    Detach(DeviceSn),
}

/// Records to commit and what to do once they are committed
#[derive(Debug, Default)]
struct Plan {
    writes: Vec<Write>,
    persist: Vec<Device>,
    effects: Vec<Effect>,
    transitions: Vec<Transition>,
}

impl Plan {
    fn stage(&mut self, current: Option<&Versioned>, record: PresenceRecord) {
        let changed = current.map_or(true, |v| differs(&v.record.device, &record.device));
        if changed {
            self.persist.push(record.device.clone());
        }
        self.writes.push(Write::new(current.map_or(0, |v| v.version), record));
    }

    /// Fold in a plan for other serials, committed in the same batch
    fn absorb(&mut self, other: Plan) {
        self.writes.extend(other.writes);
        self.persist.extend(other.persist);
        self.effects.extend(other.effects);
        self.transitions.extend(other.transitions);
    }

    fn publish(&mut self, workspace_id: Option<&str>, kind: EventKind, sn: &DeviceSn, payload: Value) {
        self.effects.push(Effect::Publish {
            workspace_id: workspace_id.map(str::to_string),
            kind,
            sn: sn.clone(),
            payload,
        });
    }
}

/// Devices differ in anything but login time
fn differs(a: &Device, b: &Device) -> bool {
    let mut b = b.clone();
    b.login_time = a.login_time;
    *a != b
}

/// Copy what the latest announcement says about the hardware
fn refresh(device: &mut Device, announced: &Device) {
    device.domain = announced.domain;
    device.device_type = announced.device_type;
    device.sub_type = announced.sub_type;
    if announced.thing_version.is_some() {
        device.thing_version = announced.thing_version.clone();
    }
    if announced.control_source.is_some() {
        device.control_source = announced.control_source.clone();
    }
}

fn device_payload(device: &Device, sub_device: Option<&Device>) -> Value {
    json!({
        "sn": device.sn,
        "model_key": device.model_key().to_string(),
        "online": device.online,
        "thing_version": device.thing_version,
        "sub_device": sub_device.map(|sub| json!({
            "sn": sub.sn,
            "model_key": sub.model_key().to_string(),
            "online": sub.online,
        })),
    })
}

/// Durable records found for serials the store has not seen yet
type Seeds = HashMap<DeviceSn, Device>;

/// The presence state machine
pub struct Reconciler {
    store: Arc<PresenceStore>,
    registry: Arc<GatewayRegistry>,
    classifier: Classifier,
    effects: EffectQueue,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<PresenceStore>,
        subscriptions: Arc<dyn SubscriptionManager>,
        publisher: Arc<dyn EventPublisher>,
        persistence: Arc<dyn PersistenceStore>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(GatewayRegistry::new()),
            classifier: Classifier::default(),
            effects: EffectQueue::new(subscriptions, publisher, persistence),
            clock: Arc::new(SystemClock),
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<GatewayRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<PresenceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    /// Wait until the side effects of every step applied so far have been
    /// delivered
    pub async fn settle(&self) {
        self.effects.settle().await;
    }

    /// Apply one signal
    pub async fn apply(&self, event: PresenceEvent) -> Result<Outcome, ReconcileError> {
        match event {
            PresenceEvent::Topology(envelope) => self.apply_topology(envelope).await,
            PresenceEvent::Telemetry { sn, class, payload } => self.apply_telemetry(&sn, class, &payload).await,
            PresenceEvent::Silence { sn } => self.apply_silence(&sn).await,
            PresenceEvent::State { sn, update } => self.apply_state(&sn, update).await,
        }
    }

    async fn apply_topology(&self, envelope: TopologyUpdateEnvelope) -> Result<Outcome, ReconcileError> {
        let gateway_sn = envelope.from.clone();
        if gateway_sn.is_empty() {
            return Err(ReconcileError::MissingSender);
        }

        let signal = self.classifier.classify(&envelope);
        debug!(gateway = %gateway_sn, signal = ?signal, method = %envelope.method, "Classified topology update");

        let now = self.clock.now();
        let announced = envelope
            .data
            .as_ref()
            .and_then(|data| data.primary_sub_device().map(|sub| (data, sub)));

        match (signal, announced) {
            (Signal::Online, Some((data, sub))) => {
                self.attach(data.gateway_device(&gateway_sn, now), sub.to_device(now))
                    .await
            }
            _ => {
                let template = envelope
                    .data
                    .as_ref()
                    .map(|data| data.gateway_device(&gateway_sn, now));
                self.gateway_offline(&gateway_sn, template).await
            }
        }
    }

    async fn apply_telemetry(
        &self,
        sn: &DeviceSn,
        class: DeviceClass,
        payload: &[u8],
    ) -> Result<Outcome, ReconcileError> {
        let normalized = match normalize(payload, class) {
            Ok(normalized) => normalized,
            Err(first) => match normalize_as(payload, first.dialect.fallback()) {
                Ok(normalized) => {
                    debug!(device = %sn, dialect = %normalized.dialect, "Decoded telemetry with fallback dialect");
                    normalized
                }
                Err(_) => {
                    warn!(device = %sn, error = %first, "Dropping undecodable telemetry");
                    return Err(first.into());
                }
            },
        };
        let telemetry = normalized.telemetry;

        // A dock names the drone it hosts; that change commits with the dock's
        // own liveness so the frame fires its side effects once
        let report = match class {
            DeviceClass::Dock => telemetry.sub_device_report(),
            _ => None,
        }
        .filter(|report| {
            if &report.sn == sn {
                warn!(device = %sn, "Dock reported itself as its sub-device, ignoring report");
                false
            } else {
                true
            }
        });

        let mut serials = vec![sn];
        if let Some(report) = &report {
            serials.push(&report.sn);
        }
        let seeds = self.hydrate(&serials).await;
        let mut outcome = match &report {
            Some(report) if report.online => {
                self.reconcile(sn, |now| self.plan_alive_with_sub_device(sn, class, report, &seeds, now))
                    .await?
            }
            Some(report) => {
                self.reconcile(sn, |now| {
                    let mut plan = self.plan_alive(sn, class, &seeds, now);
                    plan.absorb(self.plan_sub_device_offline(sn, &report.sn, now));
                    plan
                })
                .await?
            }
            None => {
                self.reconcile(sn, |now| self.plan_alive(sn, class, &seeds, now))
                    .await?
            }
        };

        let now = self.clock.now();
        if self.store.upsert_telemetry(sn, &telemetry, now) {
            let workspace_id = self
                .store
                .get(sn)
                .and_then(|v| v.record.device.workspace().map(str::to_string));
            let effect = Effect::Publish {
                workspace_id,
                kind: EventKind::TelemetryUpdate,
                sn: sn.clone(),
                payload: telemetry.to_json(),
            };
            self.fire(Vec::new(), vec![effect]);
        }

        outcome.telemetry = Some(telemetry);
        Ok(outcome)
    }

    async fn apply_silence(&self, sn: &DeviceSn) -> Result<Outcome, ReconcileError> {
        self.reconcile(sn, |_| self.plan_silence(sn)).await
    }

    async fn apply_state(&self, sn: &DeviceSn, update: StateUpdate) -> Result<Outcome, ReconcileError> {
        let update = update.meaningful();
        if update.is_empty() {
            debug!(device = %sn, "State report carries no tracked attributes");
            return Ok(Outcome::default());
        }
        self.reconcile(sn, |_| self.plan_state(sn, &update)).await
    }

    async fn attach(&self, gateway: Device, sub_device: Device) -> Result<Outcome, ReconcileError> {
        if gateway.sn == sub_device.sn {
            warn!(device = %gateway.sn, "Refusing to attach a device to itself");
            return Err(ReconcileError::SelfParent(gateway.sn));
        }
        let seeds = self.hydrate(&[&gateway.sn, &sub_device.sn]).await;
        self.reconcile(&sub_device.sn, |now| {
            self.plan_attach(&gateway, &sub_device, &seeds, now)
        })
        .await
    }

    async fn gateway_offline(
        &self,
        gateway_sn: &DeviceSn,
        template: Option<Device>,
    ) -> Result<Outcome, ReconcileError> {
        let seeds = self.hydrate(&[gateway_sn]).await;
        self.reconcile(gateway_sn, |now| {
            self.plan_gateway_offline(gateway_sn, template.as_ref(), &seeds, now)
        })
        .await
    }

    /// Plan, commit, and on success run the plan's effects
    async fn reconcile<F>(&self, subject: &DeviceSn, plan: F) -> Result<Outcome, ReconcileError>
    where
        F: Fn(DateTime<Utc>) -> Plan,
    {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let Plan {
                writes,
                persist,
                effects,
                transitions,
            } = plan(self.clock.now());

            if !self.store.commit(writes) {
                debug!(device = %subject, attempt, "Version conflict, re-planning");
                continue;
            }

            for transition in &transitions {
                info!(transition = ?transition, "Presence transition");
            }
            self.fire(persist, effects);
            return Ok(Outcome {
                transitions,
                attempts: attempt,
                telemetry: None,
            });
        }

        warn!(device = %subject, attempts, "Giving up after repeated version conflicts");
        Err(ReconcileError::Conflict {
            sn: subject.clone(),
            attempts,
        })
    }

    /// Look up durable records for serials the store does not know
    ///
    /// Hydrated devices start offline and detached; only identity and workspace
    /// binding carry over.
    async fn hydrate(&self, serials: &[&DeviceSn]) -> Seeds {
        let mut seeds = Seeds::new();
        for sn in serials {
            if self.store.version(sn) > 0 || seeds.contains_key(*sn) {
                continue;
            }
            match self.effects.persistence().load(sn).await {
                Ok(Some(mut device)) => {
                    device.online = false;
                    device.parent_sn = None;
                    device.child_device_sn = None;
                    debug!(device = %sn, workspace = ?device.workspace(), "Hydrated device from persistence");
                    seeds.insert((*sn).clone(), device);
                }
                Ok(None) => {}
                Err(e) => warn!(device = %sn, error = %e, "Persistence lookup failed"),
            }
        }
        seeds
    }

    fn default_workspace(&self) -> Option<&str> {
        self.config
            .default_workspace_id
            .as_deref()
            .filter(|ws| !ws.trim().is_empty())
    }

    /// Record for a serial the store has never held
    fn first_record(&self, template: &Device, seeds: &Seeds, now: DateTime<Utc>) -> PresenceRecord {
        let device = match seeds.get(&template.sn) {
            Some(seed) => seed.clone(),
            None => {
                let mut device = template.clone();
                if let Some(ws) = self.default_workspace() {
                    device.bind(ws);
                }
                device
            }
        };
        PresenceRecord::new(device, now)
    }

    fn plan_attach(&self, gateway: &Device, sub_device: &Device, seeds: &Seeds, now: DateTime<Utc>) -> Plan {
        let mut plan = Plan::default();
        let gateway_sn = gateway.sn.clone();
        let sub_sn = sub_device.sn.clone();

        let g_current = self.store.get(&gateway_sn);
        let s_current = self.store.get(&sub_sn);
        let mut g = g_current
            .as_ref()
            .map_or_else(|| self.first_record(gateway, seeds, now), |v| v.record.clone());
        let mut s = s_current
            .as_ref()
            .map_or_else(|| self.first_record(sub_device, seeds, now), |v| v.record.clone());
        refresh(&mut g.device, gateway);
        refresh(&mut s.device, sub_device);

        let g_was_online = g_current.as_ref().is_some_and(|v| v.record.device.online);
        let s_was_online = s_current.as_ref().is_some_and(|v| v.record.device.online);
        let attached = g.device.child_device_sn.as_ref() == Some(&sub_sn)
            && s.device.parent_sn.as_ref() == Some(&gateway_sn);

        for record in [&mut g, &mut s] {
            record.device.login_time = now;
            record.last_seen = now;
        }

        if attached && g_was_online && s_was_online {
            plan.stage(g_current.as_ref(), g);
            plan.stage(s_current.as_ref(), s);
            plan.transitions.push(Transition::Reannounced {
                gateway: gateway_sn,
                sub_device: sub_sn,
            });
            return plan;
        }

        let previous_parent = s.device.parent_sn.clone().filter(|p| p != &gateway_sn);

        // Single parent: no other gateway may keep pointing at the sub-device
        for other in self.store.gateways_with_child(&sub_sn) {
            if other.record.device.sn == gateway_sn {
                continue;
            }
            let mut cleared = other.record.clone();
            cleared.device.child_device_sn = None;
            plan.stage(Some(&other), cleared);
        }

        // The gateway's previous sub-device loses its parent pointer
        if let Some(old_child) = g.device.child_device_sn.clone().filter(|c| c != &sub_sn) {
            let orphan = self
                .store
                .get(&old_child)
                .filter(|c| c.record.device.parent_sn.as_ref() == Some(&gateway_sn));
            if let Some(current) = orphan {
                let mut record = current.record.clone();
                record.device.parent_sn = None;
                plan.stage(Some(&current), record);
            }
        }

        g.device.child_device_sn = Some(sub_sn.clone());
        g.device.online = true;
        s.device.parent_sn = Some(gateway_sn.clone());
        s.device.online = true;
        if s.device.workspace().is_none() {
            if let Some(ws) = g.device.workspace() {
                s.device.bind(ws);
            }
        }

        let gateway_ref = GatewayRef::new(&g.device, Some(&s.device));
        if previous_parent.is_some() {
            plan.effects.push(Effect::Unsubscribe(sub_sn.clone()));
            plan.effects.push(Effect::Detach(sub_sn.clone()));
        }
        plan.effects.push(Effect::Subscribe(gateway_ref.clone()));
        plan.effects.push(Effect::Register(gateway_ref));
        if !(g_was_online && s_was_online) {
            let workspace_id = g.device.workspace().or(s.device.workspace());
            plan.publish(
                workspace_id,
                EventKind::DeviceOnline,
                &gateway_sn,
                device_payload(&g.device, Some(&s.device)),
            );
        }

        let transition = match (s_current.is_some(), previous_parent) {
            (false, _) => Transition::FirstSight {
                gateway: gateway_sn,
                sub_device: sub_sn,
            },
            (true, Some(from)) => Transition::Reparented {
                sub_device: sub_sn,
                from,
                to: gateway_sn,
            },
            (true, None) => Transition::Attached {
                gateway: gateway_sn,
                sub_device: sub_sn,
            },
        };
        plan.transitions.push(transition);
        plan.stage(g_current.as_ref(), g);
        plan.stage(s_current.as_ref(), s);
        plan
    }

    fn plan_gateway_offline(
        &self,
        gateway_sn: &DeviceSn,
        template: Option<&Device>,
        seeds: &Seeds,
        now: DateTime<Utc>,
    ) -> Plan {
        let Some(current) = self.store.get(gateway_sn) else {
            // Domain and type are placeholders until the first full announcement
            let template = template
                .cloned()
                .unwrap_or_else(|| Device::new(gateway_sn.clone(), ModelKey::new(DeviceDomain::Dock, 0, 0), now));
            let mut record = self.first_record(&template, seeds, now);
            refresh(&mut record.device, &template);
            record.device.online = false;

            let mut plan = Plan::default();
            plan.stage(None, record);
            plan.transitions.push(Transition::CreatedOffline {
                gateway: gateway_sn.clone(),
            });
            return plan;
        };

        if let Some(child) = &current.record.device.child_device_sn {
            return self.plan_sub_device_offline(gateway_sn, child, now);
        }

        let mut plan = Plan::default();
        if current.record.device.online {
            let mut record = current.record.clone();
            record.device.online = false;
            record.last_seen = now;
            plan.publish(
                record.device.workspace(),
                EventKind::DeviceOffline,
                gateway_sn,
                device_payload(&record.device, None),
            );
            plan.effects.push(Effect::Deregister(gateway_sn.clone()));
            plan.stage(Some(&current), record);
            plan.transitions.push(Transition::GatewayOffline {
                gateway: gateway_sn.clone(),
            });
        }
        plan
    }

    /// Sub-device went away from its gateway; the gateway itself stays as it is
    fn plan_sub_device_offline(&self, gateway_sn: &DeviceSn, sub_sn: &DeviceSn, now: DateTime<Utc>) -> Plan {
        let mut plan = Plan::default();
        let Some(current) = self.store.get(sub_sn) else {
            return plan;
        };
        let device = &current.record.device;
        if !device.online || device.parent_sn.as_ref() != Some(gateway_sn) {
            return plan;
        }

        let mut record = current.record.clone();
        record.device.online = false;
        record.last_seen = now;
        plan.effects.push(Effect::Unsubscribe(sub_sn.clone()));
        plan.publish(
            record.device.workspace(),
            EventKind::DeviceOffline,
            sub_sn,
            device_payload(&record.device, None),
        );
        plan.stage(Some(&current), record);
        plan.transitions.push(Transition::SubDeviceOffline {
            gateway: gateway_sn.clone(),
            sub_device: sub_sn.clone(),
        });
        plan
    }

    fn plan_alive(&self, sn: &DeviceSn, class: DeviceClass, seeds: &Seeds, now: DateTime<Utc>) -> Plan {
        let mut plan = Plan::default();
        let current = self.store.get(sn);
        if current.as_ref().is_some_and(|v| v.record.device.online) {
            return plan;
        }

        let mut record = match &current {
            Some(v) => v.record.clone(),
            None => {
                let template = Device::new(sn.clone(), ModelKey::new(class.domain(), 0, 0), now);
                self.first_record(&template, seeds, now)
            }
        };
        record.device.online = true;
        record.device.login_time = now;
        record.last_seen = now;

        if record.device.is_gateway() {
            let child = record
                .device
                .child_device_sn
                .as_ref()
                .and_then(|c| self.store.get(c))
                .map(|c| c.record.device)
                .filter(|c| c.parent_sn.as_ref() == Some(sn));
            let gateway_ref = GatewayRef::new(&record.device, child.as_ref());
            plan.effects.push(Effect::Subscribe(gateway_ref.clone()));
            plan.effects.push(Effect::Register(gateway_ref));
        }
        plan.publish(
            record.device.workspace(),
            EventKind::DeviceOnline,
            sn,
            device_payload(&record.device, None),
        );
        plan.stage(current.as_ref(), record);
        plan.transitions.push(Transition::CameOnline { sn: sn.clone() });
        plan
    }

    /// Dock telemetry that reports an online drone: liveness and attachment
    /// in one plan
    fn plan_alive_with_sub_device(
        &self,
        sn: &DeviceSn,
        class: DeviceClass,
        report: &SubDeviceReport,
        seeds: &Seeds,
        now: DateTime<Utc>,
    ) -> Plan {
        let current = self.store.get(sn);
        let gateway = match &current {
            Some(v) => v.record.device.clone(),
            None => seeds
                .get(sn)
                .cloned()
                .unwrap_or_else(|| Device::new(sn.clone(), ModelKey::new(class.domain(), 0, 0), now)),
        };

        let mut sub_device = match self.store.get(&report.sn) {
            Some(known) => known.record.device,
            None => seeds
                .get(&report.sn)
                .cloned()
                .unwrap_or_else(|| Device::new(report.sn.clone(), ModelKey::new(DeviceDomain::Drone, 0, 0), now)),
        };
        if let Some(key) = report.model_key {
            sub_device.domain = key.domain;
            sub_device.device_type = key.device_type;
            sub_device.sub_type = key.sub_type;
        }

        let mut plan = self.plan_attach(&gateway, &sub_device, seeds, now);
        if !current.is_some_and(|v| v.record.device.online) {
            plan.transitions.insert(0, Transition::CameOnline { sn: sn.clone() });
        }
        plan
    }

    /// Apply state-topic attributes to a known device
    fn plan_state(&self, sn: &DeviceSn, update: &StateUpdate) -> Plan {
        let mut plan = Plan::default();
        let Some(current) = self.store.get(sn) else {
            debug!(device = %sn, "State report for an unknown device, ignoring");
            return plan;
        };

        let mut record = current.record.clone();
        if let Some(version) = &update.firmware_version {
            record.device.firmware_version = Some(version.clone());
        }
        // Control hand-overs only matter while the device is connected
        if let Some(source) = &update.control_source {
            if record.device.online {
                record.device.control_source = Some(source.clone());
            }
        }

        if record.device != current.record.device {
            plan.stage(Some(&current), record);
            plan.transitions.push(Transition::Updated { sn: sn.clone() });
        }
        plan
    }

    fn plan_silence(&self, sn: &DeviceSn) -> Plan {
        let mut plan = Plan::default();
        let Some(current) = self.store.get(sn).filter(|v| v.record.device.online) else {
            return plan;
        };

        let mut record = current.record.clone();
        record.device.online = false;
        if record.device.parent_sn.is_some() || record.device.domain.is_sub_device() {
            plan.effects.push(Effect::Unsubscribe(sn.clone()));
        }
        if record.device.is_gateway() {
            plan.effects.push(Effect::Deregister(sn.clone()));
        }
        plan.publish(
            record.device.workspace(),
            EventKind::DeviceOffline,
            sn,
            device_payload(&record.device, None),
        );
        plan.stage(Some(&current), record);
        plan.transitions.push(Transition::Silenced { sn: sn.clone() });
        plan
    }

    /// Apply registry changes now and queue the external calls
    fn fire(&self, persist: Vec<Device>, effects: Vec<Effect>) {
        let now = self.clock.now();
        let mut deliveries = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::Subscribe(gateway) => deliveries.push(Delivery::Subscribe(gateway)),
                Effect::Unsubscribe(sn) => deliveries.push(Delivery::Unsubscribe(sn)),
                Effect::Publish {
                    workspace_id,
                    kind,
                    sn,
                    payload,
                } => deliveries.push(Delivery::Publish {
                    workspace_id,
                    kind,
                    sn,
                    payload,
                }),
                Effect::Register(gateway) => {
                    self.registry.register(gateway, now);
                }
                Effect::Deregister(sn) => {
                    self.registry.remove(&sn);
                }
                Effect::Detach(sn) => self.registry.detach(&sn),
            }
        }
        self.effects.submit(persist, deliveries);
    }
}
