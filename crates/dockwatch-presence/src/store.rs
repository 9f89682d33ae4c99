//! In-memory presence state with per-serial compare-and-set
//!
//! Records live in a sharded map of per-serial slots. A slot is locked only
//! while it is read or written, so unrelated serials never contend. Writes that
//! must land together (a reparent touches the sub-device and two gateways) go
//! through [`PresenceStore::commit`], which locks the affected slots in serial
//! order, checks every expected version, then publishes all records at once.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dockwatch_core::{CanonicalTelemetry, Device, DeviceSn, Topology};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stored state of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub device: Device,
    /// Last known telemetry snapshot
    pub telemetry: Option<CanonicalTelemetry>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(device: Device, now: DateTime<Utc>) -> Self {
        Self {
            device,
            telemetry: None,
            last_seen: now,
        }
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// Starts at 1 and grows with every write; 0 is reserved for "absent"
    pub version: u64,
    pub record: PresenceRecord,
}

/// One entry of a batch commit
#[derive(Debug, Clone)]
pub struct Write {
    pub sn: DeviceSn,
    /// Version the caller read, 0 when the record must not exist yet
    pub expected_version: u64,
    pub record: PresenceRecord,
}

impl Write {
    pub fn new(expected_version: u64, record: PresenceRecord) -> Self {
        Self {
            sn: record.device.sn.clone(),
            expected_version,
            record,
        }
    }
}

type Slot = Arc<Mutex<Option<Versioned>>>;

fn version_of(slot: &Option<Versioned>) -> u64 {
    slot.as_ref().map_or(0, |v| v.version)
}

/// Presence state store
#[derive(Debug, Default)]
pub struct PresenceStore {
    slots: DashMap<DeviceSn, Slot>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, sn: &DeviceSn) -> Slot {
        self.slots.entry(sn.clone()).or_default().clone()
    }

    fn existing_slot(&self, sn: &DeviceSn) -> Option<Slot> {
        self.slots.get(sn).map(|slot| slot.clone())
    }

    /// Slots in serial order; the only order in which more than one slot is locked
    fn ordered_slots(&self) -> Vec<(DeviceSn, Slot)> {
        let mut slots: Vec<(DeviceSn, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    pub fn get(&self, sn: &DeviceSn) -> Option<Versioned> {
        self.existing_slot(sn)?.lock().clone()
    }

    pub fn version(&self, sn: &DeviceSn) -> u64 {
        self.existing_slot(sn)
            .map_or(0, |slot| version_of(&slot.lock()))
    }

    /// Replace one record if it is still at `expected_version`
    pub fn compare_and_set(&self, sn: &DeviceSn, expected_version: u64, record: PresenceRecord) -> bool {
        self.commit(vec![Write {
            sn: sn.clone(),
            expected_version,
            record,
        }])
    }

    /// Apply every write or none of them
    ///
    /// Returns false when any slot moved past its expected version, or when the
    /// batch names the same serial twice.
    pub fn commit(&self, mut writes: Vec<Write>) -> bool {
        if writes.is_empty() {
            return true;
        }
        writes.sort_by(|a, b| a.sn.cmp(&b.sn));
        if writes.windows(2).any(|pair| pair[0].sn == pair[1].sn) {
            return false;
        }

        let slots: Vec<Slot> = writes.iter().map(|w| self.slot(&w.sn)).collect();
        let mut guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        let current = guards
            .iter()
            .zip(&writes)
            .all(|(guard, write)| version_of(guard) == write.expected_version);
        if !current {
            return false;
        }

        for (guard, write) in guards.iter_mut().zip(writes) {
            let version = version_of(guard) + 1;
            **guard = Some(Versioned {
                version,
                record: write.record,
            });
        }
        true
    }

    /// Merge a telemetry snapshot into an existing record
    ///
    /// Returns false when the serial has no record.
    pub fn upsert_telemetry(&self, sn: &DeviceSn, telemetry: &CanonicalTelemetry, now: DateTime<Utc>) -> bool {
        let Some(slot) = self.existing_slot(sn) else {
            return false;
        };
        let mut guard = slot.lock();
        let Some(entry) = guard.as_mut() else {
            return false;
        };
        entry
            .record
            .telemetry
            .get_or_insert_with(CanonicalTelemetry::default)
            .merge(telemetry);
        entry.record.last_seen = now;
        entry.version += 1;
        true
    }

    /// Gateways whose `child_device_sn` points at `child`
    pub fn gateways_with_child(&self, child: &DeviceSn) -> Vec<Versioned> {
        let slots: Vec<Slot> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        let mut found: Vec<Versioned> = slots
            .iter()
            .filter_map(|slot| {
                let guard = slot.lock();
                guard
                    .as_ref()
                    .filter(|v| v.record.device.is_gateway())
                    .filter(|v| v.record.device.child_device_sn.as_ref() == Some(child))
                    .cloned()
            })
            .collect();
        found.sort_by(|a, b| a.record.device.sn.cmp(&b.record.device.sn));
        found
    }

    /// Consistent cut of every record, in serial order
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let slots = self.ordered_slots();
        let guards: Vec<_> = slots.iter().map(|(_, slot)| slot.lock()).collect();
        guards
            .iter()
            .filter_map(|guard| guard.as_ref().map(|v| v.record.clone()))
            .collect()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.snapshot().into_iter().map(|r| r.device).collect()
    }

    pub fn topology(&self) -> Topology {
        Topology::from_devices(&self.devices())
    }

    /// Online devices not heard from for longer than `idle`
    pub fn stale_online(&self, idle: Duration, now: DateTime<Utc>) -> Vec<DeviceSn> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.device.online && now - r.last_seen > idle)
            .map(|r| r.device.sn)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
