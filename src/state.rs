//! Per-unit device state: last observed coil/register values plus
//! communication counters.
//!
//! The tracker is a shared handle; the client facade writes to it as
//! transactions complete and external consumers read point-in-time
//! snapshots. Entries are keyed by `(port, unit_id)` and carry their own
//! lock, so a reader snapshotting one unit never blocks traffic to another.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type DeviceKey = (String, u8);

#[derive(Debug, Clone, Default)]
struct DeviceState {
    unit_id: u8,
    port: String,
    baudrate: u32,
    last_updated: f64,
    coils: BTreeMap<u16, bool>,
    discrete_inputs: BTreeMap<u16, bool>,
    holding_registers: BTreeMap<u16, u16>,
    input_registers: BTreeMap<u16, u16>,
    request_count: u64,
    success_count: u64,
    error_count: u64,
    timeout_count: u64,
    crc_error_count: u64,
    last_error: Option<String>,
    last_error_time: Option<f64>,
}

/// Point-in-time copy of one device's state, shaped like the exported JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub unit_id: u8,
    pub port: String,
    pub baudrate: u32,
    pub last_updated: f64,
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding_registers: BTreeMap<u16, u16>,
    pub input_registers: BTreeMap<u16, u16>,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub crc_error_count: u64,
    pub last_error: Option<String>,
    pub last_error_time: Option<f64>,
}

impl DeviceState {
    fn new(port: &str, baudrate: u32, unit_id: u8) -> Self {
        Self {
            unit_id,
            port: port.to_string(),
            baudrate,
            last_updated: epoch_seconds(),
            ..Self::default()
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            unit_id: self.unit_id,
            port: self.port.clone(),
            baudrate: self.baudrate,
            last_updated: self.last_updated,
            coils: self.coils.clone(),
            discrete_inputs: self.discrete_inputs.clone(),
            holding_registers: self.holding_registers.clone(),
            input_registers: self.input_registers.clone(),
            request_count: self.request_count,
            success_count: self.success_count,
            error_count: self.error_count,
            timeout_count: self.timeout_count,
            crc_error_count: self.crc_error_count,
            last_error: self.last_error.clone(),
            last_error_time: self.last_error_time,
        }
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Shared registry of per-unit device state. Cheap to clone; all clones see
/// the same map.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    devices: Arc<RwLock<HashMap<DeviceKey, Arc<Mutex<DeviceState>>>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the entry for `(port, unit)`.
    fn entry(&self, port: &str, baudrate: u32, unit: u8) -> Arc<Mutex<DeviceState>> {
        if let Some(entry) = self.devices.read().get(&(port.to_string(), unit)) {
            return Arc::clone(entry);
        }
        let mut devices = self.devices.write();
        Arc::clone(
            devices
                .entry((port.to_string(), unit))
                .or_insert_with(|| Arc::new(Mutex::new(DeviceState::new(port, baudrate, unit)))),
        )
    }

    pub fn record_request(&self, port: &str, baudrate: u32, unit: u8) {
        self.entry(port, baudrate, unit).lock().request_count += 1;
    }

    pub fn record_success(&self, port: &str, baudrate: u32, unit: u8) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        state.success_count += 1;
        state.last_updated = epoch_seconds();
    }

    /// A frame accepted past a failed standard CRC still counts against the
    /// device's checksum statistics.
    pub fn record_crc_bypass(&self, port: &str, baudrate: u32, unit: u8) {
        self.entry(port, baudrate, unit).lock().crc_error_count += 1;
    }

    pub fn record_timeout(&self, port: &str, baudrate: u32, unit: u8) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        state.timeout_count += 1;
        state.error_count += 1;
        state.last_error = Some("response timeout".to_string());
        state.last_error_time = Some(epoch_seconds());
    }

    pub fn record_error(&self, port: &str, baudrate: u32, unit: u8, message: &str) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        state.error_count += 1;
        state.last_error = Some(message.to_string());
        state.last_error_time = Some(epoch_seconds());
    }

    pub fn update_coils(&self, port: &str, baudrate: u32, unit: u8, start: u16, values: &[bool]) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        for (offset, &value) in values.iter().enumerate() {
            state.coils.insert(start + offset as u16, value);
        }
    }

    pub fn update_discrete_inputs(
        &self,
        port: &str,
        baudrate: u32,
        unit: u8,
        start: u16,
        values: &[bool],
    ) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        for (offset, &value) in values.iter().enumerate() {
            state.discrete_inputs.insert(start + offset as u16, value);
        }
    }

    pub fn update_holding_registers(
        &self,
        port: &str,
        baudrate: u32,
        unit: u8,
        start: u16,
        values: &[u16],
    ) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        for (offset, &value) in values.iter().enumerate() {
            state.holding_registers.insert(start + offset as u16, value);
        }
    }

    pub fn update_input_registers(
        &self,
        port: &str,
        baudrate: u32,
        unit: u8,
        start: u16,
        values: &[u16],
    ) {
        let entry = self.entry(port, baudrate, unit);
        let mut state = entry.lock();
        for (offset, &value) in values.iter().enumerate() {
            state.input_registers.insert(start + offset as u16, value);
        }
    }

    /// Snapshot one unit, if it has been seen.
    pub fn snapshot(&self, port: &str, unit: u8) -> Option<DeviceSnapshot> {
        let devices = self.devices.read();
        devices
            .get(&(port.to_string(), unit))
            .map(|entry| entry.lock().snapshot())
    }

    /// Snapshot every tracked unit, ordered by port then unit ID.
    pub fn snapshot_all(&self) -> Vec<DeviceSnapshot> {
        let devices = self.devices.read();
        let mut snapshots: Vec<DeviceSnapshot> =
            devices.values().map(|entry| entry.lock().snapshot()).collect();
        snapshots.sort_by(|a, b| (&a.port, a.unit_id).cmp(&(&b.port, b.unit_id)));
        snapshots
    }

    /// Drop the entry for one unit.
    pub fn reset_unit(&self, port: &str, unit: u8) {
        self.devices.write().remove(&(port.to_string(), unit));
    }

    /// Drop every entry. This is the teardown half of the global registry's
    /// lifecycle.
    pub fn reset(&self) {
        self.devices.write().clear();
    }

    /// Write all snapshots to `path` as pretty-printed JSON, overwriting
    /// any previous dump.
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot_all())
            .map_err(|err| Error::Transport(format!("failed to serialize snapshots: {err}")))?;
        let mut file = File::create(path)
            .map_err(|err| Error::Transport(format!("failed to create {}: {err}", path.display())))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| Error::Transport(format!("failed to write {}: {err}", path.display())))?;
        log::debug!("dumped {} device snapshots to {}", self.devices.read().len(), path.display());
        Ok(())
    }
}

/// Process-wide tracker, created on first use. Facades default to this
/// handle when state tracking is enabled; call [`StateTracker::reset`] on
/// it to tear the registry down.
static GLOBAL_TRACKER: Lazy<StateTracker> = Lazy::new(StateTracker::new);

pub fn global_tracker() -> &'static StateTracker {
    &GLOBAL_TRACKER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let tracker = StateTracker::new();
        tracker.record_request("/dev/ttyUSB0", 9600, 1);
        tracker.record_success("/dev/ttyUSB0", 9600, 1);
        tracker.record_request("/dev/ttyUSB0", 9600, 1);
        tracker.record_timeout("/dev/ttyUSB0", 9600, 1);

        let snapshot = tracker.snapshot("/dev/ttyUSB0", 1).unwrap();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.timeout_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("response timeout"));
        assert!(snapshot.last_error_time.is_some());
    }

    #[test]
    fn test_value_maps_are_keyed_by_address() {
        let tracker = StateTracker::new();
        tracker.update_coils("/dev/ttyUSB0", 9600, 1, 4, &[true, false, true]);
        tracker.update_holding_registers("/dev/ttyUSB0", 9600, 1, 0x10, &[7, 8]);

        let snapshot = tracker.snapshot("/dev/ttyUSB0", 1).unwrap();
        assert_eq!(snapshot.coils.get(&4), Some(&true));
        assert_eq!(snapshot.coils.get(&5), Some(&false));
        assert_eq!(snapshot.coils.get(&6), Some(&true));
        assert_eq!(snapshot.holding_registers.get(&0x10), Some(&7));
        assert_eq!(snapshot.holding_registers.get(&0x11), Some(&8));
    }

    #[test]
    fn test_units_are_tracked_separately() {
        let tracker = StateTracker::new();
        tracker.record_request("/dev/ttyUSB0", 9600, 1);
        tracker.record_request("/dev/ttyUSB0", 9600, 2);
        tracker.record_request("/dev/ttyUSB1", 9600, 1);

        assert_eq!(tracker.snapshot_all().len(), 3);
        assert_eq!(
            tracker.snapshot("/dev/ttyUSB0", 2).unwrap().request_count,
            1
        );
        tracker.reset_unit("/dev/ttyUSB0", 2);
        assert!(tracker.snapshot("/dev/ttyUSB0", 2).is_none());
        tracker.reset();
        assert!(tracker.snapshot_all().is_empty());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let tracker = StateTracker::new();
        tracker.record_request("/dev/ttyACM0", 57600, 3);
        tracker.record_success("/dev/ttyACM0", 57600, 3);
        tracker.update_coils("/dev/ttyACM0", 57600, 3, 0, &[true]);

        let snapshot = tracker.snapshot("/dev/ttyACM0", 3).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["unit_id"], 3);
        assert_eq!(json["port"], "/dev/ttyACM0");
        assert_eq!(json["baudrate"], 57600);
        assert_eq!(json["coils"]["0"], true);
        assert_eq!(json["request_count"], 1);
        assert_eq!(json["success_count"], 1);
        assert_eq!(json["last_error"], serde_json::Value::Null);
        assert!(json["last_updated"].is_f64());
    }
}
