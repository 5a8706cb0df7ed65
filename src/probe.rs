//! Auto-detection: sweep ports × baud rates × unit IDs until something
//! answers.
//!
//! The probe operation is the cheapest well-formed request on the bus, a
//! single-coil read at address 0. Anything that parses as a normal
//! response marks the combination as live. Ports are never left open:
//! every candidate client is closed before the sweep moves on, success or
//! not.

use serde::Serialize;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::transport::serial::{available_ports, SerialPortLink};
use crate::transport::SerialLink;

/// Baud rates tried during detection, fastest first so a healthy modern
/// device is found quickly.
pub const PROBE_BAUD_RATES: &[u32] = &[115200, 57600, 38400, 19200, 9600];

/// Unit IDs tried during detection. 0 is the broadcast address; a few
/// devices answer on it when their configured ID was lost.
pub const PROBE_UNIT_IDS: &[u8] = &[1, 2, 3, 0];

/// A working `(port, baud, unit)` combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedDevice {
    pub port: String,
    pub baudrate: u32,
    pub unit_id: u8,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Ports to sweep; `None` enumerates whatever the platform reports.
    pub ports: Option<Vec<String>>,
    pub baud_rates: Vec<u32>,
    pub unit_ids: Vec<u8>,
    /// Per-attempt deadline for the probe read. Detection sweeps a large
    /// cross product, so this is much shorter than an operational timeout.
    pub timeout_seconds: f32,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            ports: None,
            baud_rates: PROBE_BAUD_RATES.to_vec(),
            unit_ids: PROBE_UNIT_IDS.to_vec(),
            timeout_seconds: 0.5,
        }
    }
}

impl ProbeOptions {
    fn client_config(&self, port: &str, baudrate: u32) -> ClientConfig {
        ClientConfig {
            baudrate,
            timeout_seconds: self.timeout_seconds,
            retries: 0,
            state_tracking: false,
            ..ClientConfig::new(port, baudrate)
        }
    }
}

/// Sweep real serial ports and return the first working configuration.
pub fn auto_detect(options: &ProbeOptions) -> Option<DetectedDevice> {
    detect_with(options, |_, _| Box::new(SerialPortLink::new()))
}

/// Sweep with caller-supplied links (virtual ports, test doubles). The
/// factory is called once per `(port, baud)` candidate.
pub fn detect_with<F>(options: &ProbeOptions, mut make_link: F) -> Option<DetectedDevice>
where
    F: FnMut(&str, u32) -> Box<dyn SerialLink>,
{
    let ports = resolve_ports(options)?;
    for port in &ports {
        for &baudrate in &options.baud_rates {
            let found = probe_port(options, port, baudrate, make_link(port, baudrate), true);
            if let Some(first) = found.and_then(|hits| hits.into_iter().next()) {
                return Some(first);
            }
        }
    }
    log::info!("no Modbus device answered on any probed combination");
    None
}

/// Sweep every port and collect all responsive combinations. Each port
/// stops at its first responsive baud rate but still tries every unit ID
/// there.
pub fn scan_all<F>(options: &ProbeOptions, mut make_link: F) -> Vec<DetectedDevice>
where
    F: FnMut(&str, u32) -> Box<dyn SerialLink>,
{
    let Some(ports) = resolve_ports(options) else {
        return Vec::new();
    };
    let mut detected = Vec::new();
    for port in &ports {
        for &baudrate in &options.baud_rates {
            if let Some(found) =
                probe_port(options, port, baudrate, make_link(port, baudrate), false)
            {
                let answered = !found.is_empty();
                detected.extend(found);
                if answered {
                    break;
                }
            }
        }
    }
    log::info!("scan finished with {} responsive combinations", detected.len());
    detected
}

fn resolve_ports(options: &ProbeOptions) -> Option<Vec<String>> {
    let ports = match &options.ports {
        Some(ports) => ports.clone(),
        None => available_ports(),
    };
    if ports.is_empty() {
        log::warn!("no serial ports to probe");
        return None;
    }
    Some(ports)
}

/// Try every unit ID on one `(port, baud)` candidate. Returns `None` when
/// the port could not even be opened, otherwise the hits found there (all
/// of them, or just the first when `stop_at_first`).
fn probe_port(
    options: &ProbeOptions,
    port: &str,
    baudrate: u32,
    link: Box<dyn SerialLink>,
    stop_at_first: bool,
) -> Option<Vec<DetectedDevice>> {
    let config = options.client_config(port, baudrate);
    let client = match Client::with_link(config, link) {
        Ok(client) => client,
        Err(err) => {
            log::warn!("skipping {port} at {baudrate} baud: {err}");
            return None;
        }
    };
    if let Err(err) = client.open() {
        log::debug!("could not open {port} at {baudrate} baud: {err}");
        return None;
    }

    let mut hits = Vec::new();
    for &unit_id in &options.unit_ids {
        match client.read_coils(Some(unit_id), 0, 1) {
            Ok(_) => {
                log::info!("device found on {port} at {baudrate} baud, unit {unit_id}");
                hits.push(DetectedDevice {
                    port: port.to_string(),
                    baudrate,
                    unit_id,
                });
                if stop_at_first {
                    break;
                }
            }
            Err(err) => {
                log::debug!("no answer on {port} at {baudrate} baud, unit {unit_id}: {err}");
            }
        }
    }
    client.close();
    Some(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sweep_order() {
        let options = ProbeOptions::default();
        assert_eq!(options.baud_rates.first(), Some(&115200));
        assert_eq!(options.baud_rates.last(), Some(&9600));
        assert_eq!(options.unit_ids, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_probe_config_is_single_attempt() {
        let options = ProbeOptions::default();
        let config = options.client_config("/dev/ttyUSB0", 19200);
        assert_eq!(config.retries, 0);
        assert!(!config.state_tracking);
        assert_eq!(config.baudrate, 19200);
    }
}
