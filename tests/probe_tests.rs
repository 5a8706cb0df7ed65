//! Auto-detection sweep over scripted links: first-hit detection, cleanup
//! guarantees, and the collect-everything scan.

mod common;

use std::collections::HashMap;

use common::{LinkRecorder, MockLink};
use modrtu::probe::{detect_with, scan_all};
use modrtu::{DetectedDevice, ProbeOptions};

const COIL_OFF_RESPONSE: [u8; 6] = [0x01, 0x01, 0x01, 0x00, 0x51, 0x88];

fn quick_options(ports: &[&str], baud_rates: &[u32], unit_ids: &[u8]) -> ProbeOptions {
    ProbeOptions {
        ports: Some(ports.iter().map(|p| p.to_string()).collect()),
        baud_rates: baud_rates.to_vec(),
        unit_ids: unit_ids.to_vec(),
        timeout_seconds: 0.2,
    }
}

#[test]
fn test_detect_finds_the_responsive_combination() {
    // Only (9600, unit 1) answers; 115200 stays silent.
    let options = quick_options(&["/dev/pts/1"], &[115200, 9600], &[1]);
    let mut recorders: HashMap<u32, LinkRecorder> = HashMap::new();

    let found = {
        let recorders = &mut recorders;
        detect_with(&options, |_port, baud| {
            let script = if baud == 9600 {
                vec![COIL_OFF_RESPONSE.to_vec()]
            } else {
                vec![]
            };
            let (link, recorder) = MockLink::boxed(script);
            recorders.insert(baud, recorder);
            link
        })
    };

    assert_eq!(
        found,
        Some(DetectedDevice {
            port: "/dev/pts/1".to_string(),
            baudrate: 9600,
            unit_id: 1,
        })
    );

    // Exactly one failed attempt at 115200 before the hit.
    assert_eq!(recorders[&115200].write_count(), 1);
    assert_eq!(recorders[&9600].write_count(), 1);
    // No port is left open, found or not.
    assert!(!recorders[&115200].is_open());
    assert!(!recorders[&9600].is_open());
}

#[test]
fn test_detect_gives_up_after_exhausting_the_cross_product() {
    let options = quick_options(&["/dev/pts/7"], &[115200, 9600], &[1, 2]);
    let mut recorders: Vec<LinkRecorder> = Vec::new();

    let found = {
        let recorders = &mut recorders;
        detect_with(&options, |_port, _baud| {
            let (link, recorder) = MockLink::boxed(vec![]);
            recorders.push(recorder);
            link
        })
    };

    assert_eq!(found, None);
    assert_eq!(recorders.len(), 2);
    for recorder in &recorders {
        // Both unit IDs were probed on each baud rate.
        assert_eq!(recorder.write_count(), 2);
        assert!(!recorder.is_open());
    }
}

#[test]
fn test_scan_all_collects_across_ports() {
    // Port A answers at its first probed rate, port B only at the second.
    let options = quick_options(&["/dev/pts/2", "/dev/pts/3"], &[115200, 9600], &[1]);

    let devices = scan_all(&options, |port, baud| {
        let answers = matches!(
            (port, baud),
            ("/dev/pts/2", 115200) | ("/dev/pts/3", 9600)
        );
        let script = if answers {
            vec![COIL_OFF_RESPONSE.to_vec()]
        } else {
            vec![]
        };
        MockLink::boxed(script).0
    });

    assert_eq!(
        devices,
        vec![
            DetectedDevice {
                port: "/dev/pts/2".to_string(),
                baudrate: 115200,
                unit_id: 1,
            },
            DetectedDevice {
                port: "/dev/pts/3".to_string(),
                baudrate: 9600,
                unit_id: 1,
            },
        ]
    );
}
