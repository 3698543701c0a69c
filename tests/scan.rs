mod common;

use std::thread;
use std::time::Duration;

use bleio_host::mock::{MockCapture, MockRadio};
use bleio_host::{AdapterConfig, Adapter, Error, ScanBackend, ScanConfig, ScanSource};

use common::{adapter, address, wait_for};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

#[test]
fn daemon_source_suppresses_repeated_payloads() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");
    let b = address("c0:ff:ee:00:00:0b");

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    assert_eq!(results.source(), ScanSource::Daemon);
    assert!(radio.is_scanning());

    assert!(radio.advertise(a, &[0x02, 0x01, 0x06], -50));
    assert!(radio.advertise(a, &[0x02, 0x01, 0x06], -51));
    assert!(radio.advertise(b, &[0x02, 0x01, 0x04], -60));

    let first = results.next_timeout(WAIT).unwrap();
    assert_eq!(first.address(), a);
    assert_eq!(first.rssi(), -50);
    let second = results.next_timeout(WAIT).unwrap();
    assert_eq!(second.address(), b);
    assert!(results.next_timeout(QUIET).is_none());

    // A changed payload is new information
    assert!(radio.advertise(a, &[0x02, 0x01, 0x05], -50));
    assert_eq!(results.next_timeout(WAIT).unwrap().advertisement_bytes(), &[0x02, 0x01, 0x05]);
}

#[test]
fn raw_capture_keeps_every_advertisement_in_order() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");
    let p1 = [0x02, 0x01, 0x06];
    let p2 = [0x03, 0xff, 0x22, 0x08];

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    assert_eq!(results.source(), ScanSource::Capture);
    assert!(!radio.is_scanning());

    assert!(capture.advertise(a, &p1, -40));
    assert!(capture.advertise(a, &p2, -41));
    assert!(capture.advertise(a, &p1, -42));

    let entries = (0..3)
        .map(|_| results.next_timeout(WAIT).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(entries[0].advertisement_bytes(), &p1);
    assert_eq!(entries[1].advertisement_bytes(), &p2);
    assert_eq!(entries[2].advertisement_bytes(), &p1);
    assert_eq!(
        entries.iter().map(|entry| entry.rssi()).collect::<Vec<_>>(),
        vec![-40, -41, -42]
    );
    assert!(entries.iter().all(|entry| entry.address() == a));
    assert!(results.next_timeout(QUIET).is_none());
}

#[test]
fn capture_reports_scan_responses_and_connectability() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    capture.report(0x03, a, &[0x02, 0x01, 0x04], -40);
    capture.scan_response(a, &[0x04, 0x09, b'B', b'L', b'E'], -40);

    let advertisement = results.next_timeout(WAIT).unwrap();
    assert!(!advertisement.connectable());
    assert!(!advertisement.scan_response());
    let response = results.next_timeout(WAIT).unwrap();
    assert!(response.scan_response());
    assert_eq!(response.fields(), vec![&[0x09, b'B', b'L', b'E'][..]]);
}

#[test]
fn passive_scan_skips_scan_responses() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");

    let mut results = adapter.start_scan(ScanConfig::default().active(false)).unwrap();
    capture.scan_response(a, &[0x02, 0x01, 0x06], -40);
    capture.advertise(a, &[0x02, 0x01, 0x04], -40);

    assert!(!results.next_timeout(WAIT).unwrap().scan_response());
    assert!(results.next_timeout(QUIET).is_none());
}

#[test]
fn weak_and_unmatched_advertisements_are_filtered() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");

    let config = ScanConfig::default()
        .minimum_rssi(-70)
        .prefixes(&[0x03, 0xff, 0x22, 0x08]);
    let mut results = adapter.start_scan(config).unwrap();

    capture.advertise(a, &[0x03, 0xff, 0x22, 0x08], -90);
    capture.advertise(a, &[0x03, 0xff, 0x99, 0x99], -40);
    capture.advertise(a, &[0x02, 0x01, 0x06, 0x03, 0xff, 0x22, 0x08], -40);

    let entry = results.next_timeout(WAIT).unwrap();
    assert_eq!(entry.rssi(), -40);
    assert_eq!(entry.advertisement_bytes().len(), 7);
    assert!(results.next_timeout(QUIET).is_none());
}

#[test]
fn slow_consumer_loses_oldest_entries() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);

    let mut results = adapter
        .start_scan(ScanConfig::default().buffer_size(2))
        .unwrap();
    for i in 0..5u8 {
        capture.advertise(address(&format!("c0:ff:ee:00:00:0{}", i)), &[0x02, 0x01, i], -40);
    }

    assert!(wait_for(WAIT, || results.dropped() == 3));
    assert_eq!(results.next_timeout(WAIT).unwrap().advertisement_bytes()[2], 3);
    assert_eq!(results.next_timeout(WAIT).unwrap().advertisement_bytes()[2], 4);
}

#[test]
fn malformed_frames_are_counted_and_skipped() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    capture.push_line("> 04 3E 03 02 01 00");
    capture.push_line("> 04 3E 02 02 XX");
    capture.push_line("< 01 0C 20 02 01 00");
    capture.advertise(a, &[0x02, 0x01, 0x06], -40);

    assert_eq!(results.next_timeout(WAIT).unwrap().address(), a);
    assert_eq!(results.malformed_frames(), 2);
    assert!(results.is_active());
}

#[test]
fn truncated_frame_at_capture_end_is_counted() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    // Declares 0x2b parameter bytes but the tool exits after three
    capture.push_line("> 04 3E 2B 02 01 00");
    capture.close();

    assert!(results.next().is_none());
    assert_eq!(results.malformed_frames(), 1);
    assert!(wait_for(WAIT, || !adapter.scanning()));
}

#[test]
fn second_scan_is_refused() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    let _results = adapter.start_scan(ScanConfig::default()).unwrap();
    assert!(matches!(
        adapter.start_scan(ScanConfig::default()),
        Err(Error::Capability(_))
    ));
    assert!(adapter.scanning());
}

#[test]
fn stop_scan_wakes_a_blocked_consumer() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    let consumer = thread::spawn(move || results.next());

    thread::sleep(Duration::from_millis(50));
    adapter.stop_scan().unwrap();

    assert!(consumer.join().unwrap().is_none());
    assert!(!adapter.scanning());
    assert!(wait_for(WAIT, || !capture.is_open()));

    // The slot is free again
    adapter.start_scan(ScanConfig::default()).unwrap();
}

#[test]
fn dropping_results_stops_the_daemon_scan() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    let results = adapter.start_scan(ScanConfig::default()).unwrap();
    assert!(radio.is_scanning());
    drop(results);

    assert!(!radio.is_scanning());
    assert!(!adapter.scanning());
}

#[test]
fn scan_ends_after_its_timeout() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    let results = adapter
        .start_scan(ScanConfig::default().stop_after_timeout(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(results.count(), 0);
    assert!(wait_for(WAIT, || !radio.is_scanning()));
    assert!(!adapter.scanning());
}

#[test]
fn capture_failure_ends_the_session() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);
    let a = address("c0:ff:ee:00:00:0a");

    let mut results = adapter.start_scan(ScanConfig::default()).unwrap();
    capture.advertise(a, &[0x02, 0x01, 0x06], -40);
    assert!(results.next_timeout(WAIT).is_some());

    capture.fail("hcidump exited");
    assert!(results.next().is_none());
    assert!(!results.is_active());
    assert!(wait_for(WAIT, || !adapter.scanning()));
}

#[test]
fn capture_is_probed_once() {
    let radio = MockRadio::new();
    let capture = MockCapture::available();
    let adapter = adapter(&radio, &capture);

    for _ in 0..3 {
        let results = adapter.start_scan(ScanConfig::default()).unwrap();
        drop(results);
    }
    assert_eq!(capture.probe_count(), 1);
}

#[test]
fn backend_preference_selects_the_source() {
    common::init_logger();
    let radio = MockRadio::new();

    let daemon = Adapter::new(
        radio.clone(),
        MockCapture::available(),
        AdapterConfig::default().backend(ScanBackend::Daemon),
    )
    .unwrap();
    let results = daemon.start_scan(ScanConfig::default()).unwrap();
    assert_eq!(results.source(), ScanSource::Daemon);
    drop(results);

    let capture_only = Adapter::new(
        radio,
        MockCapture::unavailable(),
        AdapterConfig::default().backend(ScanBackend::Capture),
    )
    .unwrap();
    assert!(matches!(
        capture_only.start_scan(ScanConfig::default()),
        Err(Error::Capability(_))
    ));
}

#[test]
fn invalid_scan_parameters_are_rejected() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    let config = ScanConfig::default()
        .interval(Duration::from_millis(10))
        .window(Duration::from_millis(20));
    assert!(matches!(
        adapter.start_scan(config),
        Err(Error::InvalidArgument(_))
    ));
    assert!(!adapter.scanning());
}

#[test]
fn daemon_scan_receives_requested_parameters() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    let _results = adapter
        .start_scan(
            ScanConfig::default()
                .interval(Duration::from_millis(200))
                .window(Duration::from_millis(50))
                .active(false),
        )
        .unwrap();
    let parameters = radio.scan_parameters().unwrap();
    assert_eq!(parameters.interval, Duration::from_millis(200));
    assert_eq!(parameters.window, Duration::from_millis(50));
    assert!(!parameters.active);
}
