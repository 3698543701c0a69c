mod common;

use std::time::{Duration, Instant};

use bleio_host::common::characteristics::{BATTERY_LEVEL, DEVICE_NAME, NORDIC_UART_RX, NORDIC_UART_TX};
use bleio_host::common::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use bleio_host::common::services::{BATTERY, NORDIC_UART};
use bleio_host::mock::{MockCapture, MockPeripheral, MockRadio};
use bleio_host::radio::{Subscription, WriteType};
use bleio_host::{Attribute, ConnectionState, Error, PacketBuffer, Properties};

use common::{adapter, adapter_over, address, uart_peripheral, wait_for, DroppingRadio, Step};

const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn connect_discovers_services() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    assert!(connection.connected());
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.address(), peer);
    assert_eq!(connection.mtu().unwrap(), 64);
    assert_eq!(connection.max_packet_length().unwrap(), 61);
    assert!(adapter.connected());
    assert_eq!(adapter.connections().len(), 1);

    let services = connection.discover_attributes().unwrap();
    assert_eq!(
        services.iter().map(|service| service.uuid()).collect::<Vec<_>>(),
        vec![NORDIC_UART, BATTERY]
    );
    assert!(services.iter().all(|service| service.is_primary() && service.remote()));

    let uart = connection.service(NORDIC_UART).unwrap();
    let characteristics = uart.characteristics().unwrap();
    assert_eq!(characteristics.len(), 2);
    assert_eq!(characteristics[0].uuid(), NORDIC_UART_TX);
    assert_eq!(characteristics[0].properties(), Properties::NOTIFY);
    assert_eq!(characteristics[0].read_permission(), Attribute::Open);
    assert_eq!(characteristics[1].service().unwrap().uuid(), NORDIC_UART);

    let only_battery = connection
        .discover_remote_services(Some(&[BATTERY]))
        .unwrap();
    assert_eq!(only_battery.len(), 1);

    assert!(matches!(
        connection.characteristic(DEVICE_NAME),
        Err(Error::AttributeNotFound(uuid)) if uuid == DEVICE_NAME
    ));
    assert!(matches!(
        uart.characteristic(NORDIC_UART_TX, 1),
        Err(Error::AttributeNotFound(_))
    ));
}

#[test]
fn connecting_twice_reuses_the_link() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    let first = adapter.connect(peer, TIMEOUT).unwrap();
    let second = adapter.connect(peer, TIMEOUT).unwrap();
    assert_eq!(adapter.connections().len(), 1);

    second.disconnect().unwrap();
    assert!(!first.connected());
}

#[test]
fn characteristics_sharing_a_uuid_stay_distinct() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:03");
    let peripheral = MockPeripheral::new(peer)
        .service(BATTERY, &[(BATTERY_LEVEL, Properties::READ | Properties::NOTIFY)])
        .service(
            BATTERY,
            &[
                (BATTERY_LEVEL, Properties::NOTIFY),
                (BATTERY_LEVEL, Properties::INDICATE),
            ],
        );
    let handles = peripheral.handles(BATTERY_LEVEL);
    assert_eq!(handles.len(), 3);
    radio.add_peripheral(peripheral);

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    let all = connection.characteristics_with_uuid(BATTERY_LEVEL).unwrap();
    assert_eq!(
        all.iter().map(|c| c.properties()).collect::<Vec<_>>(),
        vec![
            Properties::READ | Properties::NOTIFY,
            Properties::NOTIFY,
            Properties::INDICATE
        ]
    );
    assert_eq!(
        connection.characteristic(BATTERY_LEVEL).unwrap().properties(),
        Properties::READ | Properties::NOTIFY
    );

    let services = connection.discover_attributes().unwrap();
    assert_eq!(services.len(), 2);
    let second = &services[1];
    assert_eq!(
        second.characteristic(BATTERY_LEVEL, 0).unwrap().properties(),
        Properties::NOTIFY
    );
    let indicating = second.characteristic(BATTERY_LEVEL, 1).unwrap();
    assert_eq!(indicating.properties(), Properties::INDICATE);
    assert!(matches!(
        second.characteristic(BATTERY_LEVEL, 2),
        Err(Error::AttributeNotFound(_))
    ));

    let first = PacketBuffer::new(&all[0], 4).unwrap();
    let last = PacketBuffer::new(&indicating, 4).unwrap();
    assert!(radio.notify_handle(peer, handles[2], &[42]));
    assert!(radio.notify_handle(peer, handles[0], &[7]));
    // Nobody subscribed to the middle one
    assert!(!radio.notify_handle(peer, handles[1], &[99]));

    assert!(wait_for(TIMEOUT, || {
        first.packets_waiting() == 1 && last.packets_waiting() == 1
    }));
    let mut packet = [0u8; 4];
    assert_eq!(last.readinto(&mut packet).unwrap(), 1);
    assert_eq!(packet[0], 42);
    assert_eq!(first.readinto(&mut packet).unwrap(), 1);
    assert_eq!(packet[0], 7);
    assert!(all[1].value().unwrap().is_empty());
}

#[test]
fn read_write_and_descriptors() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));
    let connection = adapter.connect(peer, TIMEOUT).unwrap();

    let battery = connection.characteristic(BATTERY_LEVEL).unwrap();
    assert!(battery.value().unwrap().is_empty());
    assert_eq!(battery.read().unwrap(), vec![87]);
    assert_eq!(battery.value().unwrap(), vec![87]);

    let rx = connection.characteristic(NORDIC_UART_RX).unwrap();
    rx.write(b"hi", true).unwrap();
    rx.write(b"yo", false).unwrap();
    let writes = radio.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].write_type, WriteType::WithResponse);
    assert_eq!(writes[1].write_type, WriteType::WithoutResponse);
    assert_eq!(radio.value(peer, NORDIC_UART_RX).unwrap(), b"yo");

    let cccd = battery.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION).unwrap();
    assert_eq!(cccd.characteristic().uuid(), BATTERY_LEVEL);
    battery.set_notify(true).unwrap();
    assert_eq!(radio.subscription(peer, BATTERY_LEVEL), Subscription::Notify);
    assert_eq!(cccd.value().unwrap(), vec![0x01, 0x00]);
    battery.set_cccd(false, false).unwrap();
    assert_eq!(radio.subscription(peer, BATTERY_LEVEL), Subscription::Off);

    cccd.write(&[0x02, 0x00]).unwrap();
    assert_eq!(cccd.read().unwrap(), vec![0x02, 0x00]);

    assert!(rx.descriptors().unwrap().is_empty());
    assert!(matches!(rx.set_notify(true), Err(Error::InvalidArgument(_))));
}

#[test]
fn indicate_only_characteristic_uses_indications() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:02");
    radio.add_peripheral(
        MockPeripheral::new(peer).service(BATTERY, &[(BATTERY_LEVEL, Properties::INDICATE)]),
    );

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    let battery = connection.characteristic(BATTERY_LEVEL).unwrap();
    battery.set_notify(true).unwrap();
    assert_eq!(radio.subscription(peer, BATTERY_LEVEL), Subscription::Indicate);
}

#[test]
fn operations_after_disconnect_fail_fast() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    let battery = connection.characteristic(BATTERY_LEVEL).unwrap();
    let cccd = battery.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION).unwrap();
    let service = connection.service(BATTERY).unwrap();

    connection.disconnect().unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!radio.is_connected(peer));
    // Idempotent
    connection.disconnect().unwrap();

    let start = Instant::now();
    assert!(matches!(battery.read(), Err(Error::NotConnected)));
    assert!(matches!(battery.write(&[1], true), Err(Error::NotConnected)));
    assert!(matches!(battery.set_notify(true), Err(Error::NotConnected)));
    assert!(matches!(cccd.read(), Err(Error::NotConnected)));
    assert!(matches!(service.characteristics(), Err(Error::NotConnected)));
    assert!(matches!(connection.rssi(), Err(Error::NotConnected)));
    assert!(matches!(connection.mtu(), Err(Error::NotConnected)));
    assert!(matches!(connection.discover_attributes(), Err(Error::NotConnected)));
    assert!(start.elapsed() < Duration::from_millis(500));

    assert!(!adapter.connected());
    assert!(adapter.connections().is_empty());
}

#[test]
fn remote_disconnect_is_noticed() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    assert!(radio.drop_link(peer));

    assert!(wait_for(TIMEOUT, || !connection.connected()));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(matches!(
        connection.characteristic(BATTERY_LEVEL),
        Err(Error::NotConnected)
    ));

    // A fresh connection replaces the dead one
    let again = adapter.connect(peer, TIMEOUT).unwrap();
    assert!(again.connected());
    assert!(!connection.connected());
}

#[test]
fn link_lost_during_discovery_fails_the_connect() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter_over(DroppingRadio::new(radio.clone(), Step::Discover), &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    assert!(matches!(adapter.connect(peer, TIMEOUT), Err(Error::Connection(_))));
    assert!(!radio.is_connected(peer));
    assert!(!adapter.connected());
    assert!(adapter.connections().is_empty());

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    assert!(connection.connected());
    assert!(radio.is_connected(peer));
}

#[test]
fn connect_to_silent_address_times_out() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let silent = address("c0:ff:ee:00:00:09");
    radio.add_peripheral(uart_peripheral(silent).unresponsive());

    let start = Instant::now();
    let result = adapter.connect(silent, Duration::from_secs(1));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::Connection(_))));
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    assert!(!adapter.connected());

    // Unknown addresses behave the same
    assert!(matches!(
        adapter.connect(address("c0:ff:ee:00:00:0f"), Duration::from_millis(100)),
        Err(Error::Connection(_))
    ));
}

#[test]
fn rssi_and_pairing() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer).rssi(-61));

    let connection = adapter.connect(peer, TIMEOUT).unwrap();
    assert_eq!(connection.rssi().unwrap(), -61);
    assert!(!connection.paired());
    connection.pair(true).unwrap();
    assert!(connection.paired());
}

#[test]
fn dropping_the_adapter_disconnects_everything() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let first = address("c0:ff:ee:00:00:01");
    let second = address("c0:ff:ee:00:00:02");
    radio.add_peripheral(uart_peripheral(first));
    radio.add_peripheral(uart_peripheral(second));

    let connection = adapter.connect(first, TIMEOUT).unwrap();
    adapter.connect(second, TIMEOUT).unwrap();
    assert!(radio.is_connected(first) && radio.is_connected(second));

    drop(adapter);

    assert!(!radio.is_connected(first));
    assert!(!radio.is_connected(second));
    assert!(!connection.connected());
    assert!(matches!(
        connection.characteristic(NORDIC_UART_TX),
        Err(Error::NotConnected)
    ));
}

#[test]
fn disabled_adapter_refuses_work() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);
    let peer = address("c0:ff:ee:00:00:01");
    radio.add_peripheral(uart_peripheral(peer));

    let results = adapter
        .start_scan(bleio_host::ScanConfig::default())
        .unwrap();
    adapter.set_enabled(false).unwrap();
    assert!(!adapter.enabled());
    assert!(!radio.is_powered());
    assert!(!radio.is_scanning());
    assert!(!results.is_active());

    assert!(matches!(adapter.connect(peer, TIMEOUT), Err(Error::Capability(_))));
    assert!(matches!(
        adapter.start_scan(bleio_host::ScanConfig::default()),
        Err(Error::Capability(_))
    ));

    adapter.set_enabled(true).unwrap();
    assert!(radio.is_powered());
    adapter.connect(peer, TIMEOUT).unwrap();
}
