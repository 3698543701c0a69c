mod common;

use std::time::Duration;

use bleio_host::mock::{MockCapture, MockRadio};
use bleio_host::{Adapter, AdapterConfig, AdvertisingConfig, Error};

use common::{adapter, address, wait_for};

const PAYLOAD: &[u8] = &[0x02, 0x01, 0x06, 0x05, 0x09, b'h', b'o', b's', b't'];

#[test]
fn advertise_and_stop() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    adapter
        .start_advertising(
            AdvertisingConfig::new(PAYLOAD)
                .scan_response(&[0x02, 0x0a, 0x00])
                .connectable(false)
                .interval(Duration::from_millis(500)),
        )
        .unwrap();
    assert!(adapter.advertising());

    let parameters = radio.advertising().unwrap();
    assert_eq!(parameters.data, PAYLOAD);
    assert_eq!(parameters.scan_response.as_deref(), Some(&[0x02, 0x0a, 0x00][..]));
    assert!(!parameters.connectable);
    assert!(!parameters.anonymous);
    assert_eq!(parameters.interval, Duration::from_millis(500));

    adapter.stop_advertising().unwrap();
    assert!(!adapter.advertising());
    assert!(radio.advertising().is_none());
    // Nothing to stop
    adapter.stop_advertising().unwrap();
}

#[test]
fn second_advertisement_is_refused() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    adapter.start_advertising(AdvertisingConfig::new(PAYLOAD)).unwrap();
    assert!(matches!(
        adapter.start_advertising(AdvertisingConfig::new(PAYLOAD)),
        Err(Error::Capability(_))
    ));
}

#[test]
fn oversized_payloads_and_bad_intervals_are_rejected() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    assert!(matches!(
        adapter.start_advertising(AdvertisingConfig::new(&[0u8; 32])),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        adapter.start_advertising(
            AdvertisingConfig::new(PAYLOAD).interval(Duration::from_secs(11))
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(!adapter.advertising());
}

#[test]
fn advertising_stops_after_its_timeout() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    adapter
        .start_advertising(AdvertisingConfig::new(PAYLOAD).timeout(Duration::from_millis(50)))
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || !adapter.advertising()));
    assert!(wait_for(Duration::from_secs(2), || radio.advertising().is_none()));

    // A later advertisement is not cut short by the old timer
    adapter
        .start_advertising(AdvertisingConfig::new(PAYLOAD).timeout(Duration::from_millis(50)))
        .unwrap();
    adapter.stop_advertising().unwrap();
    adapter.start_advertising(AdvertisingConfig::new(PAYLOAD)).unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert!(adapter.advertising());
}

#[test]
fn disabled_adapter_does_not_advertise() {
    let radio = MockRadio::new();
    let capture = MockCapture::unavailable();
    let adapter = adapter(&radio, &capture);

    adapter.start_advertising(AdvertisingConfig::new(PAYLOAD)).unwrap();
    adapter.set_enabled(false).unwrap();
    assert!(!adapter.advertising());
    assert!(radio.advertising().is_none());

    assert!(matches!(
        adapter.start_advertising(AdvertisingConfig::new(PAYLOAD)),
        Err(Error::Capability(_))
    ));
}

#[test]
fn identity_comes_from_config_or_radio() {
    common::init_logger();
    let local = address("00:1a:7d:da:71:13");
    let radio = MockRadio::new().with_address(local);

    let adapter = Adapter::new(
        radio.clone(),
        MockCapture::unavailable(),
        AdapterConfig::default(),
    )
    .unwrap();
    assert_eq!(adapter.address(), Some(local));
    assert_eq!(adapter.name(), "mock");
    adapter.set_name("feather");
    assert_eq!(adapter.name(), "feather");
    assert!(matches!(adapter.erase_bonding(), Err(Error::NotSupported(_))));

    let named = Adapter::new(
        radio,
        MockCapture::unavailable(),
        AdapterConfig::default().name("sensor"),
    )
    .unwrap();
    assert_eq!(named.name(), "sensor");
    assert!(named.enabled());
}
