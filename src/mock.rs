//! Scripted in-process radio and capture source.
//!
//! [`MockRadio`] and [`MockCapture`] stand in for the host stack in tests and
//! demos. Both are cheap clonable handles: give one clone to the
//! [`Adapter`](crate::Adapter) and keep another to drive the scenario.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::capture::{CaptureSource, LineStream, EVT_LE_ADVERTISING_REPORT, EVT_LE_META_EVENT};
use crate::common::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use crate::radio::{
    AdvertisingParameters, EventStream, Handle, Radio, RadioEvent, RadioEventKind,
    RemoteCharacteristic, RemoteDescriptor, RemoteService, ScanParameters, Subscription,
    WriteType,
};
use crate::util::lock;
use crate::{Address, AddressType, Error, Properties, Result};

/// A remote device known to [`MockRadio`].
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    address: Address,
    services: Vec<RemoteService>,
    values: HashMap<Handle, Vec<u8>>,
    responsive: bool,
    mtu: u16,
    rssi: i16,
    next_handle: Handle,
}

impl MockPeripheral {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            services: Vec::new(),
            values: HashMap::new(),
            responsive: true,
            mtu: 23,
            rssi: -55,
            next_handle: 0,
        }
    }

    /// Never answers connection attempts.
    pub fn unresponsive(mut self) -> Self {
        self.responsive = false;
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Adds a primary service. Characteristics that notify or indicate get a
    /// client configuration descriptor.
    pub fn service(mut self, uuid: Uuid, characteristics: &[(Uuid, Properties)]) -> Self {
        let handle = self.allocate();
        let mut service = RemoteService {
            uuid,
            primary: true,
            handle,
            characteristics: Vec::new(),
        };

        for (uuid, properties) in characteristics {
            let mut characteristic = RemoteCharacteristic {
                uuid: *uuid,
                handle: self.allocate(),
                properties: *properties,
                descriptors: Vec::new(),
            };
            if properties.can_notify() {
                characteristic.descriptors.push(RemoteDescriptor {
                    uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                    handle: self.allocate(),
                });
            }
            service.characteristics.push(characteristic);
        }

        self.services.push(service);
        self
    }

    /// Sets the value of the first characteristic with `uuid`.
    pub fn value(mut self, uuid: Uuid, value: &[u8]) -> Self {
        if let Some(handle) = self.handle_of(uuid) {
            self.values.insert(handle, value.to_vec());
        }
        self
    }

    fn allocate(&mut self) -> Handle {
        self.next_handle += 1;
        self.next_handle
    }

    /// Handles of every characteristic with `uuid`, in declaration order.
    pub fn handles(&self, uuid: Uuid) -> Vec<Handle> {
        self.services
            .iter()
            .flat_map(|service| &service.characteristics)
            .filter(|characteristic| characteristic.uuid == uuid)
            .map(|characteristic| characteristic.handle)
            .collect()
    }

    fn handle_of(&self, uuid: Uuid) -> Option<Handle> {
        self.handles(uuid).first().copied()
    }

    fn has_handle(&self, handle: Handle) -> bool {
        self.services.iter().any(|service| {
            service.characteristics.iter().any(|characteristic| {
                characteristic.handle == handle
                    || characteristic.descriptors.iter().any(|d| d.handle == handle)
            })
        })
    }
}

/// A write observed by [`MockRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub address: Address,
    pub handle: Handle,
    pub value: Vec<u8>,
    pub write_type: WriteType,
}

#[derive(Default)]
struct MockState {
    local_address: Option<Address>,
    powered: bool,
    scan: Option<ScanParameters>,
    advertising: Option<AdvertisingParameters>,
    peripherals: HashMap<[u8; 6], MockPeripheral>,
    links: HashSet<[u8; 6]>,
    subscriptions: HashMap<([u8; 6], Handle), Subscription>,
    paired: HashSet<[u8; 6]>,
    writes: Vec<MockWrite>,
    subscribers: Vec<mpsc::UnboundedSender<RadioEvent>>,
}

impl MockState {
    fn emit(&mut self, event: RadioEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn linked(&mut self, address: Address) -> Result<&mut MockPeripheral> {
        if !self.links.contains(&address.bytes()) {
            return Err(Error::NotConnected);
        }
        self.peripherals
            .get_mut(&address.bytes())
            .ok_or(Error::NotConnected)
    }
}

/// Scripted [`Radio`].
#[derive(Clone)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockRadio {
    fn default() -> Self {
        MockRadio::new()
    }
}

impl MockRadio {
    pub fn new() -> Self {
        let state = MockState {
            powered: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Reports `address` as the local controller address.
    pub fn with_address(self, address: Address) -> Self {
        lock(&self.state).local_address = Some(address);
        self
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        lock(&self.state)
            .peripherals
            .insert(peripheral.address.bytes(), peripheral);
    }

    /// Emits a connectable advertisement if a scan is running. Returns whether
    /// it was emitted.
    pub fn advertise(&self, address: Address, payload: &[u8], rssi: i16) -> bool {
        self.emit_advertisement(address, payload, rssi, true, false)
    }

    pub fn scan_response(&self, address: Address, payload: &[u8], rssi: i16) -> bool {
        self.emit_advertisement(address, payload, rssi, false, true)
    }

    fn emit_advertisement(
        &self,
        address: Address,
        payload: &[u8],
        rssi: i16,
        connectable: bool,
        scan_response: bool,
    ) -> bool {
        let mut state = lock(&self.state);
        if state.scan.is_none() {
            return false;
        }
        state.emit(RadioEvent::new(
            address,
            RadioEventKind::Advertisement {
                payload: payload.to_vec(),
                rssi,
                connectable,
                scan_response,
            },
        ));
        true
    }

    /// Sends a notification from the first characteristic with `uuid`, if the
    /// link is up and the client subscribed.
    pub fn notify(&self, address: Address, uuid: Uuid, value: &[u8]) -> bool {
        let handle = lock(&self.state)
            .peripherals
            .get(&address.bytes())
            .and_then(|peripheral| peripheral.handle_of(uuid));
        match handle {
            Some(handle) => self.notify_handle(address, handle, value),
            None => false,
        }
    }

    pub fn notify_handle(&self, address: Address, handle: Handle, value: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let subscribed = state.links.contains(&address.bytes())
            && state
                .subscriptions
                .get(&(address.bytes(), handle))
                .map_or(false, |mode| *mode != Subscription::Off);
        if !subscribed {
            return false;
        }
        state.emit(RadioEvent::new(
            address,
            RadioEventKind::Notification {
                handle,
                value: value.to_vec(),
            },
        ));
        true
    }

    /// Drops the link from the remote side.
    pub fn drop_link(&self, address: Address) -> bool {
        let mut state = lock(&self.state);
        if !state.links.remove(&address.bytes()) {
            return false;
        }
        state.emit(RadioEvent::new(address, RadioEventKind::Disconnected));
        true
    }

    pub fn is_connected(&self, address: Address) -> bool {
        lock(&self.state).links.contains(&address.bytes())
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan.is_some()
    }

    pub fn scan_parameters(&self) -> Option<ScanParameters> {
        lock(&self.state).scan.clone()
    }

    pub fn advertising(&self) -> Option<AdvertisingParameters> {
        lock(&self.state).advertising.clone()
    }

    pub fn is_powered(&self) -> bool {
        lock(&self.state).powered
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        lock(&self.state).writes.clone()
    }

    /// Current value of the first characteristic with `uuid`.
    pub fn value(&self, address: Address, uuid: Uuid) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        let peripheral = state.peripherals.get(&address.bytes())?;
        let handle = peripheral.handle_of(uuid)?;
        peripheral.values.get(&handle).cloned()
    }

    pub fn subscription(&self, address: Address, uuid: Uuid) -> Subscription {
        let state = lock(&self.state);
        state
            .peripherals
            .get(&address.bytes())
            .and_then(|peripheral| peripheral.handle_of(uuid))
            .and_then(|handle| state.subscriptions.get(&(address.bytes(), handle)).copied())
            .unwrap_or(Subscription::Off)
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn events(&self) -> Result<EventStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state).subscribers.push(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn local_address(&self) -> Option<Address> {
        lock(&self.state).local_address
    }

    async fn local_name(&self) -> Option<String> {
        Some("mock".to_string())
    }

    async fn set_powered(&self, powered: bool) -> Result<()> {
        lock(&self.state).powered = powered;
        Ok(())
    }

    async fn start_scan(&self, parameters: &ScanParameters) -> Result<()> {
        lock(&self.state).scan = Some(parameters.clone());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        lock(&self.state).scan = None;
        Ok(())
    }

    async fn start_advertising(&self, parameters: &AdvertisingParameters) -> Result<()> {
        lock(&self.state).advertising = Some(parameters.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        lock(&self.state).advertising = None;
        Ok(())
    }

    async fn connect(&self, address: Address) -> Result<()> {
        let responsive = {
            let mut state = lock(&self.state);
            let responsive = state
                .peripherals
                .get(&address.bytes())
                .map_or(false, |peripheral| peripheral.responsive);
            if responsive {
                state.links.insert(address.bytes());
                state.emit(RadioEvent::new(address, RadioEventKind::Connected));
            }
            responsive
        };

        if !responsive {
            // Nobody answers; the caller's timeout ends the attempt.
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self, address: Address) -> Result<()> {
        let mut state = lock(&self.state);
        if state.links.remove(&address.bytes()) {
            state.emit(RadioEvent::new(address, RadioEventKind::Disconnected));
        }
        Ok(())
    }

    async fn discover(&self, address: Address) -> Result<Vec<RemoteService>> {
        let mut state = lock(&self.state);
        Ok(state.linked(address)?.services.clone())
    }

    async fn mtu(&self, address: Address) -> Result<u16> {
        let mut state = lock(&self.state);
        Ok(state.linked(address)?.mtu)
    }

    async fn rssi(&self, address: Address) -> Result<i16> {
        let mut state = lock(&self.state);
        Ok(state.linked(address)?.rssi)
    }

    async fn pair(&self, address: Address, _bond: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.linked(address)?;
        state.paired.insert(address.bytes());
        Ok(())
    }

    async fn read(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        let peripheral = state.linked(address)?;
        if !peripheral.has_handle(handle) {
            return Err(Error::InvalidArgument(format!("no attribute at handle {}", handle)));
        }
        Ok(peripheral.values.get(&handle).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let peripheral = state.linked(address)?;
        if !peripheral.has_handle(handle) {
            return Err(Error::InvalidArgument(format!("no attribute at handle {}", handle)));
        }
        peripheral.values.insert(handle, value.to_vec());
        state.writes.push(MockWrite {
            address,
            handle,
            value: value.to_vec(),
            write_type,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        address: Address,
        handle: Handle,
        mode: Subscription,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.linked(address)?;
        state.subscriptions.insert((address.bytes(), handle), mode);
        Ok(())
    }

    async fn read_descriptor(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        self.read(address, handle).await
    }

    async fn write_descriptor(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let peripheral = state.linked(address)?;
        if !peripheral.has_handle(handle) {
            return Err(Error::InvalidArgument(format!("no attribute at handle {}", handle)));
        }
        peripheral.values.insert(handle, value.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct CaptureState {
    available: bool,
    probes: usize,
    feed: Option<mpsc::UnboundedSender<io::Result<String>>>,
}

/// Scripted [`CaptureSource`] producing `hcidump --raw` style lines.
#[derive(Clone, Default)]
pub struct MockCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl MockCapture {
    /// A capture source the host grants access to.
    pub fn available() -> Self {
        let capture = Self::default();
        lock(&capture.state).available = true;
        capture
    }

    /// A capture source that fails its probe.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn probe_count(&self) -> usize {
        lock(&self.state).probes
    }

    /// Whether a capture stream is open and still read.
    pub fn is_open(&self) -> bool {
        lock(&self.state)
            .feed
            .as_ref()
            .map_or(false, |feed| !feed.is_closed())
    }

    /// Feeds one raw line. Returns whether a capture stream took it.
    pub fn push_line(&self, line: impl Into<String>) -> bool {
        lock(&self.state)
            .feed
            .as_ref()
            .map_or(false, |feed| feed.send(Ok(line.into())).is_ok())
    }

    /// Feeds a connectable undirected advertising report.
    pub fn advertise(&self, address: Address, payload: &[u8], rssi: i16) -> bool {
        self.report(0x00, address, payload, rssi)
    }

    pub fn scan_response(&self, address: Address, payload: &[u8], rssi: i16) -> bool {
        self.report(0x04, address, payload, rssi)
    }

    /// Feeds a legacy advertising report with the given event type.
    pub fn report(&self, event_type: u8, address: Address, payload: &[u8], rssi: i16) -> bool {
        hcidump_lines(event_type, address, payload, rssi)
            .into_iter()
            .all(|line| self.push_line(line))
    }

    /// Breaks the open capture stream with a read error.
    pub fn fail(&self, message: &str) -> bool {
        let error = io::Error::new(io::ErrorKind::Other, message.to_string());
        lock(&self.state)
            .feed
            .take()
            .map_or(false, |feed| feed.send(Err(error)).is_ok())
    }

    /// Ends the open capture stream as if the tool exited.
    pub fn close(&self) {
        lock(&self.state).feed.take();
    }
}

#[async_trait]
impl CaptureSource for MockCapture {
    async fn probe(&self) -> bool {
        let mut state = lock(&self.state);
        state.probes += 1;
        state.available
    }

    async fn open(&self) -> Result<LineStream> {
        let mut state = lock(&self.state);
        if !state.available {
            return Err(Error::Capability("capture is not permitted".to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.feed = Some(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}

/// Formats a legacy LE advertising report the way `hcidump --raw` prints it:
/// twenty bytes per line, continuation lines indented.
pub fn hcidump_lines(event_type: u8, address: Address, payload: &[u8], rssi: i16) -> Vec<String> {
    let kind = match address.kind() {
        AddressType::Public => 0x00,
        _ => 0x01,
    };

    let mut parameters = vec![EVT_LE_ADVERTISING_REPORT, 0x01, event_type, kind];
    parameters.extend_from_slice(&address.bytes());
    parameters.push(payload.len() as u8);
    parameters.extend_from_slice(payload);
    parameters.push(rssi as i8 as u8);

    let mut packet = vec![0x04, EVT_LE_META_EVENT, parameters.len() as u8];
    packet.extend(parameters);

    packet
        .chunks(20)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = chunk
                .iter()
                .map(|byte| format!("{:02X}", byte))
                .collect::<Vec<_>>()
                .join(" ");
            if i == 0 {
                format!("> {}", hex)
            } else {
                format!("  {}", hex)
            }
        })
        .collect()
}
