use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Descriptor as BtleDescriptor,
    Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::{
    EventStream, Handle, Radio, RadioEvent, RadioEventKind, RemoteCharacteristic,
    RemoteDescriptor, RemoteService, ScanParameters, Subscription, WriteType,
};
use crate::common::short_uuid;
use crate::scan_entry::RSSI_UNAVAILABLE;
use crate::util::lock;
use crate::{Address, Error, Result};

/// [`Radio`] over the host OS Bluetooth daemon, via `btleplug`.
///
/// The daemon keeps its own device cache, so advertisement events only carry
/// what changed since the last report. Attribute handles are assigned here in
/// discovery order because the daemon does not expose ATT handles.
pub struct HostRadio {
    _manager: Manager,
    adapter: Adapter,
    event_sender: Subscribers,
    state: Arc<Mutex<HostState>>,
    _listen_stopper: Trigger,
}

/// Event subscribers. Unbounded so that a slow consumer never loses a
/// notification or a disconnect.
#[derive(Clone, Default)]
struct Subscribers(Arc<Mutex<Vec<mpsc::UnboundedSender<RadioEvent>>>>);

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RadioEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.0).push(sender);
        receiver
    }

    fn send(&self, event: RadioEvent) {
        lock(&self.0).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct HostState {
    /// Peripherals seen while scanning, reused when connecting.
    peripherals: HashMap<[u8; 6], Peripheral>,
    addresses: HashMap<PeripheralId, Address>,
    links: HashMap<[u8; 6], HostLink>,
}

struct HostLink {
    peripheral: Peripheral,
    characteristics: HashMap<Handle, BtleCharacteristic>,
    descriptors: HashMap<Handle, BtleDescriptor>,
    _notification_stopper: Trigger,
}

impl HostRadio {
    /// Opens the host adapter at `adapter_index`. Must run inside a tokio
    /// runtime; the event listener is spawned onto it.
    pub async fn new(adapter_index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if adapter_index >= adapters.len() {
            return Err(Error::Capability(format!(
                "no bluetooth adapter at index {} ({} found)",
                adapter_index,
                adapters.len()
            )));
        }

        let adapter = adapters.swap_remove(adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        let event_sender = Subscribers::default();
        let state = Arc::new(Mutex::new(HostState::default()));

        let (stopper, events) = Valved::new(adapter.events().await?);
        tokio::spawn(listen(
            adapter.clone(),
            events,
            event_sender.clone(),
            state.clone(),
        ));

        Ok(Self {
            _manager: manager,
            adapter,
            event_sender,
            state,
            _listen_stopper: stopper,
        })
    }

    async fn find_peripheral(&self, address: Address) -> Result<Peripheral> {
        if let Some(peripheral) = lock(&self.state).peripherals.get(&address.bytes()) {
            return Ok(peripheral.clone());
        }

        let wanted = address.to_btleplug();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == wanted {
                lock(&self.state)
                    .peripherals
                    .insert(address.bytes(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::Connection(format!(
            "{} has not been seen by the host adapter",
            address
        )))
    }

    fn link_peripheral(&self, address: Address) -> Result<Peripheral> {
        lock(&self.state)
            .links
            .get(&address.bytes())
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn link_characteristic(
        &self,
        address: Address,
        handle: Handle,
    ) -> Result<(Peripheral, BtleCharacteristic)> {
        let state = lock(&self.state);
        let link = state.links.get(&address.bytes()).ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no characteristic at handle {}", handle)))?;
        Ok((link.peripheral.clone(), characteristic))
    }

    fn link_descriptor(
        &self,
        address: Address,
        handle: Handle,
    ) -> Result<(Peripheral, BtleDescriptor)> {
        let state = lock(&self.state);
        let link = state.links.get(&address.bytes()).ok_or(Error::NotConnected)?;
        let descriptor = link
            .descriptors
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no descriptor at handle {}", handle)))?;
        Ok((link.peripheral.clone(), descriptor))
    }
}

#[async_trait]
impl Radio for HostRadio {
    async fn events(&self) -> Result<EventStream> {
        let receiver = self.event_sender.subscribe();
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn local_name(&self) -> Option<String> {
        self.adapter.adapter_info().await.ok()
    }

    async fn start_scan(&self, parameters: &ScanParameters) -> Result<()> {
        log::debug!("Starting daemon scan with {:?}", parameters);
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: Address) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let (stopper, notifications) = Valved::new(peripheral.notifications().await?);
        tokio::spawn(forward_notifications(
            address,
            notifications,
            self.event_sender.clone(),
            self.state.clone(),
        ));

        lock(&self.state).links.insert(
            address.bytes(),
            HostLink {
                peripheral,
                characteristics: HashMap::new(),
                descriptors: HashMap::new(),
                _notification_stopper: stopper,
            },
        );

        Ok(())
    }

    async fn disconnect(&self, address: Address) -> Result<()> {
        let link = lock(&self.state).links.remove(&address.bytes());
        match link {
            Some(link) => link.peripheral.disconnect().await.map_err(Into::into),
            None => Ok(()),
        }
    }

    async fn discover(&self, address: Address) -> Result<Vec<RemoteService>> {
        let peripheral = self.link_peripheral(address)?;

        if peripheral.services().is_empty() {
            log::debug!("Discovering services for {}", address);
            peripheral.discover_services().await?;
        }

        let mut next_handle: Handle = 0;
        let mut allocate = || {
            next_handle += 1;
            next_handle
        };

        let mut characteristics = HashMap::new();
        let mut descriptors = HashMap::new();
        let mut services = Vec::new();

        for service in peripheral.services() {
            let mut remote = RemoteService {
                uuid: service.uuid,
                primary: service.primary,
                handle: allocate(),
                characteristics: Vec::new(),
            };

            for characteristic in &service.characteristics {
                let handle = allocate();
                let mut remote_characteristic = RemoteCharacteristic {
                    uuid: characteristic.uuid,
                    handle,
                    properties: characteristic.properties.into(),
                    descriptors: Vec::new(),
                };
                characteristics.insert(handle, characteristic.clone());

                for descriptor in &characteristic.descriptors {
                    let handle = allocate();
                    remote_characteristic.descriptors.push(RemoteDescriptor {
                        uuid: descriptor.uuid,
                        handle,
                    });
                    descriptors.insert(handle, descriptor.clone());
                }

                remote.characteristics.push(remote_characteristic);
            }

            services.push(remote);
        }

        let mut state = lock(&self.state);
        let link = state.links.get_mut(&address.bytes()).ok_or(Error::NotConnected)?;
        link.characteristics = characteristics;
        link.descriptors = descriptors;

        Ok(services)
    }

    async fn rssi(&self, address: Address) -> Result<i16> {
        let peripheral = self.link_peripheral(address)?;
        peripheral
            .properties()
            .await?
            .and_then(|props| props.rssi)
            .ok_or_else(|| Error::NotSupported("rssi is not reported for this link".to_string()))
    }

    async fn read(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.link_characteristic(address, handle)?;
        peripheral.read(&characteristic).await.map_err(Into::into)
    }

    async fn write(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.link_characteristic(address, handle)?;
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(Into::into)
    }

    async fn subscribe(
        &self,
        address: Address,
        handle: Handle,
        mode: Subscription,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.link_characteristic(address, handle)?;
        match mode {
            // The daemon picks notify or indicate from the characteristic's flags.
            Subscription::Notify | Subscription::Indicate => {
                peripheral.subscribe(&characteristic).await?
            }
            Subscription::Off => peripheral.unsubscribe(&characteristic).await?,
        }
        Ok(())
    }

    async fn read_descriptor(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        let (peripheral, descriptor) = self.link_descriptor(address, handle)?;
        peripheral
            .read_descriptor(&descriptor)
            .await
            .map_err(Into::into)
    }

    async fn write_descriptor(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
    ) -> Result<()> {
        let (peripheral, descriptor) = self.link_descriptor(address, handle)?;
        peripheral
            .write_descriptor(&descriptor, value)
            .await
            .map_err(Into::into)
    }
}

async fn listen(
    adapter: Adapter,
    mut events: Valved<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>,
    sender: Subscribers,
    state: Arc<Mutex<HostState>>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                on_advertisement(&adapter, &id, &sender, &state).await;
            }
            CentralEvent::DeviceConnected(id) => {
                let address = lock(&state).addresses.get(&id).copied();
                if let Some(address) = address {
                    sender.send(RadioEvent::new(address, RadioEventKind::Connected));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = {
                    let mut state = lock(&state);
                    let address = state.addresses.get(&id).copied();
                    if let Some(address) = address {
                        state.links.remove(&address.bytes());
                    }
                    address
                };
                if let Some(address) = address {
                    log::debug!("Device disconnected: {}", address);
                    sender.send(RadioEvent::new(address, RadioEventKind::Disconnected));
                }
            }
            _ => {}
        }
    }

    log::info!("Host radio event stream ended");
}

async fn on_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    sender: &Subscribers,
    state: &Arc<Mutex<HostState>>,
) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(_) => return,
    };
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        _ => return,
    };

    let address = Address::from_btleplug(props.address, props.address_type);
    {
        let mut state = lock(state);
        state.addresses.insert(id.clone(), address);
        state.peripherals.insert(address.bytes(), peripheral);
    }

    log::trace!("Advertisement from {}: {:?}", address, props.local_name);

    let kind = RadioEventKind::Advertisement {
        payload: advertisement_payload(&props),
        rssi: props.rssi.unwrap_or(RSSI_UNAVAILABLE),
        // The daemon does not report connectability; devices listing services
        // usually accept connections.
        connectable: !props.services.is_empty(),
        scan_response: false,
    };
    sender.send(RadioEvent::new(address, kind));
}

async fn forward_notifications(
    address: Address,
    mut notifications: Valved<Pin<Box<dyn Stream<Item = btleplug::api::ValueNotification> + Send>>>,
    sender: Subscribers,
    state: Arc<Mutex<HostState>>,
) {
    while let Some(notification) = notifications.next().await {
        // Notifications only carry the characteristic UUID; the first
        // characteristic with that UUID receives them.
        let handle = lock(&state).links.get(&address.bytes()).and_then(|link| {
            link.characteristics
                .iter()
                .filter(|(_, c)| c.uuid == notification.uuid)
                .map(|(handle, _)| *handle)
                .min()
        });

        match handle {
            Some(handle) => sender.send(RadioEvent::new(
                address,
                RadioEventKind::Notification {
                    handle,
                    value: notification.value,
                },
            )),
            None => log::trace!(
                "Dropping notification for unknown characteristic {}",
                notification.uuid
            ),
        }
    }
}

/// Rebuilds advertising data from the daemon's parsed properties. The result
/// is deterministic for equal properties so that repeats compare equal.
pub(crate) fn advertisement_payload(props: &PeripheralProperties) -> Vec<u8> {
    let mut payload = Vec::new();

    if let Some(name) = props.local_name.as_deref() {
        if !is_placeholder_name(name) {
            push_field(&mut payload, 0x09, name.as_bytes());
        }
    }

    let mut uuids16 = Vec::new();
    let mut uuids128 = Vec::new();
    for uuid in &props.services {
        match short_uuid(uuid) {
            Some(short) => uuids16.extend_from_slice(&short.to_le_bytes()),
            None => uuids128.extend(uuid_le_bytes(uuid)),
        }
    }
    if !uuids16.is_empty() {
        push_field(&mut payload, 0x03, &uuids16);
    }
    if !uuids128.is_empty() {
        push_field(&mut payload, 0x07, &uuids128);
    }

    let mut service_data = props.service_data.iter().collect::<Vec<_>>();
    service_data.sort();
    for (uuid, data) in service_data {
        let mut field = Vec::new();
        match short_uuid(uuid) {
            Some(short) => {
                field.extend_from_slice(&short.to_le_bytes());
                field.extend_from_slice(data);
                push_field(&mut payload, 0x16, &field);
            }
            None => {
                field.extend(uuid_le_bytes(uuid));
                field.extend_from_slice(data);
                push_field(&mut payload, 0x21, &field);
            }
        }
    }

    let mut manufacturer_data = props.manufacturer_data.iter().collect::<Vec<_>>();
    manufacturer_data.sort();
    for (company, data) in manufacturer_data {
        let mut field = company.to_le_bytes().to_vec();
        field.extend_from_slice(data);
        push_field(&mut payload, 0xff, &field);
    }

    if let Some(tx_power) = props.tx_power_level {
        push_field(&mut payload, 0x0a, &[tx_power as i8 as u8]);
    }

    payload
}

fn push_field(payload: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    if data.len() >= u8::MAX as usize {
        log::debug!("Skipping oversized AD field 0x{:02x}", ad_type);
        return;
    }
    payload.push(data.len() as u8 + 1);
    payload.push(ad_type);
    payload.extend_from_slice(data);
}

fn uuid_le_bytes(uuid: &Uuid) -> impl Iterator<Item = u8> {
    uuid.as_u128().to_le_bytes().into_iter()
}

/// Names some stacks invent for unnamed devices: `Unknown`, or the address
/// written as `XX-XX-XX-XX-XX-XX` / `dev_XX_XX_XX_XX_XX_XX`.
fn is_placeholder_name(name: &str) -> bool {
    if name.eq_ignore_ascii_case("unknown") {
        return true;
    }

    let rest = match name.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("dev_") => &name[4..],
        _ => name,
    };
    let bytes = rest.as_bytes();
    bytes.len() == 17
        && bytes.iter().enumerate().all(|(i, b)| {
            if i % 3 == 2 {
                *b == b'-' || *b == b'_'
            } else {
                b.is_ascii_hexdigit()
            }
        })
}
