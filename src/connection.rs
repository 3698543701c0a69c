use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use uuid::Uuid;

use crate::characteristic::NotifySink;
use crate::radio::{Handle, Radio, RemoteService};
use crate::util::lock;
use crate::worker::Worker;
use crate::{Address, Characteristic, Error, Properties, Result, Service};

const DEFAULT_MTU: u16 = 23;
const ATT_HEADER: u16 = 3;
const MAX_ATTRIBUTE_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// How a radio disconnect relates to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkLoss {
    /// The event predates this link's radio connection.
    Stale,
    /// The link dropped while services were being discovered.
    DuringSetup,
    /// The link was up; it has to be torn down.
    Established,
}

pub(crate) struct DescriptorData {
    pub(crate) uuid: Uuid,
    pub(crate) handle: Handle,
    pub(crate) value: Mutex<Vec<u8>>,
}

pub(crate) struct CharacteristicData {
    pub(crate) uuid: Uuid,
    pub(crate) handle: Handle,
    pub(crate) properties: Properties,
    pub(crate) descriptors: Vec<DescriptorData>,
    pub(crate) value: Mutex<Vec<u8>>,
    /// Attached buffers, each fed its own copy of every notification.
    pub(crate) sinks: Mutex<Vec<(u64, Arc<dyn NotifySink>)>>,
}

pub(crate) struct ServiceData {
    pub(crate) uuid: Uuid,
    pub(crate) primary: bool,
    pub(crate) characteristics: Vec<CharacteristicData>,
}

/// Attribute tree of a connection, fixed after discovery.
pub(crate) struct GattTree {
    pub(crate) services: Vec<ServiceData>,
    /// Characteristic positions by UUID, in discovery order.
    by_uuid: HashMap<Uuid, Vec<(usize, usize)>>,
    by_handle: HashMap<Handle, (usize, usize)>,
}

impl GattTree {
    fn new(remote: Vec<RemoteService>) -> Self {
        let mut by_uuid: HashMap<Uuid, Vec<(usize, usize)>> = HashMap::new();
        let mut by_handle = HashMap::new();

        let services = remote
            .into_iter()
            .enumerate()
            .map(|(s, service)| ServiceData {
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .enumerate()
                    .map(|(c, characteristic)| {
                        by_uuid.entry(characteristic.uuid).or_default().push((s, c));
                        by_handle.insert(characteristic.handle, (s, c));
                        CharacteristicData {
                            uuid: characteristic.uuid,
                            handle: characteristic.handle,
                            properties: characteristic.properties,
                            descriptors: characteristic
                                .descriptors
                                .into_iter()
                                .map(|descriptor| DescriptorData {
                                    uuid: descriptor.uuid,
                                    handle: descriptor.handle,
                                    value: Mutex::new(Vec::new()),
                                })
                                .collect(),
                            value: Mutex::new(Vec::new()),
                            sinks: Mutex::new(Vec::new()),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            services,
            by_uuid,
            by_handle,
        }
    }

    pub(crate) fn characteristic(&self, service: usize, index: usize) -> &CharacteristicData {
        &self.services[service].characteristics[index]
    }

    fn characteristics(&self) -> impl Iterator<Item = &CharacteristicData> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
    }
}

/// Shared state of one link, referenced by every handle derived from it.
pub(crate) struct Link {
    pub(crate) address: Address,
    radio: Arc<dyn Radio>,
    worker: Worker,
    state: Mutex<ConnectionState>,
    mtu: AtomicU16,
    paired: AtomicBool,
    /// Set once the radio reports this link up.
    radio_up: AtomicBool,
    /// Set when the radio drops the link before setup completes.
    lost: AtomicBool,
    tree: OnceLock<GattTree>,
    request_timeout: Duration,
    next_sink: AtomicU64,
}

impl Link {
    pub(crate) fn new(
        address: Address,
        radio: Arc<dyn Radio>,
        worker: Worker,
        request_timeout: Duration,
    ) -> Self {
        Self {
            address,
            radio,
            worker,
            state: Mutex::new(ConnectionState::Connecting),
            mtu: AtomicU16::new(DEFAULT_MTU),
            paired: AtomicBool::new(false),
            radio_up: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            tree: OnceLock::new(),
            request_timeout,
            next_sink: AtomicU64::new(1),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Completes link setup. Fails if the link dropped meanwhile.
    pub(crate) fn establish(&self, mtu: u16, services: Vec<RemoteService>) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Connecting || self.lost.load(Ordering::Acquire) {
            return Err(Error::Connection(
                "link lost during service discovery".to_string(),
            ));
        }
        self.mtu.store(mtu.max(DEFAULT_MTU), Ordering::Relaxed);
        if self.tree.set(GattTree::new(services)).is_err() {
            log::debug!("Attribute tree of {} was already populated", self.address);
        }
        *state = ConnectionState::Connected;
        Ok(())
    }

    pub(crate) fn radio_connected(&self) {
        self.radio_up.store(true, Ordering::Release);
    }

    /// Classifies a disconnect reported by the radio. A loss during setup is
    /// remembered so that [`Link::establish`] fails.
    pub(crate) fn radio_disconnected(&self) -> LinkLoss {
        let state = lock(&self.state);
        match *state {
            ConnectionState::Connecting if self.radio_up.load(Ordering::Acquire) => {
                self.lost.store(true, Ordering::Release);
                LinkLoss::DuringSetup
            }
            ConnectionState::Connecting => LinkLoss::Stale,
            _ => LinkLoss::Established,
        }
    }

    /// Moves to the terminal state and releases every attached buffer.
    pub(crate) fn mark_disconnected(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        log::info!("Disconnected from {}", self.address);

        if let Some(tree) = self.tree.get() {
            for characteristic in tree.characteristics() {
                let sinks = std::mem::take(&mut *lock(&characteristic.sinks));
                for (_, sink) in sinks {
                    sink.close();
                }
            }
        }
    }

    /// Routes a notification to the characteristic at `handle`.
    pub(crate) fn deliver(&self, handle: Handle, value: &[u8]) {
        let tree = match self.tree.get() {
            Some(tree) => tree,
            None => return,
        };
        let (s, c) = match tree.by_handle.get(&handle) {
            Some(position) => *position,
            None => {
                log::trace!("Notification for unknown handle {} from {}", handle, self.address);
                return;
            }
        };

        let characteristic = tree.characteristic(s, c);
        *lock(&characteristic.value) = value.to_vec();

        let sinks = lock(&characteristic.sinks)
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect::<Vec<_>>();
        for sink in sinks {
            sink.push(value);
        }
    }

    /// The attribute tree regardless of link state.
    pub(crate) fn discovered(&self) -> Option<&GattTree> {
        self.tree.get()
    }

    pub(crate) fn tree(&self) -> Result<&GattTree> {
        self.ensure_connected()?;
        self.tree.get().ok_or(Error::NotConnected)
    }

    /// Runs a radio request on the event worker under the request timeout.
    pub(crate) fn request<T, F>(&self, op: impl FnOnce(Arc<dyn Radio>, Address) -> F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_connected()?;
        let future = op(self.radio.clone(), self.address);
        self.worker.run_timeout(self.request_timeout, future)
    }

    pub(crate) fn next_sink_id(&self) -> u64 {
        self.next_sink.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Largest attribute value that fits one packet on this link.
    pub(crate) fn max_packet_length(&self) -> usize {
        ((self.mtu() - ATT_HEADER) as usize).min(MAX_ATTRIBUTE_LENGTH)
    }

    pub(crate) fn disconnect(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                _ => *state = ConnectionState::Disconnecting,
            }
        }

        log::debug!("Disconnecting from {}", self.address);

        let radio = self.radio.clone();
        let address = self.address;
        let result = self
            .worker
            .run_timeout(self.request_timeout, async move { radio.disconnect(address).await });

        self.mark_disconnected();
        result
    }
}

/// An established link to a remote peripheral.
///
/// Handles are cheap to clone and share the link. Once the link is gone every
/// operation on the connection, or on anything discovered through it, fails
/// with [`Error::NotConnected`].
#[derive(Clone)]
pub struct Connection {
    pub(crate) link: Arc<Link>,
}

impl Connection {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.link.address
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Disconnect from the peripheral. Does nothing if already disconnected.
    pub fn disconnect(&self) -> Result<()> {
        self.link.disconnect()
    }

    /// Signal strength of the link, read from the controller
    pub fn rssi(&self) -> Result<i16> {
        self.link
            .request(|radio, address| async move { radio.rssi(address).await })
    }

    /// Negotiated ATT MTU
    pub fn mtu(&self) -> Result<u16> {
        self.link.ensure_connected()?;
        Ok(self.link.mtu())
    }

    /// Largest characteristic value that fits in one packet: MTU - 3
    pub fn max_packet_length(&self) -> Result<usize> {
        self.link.ensure_connected()?;
        Ok((self.link.mtu() - ATT_HEADER) as usize)
    }

    /// Pair with the peripheral, bonding if `bond` is set.
    pub fn pair(&self, bond: bool) -> Result<()> {
        self.link
            .request(move |radio, address| async move { radio.pair(address, bond).await })?;
        self.link.paired.store(true, Ordering::Relaxed);
        log::info!("Paired with {}", self.link.address);
        Ok(())
    }

    pub fn paired(&self) -> bool {
        self.link.paired.load(Ordering::Relaxed)
    }

    /// Every service of the peripheral. Services are discovered once, when
    /// the connection is made.
    pub fn discover_attributes(&self) -> Result<Vec<Service>> {
        let tree = self.link.tree()?;
        Ok(tree
            .services
            .iter()
            .enumerate()
            .map(|(index, data)| Service::new(self.link.clone(), index, data))
            .collect())
    }

    /// Services whose UUID is in `whitelist`, or all of them without one.
    pub fn discover_remote_services(&self, whitelist: Option<&[Uuid]>) -> Result<Vec<Service>> {
        let services = self.discover_attributes()?;
        Ok(match whitelist {
            Some(uuids) => services
                .into_iter()
                .filter(|service| uuids.contains(&service.uuid()))
                .collect(),
            None => services,
        })
    }

    /// First service with `uuid`.
    pub fn service(&self, uuid: Uuid) -> Result<Service> {
        self.discover_attributes()?
            .into_iter()
            .find(|service| service.uuid() == uuid)
            .ok_or(Error::AttributeNotFound(uuid))
    }

    /// Every characteristic with `uuid`, across services, in discovery order.
    pub fn characteristics_with_uuid(&self, uuid: Uuid) -> Result<Vec<Characteristic>> {
        let tree = self.link.tree()?;
        Ok(tree
            .by_uuid
            .get(&uuid)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&(s, c)| {
                        Characteristic::new(self.link.clone(), s, c, tree.characteristic(s, c))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// First characteristic with `uuid`.
    pub fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics_with_uuid(uuid)?
            .into_iter()
            .next()
            .ok_or(Error::AttributeNotFound(uuid))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.link.address)
            .field("state", &self.link.state())
            .finish()
    }
}
