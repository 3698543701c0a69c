use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use stream_cancel::{Trigger, Valved};

use crate::capture::{CaptureSource, Hcidump};
use crate::connection::{ConnectionState, Link, LinkLoss};
use crate::radio::{
    AdvertisingParameters, EventStream, HostRadio, Radio, RadioEvent, RadioEventKind,
};
use crate::scanner::{ScanConfig, ScanResults, Scanner};
use crate::util::lock;
use crate::worker::{EventLoop, Worker};
use crate::{Address, AdapterConfig, Connection, Error, Result};

const DEFAULT_NAME: &str = "bleio-host";
const MAX_LEGACY_ADVERTISEMENT: usize = 31;
const MIN_ADVERTISING_INTERVAL: Duration = Duration::from_millis(20);
const MAX_ADVERTISING_INTERVAL: Duration = Duration::from_millis(10_240);

/// Parameters of a local advertisement.
#[derive(Debug, Clone)]
pub struct AdvertisingConfig {
    data: Vec<u8>,
    scan_response: Option<Vec<u8>>,
    connectable: bool,
    anonymous: bool,
    timeout: Option<Duration>,
    interval: Duration,
}

impl AdvertisingConfig {
    /// Advertise `data`, connectable, every 100 ms.
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            scan_response: None,
            connectable: true,
            anonymous: false,
            timeout: None,
            interval: Duration::from_millis(100),
        }
    }

    /// Payload returned to active scanners
    pub fn scan_response(mut self, data: &[u8]) -> Self {
        self.scan_response = Some(data.to_vec());
        self
    }

    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;
        self
    }

    /// Advertise from a random, non-resolvable address
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Stop advertising on our own after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.data.len() > MAX_LEGACY_ADVERTISEMENT {
            return Err(Error::InvalidArgument(format!(
                "advertising data is {} bytes, at most {} fit",
                self.data.len(),
                MAX_LEGACY_ADVERTISEMENT
            )));
        }
        if let Some(response) = &self.scan_response {
            if response.len() > MAX_LEGACY_ADVERTISEMENT {
                return Err(Error::InvalidArgument(format!(
                    "scan response is {} bytes, at most {} fit",
                    response.len(),
                    MAX_LEGACY_ADVERTISEMENT
                )));
            }
        }
        if self.interval < MIN_ADVERTISING_INTERVAL || self.interval > MAX_ADVERTISING_INTERVAL {
            return Err(Error::InvalidArgument(format!(
                "advertising interval {:?} outside {:?}..={:?}",
                self.interval, MIN_ADVERTISING_INTERVAL, MAX_ADVERTISING_INTERVAL
            )));
        }
        Ok(())
    }

    fn parameters(&self) -> AdvertisingParameters {
        AdvertisingParameters {
            data: self.data.clone(),
            scan_response: self.scan_response.clone(),
            connectable: self.connectable,
            anonymous: self.anonymous,
            interval: self.interval,
            timeout: self.timeout,
        }
    }
}

/// Where the event pump sends what the radio reports.
struct Router {
    links: Mutex<HashMap<[u8; 6], Arc<Link>>>,
    scanner: OnceLock<Arc<Scanner>>,
}

impl Router {
    fn dispatch(&self, event: RadioEvent) {
        match &event.kind {
            RadioEventKind::Advertisement { .. } => {
                if let Some(scanner) = self.scanner.get() {
                    scanner.route(&event);
                }
            }
            RadioEventKind::Notification { handle, value } => {
                let link = lock(&self.links).get(&event.address.bytes()).cloned();
                match link {
                    Some(link) => link.deliver(*handle, value),
                    None => log::trace!("Notification from unlinked {}", event.address),
                }
            }
            RadioEventKind::Disconnected => {
                let key = event.address.bytes();
                let link = {
                    let mut links = lock(&self.links);
                    match links.get(&key).map(|link| link.radio_disconnected()) {
                        Some(LinkLoss::Established) => links.remove(&key),
                        Some(LinkLoss::DuringSetup) => {
                            log::debug!("Link to {} dropped during setup", event.address);
                            None
                        }
                        Some(LinkLoss::Stale) | None => {
                            log::trace!("Ignoring disconnect of {}", event.address);
                            None
                        }
                    }
                };
                if let Some(link) = link {
                    link.mark_disconnected();
                }
            }
            RadioEventKind::Connected => {
                log::trace!("Link up to {}", event.address);
                if let Some(link) = lock(&self.links).get(&event.address.bytes()) {
                    link.radio_connected();
                }
            }
        }
    }
}

async fn pump(router: Arc<Router>, mut events: Valved<EventStream>) {
    while let Some(event) = events.next().await {
        router.dispatch(event);
    }
    log::trace!("Event pump stopped");
}

struct AdapterState {
    enabled: bool,
    name: String,
}

struct AdapterInner {
    config: AdapterConfig,
    radio: Arc<dyn Radio>,
    capture: Arc<dyn CaptureSource>,
    worker: Worker,
    router: Arc<Router>,
    state: Mutex<AdapterState>,
    scanner_init: Mutex<()>,
    /// Generation of the running advertisement, if any.
    advertising: Arc<Mutex<Option<u64>>>,
    next_advertisement: AtomicU64,
    _pump_stopper: Trigger,
    _event_loop: EventLoop,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        let links = std::mem::take(&mut *lock(&self.router.links));
        for link in links.into_values() {
            if link.is_connected() {
                if let Err(e) = link.disconnect() {
                    log::warn!("Failed to disconnect {} on shutdown: {}", link.address, e);
                }
            }
        }
        if let Some(scanner) = self.router.scanner.get() {
            scanner.stop().ok();
        }
        log::debug!("Adapter {:?} shut down", self.config.worker_thread_name);
    }
}

/// The local Bluetooth adapter.
///
/// Every operation is synchronous. Radio events are handled on a background
/// worker owned by the adapter, so callers never drive an event loop. The
/// handle is cheap to clone; the last clone to drop disconnects every live
/// connection.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    /// Opens the host's Bluetooth adapter, with raw capture through
    /// `hcidump` where the host allows it.
    pub fn host(config: AdapterConfig) -> Result<Self> {
        let event_loop = EventLoop::start(&config.worker_thread_name)?;
        let index = config.adapter_index;
        let radio = event_loop
            .worker()
            .run(async move { HostRadio::new(index).await })?;
        Self::start(Arc::new(radio), Arc::new(Hcidump::new()), config, event_loop)
    }

    /// Builds an adapter over any radio and capture source.
    pub fn new(
        radio: impl Radio,
        capture: impl CaptureSource,
        config: AdapterConfig,
    ) -> Result<Self> {
        let event_loop = EventLoop::start(&config.worker_thread_name)?;
        Self::start(Arc::new(radio), Arc::new(capture), config, event_loop)
    }

    fn start(
        radio: Arc<dyn Radio>,
        capture: Arc<dyn CaptureSource>,
        config: AdapterConfig,
        event_loop: EventLoop,
    ) -> Result<Self> {
        let worker = event_loop.worker();

        let router = Arc::new(Router {
            links: Mutex::new(HashMap::new()),
            scanner: OnceLock::new(),
        });

        let events = {
            let radio = radio.clone();
            worker.run(async move { radio.events().await })?
        };
        let (pump_stopper, events) = Valved::new(events);
        worker.spawn(pump(router.clone(), events));

        let name = match &config.name {
            Some(name) => name.clone(),
            None => {
                let radio = radio.clone();
                worker
                    .run(async move { Ok(radio.local_name().await) })?
                    .unwrap_or_else(|| DEFAULT_NAME.to_string())
            }
        };

        log::info!("Adapter ready, backend preference {:?}", config.backend);

        Ok(Self {
            inner: Arc::new(AdapterInner {
                config,
                radio,
                capture,
                worker,
                router,
                state: Mutex::new(AdapterState {
                    enabled: true,
                    name,
                }),
                scanner_init: Mutex::new(()),
                advertising: Arc::new(Mutex::new(None)),
                next_advertisement: AtomicU64::new(1),
                _pump_stopper: pump_stopper,
                _event_loop: event_loop,
            }),
        })
    }

    pub fn enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }

    /// Powers the radio up or down. Disabling stops any scan and
    /// advertisement.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if self.enabled() == enabled {
            return Ok(());
        }
        if !enabled {
            self.stop_scan()?;
            self.stop_advertising()?;
        }

        let radio = self.inner.radio.clone();
        self.inner
            .worker
            .run(async move { radio.set_powered(enabled).await })?;
        lock(&self.inner.state).enabled = enabled;

        log::info!("Adapter {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled() {
            Ok(())
        } else {
            Err(Error::Capability("adapter is disabled".to_string()))
        }
    }

    /// Address of the local controller, when the stack reports one.
    pub fn address(&self) -> Option<Address> {
        let radio = self.inner.radio.clone();
        self.inner
            .worker
            .run(async move { Ok(radio.local_address().await) })
            .ok()
            .flatten()
    }

    pub fn name(&self) -> String {
        lock(&self.inner.state).name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        lock(&self.inner.state).name = name.into();
    }

    fn scanner(&self) -> Result<Arc<Scanner>> {
        let _init = lock(&self.inner.scanner_init);
        if let Some(scanner) = self.inner.router.scanner.get() {
            return Ok(scanner.clone());
        }

        let scanner = Arc::new(Scanner::new(
            self.inner.radio.clone(),
            self.inner.capture.clone(),
            self.inner.config.backend,
            self.inner.worker.clone(),
        )?);
        Ok(self.inner.router.scanner.get_or_init(|| scanner).clone())
    }

    /// Starts scanning. The results stream until the scan stops, times out or
    /// is dropped.
    pub fn start_scan(&self, config: ScanConfig) -> Result<ScanResults> {
        self.ensure_enabled()?;
        self.scanner()?.start(config)
    }

    /// Stops the running scan, waking anyone waiting on its results.
    pub fn stop_scan(&self) -> Result<()> {
        match self.inner.router.scanner.get() {
            Some(scanner) => scanner.stop(),
            None => Ok(()),
        }
    }

    /// Whether a scan is running.
    pub fn scanning(&self) -> bool {
        self.inner
            .router
            .scanner
            .get()
            .map_or(false, |scanner| scanner.is_scanning())
    }

    pub fn start_advertising(&self, config: AdvertisingConfig) -> Result<()> {
        self.ensure_enabled()?;
        config.validate()?;

        let generation = self.inner.next_advertisement.fetch_add(1, Ordering::Relaxed);
        {
            let mut advertising = lock(&self.inner.advertising);
            if advertising.is_some() {
                return Err(Error::Capability("already advertising".to_string()));
            }
            *advertising = Some(generation);
        }

        let radio = self.inner.radio.clone();
        let parameters = config.parameters();
        if let Err(e) = self
            .inner
            .worker
            .run(async move { radio.start_advertising(&parameters).await })
        {
            let mut advertising = lock(&self.inner.advertising);
            if *advertising == Some(generation) {
                *advertising = None;
            }
            return Err(e);
        }

        if let Some(timeout) = config.timeout {
            let slot = self.inner.advertising.clone();
            let radio = self.inner.radio.clone();
            self.inner.worker.spawn(async move {
                tokio::time::sleep(timeout).await;
                let expired = {
                    let mut advertising = lock(&slot);
                    if *advertising == Some(generation) {
                        *advertising = None;
                        true
                    } else {
                        false
                    }
                };
                if expired {
                    log::info!("Advertising timed out after {:?}", timeout);
                    if let Err(e) = radio.stop_advertising().await {
                        log::warn!("Failed to stop advertising: {}", e);
                    }
                }
            });
        }

        log::info!("Advertising {} bytes", config.data.len());
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<()> {
        if lock(&self.inner.advertising).take().is_none() {
            return Ok(());
        }
        let radio = self.inner.radio.clone();
        self.inner
            .worker
            .run(async move { radio.stop_advertising().await })?;
        log::info!("Advertising stopped");
        Ok(())
    }

    pub fn advertising(&self) -> bool {
        lock(&self.inner.advertising).is_some()
    }

    /// Connects to `address`, discovering its services. Fails with
    /// [`Error::Connection`] if the link is not up within `timeout`.
    pub fn connect(&self, address: Address, timeout: Duration) -> Result<Connection> {
        self.ensure_enabled()?;

        let link = {
            let mut links = lock(&self.inner.router.links);
            if let Some(link) = links.get(&address.bytes()) {
                match link.state() {
                    ConnectionState::Connected => return Ok(Connection::new(link.clone())),
                    ConnectionState::Connecting => {
                        return Err(Error::Connection(format!(
                            "already connecting to {}",
                            address
                        )))
                    }
                    _ => {}
                }
            }
            links.retain(|_, link| link.state() != ConnectionState::Disconnected);

            let link = Arc::new(Link::new(
                address,
                self.inner.radio.clone(),
                self.inner.worker.clone(),
                self.inner.config.request_timeout,
            ));
            links.insert(address.bytes(), link.clone());
            link
        };

        log::info!("Connecting to {}", address);

        match self.establish(&link, timeout) {
            Ok(()) => {
                log::info!("Connected to {}, MTU {}", address, link.mtu());
                Ok(Connection::new(link))
            }
            Err(e) => {
                {
                    let mut links = lock(&self.inner.router.links);
                    if links
                        .get(&address.bytes())
                        .map_or(false, |current| Arc::ptr_eq(current, &link))
                    {
                        links.remove(&address.bytes());
                    }
                }
                link.mark_disconnected();

                let radio = self.inner.radio.clone();
                self.inner.worker.spawn(async move {
                    if let Err(e) = radio.disconnect(address).await {
                        log::debug!("Cleanup disconnect of {} failed: {}", address, e);
                    }
                });

                log::warn!("Connection to {} failed: {}", address, e);
                Err(match e {
                    Error::Capability(_) | Error::Connection(_) => e,
                    Error::Timeout(_) => {
                        Error::Connection(format!("timed out connecting to {}", address))
                    }
                    other => Error::Connection(other.to_string()),
                })
            }
        }
    }

    fn establish(&self, link: &Arc<Link>, timeout: Duration) -> Result<()> {
        let address = link.address;

        let radio = self.inner.radio.clone();
        self.inner
            .worker
            .run_timeout(timeout, async move { radio.connect(address).await })?;

        let radio = self.inner.radio.clone();
        let (mtu, services) = self.inner.worker.run_timeout(
            self.inner.config.request_timeout,
            async move {
                let mtu = radio.mtu(address).await?;
                let services = radio.discover(address).await?;
                Ok((mtu, services))
            },
        )?;

        log::debug!("Discovered {} services on {}", services.len(), address);
        link.establish(mtu, services)
    }

    /// Live connections.
    pub fn connections(&self) -> Vec<Connection> {
        let mut links = lock(&self.inner.router.links);
        links.retain(|_, link| link.state() != ConnectionState::Disconnected);
        links
            .values()
            .filter(|link| link.is_connected())
            .map(|link| Connection::new(link.clone()))
            .collect()
    }

    /// Whether any connection is live.
    pub fn connected(&self) -> bool {
        lock(&self.inner.router.links)
            .values()
            .any(|link| link.is_connected())
    }

    /// Bonding information is owned by the host stack.
    pub fn erase_bonding(&self) -> Result<()> {
        Err(Error::NotSupported(
            "bonds are managed by the host bluetooth stack".to_string(),
        ))
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name())
            .field("enabled", &self.enabled())
            .field("backend", &self.inner.config.backend)
            .finish()
    }
}
