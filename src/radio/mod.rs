//! The boundary to the host radio stack.
//!
//! Everything above this module talks to a [`Radio`]: an asynchronous source of
//! normalized [`RadioEvent`]s plus request/response operations keyed by
//! [`Address`] and attribute handle. [`HostRadio`] drives the OS Bluetooth
//! daemon through `btleplug`; `MockRadio` (feature `mock`) is a
//! scripted stand-in.

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::{Address, Error, Properties, Result};

mod host;

pub use host::HostRadio;

/// Attribute handle, unique within one connection.
pub type Handle = u16;

pub type EventStream = Pin<Box<dyn Stream<Item = RadioEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioEvent {
    pub address: Address,
    pub kind: RadioEventKind,
    pub timestamp: Instant,
}

impl RadioEvent {
    pub fn new(address: Address, kind: RadioEventKind) -> Self {
        Self {
            address,
            kind,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEventKind {
    /// An advertisement as reported by the daemon. Repeats with an unchanged
    /// payload may or may not be reported; the scanner suppresses them.
    Advertisement {
        payload: Vec<u8>,
        rssi: i16,
        connectable: bool,
        scan_response: bool,
    },
    Connected,
    Disconnected,
    Notification { handle: Handle, value: Vec<u8> },
}

/// Radio duty cycle and filtering requested for a daemon scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParameters {
    pub interval: Duration,
    pub window: Duration,
    pub active: bool,
    pub extended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisingParameters {
    pub data: Vec<u8>,
    pub scan_response: Option<Vec<u8>>,
    pub connectable: bool,
    pub anonymous: bool,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

/// A discovered service as described by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub primary: bool,
    pub handle: Handle,
    pub characteristics: Vec<RemoteCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub handle: Handle,
    pub properties: Properties,
    pub descriptors: Vec<RemoteDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub uuid: Uuid,
    pub handle: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Off,
    Notify,
    Indicate,
}

/// Host radio stack.
///
/// Implementations must deliver events for one address in the order the stack
/// reported them. Operations are only issued from the adapter's event worker.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Subscribes to the event stream. Events emitted before the call are not
    /// replayed.
    async fn events(&self) -> Result<EventStream>;

    /// Address of the local controller, when the stack exposes it.
    async fn local_address(&self) -> Option<Address> {
        None
    }

    async fn local_name(&self) -> Option<String> {
        None
    }

    async fn set_powered(&self, _powered: bool) -> Result<()> {
        Ok(())
    }

    async fn start_scan(&self, parameters: &ScanParameters) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn start_advertising(&self, _parameters: &AdvertisingParameters) -> Result<()> {
        Err(Error::NotSupported(
            "advertising is not available on this radio".to_string(),
        ))
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    /// Establishes a link. May never complete; callers apply their own timeout.
    async fn connect(&self, address: Address) -> Result<()>;

    async fn disconnect(&self, address: Address) -> Result<()>;

    /// Full attribute discovery on a connected peer.
    async fn discover(&self, address: Address) -> Result<Vec<RemoteService>>;

    async fn mtu(&self, _address: Address) -> Result<u16> {
        Ok(23)
    }

    async fn rssi(&self, address: Address) -> Result<i16>;

    async fn pair(&self, _address: Address, _bond: bool) -> Result<()> {
        Err(Error::NotSupported("pairing is not available on this radio".to_string()))
    }

    async fn read(&self, address: Address, handle: Handle) -> Result<Vec<u8>>;

    async fn write(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    async fn subscribe(&self, address: Address, handle: Handle, mode: Subscription)
        -> Result<()>;

    async fn read_descriptor(&self, address: Address, handle: Handle) -> Result<Vec<u8>>;

    async fn write_descriptor(&self, address: Address, handle: Handle, value: &[u8])
        -> Result<()>;
}
