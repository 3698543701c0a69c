use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::common::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use crate::connection::{CharacteristicData, Link};
use crate::radio::{Handle, Subscription, WriteType};
use crate::util::lock;
use crate::{Attribute, Connection, Descriptor, Error, Properties, Result, Service};

/// Receiver of a characteristic's notifications, fed from the event worker.
pub(crate) trait NotifySink: Send + Sync {
    fn push(&self, value: &[u8]);

    /// The link is gone; no more values will arrive.
    fn close(&self);
}

/// A characteristic of a connected peripheral.
#[derive(Clone)]
pub struct Characteristic {
    pub(crate) link: Arc<Link>,
    pub(crate) service: usize,
    pub(crate) index: usize,
    uuid: Uuid,
    properties: Properties,
    handle: Handle,
}

impl Characteristic {
    pub(crate) fn new(
        link: Arc<Link>,
        service: usize,
        index: usize,
        data: &CharacteristicData,
    ) -> Self {
        Self {
            link,
            service,
            index,
            uuid: data.uuid,
            properties: data.properties,
            handle: data.handle,
        }
    }

    pub(crate) fn data(&self) -> Result<&CharacteristicData> {
        Ok(self.link.tree()?.characteristic(self.service, self.index))
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    pub fn properties(&self) -> Properties {
        self.properties
    }

    /// Remote attribute permissions are not visible to a client.
    pub fn read_permission(&self) -> Attribute {
        Attribute::Open
    }

    pub fn write_permission(&self) -> Attribute {
        Attribute::Open
    }

    /// Last value read, written or notified.
    pub fn value(&self) -> Result<Vec<u8>> {
        Ok(lock(&self.data()?.value).clone())
    }

    /// The service this characteristic belongs to.
    pub fn service(&self) -> Result<Service> {
        let tree = self.link.tree()?;
        Ok(Service::new(
            self.link.clone(),
            self.service,
            &tree.services[self.service],
        ))
    }

    pub fn connection(&self) -> Connection {
        Connection::new(self.link.clone())
    }

    pub fn descriptors(&self) -> Result<Vec<Descriptor>> {
        Ok(self
            .data()?
            .descriptors
            .iter()
            .enumerate()
            .map(|(index, data)| Descriptor::new(self.clone(), index, data))
            .collect())
    }

    pub fn descriptor(&self, uuid: Uuid) -> Result<Descriptor> {
        let data = self.data()?;
        data.descriptors
            .iter()
            .position(|descriptor| descriptor.uuid == uuid)
            .map(|index| Descriptor::new(self.clone(), index, &data.descriptors[index]))
            .ok_or(Error::AttributeNotFound(uuid))
    }

    /// Read the value from the peripheral.
    pub fn read(&self) -> Result<Vec<u8>> {
        let handle = self.handle;
        let value = self
            .link
            .request(move |radio, address| async move { radio.read(address, handle).await })?;
        *lock(&self.data()?.value) = value.clone();
        Ok(value)
    }

    /// Write `data`, waiting for the peripheral's acknowledgement if
    /// `with_response` is set.
    pub fn write(&self, data: &[u8], with_response: bool) -> Result<()> {
        let handle = self.handle;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let value = data.to_vec();
        self.link.request(move |radio, address| async move {
            radio.write(address, handle, &value, write_type).await
        })?;
        *lock(&self.data()?.value) = data.to_vec();
        Ok(())
    }

    /// Turn notifications on or off. Indication is used for characteristics
    /// that only indicate.
    pub fn set_notify(&self, enabled: bool) -> Result<()> {
        let properties = self.properties;
        let notify = enabled && properties.contains(Properties::NOTIFY);
        let indicate = enabled && !notify && properties.contains(Properties::INDICATE);
        if enabled && !notify && !indicate {
            return Err(Error::InvalidArgument(
                "characteristic neither notifies nor indicates".to_string(),
            ));
        }
        self.set_cccd(notify, indicate)
    }

    /// Write the client configuration: `notify` and `indicate` select the
    /// delivery mode, both off unsubscribes.
    pub fn set_cccd(&self, notify: bool, indicate: bool) -> Result<()> {
        let handle = self.handle;
        let mode = match (notify, indicate) {
            (false, false) => Subscription::Off,
            (true, _) => Subscription::Notify,
            (false, true) => Subscription::Indicate,
        };

        log::debug!("Setting {:?} on handle {} of {}", mode, handle, self.link.address);

        self.link.request(move |radio, address| async move {
            radio.subscribe(address, handle, mode).await
        })?;

        let bits = (notify as u8) | (indicate as u8) << 1;
        if let Some(cccd) = self
            .data()?
            .descriptors
            .iter()
            .find(|descriptor| descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION)
        {
            *lock(&cccd.value) = vec![bits, 0];
        }
        Ok(())
    }

    /// Registers a buffer, subscribing when it is the first one.
    pub(crate) fn attach(&self, sink: Arc<dyn NotifySink>) -> Result<u64> {
        let data = self.data()?;
        if !self.properties.can_notify() {
            return Err(Error::InvalidArgument(
                "characteristic neither notifies nor indicates".to_string(),
            ));
        }

        let first = lock(&data.sinks).is_empty();
        if first {
            self.set_notify(true)?;
        }

        // Teardown drains `sinks`; the state must be checked under its lock.
        let mut sinks = lock(&data.sinks);
        self.link.ensure_connected()?;
        let id = self.link.next_sink_id();
        sinks.push((id, sink));
        Ok(id)
    }

    /// Removes a buffer. With `unsubscribe`, notifications are turned off
    /// once no buffer is left.
    pub(crate) fn detach(&self, id: u64, unsubscribe: bool) -> Result<()> {
        let data = match self.link.discovered() {
            Some(tree) => tree.characteristic(self.service, self.index),
            None => return Ok(()),
        };

        let now_empty = {
            let mut sinks = lock(&data.sinks);
            let before = sinks.len();
            sinks.retain(|(sink, _)| *sink != id);
            before != sinks.len() && sinks.is_empty()
        };

        if unsubscribe && now_empty && self.link.is_connected() {
            self.set_cccd(false, false)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("properties", &self.properties)
            .field("handle", &self.handle)
            .field("address", &self.link.address)
            .finish()
    }
}
