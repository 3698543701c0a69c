use std::fmt;

use uuid::Uuid;

use crate::connection::DescriptorData;
use crate::radio::Handle;
use crate::util::lock;
use crate::{Characteristic, Result};

/// A descriptor of a remote characteristic.
#[derive(Clone)]
pub struct Descriptor {
    characteristic: Characteristic,
    index: usize,
    uuid: Uuid,
    handle: Handle,
}

impl Descriptor {
    pub(crate) fn new(characteristic: Characteristic, index: usize, data: &DescriptorData) -> Self {
        Self {
            characteristic,
            index,
            uuid: data.uuid,
            handle: data.handle,
        }
    }

    fn data(&self) -> Result<&DescriptorData> {
        Ok(&self.characteristic.data()?.descriptors[self.index])
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    /// Last value read or written.
    pub fn value(&self) -> Result<Vec<u8>> {
        Ok(lock(&self.data()?.value).clone())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        let handle = self.handle;
        let value = self.characteristic.link.request(move |radio, address| async move {
            radio.read_descriptor(address, handle).await
        })?;
        *lock(&self.data()?.value) = value.clone();
        Ok(value)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let handle = self.handle;
        let value = data.to_vec();
        self.characteristic.link.request(move |radio, address| async move {
            radio.write_descriptor(address, handle, &value).await
        })?;
        *lock(&self.data()?.value) = data.to_vec();
        Ok(())
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.uuid)
            .field("handle", &self.handle)
            .finish()
    }
}
