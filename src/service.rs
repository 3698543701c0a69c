use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::connection::{Link, ServiceData};
use crate::{Characteristic, Connection, Error, Result};

/// A service discovered on a connected peripheral.
#[derive(Clone)]
pub struct Service {
    pub(crate) link: Arc<Link>,
    pub(crate) index: usize,
    uuid: Uuid,
    primary: bool,
}

impl Service {
    pub(crate) fn new(link: Arc<Link>, index: usize, data: &ServiceData) -> Self {
        Self {
            link,
            index,
            uuid: data.uuid,
            primary: data.primary,
        }
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// False for services only reachable through another service's include.
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Always true: services are discovered on a remote peripheral.
    #[inline]
    pub fn remote(&self) -> bool {
        true
    }

    pub fn connection(&self) -> Connection {
        Connection::new(self.link.clone())
    }

    pub fn characteristics(&self) -> Result<Vec<Characteristic>> {
        let tree = self.link.tree()?;
        Ok(tree.services[self.index]
            .characteristics
            .iter()
            .enumerate()
            .map(|(index, data)| Characteristic::new(self.link.clone(), self.index, index, data))
            .collect())
    }

    /// The `instance`th characteristic with `uuid` in this service, counting
    /// from zero.
    pub fn characteristic(&self, uuid: Uuid, instance: usize) -> Result<Characteristic> {
        self.characteristics()?
            .into_iter()
            .filter(|characteristic| characteristic.uuid() == uuid)
            .nth(instance)
            .ok_or(Error::AttributeNotFound(uuid))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.uuid)
            .field("primary", &self.primary)
            .field("address", &self.link.address)
            .finish()
    }
}
