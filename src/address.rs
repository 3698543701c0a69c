use std::fmt;
use std::str::FromStr;

use btleplug::api::{AddressType as BtleAddressType, BDAddr};

use crate::Error;

/// Kind of a Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

impl AddressType {
    /// Maps the HCI address type byte. Types 2 and 3 are resolved identities of
    /// a public or random static address, hence the modulo.
    pub fn from_hci(value: u8) -> Self {
        if value % 2 == 0 {
            AddressType::Public
        } else {
            AddressType::RandomStatic
        }
    }
}

/// A device address, stored least significant byte first as it appears on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    bytes: [u8; 6],
    kind: AddressType,
}

impl Address {
    pub fn new(bytes: [u8; 6], kind: AddressType) -> Self {
        Self { bytes, kind }
    }

    /// Address bytes, least significant first.
    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.bytes
    }

    #[inline]
    pub fn kind(&self) -> AddressType {
        self.kind
    }

    pub(crate) fn from_btleplug(addr: BDAddr, kind: Option<BtleAddressType>) -> Self {
        let mut bytes = addr.into_inner();
        bytes.reverse();
        let kind = match kind {
            Some(BtleAddressType::Public) => AddressType::Public,
            _ => AddressType::RandomStatic,
        };
        Self { bytes, kind }
    }

    pub(crate) fn to_btleplug(self) -> BDAddr {
        let mut bytes = self.bytes;
        bytes.reverse();
        BDAddr::from(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parses `xx:xx:xx:xx:xx:xx` (or `-` separated), most significant byte
    /// first. The address type defaults to random static.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidArgument(format!("malformed address {:?}", s));

        let parts = s.split(|c| c == ':' || c == '-').collect::<Vec<_>>();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(invalid());
            }
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        Ok(Self::new(bytes, AddressType::RandomStatic))
    }
}
