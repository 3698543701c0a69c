use btleplug::api::CharPropFlags;

/// Security mode required to read or write an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Attribute {
    NoAccess = 0x00,
    Open = 0x11,
    EncryptNoMitm = 0x21,
    EncryptWithMitm = 0x31,
    LescEncryptWithMitm = 0x41,
    SignedNoMitm = 0x12,
    SignedWithMitm = 0x22,
}

bitflags::bitflags! {
    /// Characteristic property flags, using the firmware's bit values.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const INDICATE = 0x02;
        const NOTIFY = 0x04;
        const READ = 0x08;
        const WRITE = 0x10;
        const WRITE_NO_RESPONSE = 0x20;
    }
}

impl Properties {
    pub(crate) fn can_notify(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    pub(crate) fn can_write(self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_NO_RESPONSE)
    }
}

// btleplug numbers the flags in GATT declaration order, which differs from
// the firmware layout, so each bit is translated by name.
impl From<CharPropFlags> for Properties {
    fn from(flags: CharPropFlags) -> Self {
        flags
            .iter_names()
            .filter_map(|(name, _)| match name {
                "WRITE_WITHOUT_RESPONSE" => Some(Properties::WRITE_NO_RESPONSE),
                name => Properties::from_name(name),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_btleplug_flags() {
        let properties = Properties::from(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert!(properties.contains(Properties::READ));
        assert!(properties.contains(Properties::NOTIFY));
        assert!(!properties.contains(Properties::WRITE));
        assert_eq!(properties.bits(), 0x0c);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let properties = Properties::from_bits_truncate(0xc4);
        assert_eq!(properties, Properties::NOTIFY);
        assert!(properties.can_notify());
        assert!(!properties.can_write());
    }

    #[test]
    fn write_without_response_maps_by_name() {
        let properties = Properties::from(
            CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::INDICATE | CharPropFlags::BROADCAST,
        );
        assert_eq!(
            properties,
            Properties::WRITE_NO_RESPONSE | Properties::INDICATE | Properties::BROADCAST
        );
    }
}
