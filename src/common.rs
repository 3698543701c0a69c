use uuid::Uuid;

const BASE_UUID_SUFFIX: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Returns the 16-bit alias of `uuid` if it lives in the Bluetooth base range.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & 0xffff_0000_ffff_ffff_ffff_ffff_ffff_ffff == BASE_UUID_SUFFIX {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

pub mod services {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const GENERIC_ACCESS: Uuid = uuid_from_u16(0x1800);
    pub const BATTERY: Uuid = uuid_from_u16(0x180F);
    pub const HEART_RATE: Uuid = uuid_from_u16(0x180D);
    /// Nordic UART service, the usual partner of a `CharacteristicBuffer`.
    pub const NORDIC_UART: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
}

pub mod characteristics {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const DEVICE_NAME: Uuid = uuid_from_u16(0x2A00);
    pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
    pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
    pub const NORDIC_UART_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    pub const NORDIC_UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
}

pub mod descriptors {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);
    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = uuid_from_u16(0x2901);
}
