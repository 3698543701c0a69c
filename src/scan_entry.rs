use std::time::Instant;

use crate::Address;

/// RSSI value meaning "not measured".
pub const RSSI_UNAVAILABLE: i16 = 127;

/// One observed advertisement or scan response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub(crate) address: Address,
    pub(crate) advertisement_bytes: Vec<u8>,
    pub(crate) rssi: i16,
    pub(crate) connectable: bool,
    pub(crate) scan_response: bool,
    pub(crate) timestamp: Instant,
}

impl ScanEntry {
    pub fn new(
        address: Address,
        advertisement_bytes: Vec<u8>,
        rssi: i16,
        connectable: bool,
        scan_response: bool,
    ) -> Self {
        Self {
            address,
            advertisement_bytes,
            rssi,
            connectable,
            scan_response,
            timestamp: Instant::now(),
        }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Raw advertising data: length-prefixed AD structures.
    #[inline]
    pub fn advertisement_bytes(&self) -> &[u8] {
        &self.advertisement_bytes
    }

    /// Signal strength in dBm, or [`RSSI_UNAVAILABLE`].
    #[inline]
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    #[inline]
    pub fn connectable(&self) -> bool {
        self.connectable
    }

    #[inline]
    pub fn scan_response(&self) -> bool {
        self.scan_response
    }

    /// When the observation reached the host.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The AD structures of the payload without their length byte: the AD type
    /// followed by its data. A truncated trailing structure is cut short rather
    /// than dropped.
    pub fn fields(&self) -> Vec<&[u8]> {
        split_length_prefixed(&self.advertisement_bytes)
            .filter(|field| !field.is_empty())
            .collect()
    }

    /// Tests the payload against firmware-style prefixes: a length byte
    /// followed by that many bytes (AD type then data prefix), repeated.
    ///
    /// With `match_all` every prefix must start some field; otherwise any one
    /// suffices. Empty `prefixes` match everything.
    pub fn matches(&self, prefixes: &[u8], match_all: bool) -> bool {
        if prefixes.is_empty() {
            return true;
        }

        let fields = self.fields();
        for prefix in split_length_prefixed(prefixes) {
            let found = fields.iter().any(|field| field.starts_with(prefix));
            if found && !match_all {
                return true;
            }
            if !found && match_all {
                return false;
            }
        }

        match_all
    }
}

/// Iterates length-prefixed chunks, clamping the last one to the input.
fn split_length_prefixed(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        let (&len, tail) = rest.split_first()?;
        let len = (len as usize).min(tail.len());
        let (chunk, remaining) = tail.split_at(len);
        rest = remaining;
        Some(chunk)
    })
}
