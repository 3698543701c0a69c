//! Synchronous, firmware-style BLE central API for host computers.
//!
//! Scripts written against the microcontroller Bluetooth API (`_bleio`) expect
//! blocking calls: scan, connect, read a characteristic, pull bytes out of a
//! notification buffer. This library offers that shape on a desktop host. A
//! background worker owned by the [`Adapter`] talks to the asynchronous radio
//! stack, so callers never drive an event loop themselves.
//!
//! Advertisements come either from the OS Bluetooth daemon, which
//! deduplicates them, or from raw HCI capture through `hcidump` when the
//! host grants that privilege. Raw capture preserves every advertisement and
//! scan response.
//!
//! ## Usage
//!
//! Find a device advertising the Nordic UART service, connect to it and echo
//! what it sends:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bleio_host::common::characteristics::{NORDIC_UART_RX, NORDIC_UART_TX};
//! use bleio_host::{Adapter, AdapterConfig, CharacteristicBuffer, Error, ScanConfig};
//!
//! fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let adapter = Adapter::host(AdapterConfig::from_env()?)?;
//!
//!     // Take the first connectable device in range
//!     let config = ScanConfig::default().stop_after_timeout(Duration::from_secs(10));
//!     let entry = adapter
//!         .start_scan(config)?
//!         .find(|entry| entry.connectable())
//!         .ok_or_else(|| Error::Connection("nothing found".to_string()))?;
//!     adapter.stop_scan()?;
//!
//!     let connection = adapter.connect(entry.address(), Duration::from_secs(5))?;
//!     let tx = connection.characteristic(NORDIC_UART_TX)?;
//!     let rx = connection.characteristic(NORDIC_UART_RX)?;
//!
//!     let buffer = CharacteristicBuffer::with_defaults(&tx)?;
//!     let line = buffer.readline()?;
//!     rx.write(&line, false)?;
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use address::{Address, AddressType};
pub use adapter::{Adapter, AdvertisingConfig};
pub use attribute::{Attribute, Properties};
pub use characteristic::Characteristic;
pub use characteristic_buffer::CharacteristicBuffer;
pub use config::{AdapterConfig, ScanBackend, BACKEND_ENV};
pub use connection::{Connection, ConnectionState};
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use packet_buffer::PacketBuffer;
pub use scan_entry::{ScanEntry, RSSI_UNAVAILABLE};
pub use scanner::{ScanConfig, ScanResults, ScanSource};
pub use service::Service;

mod adapter;
mod address;
mod attribute;
pub mod capture;
mod characteristic;
mod characteristic_buffer;
pub mod common;
mod config;
mod connection;
mod descriptor;
mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod packet_buffer;
pub mod radio;
mod scan_entry;
mod scanner;
mod service;
mod util;
mod worker;
