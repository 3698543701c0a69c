//! Raw advertisement capture.
//!
//! With raw HCI access the controller's advertising reports can be read
//! before the OS daemon deduplicates them. The capture tool prints each HCI
//! packet as hex: a first line starting with a direction marker (`>` is
//! controller to host) and continuation lines indented with spaces.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::scan_entry::{ScanEntry, RSSI_UNAVAILABLE};
use crate::{Address, AddressType, Result};

pub const HCI_EVENT_PACKET: u8 = 0x04;
pub const EVT_LE_META_EVENT: u8 = 0x3E;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;

const ADV_SCAN_RSP: u8 = 0x04;

const EXT_ADV_CONNECTABLE: u16 = 0x0001;
const EXT_ADV_SCAN_RESPONSE: u16 = 0x0008;

pub type LineStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// A privileged source of raw HCI traffic in `hcidump --raw` text form.
#[async_trait]
pub trait CaptureSource: Send + Sync + 'static {
    /// Whether capture can be used at all. Called once per adapter.
    async fn probe(&self) -> bool;

    /// Starts capturing. Dropping the stream stops the capture.
    async fn open(&self) -> Result<LineStream>;
}

/// Capture through the BlueZ `hcidump` and `hcitool` utilities.
#[derive(Debug, Default, Clone)]
pub struct Hcidump {
    _private: (),
}

impl Hcidump {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl CaptureSource for Hcidump {
    async fn probe(&self) -> bool {
        use std::process::Stdio;
        use std::time::Duration;
        use tokio::process::Command;

        // A no-op HCI command fails without the raw network capability.
        let status = Command::new("hcitool")
            .args(["cmd", "0x0", "0x0000"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(Duration::from_secs(2), status).await {
            Ok(Ok(status)) => {
                log::debug!("hcitool probe exited with {}", status);
                status.success()
            }
            Ok(Err(e)) => {
                log::debug!("hcitool probe failed: {}", e);
                false
            }
            Err(_) => {
                log::debug!("hcitool probe timed out");
                false
            }
        }
    }

    async fn open(&self) -> Result<LineStream> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::process::Command;
        use tokio_stream::wrappers::LinesStream;

        let mut dump = Command::new("hcidump")
            .args(["--raw", "hci"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = dump
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "hcidump has no stdout"))?;

        // Keeps the controller scanning and reporting duplicates while we listen.
        let scan = Command::new("hcitool")
            .args(["lescan", "--duplicates"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("Started hcidump and hcitool lescan");

        Ok(Box::pin(ChildLines {
            lines: LinesStream::new(BufReader::new(stdout).lines()),
            _children: vec![dump, scan],
        }))
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl CaptureSource for Hcidump {
    async fn probe(&self) -> bool {
        false
    }

    async fn open(&self) -> Result<LineStream> {
        Err(crate::Error::Capability(
            "raw capture needs BlueZ on Linux".to_string(),
        ))
    }
}

/// Line stream that owns the processes producing it.
#[cfg(target_os = "linux")]
struct ChildLines<S> {
    lines: S,
    _children: Vec<tokio::process::Child>,
}

#[cfg(target_os = "linux")]
impl<S> Stream for ChildLines<S>
where
    S: Stream<Item = io::Result<String>> + Unpin,
{
    type Item = io::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.lines).poll_next(cx)
    }
}

/// Groups capture lines into packets. A line not starting with a space opens
/// a new packet. Event packets are complete once their declared parameter
/// length has arrived; anything else is complete when the next packet starts.
#[derive(Debug, Default)]
pub(crate) struct FrameAssembler {
    pending: Vec<String>,
}

impl FrameAssembler {
    pub(crate) fn push(&mut self, line: String) -> Vec<Vec<String>> {
        let mut complete = Vec::new();

        if line.starts_with(' ') {
            if self.pending.is_empty() {
                // Tail of a packet that began before we started reading.
                return complete;
            }
            self.pending.push(line);
        } else {
            if !self.pending.is_empty() {
                complete.push(std::mem::take(&mut self.pending));
            }
            self.pending.push(line);
        }

        if self.pending_is_complete() {
            complete.push(std::mem::take(&mut self.pending));
        }
        complete
    }

    pub(crate) fn finish(&mut self) -> Option<Vec<String>> {
        let complete = std::mem::take(&mut self.pending);
        if complete.is_empty() {
            None
        } else {
            Some(complete)
        }
    }

    fn pending_is_complete(&self) -> bool {
        let header = match self.pending.first().and_then(|line| line.strip_prefix('>')) {
            Some(header) => header,
            None => return false,
        };

        let mut tokens = header.split_whitespace();
        if tokens.next() != Some("04") {
            return false;
        }
        let declared = match tokens.nth(1).and_then(|len| u8::from_str_radix(len, 16).ok()) {
            Some(len) => len as usize,
            None => return false,
        };

        let received = self
            .pending
            .iter()
            .map(|line| line.split_whitespace().count())
            .sum::<usize>();
        // '>' marker, packet indicator, event code and length precede the parameters
        received >= 4 + declared
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("invalid hex byte {0:?}")]
    InvalidHex(String),
    #[error("report truncated")]
    Truncated,
    #[error("{0} reports packed in one event")]
    MultipleReports(u8),
}

/// Parses one captured packet.
///
/// Returns `Ok(None)` for packets that are not advertising reports, for
/// extended reports when `extended` is off, and for reports without RSSI.
pub(crate) fn parse_frame(
    lines: &[String],
    extended: bool,
) -> Result<Option<ScanEntry>, FrameError> {
    let first = match lines.first() {
        Some(first) => first,
        None => return Ok(None),
    };
    let header = match first.strip_prefix('>') {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut bytes = Vec::new();
    for token in std::iter::once(header)
        .chain(lines[1..].iter().map(String::as_str))
        .flat_map(str::split_whitespace)
    {
        let byte =
            u8::from_str_radix(token, 16).map_err(|_| FrameError::InvalidHex(token.to_string()))?;
        bytes.push(byte);
    }

    let entry = match bytes.as_slice() {
        [HCI_EVENT_PACKET, EVT_LE_META_EVENT, _len, subevent, body @ ..] => match *subevent {
            EVT_LE_ADVERTISING_REPORT => parse_legacy_report(body)?,
            EVT_LE_EXTENDED_ADVERTISING_REPORT if extended => parse_extended_report(body)?,
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };

    if entry.rssi == RSSI_UNAVAILABLE {
        return Ok(None);
    }
    Ok(Some(entry))
}

fn parse_legacy_report(body: &[u8]) -> Result<ScanEntry, FrameError> {
    let (&num_reports, report) = body.split_first().ok_or(FrameError::Truncated)?;
    if num_reports != 1 {
        return Err(FrameError::MultipleReports(num_reports));
    }

    // event type, address type, address, data length
    if report.len() < 9 {
        return Err(FrameError::Truncated);
    }
    let event_type = report[0];
    let address = read_address(report[1], &report[2..8]);
    let data_len = report[8] as usize;
    let data = report.get(9..9 + data_len).ok_or(FrameError::Truncated)?;
    let rssi = *report.get(9 + data_len).ok_or(FrameError::Truncated)? as i8;

    Ok(ScanEntry::new(
        address,
        data.to_vec(),
        rssi as i16,
        event_type < 0x02,
        event_type == ADV_SCAN_RSP,
    ))
}

fn parse_extended_report(body: &[u8]) -> Result<ScanEntry, FrameError> {
    let (&num_reports, report) = body.split_first().ok_or(FrameError::Truncated)?;
    if num_reports != 1 {
        return Err(FrameError::MultipleReports(num_reports));
    }

    // event type (2), address type, address (6), primary and secondary PHY,
    // SID, TX power, RSSI, periodic interval (2), direct address type and
    // address (7), data length
    if report.len() < 24 {
        return Err(FrameError::Truncated);
    }
    let event_type = u16::from_le_bytes([report[0], report[1]]);
    let address = read_address(report[2], &report[3..9]);
    let rssi = report[13] as i8;
    let data_len = report[23] as usize;
    let data = report.get(24..24 + data_len).ok_or(FrameError::Truncated)?;

    Ok(ScanEntry::new(
        address,
        data.to_vec(),
        rssi as i16,
        event_type & EXT_ADV_CONNECTABLE != 0,
        event_type & EXT_ADV_SCAN_RESPONSE != 0,
    ))
}

fn read_address(kind: u8, bytes: &[u8]) -> Address {
    let mut address = [0u8; 6];
    address.copy_from_slice(bytes);
    Address::new(address, AddressType::from_hci(kind))
}
