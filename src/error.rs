use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the adapter, scanner, connections and attribute handles.
///
/// Buffer overflow is not an error: both buffers expose it as a flag so that a
/// streaming reader is never interrupted.
#[derive(Debug, Error)]
pub enum Error {
    /// A required privilege or resource is unavailable, or a second scan or
    /// advertisement was requested while one is active.
    #[error("capability unavailable: {0}")]
    Capability(String),

    /// Link establishment failed or timed out.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection behind this handle is gone.
    #[error("not connected")]
    NotConnected,

    #[error("attribute not found: {0}")]
    AttributeNotFound(Uuid),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The next queued packet does not fit in the destination.
    #[error("packet of {packet} bytes does not fit in a {buffer} byte buffer")]
    BufferTooSmall { packet: usize, buffer: usize },

    #[error("bluetooth error: {0}")]
    Bluetooth(#[source] btleplug::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Error::NotConnected,
            btleplug::Error::TimedOut(duration) => Error::Timeout(duration),
            btleplug::Error::PermissionDenied => {
                Error::Capability("permission denied by the bluetooth stack".to_string())
            }
            btleplug::Error::NotSupported(what) => Error::NotSupported(what),
            btleplug::Error::DeviceNotFound => Error::Connection("device not found".to_string()),
            other => Error::Bluetooth(other),
        }
    }
}
