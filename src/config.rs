use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable consulted by [`AdapterConfig::from_env`].
pub const BACKEND_ENV: &str = "BLEIO_BACKEND";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Which advertisement source a scan may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanBackend {
    /// Raw capture when the host grants it, the daemon otherwise.
    #[default]
    Auto,
    /// Always the OS daemon's deduplicated stream.
    Daemon,
    /// Always raw capture; scanning fails if it is unavailable.
    Capture,
}

impl FromStr for ScanBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(ScanBackend::Auto),
            "daemon" | "bleak" => Ok(ScanBackend::Daemon),
            "capture" | "hcitool" => Ok(ScanBackend::Capture),
            other => Err(Error::InvalidArgument(format!(
                "unknown scan backend {:?}, expected auto, daemon or capture",
                other
            ))),
        }
    }
}

/// Settings fixed for the lifetime of an [`Adapter`](crate::Adapter).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Index of the host Bluetooth adapter to use. The first one by default.
    pub(crate) adapter_index: usize,
    /// Advertisement source preference.
    pub(crate) backend: ScanBackend,
    /// Deadline for every GATT request round-trip.
    pub(crate) request_timeout: Duration,
    /// Local name reported by `Adapter::name` until changed.
    pub(crate) name: Option<String>,
    /// Name of the background event thread.
    pub(crate) worker_thread_name: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            backend: ScanBackend::Auto,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            name: None,
            worker_thread_name: "bleio-events".to_string(),
        }
    }
}

impl AdapterConfig {
    /// Default configuration with the backend taken from `BLEIO_BACKEND`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BACKEND_ENV) {
            config.backend = value.parse()?;
        }
        Ok(config)
    }

    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Advertisement source preference
    pub fn backend(mut self, backend: ScanBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Deadline for reads, writes and subscriptions
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Initial local name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Thread name of the background event worker
    pub fn worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }
}
