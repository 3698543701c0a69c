#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bleio_host::common::characteristics::{BATTERY_LEVEL, NORDIC_UART_RX, NORDIC_UART_TX};
use bleio_host::common::services::{BATTERY, NORDIC_UART};
use bleio_host::mock::{MockCapture, MockPeripheral, MockRadio};
use bleio_host::radio::{
    AdvertisingParameters, EventStream, Handle, Radio, RemoteService, ScanParameters,
    Subscription, WriteType,
};
use bleio_host::{Adapter, AdapterConfig, Address, Properties, Result};

pub fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

pub fn address(text: &str) -> Address {
    text.parse().unwrap()
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn adapter(radio: &MockRadio, capture: &MockCapture) -> Adapter {
    adapter_over(radio.clone(), capture)
}

pub fn adapter_over(radio: impl Radio, capture: &MockCapture) -> Adapter {
    init_logger();
    let config = AdapterConfig::default().request_timeout(Duration::from_secs(2));
    Adapter::new(radio, capture.clone(), config).unwrap()
}

/// A UART bridge that also reports a battery level.
pub fn uart_peripheral(address: Address) -> MockPeripheral {
    MockPeripheral::new(address)
        .mtu(64)
        .service(
            NORDIC_UART,
            &[
                (NORDIC_UART_TX, Properties::NOTIFY),
                (
                    NORDIC_UART_RX,
                    Properties::WRITE | Properties::WRITE_NO_RESPONSE,
                ),
            ],
        )
        .service(BATTERY, &[(BATTERY_LEVEL, Properties::READ | Properties::NOTIFY)])
        .value(BATTERY_LEVEL, &[87])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Discover,
    Subscribe,
}

/// A [`MockRadio`] whose peer drops the link once, right after `step`
/// succeeds, and stays quiet long enough for the disconnect to be dispatched
/// before the step returns.
#[derive(Clone)]
pub struct DroppingRadio {
    inner: MockRadio,
    step: Step,
    armed: Arc<AtomicBool>,
}

impl DroppingRadio {
    pub fn new(inner: MockRadio, step: Step) -> Self {
        Self {
            inner,
            step,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    async fn after(&self, step: Step, address: Address) {
        if step == self.step && self.armed.swap(false, Ordering::SeqCst) {
            self.inner.drop_link(address);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl Radio for DroppingRadio {
    async fn events(&self) -> Result<EventStream> {
        self.inner.events().await
    }

    async fn local_address(&self) -> Option<Address> {
        self.inner.local_address().await
    }

    async fn local_name(&self) -> Option<String> {
        self.inner.local_name().await
    }

    async fn set_powered(&self, powered: bool) -> Result<()> {
        self.inner.set_powered(powered).await
    }

    async fn start_scan(&self, parameters: &ScanParameters) -> Result<()> {
        self.inner.start_scan(parameters).await
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.stop_scan().await
    }

    async fn start_advertising(&self, parameters: &AdvertisingParameters) -> Result<()> {
        self.inner.start_advertising(parameters).await
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.inner.stop_advertising().await
    }

    async fn connect(&self, address: Address) -> Result<()> {
        self.inner.connect(address).await
    }

    async fn disconnect(&self, address: Address) -> Result<()> {
        self.inner.disconnect(address).await
    }

    async fn discover(&self, address: Address) -> Result<Vec<RemoteService>> {
        let services = self.inner.discover(address).await?;
        self.after(Step::Discover, address).await;
        Ok(services)
    }

    async fn mtu(&self, address: Address) -> Result<u16> {
        self.inner.mtu(address).await
    }

    async fn rssi(&self, address: Address) -> Result<i16> {
        self.inner.rssi(address).await
    }

    async fn pair(&self, address: Address, bond: bool) -> Result<()> {
        self.inner.pair(address, bond).await
    }

    async fn read(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        self.inner.read(address, handle).await
    }

    async fn write(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.inner.write(address, handle, value, write_type).await
    }

    async fn subscribe(
        &self,
        address: Address,
        handle: Handle,
        mode: Subscription,
    ) -> Result<()> {
        self.inner.subscribe(address, handle, mode).await?;
        self.after(Step::Subscribe, address).await;
        Ok(())
    }

    async fn read_descriptor(&self, address: Address, handle: Handle) -> Result<Vec<u8>> {
        self.inner.read_descriptor(address, handle).await
    }

    async fn write_descriptor(
        &self,
        address: Address,
        handle: Handle,
        value: &[u8],
    ) -> Result<()> {
        self.inner.write_descriptor(address, handle, value).await
    }
}
