//! This demo scans for ten seconds and prints every advertisement it sees.
//! Set BLEIO_BACKEND=capture to require raw capture (needs root) or
//! BLEIO_BACKEND=daemon to force the deduplicated daemon stream.

use std::time::Duration;

use bleio_host::{Adapter, AdapterConfig, Error, ScanConfig};

fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let adapter = Adapter::host(AdapterConfig::from_env()?)?;
    println!("Adapter {} ({:?})", adapter.name(), adapter.address());

    let config = ScanConfig::default()
        .minimum_rssi(-100)
        .stop_after_timeout(Duration::from_secs(10));

    let mut results = adapter.start_scan(config)?;
    println!("Scanning using {:?}", results.source());

    for entry in &mut results {
        println!(
            "{} rssi={} connectable={} response={} {:02x?}",
            entry.address(),
            entry.rssi(),
            entry.connectable(),
            entry.scan_response(),
            entry.advertisement_bytes()
        );
    }

    println!(
        "Done, {} entries dropped, {} malformed frames",
        results.dropped(),
        results.malformed_frames()
    );

    Ok(())
}
