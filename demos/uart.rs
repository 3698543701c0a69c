//! This demo connects to the device given as a command line argument and
//! bridges its Nordic UART service to the terminal: received lines are
//! printed and each line typed on stdin is sent back.

use std::io::BufRead;
use std::time::Duration;

use bleio_host::common::characteristics::{NORDIC_UART_RX, NORDIC_UART_TX};
use bleio_host::{Adapter, AdapterConfig, Address, CharacteristicBuffer, Error};

fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let address: Address = std::env::args()
        .nth(1)
        .ok_or_else(|| Error::InvalidArgument("expected a device address".to_string()))?
        .parse()?;

    let adapter = Adapter::host(AdapterConfig::from_env()?)?;
    let connection = adapter.connect(address, Duration::from_secs(10))?;
    println!("Connected, MTU {}", connection.mtu()?);

    let tx = connection.characteristic(NORDIC_UART_TX)?;
    let rx = connection.characteristic(NORDIC_UART_RX)?;
    let buffer = CharacteristicBuffer::new(&tx, Duration::from_millis(200), 256)?;

    let (lines, input) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            if lines.send(line).is_err() {
                break;
            }
        }
    });

    while connection.connected() {
        let received = match buffer.readline() {
            Ok(received) => received,
            Err(Error::NotConnected) => break,
            Err(e) => return Err(e),
        };
        if !received.is_empty() {
            print!("{}", String::from_utf8_lossy(&received));
        }

        while let Ok(line) = input.try_recv() {
            let packet = format!("{}\n", line).into_bytes();
            for chunk in packet.chunks(connection.max_packet_length()?) {
                rx.write(chunk, false)?;
            }
        }
    }

    println!("Disconnected");
    Ok(())
}
