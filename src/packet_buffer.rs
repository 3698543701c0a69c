use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::characteristic::NotifySink;
use crate::util::lock;
use crate::{Characteristic, Error, Properties, Result};

/// Fixed-depth packet queue. When full, incoming packets are dropped and the
/// overflow flag stays set.
struct PacketQueue {
    state: Mutex<PacketState>,
}

struct PacketState {
    packets: VecDeque<Vec<u8>>,
    capacity: usize,
    overflowed: bool,
    closed: bool,
}

impl PacketQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PacketState {
                packets: VecDeque::with_capacity(capacity),
                capacity,
                overflowed: false,
                closed: false,
            }),
        }
    }

    fn pop_into(&self, destination: &mut [u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        let len = match state.packets.front() {
            Some(packet) if packet.len() > destination.len() => {
                return Err(Error::BufferTooSmall {
                    packet: packet.len(),
                    buffer: destination.len(),
                });
            }
            Some(packet) => packet.len(),
            None if state.closed => return Err(Error::NotConnected),
            None => return Ok(0),
        };

        if let Some(packet) = state.packets.pop_front() {
            destination[..len].copy_from_slice(&packet);
        }
        Ok(len)
    }
}

impl NotifySink for PacketQueue {
    fn push(&self, value: &[u8]) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if state.packets.len() >= state.capacity {
            if !state.overflowed {
                log::debug!("Packet buffer full, dropping incoming packets");
            }
            state.overflowed = true;
            return;
        }
        state.packets.push_back(value.to_vec());
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

/// Queues a characteristic's notifications as discrete packets, each one
/// read whole.
///
/// Packets stay in arrival order and are never split or merged. An optional
/// outgoing characteristic makes the buffer writable.
pub struct PacketBuffer {
    characteristic: Characteristic,
    outgoing: Option<Characteristic>,
    queue: Arc<PacketQueue>,
    sink: Option<u64>,
}

impl PacketBuffer {
    /// Buffers up to `buffer_size` packets from `characteristic`, which must
    /// notify or indicate.
    pub fn new(characteristic: &Characteristic, buffer_size: usize) -> Result<Self> {
        Self::create(characteristic, None, buffer_size)
    }

    /// Like [`new`](Self::new), writing through `outgoing`.
    pub fn with_outgoing(
        characteristic: &Characteristic,
        outgoing: &Characteristic,
        buffer_size: usize,
    ) -> Result<Self> {
        if !outgoing.properties().can_write() {
            return Err(Error::InvalidArgument(
                "outgoing characteristic is not writable".to_string(),
            ));
        }
        Self::create(characteristic, Some(outgoing.clone()), buffer_size)
    }

    fn create(
        characteristic: &Characteristic,
        outgoing: Option<Characteristic>,
        buffer_size: usize,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "buffer_size must be at least 1".to_string(),
            ));
        }

        let queue = Arc::new(PacketQueue::new(buffer_size));
        let sink = characteristic.attach(queue.clone())?;

        Ok(Self {
            characteristic: characteristic.clone(),
            outgoing,
            queue,
            sink: Some(sink),
        })
    }

    /// Moves the oldest packet into `destination` and returns its length, or
    /// 0 when nothing is queued. A packet that does not fit stays queued and
    /// [`Error::BufferTooSmall`] is returned.
    pub fn readinto(&self, destination: &mut [u8]) -> Result<usize> {
        if self.sink.is_none() {
            return Err(Error::NotConnected);
        }
        self.queue.pop_into(destination)
    }

    /// Sends `header` followed by `data` as one packet. Returns the number of
    /// bytes sent.
    pub fn write(&self, data: &[u8], header: &[u8]) -> Result<usize> {
        let outgoing = self.outgoing.as_ref().ok_or_else(|| {
            Error::Capability("packet buffer has no outgoing characteristic".to_string())
        })?;

        let limit = self.outgoing_packet_length()?;
        let len = header.len() + data.len();
        if len > limit {
            return Err(Error::InvalidArgument(format!(
                "packet of {} bytes exceeds the outgoing limit of {}",
                len, limit
            )));
        }

        let mut packet = Vec::with_capacity(len);
        packet.extend_from_slice(header);
        packet.extend_from_slice(data);

        let with_response = outgoing.properties().contains(Properties::WRITE);
        outgoing.write(&packet, with_response)?;
        Ok(len)
    }

    /// Whether an incoming packet was dropped because the buffer was full.
    pub fn overflowed(&self) -> bool {
        lock(&self.queue.state).overflowed
    }

    /// Number of packets waiting to be read.
    pub fn packets_waiting(&self) -> usize {
        lock(&self.queue.state).packets.len()
    }

    /// Largest packet this buffer can receive.
    pub fn incoming_packet_length(&self) -> Result<usize> {
        self.characteristic.link.ensure_connected()?;
        Ok(self.characteristic.link.max_packet_length())
    }

    /// Largest packet [`write`](Self::write) accepts.
    pub fn outgoing_packet_length(&self) -> Result<usize> {
        let outgoing = self.outgoing.as_ref().ok_or_else(|| {
            Error::Capability("packet buffer has no outgoing characteristic".to_string())
        })?;
        outgoing.link.ensure_connected()?;
        Ok(outgoing.link.max_packet_length())
    }

    /// Same as [`incoming_packet_length`](Self::incoming_packet_length).
    pub fn packet_size(&self) -> Result<usize> {
        self.incoming_packet_length()
    }

    /// Stops buffering and turns notifications off if no other buffer
    /// listens. Queued packets are discarded.
    pub fn deinit(&mut self) -> Result<()> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        {
            let mut state = lock(&self.queue.state);
            state.closed = true;
            state.packets.clear();
        }
        self.characteristic.detach(sink, true)
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.characteristic.detach(sink, false).ok();
        }
    }
}
