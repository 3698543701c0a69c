use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::characteristic::NotifySink;
use crate::util::lock;
use crate::{Characteristic, Error, Result};

pub const DEFAULT_BUFFER_SIZE: usize = 64;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte ring fed by notifications. When full the oldest bytes are
/// overwritten.
struct ByteRing {
    state: Mutex<RingState>,
    readable: Condvar,
}

struct RingState {
    bytes: VecDeque<u8>,
    capacity: usize,
    overflowed: bool,
    closed: bool,
}

impl ByteRing {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                bytes: VecDeque::with_capacity(capacity),
                capacity,
                overflowed: false,
                closed: false,
            }),
            readable: Condvar::new(),
        }
    }

    /// Waits until `ready` holds, the ring closes or `deadline` passes.
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, RingState>,
        deadline: Option<Instant>,
        ready: impl Fn(&RingState) -> bool,
    ) -> MutexGuard<'a, RingState> {
        while !ready(&state) && !state.closed {
            state = match deadline {
                None => self
                    .readable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => {
                        self.readable
                            .wait_timeout(state, remaining)
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .0
                    }
                    _ => break,
                },
            };
        }
        state
    }

    fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        if state.closed && state.bytes.is_empty() {
            return Err(Error::NotConnected);
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = match timeout {
            None => self.wait_until(state, None, |state| !state.bytes.is_empty()),
            Some(_) => self.wait_until(state, deadline, |state| state.bytes.len() >= n),
        };

        let take = n.min(state.bytes.len());
        Ok(state.bytes.drain(..take).collect())
    }

    fn readline(&self, timeout: Duration) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        if state.closed && state.bytes.is_empty() {
            return Err(Error::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.wait_until(state, Some(deadline), |state| {
            state.bytes.contains(&b'\n')
        });

        let take = match state.bytes.iter().position(|byte| *byte == b'\n') {
            Some(newline) => newline + 1,
            None => state.bytes.len(),
        };
        Ok(state.bytes.drain(..take).collect())
    }
}

impl NotifySink for ByteRing {
    fn push(&self, value: &[u8]) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }

        let capacity = state.capacity;
        let incoming = if value.len() > capacity {
            state.overflowed = true;
            state.bytes.clear();
            &value[value.len() - capacity..]
        } else {
            value
        };

        let excess = (state.bytes.len() + incoming.len()).saturating_sub(capacity);
        if excess > 0 {
            state.overflowed = true;
            state.bytes.drain(..excess);
        }
        state.bytes.extend(incoming);
        self.readable.notify_all();
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.readable.notify_all();
    }
}

/// Buffers a characteristic's notifications as a byte stream, like a
/// serial port.
pub struct CharacteristicBuffer {
    characteristic: Characteristic,
    ring: Arc<ByteRing>,
    timeout: Duration,
    sink: Option<u64>,
}

impl CharacteristicBuffer {
    /// Buffers up to `buffer_size` bytes from `characteristic`. `timeout`
    /// bounds [`read`](Self::read), [`readinto`](Self::readinto) and
    /// [`readline`](Self::readline).
    pub fn new(characteristic: &Characteristic, timeout: Duration, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "buffer_size must be at least 1".to_string(),
            ));
        }

        let ring = Arc::new(ByteRing::new(buffer_size));
        let sink = characteristic.attach(ring.clone())?;

        Ok(Self {
            characteristic: characteristic.clone(),
            ring,
            timeout,
            sink: Some(sink),
        })
    }

    /// A 64 byte buffer with a one second timeout.
    pub fn with_defaults(characteristic: &Characteristic) -> Result<Self> {
        Self::new(characteristic, DEFAULT_TIMEOUT, DEFAULT_BUFFER_SIZE)
    }

    /// Reads up to `n` bytes, waiting at most the buffer's timeout for them.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        self.read_timeout(n, Some(self.timeout))
    }

    /// Reads up to `n` bytes. With a timeout, waits for `n` bytes until it
    /// elapses and returns what arrived; a zero timeout never blocks. Without
    /// one, waits for at least one byte.
    ///
    /// If the connection drops while waiting, the bytes received so far are
    /// returned. Later reads drain what is left and then fail with
    /// [`Error::NotConnected`].
    pub fn read_timeout(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.ensure_attached()?;
        self.ring.read(n, timeout)
    }

    /// Fills as much of `destination` as arrives within the timeout.
    pub fn readinto(&self, destination: &mut [u8]) -> Result<usize> {
        let bytes = self.read(destination.len())?;
        destination[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Reads through the next newline, or whatever arrived when the timeout
    /// elapses.
    pub fn readline(&self) -> Result<Vec<u8>> {
        self.ensure_attached()?;
        self.ring.readline(self.timeout)
    }

    /// Bytes available without blocking.
    pub fn in_waiting(&self) -> usize {
        lock(&self.ring.state).bytes.len()
    }

    /// Discards unread bytes.
    pub fn reset_input_buffer(&self) {
        lock(&self.ring.state).bytes.clear();
    }

    /// Whether unread bytes were overwritten.
    pub fn overflowed(&self) -> bool {
        lock(&self.ring.state).overflowed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stops buffering and turns notifications off if no other buffer
    /// listens.
    pub fn deinit(&mut self) -> Result<()> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        self.ring.close();
        lock(&self.ring.state).bytes.clear();
        self.characteristic.detach(sink, true)
    }

    fn ensure_attached(&self) -> Result<()> {
        match self.sink {
            Some(_) => Ok(()),
            None => Err(Error::NotConnected),
        }
    }
}

impl Drop for CharacteristicBuffer {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.ring.close();
            self.characteristic.detach(sink, false).ok();
        }
    }
}
