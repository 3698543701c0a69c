use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};

use crate::capture::{parse_frame, CaptureSource, FrameAssembler};
use crate::radio::{Radio, RadioEvent, RadioEventKind, ScanParameters};
use crate::util::lock;
use crate::worker::Worker;
use crate::{Address, Error, Result, ScanBackend, ScanEntry};

const MIN_INTERVAL: Duration = Duration::from_micros(2_500);
const MAX_INTERVAL: Duration = Duration::from_micros(40_959_375);

/// Parameters of one scan, validated when the scan starts.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Advertising data prefixes; an advertisement must match at least one.
    prefixes: Vec<u8>,
    /// Accept extended advertising reports as well as legacy ones.
    extended: bool,
    /// Number of unread entries kept before the oldest are dropped.
    buffer_size: usize,
    /// Time between the start of two scan windows.
    interval: Duration,
    /// Time spent listening in each window.
    window: Duration,
    /// Weaker advertisements are ignored.
    minimum_rssi: i16,
    /// Request and report scan responses.
    active: bool,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            extended: false,
            buffer_size: 512,
            interval: Duration::from_millis(100),
            window: Duration::from_millis(100),
            minimum_rssi: -80,
            active: true,
            timeout: None,
        }
    }
}

impl ScanConfig {
    /// Only report advertisements with a field starting with one of the
    /// length-prefixed `prefixes`
    pub fn prefixes(mut self, prefixes: &[u8]) -> Self {
        self.prefixes = prefixes.to_vec();
        self
    }

    /// Also accept extended advertising reports
    pub fn extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Maximum number of unread scan entries
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Interval between scan windows, 2.5 ms to 40.959375 s
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Length of each scan window, at most the interval
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Ignore advertisements weaker than `rssi` dBm
    pub fn minimum_rssi(mut self, rssi: i16) -> Self {
        self.minimum_rssi = rssi;
        self
    }

    /// Whether to request and report scan responses
    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL {
            return Err(Error::InvalidArgument(format!(
                "interval {:?} outside {:?}..={:?}",
                self.interval, MIN_INTERVAL, MAX_INTERVAL
            )));
        }
        if self.window < MIN_INTERVAL || self.window > self.interval {
            return Err(Error::InvalidArgument(format!(
                "window {:?} must be between {:?} and the interval",
                self.window, MIN_INTERVAL
            )));
        }
        Ok(())
    }

    fn parameters(&self) -> ScanParameters {
        ScanParameters {
            interval: self.interval,
            window: self.window,
            active: self.active,
            extended: self.extended,
        }
    }

    fn accepts(&self, entry: &ScanEntry) -> bool {
        if entry.rssi < self.minimum_rssi {
            return false;
        }
        if entry.scan_response && !self.active {
            return false;
        }
        entry.matches(&self.prefixes, false)
    }
}

/// Where a scan session takes its advertisements from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    /// The OS daemon's stream, repeats suppressed.
    Daemon,
    /// Raw controller reports, every one delivered.
    Capture,
}

/// Bounded queue between the event worker and the consumer. When full the
/// oldest unread entry makes room.
pub(crate) struct ScanQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    entries: VecDeque<ScanEntry>,
    capacity: usize,
    dropped: u64,
    malformed: u64,
    closed: bool,
}

impl ScanQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(64)),
                capacity,
                dropped: 0,
                malformed: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Returns false once the queue is closed.
    pub(crate) fn push(&self, entry: ScanEntry) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        if state.entries.len() >= state.capacity {
            state.entries.pop_front();
            state.dropped += 1;
        }
        state.entries.push_back(entry);
        self.available.notify_one();
        true
    }

    pub(crate) fn record_malformed(&self) {
        lock(&self.state).malformed += 1;
    }

    /// Discards unread entries and wakes every waiting consumer.
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.entries.clear();
        self.available.notify_all();
    }

    /// Waits for the next entry until `deadline`. `None` when the deadline
    /// passes or the queue is closed.
    pub(crate) fn pop(&self, deadline: Option<Instant>) -> Option<ScanEntry> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let remaining = deadline.checked_duration_since(Instant::now())?;
                    self.available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub(crate) fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }

    pub(crate) fn malformed(&self) -> u64 {
        lock(&self.state).malformed
    }
}

pub(crate) struct ScanSession {
    id: u64,
    source: ScanSource,
    config: ScanConfig,
    queue: ScanQueue,
    /// Last payload delivered per address, for daemon repeat suppression.
    seen: Mutex<HashMap<Address, Vec<u8>>>,
    capture_stopper: Mutex<Option<Trigger>>,
}

impl ScanSession {
    fn offer(&self, entry: ScanEntry) {
        if !self.config.accepts(&entry) {
            return;
        }

        if self.source == ScanSource::Daemon {
            let mut seen = lock(&self.seen);
            if seen.get(&entry.address) == Some(&entry.advertisement_bytes) {
                return;
            }
            seen.insert(entry.address, entry.advertisement_bytes.clone());
        }

        log::trace!("Scan entry from {} (rssi {})", entry.address, entry.rssi);
        self.queue.push(entry);
    }

    fn close(&self) {
        self.queue.close();
        lock(&self.capture_stopper).take();
    }
}

/// Owns the adapter's scan sessions, at most one at a time.
pub(crate) struct Scanner {
    radio: Arc<dyn Radio>,
    capture: Arc<dyn CaptureSource>,
    backend: ScanBackend,
    /// Probed once, when the scanner is created.
    capture_available: bool,
    worker: Worker,
    current: Mutex<Option<Arc<ScanSession>>>,
    next_id: AtomicU64,
}

impl Scanner {
    /// Creates the scanner, probing for raw capture unless the daemon is forced.
    pub(crate) fn new(
        radio: Arc<dyn Radio>,
        capture: Arc<dyn CaptureSource>,
        backend: ScanBackend,
        worker: Worker,
    ) -> Result<Self> {
        let capture_available = match backend {
            ScanBackend::Daemon => false,
            ScanBackend::Auto | ScanBackend::Capture => {
                let probe = capture.clone();
                worker.run(async move { Ok(probe.probe().await) })?
            }
        };

        log::debug!(
            "Raw capture {}",
            if capture_available {
                "available"
            } else {
                "unavailable"
            }
        );

        Ok(Self {
            radio,
            capture,
            backend,
            capture_available,
            worker,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn select_source(&self) -> Result<ScanSource> {
        match (self.backend, self.capture_available) {
            (ScanBackend::Daemon, _) | (ScanBackend::Auto, false) => Ok(ScanSource::Daemon),
            (ScanBackend::Auto, true) | (ScanBackend::Capture, true) => Ok(ScanSource::Capture),
            (ScanBackend::Capture, false) => Err(Error::Capability(
                "raw capture backend requested but capture is unavailable".to_string(),
            )),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, config: ScanConfig) -> Result<ScanResults> {
        config.validate()?;
        let source = self.select_source()?;

        let session = Arc::new(ScanSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            source,
            queue: ScanQueue::new(config.buffer_size),
            config,
            seen: Mutex::new(HashMap::new()),
            capture_stopper: Mutex::new(None),
        });

        {
            let mut current = lock(&self.current);
            if current.is_some() {
                return Err(Error::Capability("a scan is already in progress".to_string()));
            }
            *current = Some(session.clone());
        }

        if let Err(e) = self.start_source(&session) {
            self.detach(Some(session.id));
            return Err(e);
        }

        if let Some(timeout) = session.config.timeout {
            let scanner = Arc::downgrade(self);
            let id = session.id;
            self.worker.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(scanner) = scanner.upgrade() {
                    if scanner.end(id).await {
                        log::info!("Scan timed out after {:?}", timeout);
                    }
                }
            });
        }

        log::info!("Scan started using the {:?} source", source);

        Ok(ScanResults {
            session,
            scanner: Arc::downgrade(self),
        })
    }

    fn start_source(self: &Arc<Self>, session: &Arc<ScanSession>) -> Result<()> {
        match session.source {
            ScanSource::Daemon => {
                let radio = self.radio.clone();
                let parameters = session.config.parameters();
                self.worker
                    .run(async move { radio.start_scan(&parameters).await })
            }
            ScanSource::Capture => {
                let capture = self.capture.clone();
                let lines = self.worker.run(async move { capture.open().await })?;
                let (stopper, lines) = Valved::new(lines);
                *lock(&session.capture_stopper) = Some(stopper);
                self.worker.spawn(read_capture(
                    Arc::downgrade(self),
                    session.clone(),
                    lines,
                ));
                Ok(())
            }
        }
    }

    /// Delivers a daemon event to the running session, if it wants one.
    pub(crate) fn route(&self, event: &RadioEvent) {
        if let RadioEventKind::Advertisement {
            payload,
            rssi,
            connectable,
            scan_response,
        } = &event.kind
        {
            let session = lock(&self.current).clone();
            if let Some(session) = session.filter(|s| s.source == ScanSource::Daemon) {
                let mut entry = ScanEntry::new(
                    event.address,
                    payload.clone(),
                    *rssi,
                    *connectable,
                    *scan_response,
                );
                entry.timestamp = event.timestamp;
                session.offer(entry);
            }
        }
    }

    /// Clears the session slot if it holds session `id` (or any session when
    /// `id` is `None`) and closes that session.
    fn detach(&self, id: Option<u64>) -> Option<Arc<ScanSession>> {
        let session = {
            let mut current = lock(&self.current);
            let wanted = current
                .as_ref()
                .map_or(false, |session| id.map_or(true, |id| id == session.id));
            if wanted {
                current.take()
            } else {
                None
            }
        }?;
        session.close();
        Some(session)
    }

    /// Ends session `id` from the event worker. Returns whether it was running.
    async fn end(&self, id: u64) -> bool {
        match self.detach(Some(id)) {
            Some(session) => {
                if session.source == ScanSource::Daemon {
                    if let Err(e) = self.radio.stop_scan().await {
                        log::warn!("Failed to stop the daemon scan: {}", e);
                    }
                }
                true
            }
            None => false,
        }
    }

    fn stop_session(&self, id: Option<u64>) -> Result<()> {
        match self.detach(id) {
            Some(session) => {
                log::info!("Scan stopped");
                if session.source == ScanSource::Daemon {
                    let radio = self.radio.clone();
                    self.worker.run(async move { radio.stop_scan().await })?;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Stops whatever scan is running.
    pub(crate) fn stop(&self) -> Result<()> {
        self.stop_session(None)
    }

    pub(crate) fn is_scanning(&self) -> bool {
        lock(&self.current).is_some()
    }
}

type LineStream = Valved<Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>>;

async fn read_capture(scanner: Weak<Scanner>, session: Arc<ScanSession>, mut lines: LineStream) {
    let mut assembler = FrameAssembler::default();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Capture stream failed: {}", e);
                break;
            }
        };

        for frame in assembler.push(line) {
            offer_frame(&session, &frame);
        }
    }

    if session.queue.is_closed() {
        return;
    }

    if let Some(frame) = assembler.finish() {
        offer_frame(&session, &frame);
    }

    log::warn!("Capture ended, stopping the scan");
    if let Some(scanner) = scanner.upgrade() {
        scanner.end(session.id).await;
    }
}

fn offer_frame(session: &ScanSession, frame: &[String]) {
    match parse_frame(frame, session.config.extended) {
        Ok(Some(entry)) => session.offer(entry),
        Ok(None) => {}
        Err(e) => {
            log::debug!("Discarding capture frame: {}", e);
            session.queue.record_malformed();
        }
    }
}

/// Scan results, in arrival order.
///
/// Iteration blocks until the next entry arrives and ends once the scan is
/// stopped, times out or its source fails. Dropping the results stops the
/// scan.
pub struct ScanResults {
    session: Arc<ScanSession>,
    scanner: Weak<Scanner>,
}

impl ScanResults {
    /// Waits at most `timeout` for the next entry. `None` does not mean the
    /// scan is over; see [`is_active`](Self::is_active).
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ScanEntry> {
        self.session.queue.pop(Some(Instant::now() + timeout))
    }

    /// Whether the session can still deliver entries.
    pub fn is_active(&self) -> bool {
        !self.session.queue.is_closed()
    }

    pub fn source(&self) -> ScanSource {
        self.session.source
    }

    /// Entries evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.session.queue.dropped()
    }

    /// Capture frames that could not be parsed.
    pub fn malformed_frames(&self) -> u64 {
        self.session.queue.malformed()
    }
}

impl Iterator for ScanResults {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        self.session.queue.pop(None)
    }
}

impl Drop for ScanResults {
    fn drop(&mut self) {
        if let Some(scanner) = self.scanner.upgrade() {
            if let Err(e) = scanner.stop_session(Some(self.session.id)) {
                log::debug!("Failed to stop scan on drop: {}", e);
            }
        }
    }
}
