//! The acquisition pipeline: one board, one stream.
//!
//! A receiver pipeline owns a dedicated thread that receives datagrams,
//! validates their sequence and stores deliverable payloads in a slot ring.
//! The control cycle reads the ring with [`AcquisitionPipeline::get_data`].
//! A transmitter pipeline frames the control cycle's output with
//! [`AcquisitionPipeline::write_data`] and sends it.
//!
//! # Receiver thread
//!
//! ```text
//! enable_acquisition()
//!   └─ spawn ──▶ pin + raise priority
//!                loop while alive:
//!                  recv (bounded wait) ─▶ length check ─▶ decode header
//!                  ─▶ validate ─▶ [deliverable] store in ring
//!                  ─▶ publish timestamp ─▶ bump generation (wake poll() if waiting)
//! disable_acquisition()
//!   └─ clear alive, join (the in-flight datagram completes)
//! ```
//!
//! Everything the thread needs (transport, tracker, ring producer, scratch
//! buffer) is moved into it on enable and handed back on join, so the
//! pipeline can be enabled again without reallocating.
//!
//! The receiver's data path takes no lock. `poll` callers register as
//! waiters, and only then does a stored datagram touch the condition
//! variable that wakes them.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::atomic::AtomicWord;
use crate::clock::{Clock, SystemClock};
use crate::config::{AcquisitionConfig, Buffering, ModuleRole};
use crate::error::{ReadError, Result, SetupError, WriteError};
use crate::packet::{self, HEADER_SIZE, PacketHeader};
use crate::ring::{TrailingProducer, TrailingRing};
use crate::rt;
use crate::scan::ScanRing;
use crate::sequence::{PacketSequenceTracker, SequenceCounters, SequenceSnapshot};
use crate::transport::{DatagramSink, DatagramSource, UdpSink, UdpSource};

/// Outcome of a consumer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataStatus {
    /// The buffer holds data captured within the max data age of the request.
    Ready {
        /// Capture timestamp of the data, µs.
        timestamp_us: u64,
    },
    /// The buffer holds data older than the max data age.
    Stale {
        /// Capture timestamp of the data, µs.
        timestamp_us: u64,
    },
    /// Nothing to deliver; the buffer is unspecified.
    NotReady,
}

/// Diagnostic counters of one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Sequence tracker counters.
    #[serde(flatten)]
    pub sequence: SequenceSnapshot,
    /// Units dropped because the scan ring had no unlocked slot.
    pub lost_buffers: u64,
    /// Unread units overwritten by newer ones in the scan ring.
    pub overruns: u64,
}

/// Edge-triggered "new data" event for `poll`.
///
/// The generation counts stored datagrams. The mutex and condvar are only
/// touched while a `poll` caller is registered in `waiters`.
#[derive(Debug, Default)]
struct SyncEvent {
    generation: AtomicU64,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SyncEvent {
    fn notify(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // SeqCst pairs with `wait_past`: either the waiter sees the new
        // generation before sleeping or this sees the waiter.
        if self.waiters.load(Ordering::SeqCst) != 0 {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
        }
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Waits until the generation moves past `seen`; returns the new one.
    fn wait_past(&self, seen: u64, timeout: Duration) -> Option<u64> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |_| self.current() == seen)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        let current = self.current();
        (current != seen).then_some(current)
    }
}

/// State shared with the receiver thread.
struct Shared {
    config: AcquisitionConfig,
    clock: Arc<dyn Clock>,
    alive: AtomicU32,
    counters: Arc<SequenceCounters>,
    /// Capture timestamp of the newest stored datagram, 0 before any.
    last_timestamp_us: AtomicU64,
    sync: SyncEvent,
}

/// Producer side of the configured ring.
enum RingWriter {
    Trailing(TrailingProducer),
    Scan(Arc<ScanRing>),
}

/// Consumer side of the configured ring.
enum RingReader {
    Trailing(Arc<TrailingRing>),
    Scan(Arc<ScanRing>),
}

/// Everything the receiver thread owns while running.
struct ReceiverParts {
    source: Box<dyn DatagramSource>,
    tracker: PacketSequenceTracker,
    writer: RingWriter,
    scratch: Vec<u8>,
}

impl ReceiverParts {
    fn run(mut self, shared: &Shared) -> Self {
        let config = &shared.config;
        rt::configure_current_thread(&config.name, config.cpu_mask, config.receiver_priority);
        self.tracker.reset_baseline();
        tracing::info!(stream = %config.name, "receiver started");

        while shared.alive.value() != 0 {
            self.receive_one(shared);
        }

        tracing::info!(stream = %config.name, "receiver stopped");
        self
    }

    fn receive_one(&mut self, shared: &Shared) {
        let config = &shared.config;
        let received = self.source.recv(&mut self.scratch);
        let now_us = shared.clock.now_us();

        let len = match received {
            Ok(Some(len)) => len,
            Ok(None) => return,
            Err(error) => {
                self.tracker.note_receive_error(&error, now_us);
                return;
            }
        };

        // The scratch buffer is one byte longer than a datagram, so an
        // oversized datagram shows up as a length mismatch.
        let expected = config.datagram_size();
        if len != expected {
            self.tracker.record_size_mismatch(expected, len, now_us);
            return;
        }

        let Ok((header, _)) = PacketHeader::decode(&self.scratch[..len]) else {
            return;
        };
        let class = self
            .tracker
            .validate(header.sequence, header.timestamp_us, now_us);
        if !class.delivers_payload() {
            return;
        }

        let payload = &mut self.scratch[HEADER_SIZE..len];
        if config.normalize_byte_order {
            packet::wire_to_host(payload);
        }

        match &mut self.writer {
            RingWriter::Trailing(producer) => {
                producer.publish(payload, header.timestamp_us);
            }
            RingWriter::Scan(ring) => {
                for unit in payload.chunks_exact(config.unit_size()) {
                    match ring.find_next_unlocked_slot() {
                        Some(mut slot) => {
                            slot.write(unit);
                            slot.commit(header.timestamp_us);
                        }
                        None => self.tracker.note_lost_buffer(ring.lost_buffers(), now_us),
                    }
                }
            }
        }

        shared
            .last_timestamp_us
            .store(header.timestamp_us, Ordering::Relaxed);
        if config.sync.is_some() {
            shared.sync.notify();
        }
    }
}

/// Transmit-side state.
struct Transmitter {
    sink: Box<dyn DatagramSink>,
    datagram: Vec<u8>,
    packet_number: u32,
    mask: u64,
}

/// One acquisition board: a receiver or a transmitter.
pub struct AcquisitionPipeline {
    shared: Arc<Shared>,
    reader: Option<RingReader>,
    /// Receiver parts while acquisition is disabled.
    idle: Option<ReceiverParts>,
    worker: Option<JoinHandle<ReceiverParts>>,
    transmitter: Option<Transmitter>,
    last_polled: AtomicU64,
    input_claimed: AtomicU32,
    output_claimed: AtomicU32,
}

impl std::fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("name", &self.shared.config.name)
            .field("role", &self.shared.config.role)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl AcquisitionPipeline {
    /// Builds a pipeline on a UDP transport and the system clock.
    ///
    /// Receivers bind `listen_port`; transmitters connect to `destination`.
    ///
    /// # Errors
    ///
    /// Returns configuration, slot storage or transport errors.
    pub fn new(config: AcquisitionConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        match config.role {
            ModuleRole::Receiver => {
                let port = config.listen_port.unwrap_or_default();
                let source = UdpSource::bind(port, config.recv_timeout())?;
                Self::with_source(config, Box::new(source), clock)
            }
            ModuleRole::Transmitter => {
                let destination = config.destination.clone().unwrap_or_default();
                let sink = UdpSink::connect(&destination)?;
                Self::with_sink(config, Box::new(sink), clock)
            }
        }
    }

    /// Builds a receiver pipeline on an arbitrary datagram source.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] for a transmitter config, and
    /// configuration or slot storage errors.
    pub fn with_source(
        config: AcquisitionConfig,
        source: Box<dyn DatagramSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        require_role(&config, ModuleRole::Receiver)?;

        let (writer, reader) = match config.buffering {
            Buffering::Trailing => {
                let ring = Arc::new(TrailingRing::new(config.payload_size)?);
                let producer = ring.claim_producer()?;
                (RingWriter::Trailing(producer), RingReader::Trailing(ring))
            }
            Buffering::Scan { slots, .. } => {
                let ring = Arc::new(ScanRing::new(slots, config.unit_size())?);
                (RingWriter::Scan(Arc::clone(&ring)), RingReader::Scan(ring))
            }
        };

        let tracker = PacketSequenceTracker::new(config.name.clone(), config.tracker_config());
        let counters = Arc::clone(tracker.counters());
        let parts = ReceiverParts {
            source,
            tracker,
            writer,
            scratch: vec![0u8; config.datagram_size() + 1],
        };

        tracing::info!(
            name = %config.name,
            payload_size = config.payload_size,
            buffering = ?config.buffering,
            "receiver pipeline created"
        );

        Ok(Self {
            shared: Self::shared(config, clock, counters),
            reader: Some(reader),
            idle: Some(parts),
            worker: None,
            transmitter: None,
            last_polled: AtomicU64::new(0),
            input_claimed: AtomicU32::new(0),
            output_claimed: AtomicU32::new(0),
        })
    }

    /// Builds a transmitter pipeline on an arbitrary datagram sink.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] for a receiver config, and
    /// configuration errors.
    pub fn with_sink(
        config: AcquisitionConfig,
        sink: Box<dyn DatagramSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        require_role(&config, ModuleRole::Transmitter)?;

        let transmitter = Transmitter {
            sink,
            datagram: vec![0u8; config.datagram_size()],
            packet_number: 0,
            mask: config.sequence_modulus() - 1,
        };

        tracing::info!(
            name = %config.name,
            destination = ?config.destination,
            payload_size = config.payload_size,
            "transmitter pipeline created"
        );

        Ok(Self {
            shared: Self::shared(config, clock, Arc::default()),
            reader: None,
            idle: None,
            worker: None,
            transmitter: Some(transmitter),
            last_polled: AtomicU64::new(0),
            input_claimed: AtomicU32::new(0),
            output_claimed: AtomicU32::new(0),
        })
    }

    fn shared(
        config: AcquisitionConfig,
        clock: Arc<dyn Clock>,
        counters: Arc<SequenceCounters>,
    ) -> Arc<Shared> {
        Arc::new(Shared {
            config,
            clock,
            alive: AtomicU32::new(0),
            counters,
            last_timestamp_us: AtomicU64::new(0),
            sync: SyncEvent::default(),
        })
    }

    /// The pipeline's configuration.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.shared.config
    }

    /// Whether the receiver thread is running.
    pub fn is_enabled(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts the receiver thread.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a transmitter,
    /// [`SetupError::AlreadyEnabled`] if running, [`SetupError::NoSource`] if
    /// a previous receiver thread died, or [`SetupError::Spawn`].
    pub fn enable_acquisition(&mut self) -> Result<()> {
        require_role(&self.shared.config, ModuleRole::Receiver)?;
        let name = &self.shared.config.name;

        if self.worker.is_some() {
            return Err(SetupError::AlreadyEnabled { name: name.clone() }.into());
        }
        let parts = self
            .idle
            .take()
            .ok_or_else(|| SetupError::NoSource { name: name.clone() })?;

        self.shared.alive.exchange(1);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("rtacq-{name}"))
            .spawn(move || parts.run(&shared));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.alive.exchange(0);
                Err(SetupError::Spawn { source }.into())
            }
        }
    }

    /// Stops the receiver thread and waits for it to finish its current
    /// datagram. Does nothing if acquisition is not running.
    pub fn disable_acquisition(&mut self) {
        self.shared.alive.exchange(0);
        let Some(handle) = self.worker.take() else {
            return;
        };

        match handle.join() {
            Ok(parts) => self.idle = Some(parts),
            Err(_) => {
                tracing::error!(stream = %self.shared.config.name, "receiver thread panicked");
            }
        }
    }

    /// Copies the newest available unit into `out`.
    ///
    /// Never blocks. In trailing mode the trailing slot is always copied and
    /// its age judged against `requested_timestamp_us`. In scan mode the next
    /// unread unit is copied, or `NotReady` returned if none arrived.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a transmitter, or
    /// [`ReadError::BufferSize`] if `out` is not one unit long.
    pub fn get_data(&self, requested_timestamp_us: u64, out: &mut [u8]) -> Result<DataStatus> {
        let config = &self.shared.config;
        require_role(config, ModuleRole::Receiver)?;

        let expected = config.unit_size();
        if out.len() != expected {
            return Err(ReadError::BufferSize {
                expected,
                actual: out.len(),
            }
            .into());
        }

        let timestamp_us = match &self.reader {
            Some(RingReader::Trailing(ring)) => {
                let read = ring.read_into(out);
                if !read.has_data() {
                    return Ok(DataStatus::NotReady);
                }
                read.timestamp_us
            }
            Some(RingReader::Scan(ring)) => match ring.read_next(out) {
                Some(read) => read.timestamp_us,
                None => return Ok(DataStatus::NotReady),
            },
            None => return Ok(DataStatus::NotReady),
        };

        let age = requested_timestamp_us.saturating_sub(timestamp_us);
        if config.max_data_age_us == 0 || age <= config.max_data_age_us {
            Ok(DataStatus::Ready { timestamp_us })
        } else {
            Ok(DataStatus::Stale { timestamp_us })
        }
    }

    /// Frames `buffer` with the next sequence id and `timestamp_us` and sends
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a receiver,
    /// [`WriteError::BufferSize`] if `buffer` is not one payload long, or a
    /// transport failure.
    pub fn write_data(&mut self, timestamp_us: u64, buffer: &[u8]) -> Result<()> {
        let config = &self.shared.config;
        require_role(config, ModuleRole::Transmitter)?;
        let Some(tx) = self.transmitter.as_mut() else {
            return Err(SetupError::NoSource {
                name: config.name.clone(),
            }
            .into());
        };

        if buffer.len() != config.payload_size {
            return Err(WriteError::BufferSize {
                expected: config.payload_size,
                actual: buffer.len(),
            }
            .into());
        }

        #[allow(clippy::cast_possible_truncation)] // sample counters wrap
        let sample_counter = config
            .producer_period_us
            .map_or(0, |period| (timestamp_us / period) as u32);
        let header = PacketHeader {
            sequence: tx.packet_number,
            sample_counter,
            timestamp_us,
        };
        let next = (u64::from(tx.packet_number) + 1) & tx.mask;
        tx.packet_number = u32::try_from(next).unwrap_or(0);

        let len = packet::encode_datagram(
            &header,
            buffer,
            config.normalize_byte_order,
            &mut tx.datagram,
        )?;
        let sent = tx
            .sink
            .send(&tx.datagram[..len])
            .map_err(|source| WriteError::Send { source })?;
        if sent != len {
            return Err(WriteError::ShortSend { sent, len }.into());
        }
        Ok(())
    }

    /// Restarts the outgoing sequence at zero. Receiver state is untouched.
    pub fn pulse_start(&mut self) {
        if let Some(tx) = self.transmitter.as_mut() {
            tx.packet_number = 0;
            tracing::debug!(name = %self.shared.config.name, "outgoing sequence reset");
        }
    }

    /// Next sequence id `write_data` will send, `None` on a receiver.
    pub fn packet_number(&self) -> Option<u32> {
        self.transmitter.as_ref().map(|tx| tx.packet_number)
    }

    /// Waits for new data, at most the configured sync timeout.
    ///
    /// Returns `true` if a datagram was stored since the previous `poll`
    /// (immediately without a `sync` section), `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a transmitter.
    pub fn poll(&self) -> Result<bool> {
        require_role(&self.shared.config, ModuleRole::Receiver)?;
        let Some(sync) = self.shared.config.sync else {
            return Ok(true);
        };

        let seen = self.last_polled.load(Ordering::Acquire);
        let current = self.shared.sync.current();
        let generation = if current == seen {
            self.shared
                .sync
                .wait_past(seen, Duration::from_millis(sync.timeout_ms))
        } else {
            Some(current)
        };

        match generation {
            Some(generation) => {
                self.last_polled.store(generation, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Capture timestamp of the newest stored datagram in µs, or 0 if none
    /// has arrived. Paired with [`poll`](Self::poll), this lets the stream
    /// serve as the time source of the control cycle.
    pub fn usec_time(&self) -> u64 {
        self.shared.last_timestamp_us.load(Ordering::Relaxed)
    }

    /// Marks the board's input as used.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a transmitter or
    /// [`SetupError::BoardInUse`] if already claimed.
    pub fn claim_input(&self) -> Result<()> {
        self.claim(ModuleRole::Receiver, &self.input_claimed, "input")
    }

    /// Marks the board's output as used.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::WrongRole`] on a receiver or
    /// [`SetupError::BoardInUse`] if already claimed.
    pub fn claim_output(&self) -> Result<()> {
        self.claim(ModuleRole::Transmitter, &self.output_claimed, "output")
    }

    /// Releases both claims.
    pub fn release_claims(&self) {
        self.input_claimed.exchange(0);
        self.output_claimed.exchange(0);
    }

    fn claim(&self, role: ModuleRole, flag: &AtomicU32, direction: &'static str) -> Result<()> {
        require_role(&self.shared.config, role)?;
        if flag.test_and_set() {
            Ok(())
        } else {
            Err(SetupError::BoardInUse {
                name: self.shared.config.name.clone(),
                direction,
            }
            .into())
        }
    }

    /// Reads the diagnostic counters.
    pub fn counters(&self) -> CounterSnapshot {
        let (lost_buffers, overruns) = match &self.reader {
            Some(RingReader::Scan(ring)) => (ring.lost_buffers(), ring.overruns()),
            _ => (0, 0),
        };
        CounterSnapshot {
            sequence: self.shared.counters.snapshot(),
            lost_buffers,
            overruns,
        }
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        self.disable_acquisition();
    }
}

fn require_role(config: &AcquisitionConfig, required: ModuleRole) -> Result<()> {
    if config.role == required {
        Ok(())
    } else {
        Err(SetupError::WrongRole {
            name: config.name.clone(),
            role: config.role.as_str(),
            required: required.as_str(),
        }
        .into())
    }
}
