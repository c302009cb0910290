//! Packet sequence tracking for one datagram stream.
//!
//! [`PacketSequenceTracker::validate`] classifies every arriving packet from
//! its sequence id, its capture timestamp and the local arrival time, and
//! keeps the diagnostic counters the surrounding framework reports.
//!
//! # Classification
//!
//! With `gap = (new_id - last_id) mod 2^sequence_bits`:
//!
//! | condition                            | result     | state      |
//! |--------------------------------------|------------|------------|
//! | first packet of the stream           | `Accepted` | baseline   |
//! | `gap == 0`                           | `Duplicate`| unchanged  |
//! | `gap == 1`                           | `Accepted` | advance    |
//! | `1 < gap <= max_lost_packets`        | `Lost(gap-1)` | advance |
//! | otherwise (including ids behind)     | `Rollover` | new baseline |
//!
//! Sequence-advancing packets are then checked for age (`TooOld`, payload
//! withheld) and, with a declared producer period, for arrival deviation
//! (`Deviant`, payload still delivered). `TooOld` wins over `Deviant`.
//!
//! A `Rollover` packet stays classified as `Rollover` but is still checked
//! for age: a stale one also counts toward `too_old`. It is not measured for
//! deviation, since its arrival starts a new timing baseline.
//!
//! After a `Rollover`, the next `Accepted` packet clears every counter
//! except the rollover and recovery counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Outcome of validating one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classification {
    /// Next in sequence (or first of the stream).
    Accepted,
    /// Same id as the previous packet.
    Duplicate,
    /// Accepted after this many missing packets.
    Lost(u32),
    /// Discontinuity too large to be loss; tracking restarted at this packet.
    Rollover,
    /// Sequence advanced but the capture timestamp exceeds the max data age.
    TooOld,
    /// Arrived outside the tolerance band around the producer period.
    Deviant,
}

impl Classification {
    /// Whether the payload may be handed to the consumer.
    pub fn delivers_payload(self) -> bool {
        matches!(self, Self::Accepted | Self::Lost(_) | Self::Deviant)
    }
}

/// Diagnostic classes rate-limited independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningClass {
    /// Datagram length does not match the configured layout.
    SizeMismatch,
    /// Packet older than the max data age.
    TooOld,
    /// Packets missing from the sequence.
    Lost,
    /// Repeated sequence id.
    Duplicate,
    /// Sequence discontinuity.
    Rollover,
    /// Arrival outside the producer period band.
    Deviation,
    /// No free slot for a received unit.
    LostBuffer,
    /// Transport receive failure.
    Receive,
}

impl WarningClass {
    /// Number of classes.
    pub const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }
}

/// Suppresses repeats of a warning class until an interval has elapsed.
#[derive(Debug, Clone)]
pub struct WarningLimiter {
    interval_us: u64,
    last_emitted_us: [Option<u64>; WarningClass::COUNT],
}

impl WarningLimiter {
    /// Creates a limiter allowing one warning per class per `interval_us`.
    pub fn new(interval_us: u64) -> Self {
        Self {
            interval_us,
            last_emitted_us: [None; WarningClass::COUNT],
        }
    }

    /// Returns whether a warning of `class` may be emitted at `now_us`, and
    /// records the emission if so.
    pub fn should_emit(&mut self, class: WarningClass, now_us: u64) -> bool {
        let slot = &mut self.last_emitted_us[class.index()];
        match *slot {
            Some(last) if now_us.saturating_sub(last) < self.interval_us => false,
            _ => {
                *slot = Some(now_us);
                true
            }
        }
    }
}

/// Counters shared between the receiver (writer) and diagnostics (readers).
///
/// Relaxed atomics: they are never used to order other memory.
#[derive(Debug, Default)]
pub struct SequenceCounters {
    size_mismatch: AtomicU64,
    too_old: AtomicU64,
    lost: AtomicU64,
    duplicate: AtomicU64,
    recovery: AtomicU64,
    rollover: AtomicU64,
    deviation: AtomicU64,
}

impl SequenceCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn clear_streak(&self) {
        for counter in [
            &self.size_mismatch,
            &self.too_old,
            &self.lost,
            &self.duplicate,
            &self.deviation,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> SequenceSnapshot {
        SequenceSnapshot {
            size_mismatch: self.size_mismatch.load(Ordering::Relaxed),
            too_old: self.too_old.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            recovery: self.recovery.load(Ordering::Relaxed),
            rollover: self.rollover.load(Ordering::Relaxed),
            deviation: self.deviation.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SequenceCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceSnapshot {
    /// Datagrams with an unexpected length.
    pub size_mismatch: u64,
    /// Packets withheld for exceeding the max data age.
    pub too_old: u64,
    /// Packets missing from the sequence.
    pub lost: u64,
    /// Repeated packets.
    pub duplicate: u64,
    /// Tracking restarts.
    pub recovery: u64,
    /// Sequence discontinuities.
    pub rollover: u64,
    /// Arrivals outside the producer period band.
    pub deviation: u64,
}

/// Tuning of a [`PacketSequenceTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Largest gap still treated as loss rather than rollover.
    pub max_lost_packets: u32,
    /// Sequence ids wrap at `2^sequence_bits` (1..=32).
    pub sequence_bits: u8,
    /// Max capture-to-arrival age in µs; 0 disables the check.
    pub max_data_age_us: u64,
    /// Declared producer period in µs, if any.
    pub producer_period_us: Option<u64>,
    /// Allowed deviation from the expected interval, percent.
    pub period_tolerance_pct: u32,
    /// Minimum interval between two warnings of one class, µs.
    pub warning_interval_us: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_lost_packets: 10,
            sequence_bits: 32,
            max_data_age_us: 0,
            producer_period_us: None,
            period_tolerance_pct: 25,
            warning_interval_us: 1_000_000,
        }
    }
}

/// Per-stream sequence state machine.
#[derive(Debug)]
pub struct PacketSequenceTracker {
    stream: String,
    config: TrackerConfig,
    mask: u64,
    last_id: Option<u32>,
    last_timestamp_us: u64,
    last_arrival_us: Option<u64>,
    /// Set by a rollover; cleared by the next accepted packet.
    pending_reset: bool,
    counters: Arc<SequenceCounters>,
    limiter: WarningLimiter,
}

impl PacketSequenceTracker {
    /// Creates a tracker for the stream named `stream`.
    ///
    /// # Panics
    ///
    /// Panics if `sequence_bits` is not in `1..=32`.
    pub fn new(stream: impl Into<String>, config: TrackerConfig) -> Self {
        assert!(
            (1..=32).contains(&config.sequence_bits),
            "sequence_bits {} out of range",
            config.sequence_bits
        );
        let mask = (1u64 << config.sequence_bits) - 1;
        let limiter = WarningLimiter::new(config.warning_interval_us);

        Self {
            stream: stream.into(),
            config,
            mask,
            last_id: None,
            last_timestamp_us: 0,
            last_arrival_us: None,
            pending_reset: false,
            counters: Arc::new(SequenceCounters::default()),
            limiter,
        }
    }

    /// The shared counters, for diagnostics readers.
    pub fn counters(&self) -> &Arc<SequenceCounters> {
        &self.counters
    }

    /// Last accepted sequence id.
    pub fn last_id(&self) -> Option<u32> {
        self.last_id
    }

    /// Capture timestamp of the last sequence-advancing packet.
    pub fn last_timestamp_us(&self) -> u64 {
        self.last_timestamp_us
    }

    /// Forgets the baseline; the next packet starts a fresh stream without
    /// counting a rollover. Counters are kept.
    pub fn reset_baseline(&mut self) {
        self.last_id = None;
        self.last_arrival_us = None;
        self.pending_reset = false;
    }

    /// Classifies a packet with id `new_id`, captured at `timestamp_us` and
    /// arriving at `now_us`.
    pub fn validate(&mut self, new_id: u32, timestamp_us: u64, now_us: u64) -> Classification {
        let new_id = u64::from(new_id) & self.mask;
        let gap = self
            .last_id
            .map(|last| new_id.wrapping_sub(u64::from(last)) & self.mask);

        match gap {
            Some(0) => {
                SequenceCounters::add(&self.counters.duplicate, 1);
                self.warn(WarningClass::Duplicate, now_us, new_id, 0);
                return Classification::Duplicate;
            }
            Some(g) if g > 1 && g > u64::from(self.config.max_lost_packets) => {
                self.rollover(new_id, timestamp_us, now_us, g);
                if self.is_too_old(timestamp_us, now_us) {
                    SequenceCounters::add(&self.counters.too_old, 1);
                    self.warn(WarningClass::TooOld, now_us, new_id, g);
                }
                return Classification::Rollover;
            }
            _ => {}
        }

        let steps = gap.unwrap_or(1);
        let mut class = if steps > 1 {
            // steps <= max_lost_packets, so it fits in u32.
            let missing = u32::try_from(steps - 1).unwrap_or(u32::MAX);
            SequenceCounters::add(&self.counters.lost, u64::from(missing));
            self.warn(WarningClass::Lost, now_us, new_id, steps);
            Classification::Lost(missing)
        } else {
            Classification::Accepted
        };

        let deviant = self.is_deviant(steps, now_us);
        self.advance(new_id, timestamp_us, now_us);

        if self.is_too_old(timestamp_us, now_us) {
            SequenceCounters::add(&self.counters.too_old, 1);
            self.warn(WarningClass::TooOld, now_us, new_id, steps);
            class = Classification::TooOld;
        } else if deviant {
            SequenceCounters::add(&self.counters.deviation, 1);
            self.warn(WarningClass::Deviation, now_us, new_id, steps);
            class = Classification::Deviant;
        }

        if class == Classification::Accepted && self.pending_reset {
            self.counters.clear_streak();
            self.pending_reset = false;
            tracing::info!(stream = %self.stream, id = new_id, "sequence recovered");
        }

        class
    }

    /// Counts a datagram whose length does not match the configured layout.
    pub fn record_size_mismatch(&mut self, expected: usize, actual: usize, now_us: u64) {
        SequenceCounters::add(&self.counters.size_mismatch, 1);
        if self.limiter.should_emit(WarningClass::SizeMismatch, now_us) {
            tracing::warn!(
                stream = %self.stream,
                expected,
                actual,
                total = self.counters.size_mismatch.load(Ordering::Relaxed),
                "datagram size mismatch"
            );
        }
    }

    /// Reports a unit dropped for lack of a free slot.
    pub fn note_lost_buffer(&mut self, total: u64, now_us: u64) {
        if self.limiter.should_emit(WarningClass::LostBuffer, now_us) {
            tracing::warn!(stream = %self.stream, total, "no free slot, unit dropped");
        }
    }

    /// Reports a transport receive failure.
    pub fn note_receive_error(&mut self, error: &std::io::Error, now_us: u64) {
        if self.limiter.should_emit(WarningClass::Receive, now_us) {
            tracing::warn!(stream = %self.stream, %error, "datagram receive failed");
        }
    }

    fn rollover(&mut self, new_id: u64, timestamp_us: u64, now_us: u64, gap: u64) {
        SequenceCounters::add(&self.counters.rollover, 1);
        SequenceCounters::add(&self.counters.recovery, 1);
        self.pending_reset = true;
        self.warn(WarningClass::Rollover, now_us, new_id, gap);
        self.advance(new_id, timestamp_us, now_us);
    }

    fn advance(&mut self, new_id: u64, timestamp_us: u64, now_us: u64) {
        // new_id is masked to at most 32 bits.
        self.last_id = u32::try_from(new_id).ok();
        self.last_timestamp_us = timestamp_us;
        self.last_arrival_us = Some(now_us);
    }

    fn is_too_old(&self, timestamp_us: u64, now_us: u64) -> bool {
        self.config.max_data_age_us != 0
            && now_us.saturating_sub(timestamp_us) > self.config.max_data_age_us
    }

    fn is_deviant(&self, steps: u64, now_us: u64) -> bool {
        let (Some(period), Some(last_arrival)) =
            (self.config.producer_period_us, self.last_arrival_us)
        else {
            return false;
        };

        let expected = period.saturating_mul(steps);
        let tolerance = expected.saturating_mul(u64::from(self.config.period_tolerance_pct)) / 100;
        let observed = now_us.saturating_sub(last_arrival);
        observed.abs_diff(expected) > tolerance
    }

    fn warn(&mut self, class: WarningClass, now_us: u64, id: u64, gap: u64) {
        if !self.limiter.should_emit(class, now_us) {
            return;
        }
        let counters = self.counters.snapshot();
        tracing::warn!(
            stream = %self.stream,
            ?class,
            id,
            gap,
            lost = counters.lost,
            duplicate = counters.duplicate,
            rollover = counters.rollover,
            too_old = counters.too_old,
            deviation = counters.deviation,
            "packet sequence anomaly"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_lost: u32) -> PacketSequenceTracker {
        PacketSequenceTracker::new(
            "test",
            TrackerConfig {
                max_lost_packets: max_lost,
                ..TrackerConfig::default()
            },
        )
    }

    #[test]
    fn test_first_packet_is_accepted() {
        let mut t = tracker(5);
        assert_eq!(t.validate(1234, 10, 10), Classification::Accepted);
        assert_eq!(t.last_id(), Some(1234));
        assert_eq!(t.counters().snapshot(), SequenceSnapshot::default());
    }

    #[test]
    fn test_consecutive_ids_are_accepted() {
        let mut t = tracker(5);
        for id in 0..100 {
            assert_eq!(t.validate(id, 1, 1), Classification::Accepted);
        }
        assert_eq!(t.counters().snapshot(), SequenceSnapshot::default());
    }

    #[test]
    fn test_every_tolerated_gap_reports_exact_loss() {
        let max_lost = 8;
        for gap in 2..=max_lost {
            let mut t = tracker(max_lost);
            t.validate(100, 1, 1);
            assert_eq!(t.validate(100 + gap, 1, 1), Classification::Lost(gap - 1));
            assert_eq!(t.counters().snapshot().lost, u64::from(gap - 1));
            assert_eq!(t.last_id(), Some(100 + gap));
        }
    }

    #[test]
    fn test_gap_beyond_limit_is_rollover() {
        let mut t = tracker(5);
        assert_eq!(t.validate(10, 1, 1), Classification::Accepted);
        assert_eq!(t.validate(11, 1, 1), Classification::Accepted);
        assert_eq!(t.validate(17, 1, 1), Classification::Rollover);

        let c = t.counters().snapshot();
        assert_eq!(c.rollover, 1);
        assert_eq!(c.recovery, 1);
        assert_eq!(c.lost, 0);
        assert_eq!(t.last_id(), Some(17));
    }

    #[test]
    fn test_gap_at_limit_is_loss() {
        let mut t = tracker(5);
        t.validate(11, 1, 1);
        assert_eq!(t.validate(16, 1, 1), Classification::Lost(4));
    }

    #[test]
    fn test_repeated_id_counts_each_duplicate() {
        let mut t = tracker(5);
        t.validate(7, 1, 1);
        for n in 1..=3 {
            assert_eq!(t.validate(7, 1, 1), Classification::Duplicate);
            assert_eq!(t.counters().snapshot().duplicate, n);
        }
        assert_eq!(t.validate(8, 1, 1), Classification::Accepted);
    }

    #[test]
    fn test_older_id_is_rollover() {
        let mut t = tracker(5);
        t.validate(50, 1, 1);
        assert_eq!(t.validate(49, 1, 1), Classification::Rollover);
        assert_eq!(t.validate(50, 1, 1), Classification::Accepted);
    }

    #[test]
    fn test_wraparound_at_modulus() {
        let mut t = PacketSequenceTracker::new(
            "wrap",
            TrackerConfig {
                max_lost_packets: 4,
                sequence_bits: 8,
                ..TrackerConfig::default()
            },
        );
        t.validate(254, 1, 1);
        assert_eq!(t.validate(255, 1, 1), Classification::Accepted);
        assert_eq!(t.validate(0, 1, 1), Classification::Accepted);
        assert_eq!(t.validate(3, 1, 1), Classification::Lost(2));
        // Ids above the modulus are reduced.
        assert_eq!(t.validate(260, 1, 1), Classification::Accepted);
        assert_eq!(t.last_id(), Some(4));
    }

    #[test]
    fn test_full_width_wraparound() {
        let mut t = tracker(3);
        t.validate(u32::MAX - 1, 1, 1);
        assert_eq!(t.validate(u32::MAX, 1, 1), Classification::Accepted);
        assert_eq!(t.validate(1, 1, 1), Classification::Lost(1));
    }

    #[test]
    fn test_recovery_resets_streak_counters_only() {
        let mut t = PacketSequenceTracker::new(
            "recover",
            TrackerConfig {
                max_lost_packets: 5,
                producer_period_us: Some(1_000),
                period_tolerance_pct: 10,
                ..TrackerConfig::default()
            },
        );

        t.validate(1, 0, 0);
        t.validate(1, 0, 0); // duplicate
        t.validate(4, 0, 3_000); // lost 2
        t.validate(5, 0, 9_000); // deviant
        t.record_size_mismatch(32, 31, 9_000);
        assert_eq!(t.validate(100, 0, 10_000), Classification::Rollover);

        let before = t.counters().snapshot();
        assert_eq!(before.duplicate, 1);
        assert_eq!(before.lost, 2);
        assert_eq!(before.deviation, 1);
        assert_eq!(before.size_mismatch, 1);
        assert_eq!(before.rollover, 1);
        assert_eq!(before.recovery, 1);

        assert_eq!(t.validate(101, 0, 11_000), Classification::Accepted);
        let after = t.counters().snapshot();
        assert_eq!(after.lost, 0);
        assert_eq!(after.duplicate, 0);
        assert_eq!(after.deviation, 0);
        assert_eq!(after.size_mismatch, 0);
        assert_eq!(after.rollover, 1);
        assert_eq!(after.recovery, 1);
    }

    #[test]
    fn test_loss_after_rollover_keeps_counters_until_accepted() {
        let mut t = tracker(5);
        t.validate(1, 0, 0);
        t.validate(3, 0, 0); // lost 1
        t.validate(50, 0, 0); // rollover
        assert_eq!(t.validate(52, 0, 0), Classification::Lost(1));
        assert_eq!(t.counters().snapshot().lost, 2);
        assert_eq!(t.validate(53, 0, 0), Classification::Accepted);
        assert_eq!(t.counters().snapshot().lost, 0);
    }

    #[test]
    fn test_too_old_advances_sequence() {
        let mut t = PacketSequenceTracker::new(
            "age",
            TrackerConfig {
                max_data_age_us: 500,
                ..TrackerConfig::default()
            },
        );
        assert_eq!(t.validate(1, 1_000, 1_400), Classification::Accepted);
        assert_eq!(t.validate(2, 1_000, 1_600), Classification::TooOld);
        assert!(!Classification::TooOld.delivers_payload());
        assert_eq!(t.last_id(), Some(2));
        assert_eq!(t.validate(3, 1_600, 1_700), Classification::Accepted);
        assert_eq!(t.counters().snapshot().too_old, 1);
    }

    #[test]
    fn test_stale_rollover_counts_too_old() {
        let mut t = PacketSequenceTracker::new(
            "age",
            TrackerConfig {
                max_data_age_us: 100,
                producer_period_us: Some(1_000),
                ..TrackerConfig::default()
            },
        );
        assert_eq!(t.validate(1, 1_000, 1_000), Classification::Accepted);
        assert_eq!(t.validate(500, 0, 10_000), Classification::Rollover);

        let c = t.counters().snapshot();
        assert_eq!(c.rollover, 1);
        assert_eq!(c.too_old, 1);
        assert_eq!(c.deviation, 0);
        assert_eq!(t.last_id(), Some(500));
    }

    #[test]
    fn test_fresh_rollover_is_not_too_old() {
        let mut t = PacketSequenceTracker::new(
            "age",
            TrackerConfig {
                max_data_age_us: 100,
                ..TrackerConfig::default()
            },
        );
        t.validate(1, 1_000, 1_000);
        assert_eq!(t.validate(500, 9_950, 10_000), Classification::Rollover);
        assert_eq!(t.counters().snapshot().too_old, 0);
    }

    #[test]
    fn test_deviation_is_counted_not_rejected() {
        let mut t = PacketSequenceTracker::new(
            "period",
            TrackerConfig {
                producer_period_us: Some(1_000),
                period_tolerance_pct: 20,
                ..TrackerConfig::default()
            },
        );
        assert_eq!(t.validate(1, 0, 10_000), Classification::Accepted);
        assert_eq!(t.validate(2, 0, 11_150), Classification::Accepted);
        assert_eq!(t.validate(3, 0, 11_400), Classification::Deviant);
        assert!(Classification::Deviant.delivers_payload());
        // Two periods expected across one lost packet.
        assert_eq!(t.validate(5, 0, 13_350), Classification::Lost(1));
        assert_eq!(t.counters().snapshot().deviation, 1);
    }

    #[test]
    fn test_reset_baseline_does_not_count_rollover() {
        let mut t = tracker(5);
        t.validate(10, 0, 0);
        t.reset_baseline();
        assert_eq!(t.validate(5_000, 0, 0), Classification::Accepted);
        assert_eq!(t.counters().snapshot().rollover, 0);
    }

    #[test]
    fn test_warning_limiter_per_class() {
        let mut limiter = WarningLimiter::new(1_000_000);
        assert!(limiter.should_emit(WarningClass::Lost, 0));
        assert!(!limiter.should_emit(WarningClass::Lost, 999_999));
        assert!(limiter.should_emit(WarningClass::Duplicate, 10));
        assert!(limiter.should_emit(WarningClass::Lost, 1_000_000));
        assert!(!limiter.should_emit(WarningClass::Lost, 1_500_000));
        assert!(limiter.should_emit(WarningClass::Lost, 2_000_000));
    }
}
