//! Error types for the rtacq acquisition layer.
//!
//! Only setup-time faults and per-call contract violations surface as errors.
//! Packet-level anomalies (loss, duplication, rollover, stale or deviant
//! packets, ring exhaustion) are classifications and counters, never errors.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all rtacq operations.
#[derive(Error, Debug)]
pub enum AcqError {
    /// The configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The module could not be set up.
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    /// A consumer read was rejected.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// A transmitter write failed.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// A datagram could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors found while loading or validating an [`AcquisitionConfig`](crate::config::AcquisitionConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Load {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The payload size is zero or not a whole number of 32-bit words
    /// while byte-order normalization is on.
    #[error("invalid payload size {size}: {reason}")]
    InvalidPayloadSize {
        /// The configured payload size in bytes.
        size: usize,
        /// Why the size is rejected.
        reason: String,
    },

    /// The sequence wrap width is out of range.
    #[error("invalid sequence width: {bits} bits (must be 1..=32)")]
    InvalidSequenceBits {
        /// The configured width.
        bits: u8,
    },

    /// The tolerated lost-packet gap cannot be expressed in the sequence space.
    #[error("max_lost_packets {max_lost} must be below the sequence modulus {modulus}")]
    InvalidMaxLost {
        /// The configured gap.
        max_lost: u32,
        /// The sequence modulus.
        modulus: u64,
    },

    /// The destination address of a transmitter is missing or malformed.
    #[error("invalid destination address '{address}'")]
    InvalidAddress {
        /// The address as configured.
        address: String,
    },

    /// A port is missing or zero.
    #[error("invalid port: {reason}")]
    InvalidPort {
        /// Why the port is rejected.
        reason: String,
    },

    /// The buffering section is inconsistent.
    #[error("invalid buffering: {reason}")]
    InvalidBuffering {
        /// Description of the inconsistency.
        reason: String,
    },

    /// The producer period or its tolerance is inconsistent.
    #[error("invalid producer period: {reason}")]
    InvalidPeriod {
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Errors that stop a module from starting.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The slot storage could not be mapped.
    #[error("failed to map {bytes} bytes of slot storage: {source}")]
    SlotStorage {
        /// The requested mapping size.
        bytes: usize,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The transport could not be opened.
    #[error("failed to open transport on {endpoint}: {source}")]
    Transport {
        /// The local or remote endpoint.
        endpoint: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The receiver thread could not be spawned.
    #[error("failed to spawn receiver thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The board direction is already in use.
    #[error("board '{name}' is already in use as {direction}")]
    BoardInUse {
        /// The module name.
        name: String,
        /// `input` or `output`.
        direction: &'static str,
    },

    /// The operation does not match the configured module role.
    #[error("board '{name}' is a {role}, operation requires a {required}")]
    WrongRole {
        /// The module name.
        name: String,
        /// The configured role.
        role: &'static str,
        /// The role the operation needs.
        required: &'static str,
    },

    /// The trailing ring already has a producer.
    #[error("ring producer already claimed")]
    ProducerClaimed,

    /// Acquisition is already running.
    #[error("acquisition already enabled for '{name}'")]
    AlreadyEnabled {
        /// The module name.
        name: String,
    },

    /// The receiver has no datagram source left to run on.
    #[error("no datagram source available for '{name}'")]
    NoSource {
        /// The module name.
        name: String,
    },
}

/// Errors returned by consumer reads.
#[derive(Error, Debug)]
pub enum ReadError {
    /// The caller's buffer does not match the configured unit size.
    #[error("output buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        /// The configured unit size.
        expected: usize,
        /// The caller's buffer size.
        actual: usize,
    },
}

/// Errors returned by transmitter writes.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The caller's buffer does not match the configured payload size.
    #[error("input buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        /// The configured payload size.
        expected: usize,
        /// The caller's buffer size.
        actual: usize,
    },

    /// The transport rejected the datagram.
    #[error("failed to send datagram: {source}")]
    Send {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The transport accepted only part of the datagram.
    #[error("short send: {sent} of {len} bytes")]
    ShortSend {
        /// Bytes actually sent.
        sent: usize,
        /// Datagram length.
        len: usize,
    },
}

/// Errors from the datagram codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The datagram is shorter than a header.
    #[error("datagram of {len} bytes is shorter than the {header} byte header")]
    Truncated {
        /// The datagram length.
        len: usize,
        /// The header length.
        header: usize,
    },

    /// The destination buffer cannot hold the encoded datagram.
    #[error("buffer of {capacity} bytes cannot hold a {needed} byte datagram")]
    BufferTooSmall {
        /// The buffer capacity.
        capacity: usize,
        /// The bytes needed.
        needed: usize,
    },
}

/// Type alias for `Result<T, AcqError>`.
pub type Result<T> = std::result::Result<T, AcqError>;
