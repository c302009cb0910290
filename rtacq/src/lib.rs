//! # rtacq
//!
//! Real-time data acquisition over lossy datagram transports.
//!
//! rtacq sits between a network stream of periodic sample datagrams and a
//! deterministic control cycle. A receiver thread validates every packet's
//! sequence and timing and stores usable payloads in preallocated slots; the
//! control cycle picks them up once per cycle without blocking and without
//! allocating.
//!
//! ## Key Properties
//!
//! - No allocation on the data path after construction
//! - Consumer reads never block on the producer
//! - Loss, duplication, rollover, stale and off-period packets are counted
//!   and classified, never fatal
//! - Diagnostics are rate-limited per class
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtacq::{AcquisitionConfig, AcquisitionPipeline, DataStatus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = AcquisitionConfig::receiver("magnetics", 44488, 256);
//! config.max_data_age_us = 2_000;
//!
//! let mut pipeline = AcquisitionPipeline::new(config)?;
//! pipeline.enable_acquisition()?;
//!
//! let mut sample = vec![0u8; 256];
//! let now_us = 1_700_000_000_000_000;
//! match pipeline.get_data(now_us, &mut sample)? {
//!     DataStatus::Ready { timestamp_us } => println!("fresh sample from {timestamp_us}"),
//!     DataStatus::Stale { timestamp_us } => println!("stale sample from {timestamp_us}"),
//!     DataStatus::NotReady => println!("nothing yet"),
//! }
//!
//! println!("{}", serde_json::to_string(&pipeline.counters())?);
//! pipeline.disable_acquisition();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`atomic`]: Atomic word primitives and the core-safety flag
//! - [`spin`]: Busy-wait lock built on those primitives
//! - [`slot`]: Preallocated slot storage
//! - [`ring`]: Three-slot trailing-rotation ring
//! - [`scan`]: Lock/free-scan ring
//! - [`sequence`]: Packet sequence tracking and counters
//! - [`packet`]: Datagram codec
//! - [`transport`]: Datagram source and sink traits, UDP implementations
//! - [`pipeline`]: Receiver thread and control-cycle operations
//! - [`config`]: Module configuration
//! - [`clock`]: Microsecond time sources
//! - [`rt`]: Thread affinity and real-time priority
//! - [`error`]: Error types

pub mod atomic;
pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod ring;
pub mod rt;
pub mod scan;
pub mod sequence;
pub mod slot;
pub mod spin;
pub mod transport;

// Re-export primary API types at crate root for convenience.
pub use config::{AcquisitionConfig, Buffering, ModuleRole, SyncConfig};
pub use error::{AcqError, Result};
pub use pipeline::{AcquisitionPipeline, CounterSnapshot, DataStatus};
pub use sequence::{Classification, PacketSequenceTracker};
