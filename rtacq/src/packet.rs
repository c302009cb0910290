//! Datagram codec.
//!
//! # Wire format
//!
//! ```text
//! +----------------+--------------------+-----------------+-------------+
//! | sequence id(4) | sample counter (4) | timestamp us(8) | payload (P) |
//! +----------------+--------------------+-----------------+-------------+
//! ```
//!
//! Header fields are big-endian. With byte-order normalization on, the
//! payload is a sequence of big-endian 32-bit words; otherwise it is sent in
//! host order as produced.

use byteorder::{BigEndian, ByteOrder, NativeEndian, ReadBytesExt};

use crate::error::CodecError;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Logical header of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Per-stream sequence id.
    pub sequence: u32,
    /// Producer sample counter.
    pub sample_counter: u32,
    /// Capture timestamp in µs.
    pub timestamp_us: u64,
}

impl PacketHeader {
    /// Writes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferTooSmall`] if `buf` is shorter than a header.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        let capacity = buf.len();
        let header = buf.get_mut(..HEADER_SIZE).ok_or(CodecError::BufferTooSmall {
            capacity,
            needed: HEADER_SIZE,
        })?;
        BigEndian::write_u32(&mut header[0..4], self.sequence);
        BigEndian::write_u32(&mut header[4..8], self.sample_counter);
        BigEndian::write_u64(&mut header[8..16], self.timestamp_us);
        Ok(())
    }

    /// Reads a header from the front of `datagram`, returning it with the
    /// remaining payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if `datagram` is shorter than a header.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        if datagram.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                len: datagram.len(),
                header: HEADER_SIZE,
            });
        }
        let (mut r, payload) = datagram.split_at(HEADER_SIZE);
        let truncated = |_| CodecError::Truncated {
            len: datagram.len(),
            header: HEADER_SIZE,
        };

        let header = Self {
            sequence: r.read_u32::<BigEndian>().map_err(truncated)?,
            sample_counter: r.read_u32::<BigEndian>().map_err(truncated)?,
            timestamp_us: r.read_u64::<BigEndian>().map_err(truncated)?,
        };
        Ok((header, payload))
    }
}

/// Encodes `header` and `payload` into `out`, returning the datagram length.
///
/// With `normalize` set, 32-bit payload words are converted from host order
/// to big-endian while copying. Trailing bytes that do not form a whole word
/// are copied unchanged.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] if `out` cannot hold the datagram.
pub fn encode_datagram(
    header: &PacketHeader,
    payload: &[u8],
    normalize: bool,
    out: &mut [u8],
) -> Result<usize, CodecError> {
    let needed = HEADER_SIZE + payload.len();
    if out.len() < needed {
        return Err(CodecError::BufferTooSmall {
            capacity: out.len(),
            needed,
        });
    }

    header.encode(out)?;
    let body = &mut out[HEADER_SIZE..needed];
    body.copy_from_slice(payload);
    if normalize {
        host_to_wire(body);
    }
    Ok(needed)
}

/// Converts 32-bit words in `buf` from host order to big-endian in place.
pub fn host_to_wire(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(4) {
        let value = NativeEndian::read_u32(word);
        BigEndian::write_u32(word, value);
    }
}

/// Converts 32-bit words in `buf` from big-endian to host order in place.
pub fn wire_to_host(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(4) {
        let value = BigEndian::read_u32(word);
        NativeEndian::write_u32(word, value);
    }
}
