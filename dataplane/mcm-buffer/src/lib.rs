//! Partition layout and sysdata header for shared dataplane buffers.
//!
//! A buffer handed across the mesh is a single contiguous, 8-byte-aligned
//! region split into three partitions, in this order: `sysdata`, `payload`,
//! `metadata`. `sysdata` always carries a [`BufferSysData`] header so a
//! receiver can locate payload/metadata lengths without external state.

use thiserror::Error;

/// Rounds `n` up to the next multiple of 8, matching the alignment formula
/// used throughout the original connection setup code: `(x + 7) & !7`.
pub const fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer too short: need at least {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
}

/// A single contiguous, 8-byte-aligned region within a shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPartition {
    pub offset: u32,
    pub size: u32,
}

/// The sysdata/payload/metadata layout of one shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPartitions {
    pub sysdata: BufferPartition,
    pub payload: BufferPartition,
    pub metadata: BufferPartition,
}

impl BufferPartitions {
    /// Builds a partition layout for the given (unaligned) payload and
    /// metadata capacities. `sysdata` is sized to the aligned size of
    /// [`BufferSysData`]'s wire encoding.
    pub fn new(payload_size: u32, metadata_size: u32) -> Self {
        let sysdata_size = align8(BufferSysData::WIRE_SIZE as u32);
        let payload_size = align8(payload_size);
        let metadata_size = align8(metadata_size);

        let sysdata = BufferPartition {
            offset: 0,
            size: sysdata_size,
        };
        let payload = BufferPartition {
            offset: sysdata.offset + sysdata.size,
            size: payload_size,
        };
        let metadata = BufferPartition {
            offset: payload.offset + payload.size,
            size: metadata_size,
        };

        Self {
            sysdata,
            payload,
            metadata,
        }
    }

    pub fn total_size(&self) -> u32 {
        self.sysdata.size + self.payload.size + self.metadata.size
    }
}

/// Header written at the start of every shared buffer's `sysdata` partition.
///
/// Wire layout is little-endian and packed regardless of host struct layout:
/// `i64 timestamp_ms, u32 seq, u32 payload_len, u32 metadata_len` (20 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferSysData {
    pub timestamp_ms: i64,
    pub seq: u32,
    pub payload_len: u32,
    pub metadata_len: u32,
}

impl BufferSysData {
    pub const WIRE_SIZE: usize = 8 + 4 + 4 + 4;

    pub fn encode(&self, out: &mut [u8]) -> Result<(), BufferError> {
        if out.len() < Self::WIRE_SIZE {
            return Err(BufferError::TooShort {
                need: Self::WIRE_SIZE,
                have: out.len(),
            });
        }
        out[0..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[8..12].copy_from_slice(&self.seq.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16..20].copy_from_slice(&self.metadata_len.to_le_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, BufferError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(BufferError::TooShort {
                need: Self::WIRE_SIZE,
                have: buf.len(),
            });
        }
        let timestamp_ms = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let seq = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let payload_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let metadata_len = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        Ok(Self {
            timestamp_ms,
            seq,
            payload_len,
            metadata_len,
        })
    }

    /// Clamps lengths decoded off the wire to the partitions they describe,
    /// the way a receiving endpoint must before trusting a peer's header.
    pub fn clamp_to(mut self, parts: &BufferPartitions) -> Self {
        self.payload_len = self.payload_len.min(parts.payload.size);
        self.metadata_len = self.metadata_len.min(parts.metadata.size);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(20), 24);
    }

    #[test]
    fn partitions_are_contiguous_and_aligned() {
        let parts = BufferPartitions::new(5_529_600, 0);
        assert_eq!(parts.sysdata.offset, 0);
        assert_eq!(parts.sysdata.size % 8, 0);
        assert_eq!(parts.payload.offset, parts.sysdata.size);
        assert_eq!(parts.payload.size, 5_529_600);
        assert_eq!(parts.metadata.offset, parts.payload.offset + parts.payload.size);
        assert_eq!(
            parts.total_size(),
            parts.sysdata.size + parts.payload.size + parts.metadata.size
        );
    }

    #[test]
    fn sysdata_round_trips() {
        let sd = BufferSysData {
            timestamp_ms: 123_456_789,
            seq: 42,
            payload_len: 1024,
            metadata_len: 16,
        };
        let mut buf = [0u8; BufferSysData::WIRE_SIZE];
        sd.encode(&mut buf).unwrap();
        assert_eq!(BufferSysData::decode(&buf).unwrap(), sd);
    }

    #[test]
    fn sysdata_encode_rejects_short_buffer() {
        let sd = BufferSysData::default();
        let mut buf = [0u8; 4];
        assert_eq!(
            sd.encode(&mut buf).unwrap_err(),
            BufferError::TooShort {
                need: BufferSysData::WIRE_SIZE,
                have: 4
            }
        );
    }

    #[test]
    fn clamp_caps_oversized_lengths_to_partition_capacity() {
        let parts = BufferPartitions::new(16, 8);
        let sd = BufferSysData {
            payload_len: 9999,
            metadata_len: 9999,
            ..Default::default()
        };
        let clamped = sd.clamp_to(&parts);
        assert_eq!(clamped.payload_len, parts.payload.size);
        assert_eq!(clamped.metadata_len, parts.metadata.size);
    }
}
