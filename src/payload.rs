//! Load-test message bodies.
//!
//! Every message starts with a fixed header carrying the producer index, a
//! per-worker sequence number, the publish timestamp and the declared total
//! size, followed by filler up to the configured message size. Consumers
//! decode the header to check that what arrived is what was sent.

use crate::error::{LoadGenError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAGIC: &[u8; 4] = b"RMQL";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub producer_index: u32,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub size: u32,
}

impl PayloadHeader {
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(LoadGenError::InvalidPayload(format!(
                "payload of {} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_LEN
            )));
        }
        if &data[..4] != MAGIC {
            return Err(LoadGenError::InvalidPayload("bad magic".to_string()));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != VERSION {
            return Err(LoadGenError::InvalidPayload(format!(
                "unsupported payload version {}",
                version
            )));
        }
        data.advance(3);
        Ok(Self {
            producer_index: data.get_u32(),
            sequence: data.get_u64(),
            timestamp_us: data.get_u64(),
            size: data.get_u32(),
        })
    }

    /// Microseconds between publish and `now_us`, zero if clocks disagree
    pub fn latency_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.timestamp_us)
    }
}

/// Builds fixed-size payloads for one producer worker
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    producer_index: u32,
    size: usize,
    filler: Bytes,
}

impl PayloadBuilder {
    pub fn new(producer_index: usize, size: usize) -> Result<Self> {
        if size < HEADER_LEN {
            return Err(LoadGenError::InvalidConfig(format!(
                "message size {} is smaller than the {} byte header",
                size, HEADER_LEN
            )));
        }
        if size > u32::MAX as usize {
            return Err(LoadGenError::InvalidConfig(format!(
                "message size {} exceeds {}",
                size,
                u32::MAX
            )));
        }
        let filler: Vec<u8> = (0..size - HEADER_LEN)
            .map(|i| b'A' + (i % 26) as u8)
            .collect();
        Ok(Self {
            producer_index: producer_index as u32,
            size,
            filler: Bytes::from(filler),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn build(&self, sequence: u64) -> Bytes {
        self.build_at(sequence, now_micros())
    }

    pub fn build_at(&self, sequence: u64, timestamp_us: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_bytes(0, 3);
        buf.put_u32(self.producer_index);
        buf.put_u64(sequence);
        buf.put_u64(timestamp_us);
        buf.put_u32(self.size as u32);
        buf.put_slice(&self.filler);
        buf.freeze()
    }
}

/// Decode the header and check the declared size against the received length
pub fn verify(data: &[u8]) -> Result<PayloadHeader> {
    let header = PayloadHeader::decode(data)?;
    if header.size as usize != data.len() {
        return Err(LoadGenError::InvalidPayload(format!(
            "sequence {} from producer {} declared {} bytes but {} arrived",
            header.sequence,
            header.producer_index,
            header.size,
            data.len()
        )));
    }
    Ok(header)
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_has_exact_size() {
        let builder = PayloadBuilder::new(2, 1024).unwrap();
        let payload = builder.build(7);
        assert_eq!(payload.len(), 1024);

        let header = verify(&payload).unwrap();
        assert_eq!(header.producer_index, 2);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.size, 1024);
    }

    #[test]
    fn test_header_only_payload() {
        let builder = PayloadBuilder::new(0, HEADER_LEN).unwrap();
        let payload = builder.build_at(1, 42);
        assert_eq!(payload.len(), HEADER_LEN);
        assert_eq!(verify(&payload).unwrap().timestamp_us, 42);
    }

    #[test]
    fn test_too_small_size_rejected() {
        assert!(PayloadBuilder::new(0, HEADER_LEN - 1).is_err());
    }

    #[test]
    fn test_truncated_payload_detected() {
        let builder = PayloadBuilder::new(1, 4096).unwrap();
        let payload = builder.build(99);
        let truncated = &payload[..2048];
        let err = verify(truncated).unwrap_err();
        assert!(matches!(err, LoadGenError::InvalidPayload(_)));
        assert!(err.to_string().contains("sequence 99"));
    }

    #[test]
    fn test_foreign_payload_rejected() {
        let mut junk = vec![0u8; 64];
        junk[..4].copy_from_slice(b"JSON");
        assert!(PayloadHeader::decode(&junk).is_err());
        assert!(PayloadHeader::decode(b"short").is_err());
    }

    #[test]
    fn test_latency_saturates() {
        let header = PayloadHeader {
            producer_index: 0,
            sequence: 1,
            timestamp_us: 1_000,
            size: 32,
        };
        assert_eq!(header.latency_us(1_500), 500);
        assert_eq!(header.latency_us(500), 0);
    }
}
