//! Wire format for Blocks transmitted between hosts (spec.md §6), grounded on
//! `thrill/data/stream_data.hpp`'s `MagicByte` enum and the header fields
//! carried alongside every `ChannelBlockHeader` in `multiplexer.hpp`.

use crate::error::EngineError;
use crate::stream::StreamId;

/// Sentinel for `receiver_local_worker` meaning "all workers on this host"
/// (spec.md §4.4: the accelerated final-close header).
pub const ALL_WORKERS: u32 = u32::MAX;

/// Stream kind carried in the header's magic byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Invalid = 0,
    Cat = 1,
    Mix = 2,
    Partition = 3,
}

impl Magic {
    fn from_u8(b: u8) -> Result<Self, EngineError> {
        match b {
            0 => Ok(Magic::Invalid),
            1 => Ok(Magic::Cat),
            2 => Ok(Magic::Mix),
            3 => Ok(Magic::Partition),
            other => Err(EngineError::protocol(format!("unknown magic byte {other}"))),
        }
    }
}

/// Fixed-layout header preceding every transmitted Block (spec.md §6).
///
/// `payload_size == 0` indicates a close sentinel from `sender_local_worker`.
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub magic: Magic,
    pub stream_id: StreamId,
    pub sender_host: u32,
    pub sender_local_worker: u32,
    pub receiver_local_worker: u32,
    pub seq: u32,
    pub payload_size: u32,
    pub first_item: u32,
    pub nitems: u32,
}

/// Total encoded header size in bytes: 1 + 8 + 4*6.
pub const HEADER_LEN: usize = 1 + 8 + 4 * 6;

impl BlockHeader {
    pub fn is_close_sentinel(&self) -> bool {
        self.payload_size == 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic as u8;
        buf[1..9].copy_from_slice(&self.stream_id.0.to_le_bytes());
        buf[9..13].copy_from_slice(&self.sender_host.to_le_bytes());
        buf[13..17].copy_from_slice(&self.sender_local_worker.to_le_bytes());
        buf[17..21].copy_from_slice(&self.receiver_local_worker.to_le_bytes());
        buf[21..25].copy_from_slice(&self.seq.to_le_bytes());
        buf[25..29].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[29..33].copy_from_slice(&self.first_item.to_le_bytes());
        buf[33..37].copy_from_slice(&self.nitems.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EngineError> {
        if buf.len() < HEADER_LEN {
            return Err(EngineError::serialization("short read on block header"));
        }
        let u32_at = |r: std::ops::Range<usize>| u32::from_le_bytes(buf[r].try_into().unwrap());
        Ok(Self {
            magic: Magic::from_u8(buf[0])?,
            stream_id: StreamId(u64::from_le_bytes(buf[1..9].try_into().unwrap())),
            sender_host: u32_at(9..13),
            sender_local_worker: u32_at(13..17),
            receiver_local_worker: u32_at(17..21),
            seq: u32_at(21..25),
            payload_size: u32_at(25..29),
            first_item: u32_at(29..33),
            nitems: u32_at(33..37),
        })
    }
}
