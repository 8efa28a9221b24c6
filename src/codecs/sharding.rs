use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::CodecChain;
use crate::variant_from_data;
use crate::GridCoord;

/// Byte length of one shard's checksum trailer.
pub const CHECKSUM_NBYTES: usize = std::mem::size_of::<u32>();

/// One slot of a shard's index table: where the chunk's encoded bytes sit
/// in the file. A slot never written holds the all-ones sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotEntry {
    pub offset: u64,
    pub nbytes: u64,
}

impl SlotEntry {
    pub const NBYTES: usize = 2 * std::mem::size_of::<u64>();

    pub fn new(offset: u64, nbytes: u64) -> Self {
        Self { offset, nbytes }
    }

    pub fn empty() -> Self {
        Self {
            offset: u64::MAX,
            nbytes: u64::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offset == u64::MAX && self.nbytes == u64::MAX
    }

    pub fn end_offset(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.offset + self.nbytes)
        }
    }

    pub fn from_reader<R: Read>(r: &mut R) -> Result<Self, std::io::Error> {
        let offset = r.read_u64::<LittleEndian>()?;
        let nbytes = r.read_u64::<LittleEndian>()?;
        Ok(Self { offset, nbytes })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u64::<LittleEndian>(self.nbytes)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ShardIndexError {
    #[error("Shard of {nbytes} bytes cannot hold {n_slots} index entries")]
    Truncated { nbytes: usize, n_slots: u64 },
    #[error("Shard does not match checksum")]
    ChecksumFailure,
    #[error("Could not read chunk index")]
    Io(#[from] std::io::Error),
}

/// Index table of one shard, one entry per chunk slot in row-major slot
/// order. Serialized after the chunk payloads, before the checksum.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ShardIndex {
    entries: Vec<SlotEntry>,
}

impl ShardIndex {
    pub fn empty(n_slots: u64) -> Self {
        Self {
            entries: vec![SlotEntry::empty(); n_slots as usize],
        }
    }

    /// Replaces the entry at `slot`, returning the previous one.
    pub fn set(&mut self, slot: u64, entry: SlotEntry) -> SlotEntry {
        std::mem::replace(&mut self.entries[slot as usize], entry)
    }

    /// The entry for `slot`, if that chunk is present.
    pub fn get(&self, slot: u64) -> Option<&SlotEntry> {
        self.entries.get(slot as usize).filter(|e| !e.is_empty())
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    pub fn n_slots(&self) -> usize {
        self.entries.len()
    }

    pub fn n_present(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }

    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|e| !e.is_empty())
    }

    /// Serialized length of the table, excluding the checksum.
    pub fn nbytes(&self) -> usize {
        self.entries.len() * SlotEntry::NBYTES
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), std::io::Error> {
        for e in self.entries.iter() {
            e.write_to(w)?;
        }
        Ok(())
    }

    /// Parses the index from a whole shard image, verifying the trailing
    /// crc32c over every byte that precedes it.
    pub fn from_shard_bytes(data: &[u8], n_slots: u64) -> Result<Self, ShardIndexError> {
        let footprint = n_slots as usize * SlotEntry::NBYTES + CHECKSUM_NBYTES;
        if data.len() < footprint {
            return Err(ShardIndexError::Truncated {
                nbytes: data.len(),
                n_slots,
            });
        }
        let chksum_offset = data.len() - CHECKSUM_NBYTES;
        let chksum_calc = crc32c(&data[..chksum_offset]);
        let chksum_read = Cursor::new(&data[chksum_offset..]).read_u32::<LittleEndian>()?;
        if chksum_calc != chksum_read {
            return Err(ShardIndexError::ChecksumFailure);
        }

        let mut curs = Cursor::new(&data[chksum_offset - n_slots as usize * SlotEntry::NBYTES..]);
        let mut entries = Vec::with_capacity(n_slots as usize);
        for _ in 0..n_slots {
            entries.push(SlotEntry::from_reader(&mut curs)?);
        }
        Ok(Self { entries })
    }
}

/// Configuration of the `sharding_indexed` codec as written to array
/// metadata: the inner chunk shape and the per-chunk codec chain.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct ShardingIndexedCodec {
    pub chunk_shape: GridCoord,
    pub codecs: CodecChain,
}

impl ShardingIndexedCodec {
    pub fn new<C: Into<GridCoord>>(chunk_shape: C, codecs: CodecChain) -> Self {
        Self {
            chunk_shape: chunk_shape.into(),
            codecs,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(rename_all = "snake_case", tag = "name", content = "configuration")]
pub enum ArrayCodec {
    ShardingIndexed(ShardingIndexedCodec),
}

variant_from_data!(ArrayCodec, ShardingIndexed, ShardingIndexedCodec);
