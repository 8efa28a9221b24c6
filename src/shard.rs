use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use crc32c::crc32c_append;
use log::{debug, warn};
use smallvec::smallvec;

use crate::chunk_key_encoding::{ChunkKeyEncoder, ChunkKeyEncoding};
use crate::codecs::sharding::{ShardIndex, SlotEntry, CHECKSUM_NBYTES};
use crate::store::ArrayStore;
use crate::GridCoord;

/// Append-only writer for one shard file.
///
/// Encoded chunks land at the current tail in arrival order; the index
/// table records their real offsets, so slot order is free. The crc32c
/// runs over every appended byte and the index, and is written as the
/// 4-byte trailer by [ShardWriter::seal].
pub struct ShardWriter {
    file: File,
    offset: u64,
    checksum: u32,
    index: ShardIndex,
    sealed: bool,
    key: String,
}

impl ShardWriter {
    fn create(
        store: &ArrayStore,
        encoding: &ChunkKeyEncoding,
        shard: &[u64],
        n_slots: u64,
    ) -> io::Result<Self> {
        let components = encoding.components(shard);
        let file = store.create_shard_file(&components)?;
        Ok(Self {
            file,
            offset: 0,
            checksum: 0,
            index: ShardIndex::empty(n_slots),
            sealed: false,
            key: encoding.encode(shard),
        })
    }

    /// Appends one encoded chunk and records its slot entry.
    ///
    /// A sealed shard is immutable; a chunk arriving late for one is
    /// discarded with a warning rather than corrupting the trailer.
    pub fn put(&mut self, slot: u64, payload: &[u8]) -> io::Result<()> {
        if self.sealed {
            warn!("Discarding chunk for slot {} of sealed shard {}", slot, self.key);
            return Ok(());
        }
        self.file.write_all(payload)?;
        self.checksum = crc32c_append(self.checksum, payload);
        let old = self
            .index
            .set(slot, SlotEntry::new(self.offset, payload.len() as u64));
        if !old.is_empty() {
            warn!("Slot {} of shard {} written twice", slot, self.key);
        }
        self.offset += payload.len() as u64;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.index.is_full()
    }

    /// Appends the index table and checksum trailer. Idempotent.
    pub fn seal(&mut self) -> io::Result<()> {
        if self.sealed {
            return Ok(());
        }
        let mut tail = Vec::with_capacity(self.index.nbytes() + CHECKSUM_NBYTES);
        self.index.write_to(&mut tail)?;
        let checksum = crc32c_append(self.checksum, &tail);
        tail.write_u32::<LittleEndian>(checksum)?;
        self.file.write_all(&tail)?;
        self.file.flush()?;
        self.sealed = true;
        debug!(
            "Sealed shard {}: {}/{} slots, {} bytes",
            self.key,
            self.index.n_present(),
            self.index.n_slots(),
            self.offset + tail.len() as u64
        );
        Ok(())
    }
}

/// Registry of the shards a session has touched.
///
/// Each shard carries its own lock, taken only while appending to that
/// shard's file; different shards accept chunks concurrently. A shard
/// whose every slot is filled is sealed on the spot.
pub struct ShardSet {
    store: ArrayStore,
    encoding: ChunkKeyEncoding,
    n_slots: u64,
    ndim: usize,
    shards: Mutex<HashMap<GridCoord, Arc<Mutex<ShardWriter>>>>,
}

impl ShardSet {
    pub fn new(store: ArrayStore, encoding: ChunkKeyEncoding, n_slots: u64, ndim: usize) -> Self {
        Self {
            store,
            encoding,
            n_slots,
            ndim,
            shards: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ArrayStore {
        &self.store
    }

    fn writer(&self, shard: &GridCoord) -> io::Result<Arc<Mutex<ShardWriter>>> {
        let mut map = self.shards.lock().expect("shard registry poisoned");
        match map.get(shard) {
            Some(w) => Ok(w.clone()),
            None => {
                let w = Arc::new(Mutex::new(ShardWriter::create(
                    &self.store,
                    &self.encoding,
                    shard,
                    self.n_slots,
                )?));
                map.insert(shard.clone(), w.clone());
                Ok(w)
            }
        }
    }

    /// Appends one encoded chunk to its shard, sealing the shard if this
    /// filled its last open slot.
    pub fn put(&self, shard: &GridCoord, slot: u64, payload: &[u8]) -> io::Result<()> {
        let writer = self.writer(shard)?;
        let mut guard = writer.lock().expect("shard writer poisoned");
        guard.put(slot, payload)?;
        if guard.is_full() {
            guard.seal()?;
        }
        Ok(())
    }

    /// Seals every touched shard. A session that saw no data still
    /// materializes the origin shard, all slots missing, so the array has
    /// at least one well-formed shard file on disk.
    pub fn seal_all(&self) -> io::Result<()> {
        let mut map = self.shards.lock().expect("shard registry poisoned");
        if map.is_empty() {
            let origin: GridCoord = smallvec![0; self.ndim];
            let w = Arc::new(Mutex::new(ShardWriter::create(
                &self.store,
                &self.encoding,
                &origin,
                self.n_slots,
            )?));
            map.insert(origin, w);
        }
        for writer in map.values() {
            writer.lock().expect("shard writer poisoned").seal()?;
        }
        Ok(())
    }

    pub fn n_shards(&self) -> usize {
        self.shards.lock().expect("shard registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::sharding::ShardIndexError;
    use std::fs;
    use tempdir::TempDir;

    fn shard_set(root: &std::path::Path, n_slots: u64) -> ShardSet {
        let store = ArrayStore::create(root.join("data.zarr"), false).unwrap();
        ShardSet::new(store, ChunkKeyEncoding::default(), n_slots, 3)
    }

    #[test]
    fn appends_in_arrival_order_and_indexes_by_slot() {
        let tmp = TempDir::new("shard").unwrap();
        let set = shard_set(tmp.path(), 4);
        let shard: GridCoord = smallvec![0, 0, 0];

        set.put(&shard, 1, b"abcd").unwrap();
        set.put(&shard, 0, b"xy").unwrap();
        set.seal_all().unwrap();

        let path = set.store().shard_path(&["c", "0", "0", "0"].map(String::from));
        let bytes = fs::read(path).unwrap();
        assert_eq!(bytes.len(), 6 + 4 * SlotEntry::NBYTES + CHECKSUM_NBYTES);
        assert_eq!(&bytes[..6], b"abcdxy");

        let index = ShardIndex::from_shard_bytes(&bytes, 4).unwrap();
        assert_eq!(index.get(0), Some(&SlotEntry::new(4, 2)));
        assert_eq!(index.get(1), Some(&SlotEntry::new(0, 4)));
        assert!(index.get(2).is_none());
        assert!(index.get(3).is_none());
    }

    #[test]
    fn full_shard_seals_eagerly() {
        let tmp = TempDir::new("shard").unwrap();
        let set = shard_set(tmp.path(), 1);
        let shard: GridCoord = smallvec![0, 0, 0];
        set.put(&shard, 0, b"chunk").unwrap();

        // sealed without seal_all
        let path = set.store().shard_path(&["c", "0", "0", "0"].map(String::from));
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 5 + SlotEntry::NBYTES + CHECKSUM_NBYTES);

        // seal_all afterwards is a no-op
        set.seal_all().unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), bytes.len());

        // a chunk arriving after the seal is discarded
        set.put(&shard, 0, b"again").unwrap();
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn empty_run_materializes_origin_shard() {
        let tmp = TempDir::new("shard").unwrap();
        let set = shard_set(tmp.path(), 8);
        set.seal_all().unwrap();
        assert_eq!(set.n_shards(), 1);

        let path = set.store().shard_path(&["c", "0", "0", "0"].map(String::from));
        let bytes = fs::read(path).unwrap();
        assert_eq!(bytes.len(), 8 * SlotEntry::NBYTES + CHECKSUM_NBYTES);
        let index = ShardIndex::from_shard_bytes(&bytes, 8).unwrap();
        assert_eq!(index.n_present(), 0);
    }

    #[test]
    fn tampered_shard_detected_on_read() {
        let tmp = TempDir::new("shard").unwrap();
        let set = shard_set(tmp.path(), 1);
        let shard: GridCoord = smallvec![0, 0, 0];
        set.put(&shard, 0, b"chunk").unwrap();

        let path = set.store().shard_path(&["c", "0", "0", "0"].map(String::from));
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ShardIndex::from_shard_bytes(&bytes, 1),
            Err(ShardIndexError::ChecksumFailure)
        ));
    }
}
