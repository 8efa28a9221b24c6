//! Worker pool taking closed chunks through encode and shard append.
//!
//! Ordering between jobs is deliberately unconstrained. The shard index
//! records the real byte offset of every chunk, so workers may interleave
//! freely as long as no two of them touch one shard file at once (which
//! [ShardSet] guarantees).
use std::io;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};
use thiserror::Error;

use crate::codecs::{BBCodec, CodecChain, CodecError};
use crate::mapping::ChunkLocation;
use crate::shard::ShardSet;
use crate::GridCoord;

#[derive(Debug)]
pub(crate) struct EncodeJob {
    pub location: ChunkLocation,
    pub data: Vec<u8>,
}

/// A failure reported back from an encode worker.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Could not encode chunk {chunk:?}")]
    Encode {
        chunk: GridCoord,
        #[source]
        source: CodecError,
    },
    #[error("Could not write chunk {chunk:?} to its shard")]
    Write {
        chunk: GridCoord,
        #[source]
        source: io::Error,
    },
}

impl EncodeError {
    /// Write failures leave the shard file in an unknown state;
    /// encode failures only cost the one chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Write { .. })
    }
}

/// Counts submitted-but-unfinished jobs so finalise can wait for the queue
/// to drain without tearing the workers down.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn incr(&self) {
        *self.count.lock().expect("pending counter poisoned") += 1;
    }

    fn decr(&self) {
        let mut n = self.count.lock().expect("pending counter poisoned");
        *n -= 1;
        if *n == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut n = self.count.lock().expect("pending counter poisoned");
        while *n > 0 {
            n = self.idle.wait(n).expect("pending counter poisoned");
        }
    }
}

fn handle_job(job: EncodeJob, codecs: &CodecChain, shards: &ShardSet) -> Result<(), EncodeError> {
    let payload = codecs.encode(&job.data).map_err(|source| EncodeError::Encode {
        chunk: job.location.chunk.clone(),
        source,
    })?;
    shards
        .put(&job.location.shard, job.location.slot, &payload)
        .map_err(|source| EncodeError::Write {
            chunk: job.location.chunk.clone(),
            source,
        })
}

fn run_worker(
    jobs: Arc<Mutex<Receiver<EncodeJob>>>,
    codecs: Arc<CodecChain>,
    shards: Arc<ShardSet>,
    errors: Sender<EncodeError>,
    pending: Arc<Pending>,
) {
    loop {
        let received = {
            let rx = jobs.lock().expect("job queue poisoned");
            rx.recv()
        };
        let job = match received {
            Ok(job) => job,
            // all senders gone, pool is shutting down
            Err(_) => break,
        };
        if let Err(e) = handle_job(job, &codecs, &shards) {
            // the session decides whether this is terminal
            let _ = errors.send(e);
        }
        pending.decr();
    }
    debug!("encode worker is done");
}

/// Fixed-size encode pool fed from the session thread.
///
/// The job channel is bounded so a source producing frames faster than the
/// codecs can chew through them blocks in [EncodePool::submit] rather than
/// buffering without limit.
pub(crate) struct EncodePool {
    jobs: Option<SyncSender<EncodeJob>>,
    workers: Vec<JoinHandle<()>>,
    errors: Receiver<EncodeError>,
    pending: Arc<Pending>,
}

impl EncodePool {
    pub fn spawn(n_threads: usize, codecs: CodecChain, shards: Arc<ShardSet>) -> Self {
        let (job_tx, job_rx) = sync_channel(2 * n_threads);
        let (err_tx, err_rx) = channel();
        let jobs = Arc::new(Mutex::new(job_rx));
        let codecs = Arc::new(codecs);
        let pending = Arc::new(Pending::default());

        let workers = (0..n_threads)
            .map(|i| {
                let jobs = jobs.clone();
                let codecs = codecs.clone();
                let shards = shards.clone();
                let errors = err_tx.clone();
                let pending = pending.clone();
                std::thread::Builder::new()
                    .name(format!("encode-{i}"))
                    .spawn(move || run_worker(jobs, codecs, shards, errors, pending))
                    .expect("failed to start encode worker")
            })
            .collect();

        debug!("spawned {n_threads} encode workers");
        Self {
            jobs: Some(job_tx),
            workers,
            errors: err_rx,
            pending,
        }
    }

    /// Blocks while the job queue is full.
    pub fn submit(&self, job: EncodeJob) {
        self.pending.incr();
        self.jobs
            .as_ref()
            .and_then(|tx| tx.send(job).ok())
            .expect("encode workers should be running");
    }

    /// Block until every submitted job has been encoded and appended.
    pub fn wait_idle(&self) {
        self.pending.wait_idle();
    }

    /// The oldest unreported worker failure, if any.
    pub fn next_error(&self) -> Option<EncodeError> {
        match self.errors.try_recv() {
            Ok(e) => Some(e),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Close the queue and join the workers. Jobs already submitted are
    /// still worked off.
    pub fn shutdown(&mut self) {
        if self.jobs.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("encode worker panicked");
            }
        }
    }
}

impl Drop for EncodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::chunk_key_encoding::ChunkKeyEncoding;
    use crate::codecs::sharding::ShardIndex;
    use crate::store::ArrayStore;

    fn pool_fixture(n_slots: u64) -> (tempdir::TempDir, Arc<ShardSet>) {
        let tmp = tempdir::TempDir::new("zarr3-sink-test").unwrap();
        let store = ArrayStore::create(tmp.path().join("run.zarr"), false).unwrap();
        let shards = Arc::new(ShardSet::new(
            store,
            ChunkKeyEncoding::default(),
            n_slots,
            2,
        ));
        (tmp, shards)
    }

    fn location(shard: GridCoord, slot: u64) -> ChunkLocation {
        ChunkLocation {
            chunk: shard.clone(),
            shard,
            slot,
        }
    }

    #[test]
    fn jobs_land_in_shards() {
        let (_tmp, shards) = pool_fixture(4);
        let mut pool = EncodePool::spawn(2, CodecChain::default(), shards.clone());

        for slot in 0..3 {
            pool.submit(EncodeJob {
                location: location(smallvec![0, 0], slot),
                data: vec![slot as u8; 8],
            });
        }
        pool.wait_idle();
        assert!(pool.next_error().is_none());
        pool.shutdown();

        shards.seal_all().unwrap();
        let path = shards.store().shard_path(&[
            "c".to_string(),
            "0".to_string(),
            "0".to_string(),
        ]);
        let bytes = std::fs::read(path).unwrap();
        let index = ShardIndex::from_shard_bytes(&bytes, 4).unwrap();
        assert_eq!(index.n_present(), 3);
        for slot in 0..3 {
            let entry = index.get(slot).unwrap();
            let start = entry.offset as usize;
            let end = start + entry.nbytes as usize;
            assert_eq!(&bytes[start..end], &vec![slot as u8; 8][..]);
        }
    }

    #[test]
    fn wait_idle_blocks_until_queue_drains() {
        let (_tmp, shards) = pool_fixture(64);
        let pool = EncodePool::spawn(4, CodecChain::default(), shards.clone());

        for slot in 0..64 {
            pool.submit(EncodeJob {
                location: location(smallvec![0, 0], slot),
                data: vec![0xAB; 1024],
            });
        }
        pool.wait_idle();
        // a full shard seals eagerly, so the index must be on disk already
        let path = shards.store().shard_path(&[
            "c".to_string(),
            "0".to_string(),
            "0".to_string(),
        ]);
        let bytes = std::fs::read(path).unwrap();
        let index = ShardIndex::from_shard_bytes(&bytes, 64).unwrap();
        assert!(index.is_full());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn compressed_jobs_roundtrip() {
        use crate::codecs::{gzip::GzipCodec, BBCodec};

        let (_tmp, shards) = pool_fixture(4);
        let chain = CodecChain::default().with_compressor(GzipCodec::default());
        let mut pool = EncodePool::spawn(2, chain.clone(), shards.clone());

        let data = vec![7u8; 4096];
        pool.submit(EncodeJob {
            location: location(smallvec![1, 2], 0),
            data: data.clone(),
        });
        pool.wait_idle();
        pool.shutdown();
        shards.seal_all().unwrap();

        let path = shards.store().shard_path(&[
            "c".to_string(),
            "1".to_string(),
            "2".to_string(),
        ]);
        let bytes = std::fs::read(path).unwrap();
        let index = ShardIndex::from_shard_bytes(&bytes, 4).unwrap();
        let entry = index.get(0).unwrap();
        let payload = &bytes[entry.offset as usize..(entry.offset + entry.nbytes) as usize];
        assert!(payload.len() < data.len());
        assert_eq!(chain.decode(payload).unwrap().as_ref(), &data[..]);
    }
}
