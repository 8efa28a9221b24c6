//! Streaming write sessions.
//!
//! An [ArraySession] owns everything a running stream needs: the validated
//! geometry, the frame accumulator, the shard registry, and the encode pool.
//! Frames go in one at a time; sealed shard files and, at finalise time, the
//! metadata documents come out the other side.
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use smallvec::smallvec;
use thiserror::Error;

use crate::accumulator::{ChunkAccumulator, ClosedChunk};
use crate::chunk_key_encoding::{DefaultChunkKeyEncoding, Separator};
#[cfg(feature = "gzip")]
use crate::codecs::gzip::GzipCodec;
use crate::codecs::{CodecChain, CodecError};
use crate::data_type::SampleType;
use crate::dimension::{ArrayDims, Dimension, DimensionError};
use crate::mapping::CoordMapper;
use crate::metadata::{write_stream_metadata, ArrayMetadataBuilder};
use crate::pool::{EncodeError, EncodeJob, EncodePool};
use crate::shard::ShardSet;
use crate::store::ArrayStore;
use crate::GridCoord;

/// Most acquisitions are I/O bound; more encode threads than this
/// just contend on the shard locks.
const MAX_DEFAULT_THREADS: usize = 8;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Dimensions(#[from] DimensionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Coordinate {coord:?} is outside the frame extents {shape:?}")]
    OutOfBounds { coord: GridCoord, shape: GridCoord },
    #[error("Expected a frame of {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Could not encode chunk {chunk:?}")]
    Encoding {
        chunk: GridCoord,
        #[source]
        source: CodecError,
    },
    #[error("Could not write chunk {chunk:?} to its shard")]
    ShardWrite {
        chunk: GridCoord,
        #[source]
        source: io::Error,
    },
    #[error("Session is already finalised")]
    AlreadyFinalized,
    #[error("Session is unusable after an earlier write failure")]
    Unusable,
}

impl From<EncodeError> for SessionError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Encode { chunk, source } => Self::Encoding { chunk, source },
            EncodeError::Write { chunk, source } => Self::ShardWrite { chunk, source },
        }
    }
}

/// Configuration for [ArraySession::open].
///
/// ```
/// use zarr3_sink::prelude::*;
///
/// let settings = StreamSettings::new(
///     "/tmp/run.zarr",
///     vec![
///         Dimension::new("t", DimensionKind::Time, 64, 16, 1).unwrap(),
///         Dimension::new("y", DimensionKind::Space, 1080, 154, 8).unwrap(),
///         Dimension::new("x", DimensionKind::Space, 1920, 274, 8).unwrap(),
///     ],
///     SampleType::UInt8,
/// )
/// .overwrite(true);
/// ```
#[derive(Debug, Clone)]
pub struct StreamSettings {
    root: PathBuf,
    dimensions: Vec<Dimension>,
    sample_type: SampleType,
    sample_spacing_um: Option<[f64; 2]>,
    #[cfg(feature = "gzip")]
    compression: Option<GzipCodec>,
    external_metadata: serde_json::Value,
    overwrite: bool,
    encode_threads: Option<usize>,
    separator: Separator,
}

impl StreamSettings {
    pub fn new<P: Into<PathBuf>>(
        root: P,
        dimensions: Vec<Dimension>,
        sample_type: SampleType,
    ) -> Self {
        Self {
            root: root.into(),
            dimensions,
            sample_type,
            sample_spacing_um: None,
            #[cfg(feature = "gzip")]
            compression: None,
            external_metadata: serde_json::json!({}),
            overwrite: false,
            encode_threads: None,
            separator: Separator::default(),
        }
    }

    /// Replace an existing root directory instead of refusing to open.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Physical pixel pitch, `[y, x]` in micrometers, stored as an
    /// array attribute.
    pub fn sample_spacing_um(mut self, spacing: [f64; 2]) -> Self {
        self.sample_spacing_um = Some(spacing);
        self
    }

    /// Compress chunk payloads before they are appended to their shard.
    #[cfg(feature = "gzip")]
    pub fn compression(mut self, codec: GzipCodec) -> Self {
        self.compression = Some(codec);
        self
    }

    /// Arbitrary document written verbatim next to the zarr hierarchy.
    pub fn external_metadata(mut self, doc: serde_json::Value) -> Self {
        self.external_metadata = doc;
        self
    }

    pub fn encode_threads(mut self, n_threads: usize) -> Self {
        self.encode_threads = Some(n_threads.max(1));
        self
    }

    pub fn separator(mut self, separator: Separator) -> Self {
        self.separator = separator;
        self
    }

    fn codec_chain(&self) -> CodecChain {
        let chain = CodecChain::default();
        #[cfg(feature = "gzip")]
        let chain = match self.compression {
            Some(codec) => chain.with_compressor(codec),
            None => chain,
        };
        chain
    }

    fn n_threads(&self) -> usize {
        self.encode_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_DEFAULT_THREADS)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Finalized,
    Unusable,
}

/// A live stream writing one zarr array.
///
/// Obtained from [ArraySession::open]; frames go in through [write_at]
/// (explicit placement) or [append] (sequential); [finalize] flushes
/// everything and writes the metadata documents. Dropping a session
/// without finalising leaves sealed shards readable but writes no
/// metadata.
///
/// [write_at]: ArraySession::write_at
/// [append]: ArraySession::append
/// [finalize]: ArraySession::finalize
pub struct ArraySession {
    dims: ArrayDims,
    sample_type: SampleType,
    mapper: CoordMapper,
    accumulator: ChunkAccumulator,
    shards: Arc<ShardSet>,
    pool: EncodePool,
    chain: CodecChain,
    separator: Separator,
    sample_spacing_um: Option<[f64; 2]>,
    external_metadata: serde_json::Value,
    next_frame: u64,
    state: SessionState,
}

impl ArraySession {
    /// Validate the settings, create the root directory tree, and spawn
    /// the encode workers. No data files exist until frames arrive.
    pub fn open(settings: StreamSettings) -> Result<Self, SessionError> {
        let dims = ArrayDims::new(settings.dimensions.clone())?;
        let chain = settings.codec_chain();
        chain.validate_for(settings.sample_type)?;

        let store = ArrayStore::create(settings.root.clone(), settings.overwrite)?;
        info!(
            "Streaming {} array of shape {:?} to {}",
            settings.sample_type,
            dims.shape(),
            store.root().display()
        );

        let encoding = DefaultChunkKeyEncoding::new(settings.separator).into();
        let shards = Arc::new(ShardSet::new(
            store,
            encoding,
            dims.chunks_per_shard(),
            dims.ndim(),
        ));
        let pool = EncodePool::spawn(settings.n_threads(), chain.clone(), shards.clone());

        Ok(Self {
            accumulator: ChunkAccumulator::new(&dims, settings.sample_type),
            mapper: CoordMapper::new(&dims),
            dims,
            sample_type: settings.sample_type,
            shards,
            pool,
            chain,
            separator: settings.separator,
            sample_spacing_um: settings.sample_spacing_um,
            external_metadata: settings.external_metadata,
            next_frame: 0,
            state: SessionState::Open,
        })
    }

    pub fn dims(&self) -> &ArrayDims {
        &self.dims
    }

    /// Frames accepted through [ArraySession::append] so far.
    pub fn frames_appended(&self) -> u64 {
        self.next_frame
    }

    /// Place one frame at an explicit coordinate over the frame dimensions.
    ///
    /// On `Err` the frame has not been consumed. Failures reported by the
    /// encode workers since the previous call surface here before the new
    /// frame is touched.
    pub fn write_at(&mut self, coord: &[u64], frame: &[u8]) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.surface_worker_errors()?;
        self.check_frame(coord, frame)?;
        for closed in self.accumulator.write_frame(coord, frame) {
            self.submit(closed);
        }
        Ok(())
    }

    /// Place one frame at the next coordinate in row-major order over the
    /// frame dimensions. Errors with [SessionError::OutOfBounds] once every
    /// frame slot has been appended.
    pub fn append(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.ensure_open()?;
        let coord = self.peek_next_coord()?;
        self.write_at(&coord, frame)?;
        self.next_frame += 1;
        Ok(())
    }

    /// Append as many whole frames from `data` as fit, in order.
    ///
    /// Returns the number of frames consumed; trailing bytes short of a
    /// full frame are never consumed. Consumes zero frames with an error
    /// only when the array is already full.
    pub fn append_many(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        self.ensure_open()?;
        self.surface_worker_errors()?;
        let frame_nbytes = self.frame_nbytes();
        let mut consumed = 0;
        for frame in data.chunks_exact(frame_nbytes) {
            match self.peek_next_coord() {
                Ok(coord) => {
                    for closed in self.accumulator.write_frame(&coord, frame) {
                        self.submit(closed);
                    }
                    self.next_frame += 1;
                    consumed += 1;
                }
                Err(e) => {
                    if consumed == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(consumed)
    }

    /// Flush short chunks, wait for the encode pool to drain, seal every
    /// shard, and write the metadata documents.
    ///
    /// Idempotent: finalising a finalised session is a no-op. An
    /// [Encoding](SessionError::Encoding) failure leaves the session open
    /// with that chunk missing; calling again accepts the hole and
    /// completes the array. A [ShardWrite](SessionError::ShardWrite)
    /// failure poisons the session and no metadata is written.
    pub fn finalize(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Finalized => return Ok(()),
            SessionState::Unusable => return Err(SessionError::Unusable),
            SessionState::Open => {}
        }

        for closed in self.accumulator.drain() {
            self.submit(closed);
        }
        self.pool.wait_idle();
        self.surface_worker_errors()?;

        self.shards.seal_all().map_err(|e| self.fail(e))?;

        let mut builder = ArrayMetadataBuilder::new(&self.dims, self.sample_type)
            .codecs(self.chain.clone())
            .separator(self.separator);
        if let Some(spacing) = self.sample_spacing_um {
            builder = builder.sample_spacing_um(spacing);
        }
        write_stream_metadata(self.shards.store(), builder.build(), &self.external_metadata)
            .map_err(|e| self.fail(e))?;

        self.pool.shutdown();
        self.state = SessionState::Finalized;
        info!(
            "Finalised array at {} with {} shards",
            self.shards.store().root().display(),
            self.shards.n_shards()
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Finalized => Err(SessionError::AlreadyFinalized),
            SessionState::Unusable => Err(SessionError::Unusable),
        }
    }

    /// Report queued worker failures, oldest first; a shard write failure
    /// takes precedence and poisons the session.
    fn surface_worker_errors(&mut self) -> Result<(), SessionError> {
        let mut errors = Vec::new();
        while let Some(e) = self.pool.next_error() {
            error!("{e}");
            errors.push(e);
        }
        if errors.is_empty() {
            return Ok(());
        }
        let idx = errors.iter().position(|e| e.is_fatal()).unwrap_or(0);
        let err = errors.swap_remove(idx);
        if err.is_fatal() {
            self.state = SessionState::Unusable;
        }
        Err(err.into())
    }

    fn fail(&mut self, e: io::Error) -> SessionError {
        self.state = SessionState::Unusable;
        SessionError::Io(e)
    }

    fn check_frame(&self, coord: &[u64], frame: &[u8]) -> Result<(), SessionError> {
        let extents: GridCoord = self
            .dims
            .frame_dims()
            .iter()
            .map(|d| d.array_extent)
            .collect();
        let in_bounds = coord.len() == extents.len()
            && coord.iter().zip(extents.iter()).all(|(c, e)| c < e);
        if !in_bounds {
            return Err(SessionError::OutOfBounds {
                coord: coord.iter().copied().collect(),
                shape: extents,
            });
        }
        let expected = self.frame_nbytes();
        if frame.len() != expected {
            return Err(SessionError::FrameSize {
                expected,
                actual: frame.len(),
            });
        }
        Ok(())
    }

    fn frame_nbytes(&self) -> usize {
        self.dims.frame_numel() as usize * self.sample_type.nbytes()
    }

    fn peek_next_coord(&self) -> Result<GridCoord, SessionError> {
        let extents: GridCoord = self
            .dims
            .frame_dims()
            .iter()
            .map(|d| d.array_extent)
            .collect();
        let total: u64 = extents.iter().product();
        if self.next_frame >= total {
            let mut coord: GridCoord = smallvec![0; extents.len()];
            coord[0] = extents[0];
            return Err(SessionError::OutOfBounds {
                coord,
                shape: extents,
            });
        }
        let mut coord: GridCoord = smallvec![0; extents.len()];
        let mut rem = self.next_frame;
        for (c, e) in coord.iter_mut().zip(extents.iter()).rev() {
            *c = rem % e;
            rem /= e;
        }
        Ok(coord)
    }

    fn submit(&self, closed: ClosedChunk) {
        let location = self.mapper.locate(closed.chunk);
        self.pool.submit(EncodeJob {
            location,
            data: closed.data,
        });
    }
}

impl Drop for ArraySession {
    fn drop(&mut self) {
        if self.state != SessionState::Finalized {
            warn!(
                "Dropping un-finalised session for {}; no metadata written",
                self.shards.store().root().display()
            );
            self.pool.shutdown();
        }
    }
}
