//! Streaming writer for Zarr v3 arrays: fixed-size frames are accumulated
//! into chunks, encoded, and persisted into sharded chunk files with a
//! binary slot index and checksum trailer.

use smallvec::SmallVec;

pub mod accumulator;
pub mod chunk_key_encoding;
pub mod codecs;
pub mod data_type;
pub mod dimension;
pub mod mapping;
pub mod metadata;
mod pool;
pub mod session;
mod shard;
pub mod store;
mod util;

pub mod prelude;

const COORD_SMALLVEC_SIZE: usize = 6;
pub const ZARR_FORMAT: usize = 3;

pub type CoordVec<T> = SmallVec<[T; COORD_SMALLVEC_SIZE]>;
pub type GridCoord = CoordVec<u64>;

/// Open a session, append every whole frame in `data`, and finalise.
///
/// Returns the number of frames consumed. Convenience for sources which
/// have the whole acquisition in memory; streaming callers should drive
/// an [ArraySession](session::ArraySession) themselves.
pub fn stream_to_zarr(
    settings: session::StreamSettings,
    data: &[u8],
) -> Result<usize, session::SessionError> {
    let mut session = session::ArraySession::open(settings)?;
    let consumed = session.append_many(data)?;
    session.finalize()?;
    Ok(consumed)
}
