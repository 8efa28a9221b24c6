use itertools::iproduct;
use smallvec::smallvec;

use crate::dimension::ArrayDims;
use crate::GridCoord;

/// C order
pub(crate) fn to_linear_idx(coord: &[u64], shape: &[u64]) -> u64 {
    debug_assert_eq!(coord.len(), shape.len());
    let mut total = 0;
    let mut stride = 1;
    for (i, s) in coord.iter().rev().zip(shape.iter().rev()) {
        debug_assert!(i < s);
        total += i * stride;
        stride *= s;
    }
    total
}

/// Where a chunk lives on disk: the shard that holds it and its linear
/// slot in that shard's index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub chunk: GridCoord,
    pub shard: GridCoord,
    pub slot: u64,
}

/// Pure voxel/chunk/shard arithmetic for one array's geometry.
///
/// All methods are deterministic and allocate nothing beyond the returned
/// coordinates; two calls with the same input always agree.
#[derive(Debug, Clone)]
pub struct CoordMapper {
    chunk_shape: GridCoord,
    shard_shape_chunks: GridCoord,
}

impl CoordMapper {
    pub fn new(dims: &ArrayDims) -> Self {
        Self {
            chunk_shape: dims.chunk_shape(),
            shard_shape_chunks: dims.shard_shape_chunks(),
        }
    }

    /// Chunk index holding the voxel, and the voxel's offset within it.
    pub fn voxel_chunk(&self, coord: &[u64]) -> (GridCoord, GridCoord) {
        let mut chunk_idx = GridCoord::new();
        let mut offset = GridCoord::new();
        for (vx, cs) in coord.iter().zip(self.chunk_shape.iter()) {
            chunk_idx.push(vx / cs);
            offset.push(vx % cs);
        }
        (chunk_idx, offset)
    }

    /// Shard index holding the chunk.
    pub fn shard_of(&self, chunk: &[u64]) -> GridCoord {
        chunk
            .iter()
            .zip(self.shard_shape_chunks.iter())
            .map(|(c, s)| c / s)
            .collect()
    }

    /// Linear slot of the chunk in its shard's index table.
    pub fn slot_of(&self, chunk: &[u64]) -> u64 {
        let within: GridCoord = chunk
            .iter()
            .zip(self.shard_shape_chunks.iter())
            .map(|(c, s)| c % s)
            .collect();
        to_linear_idx(&within, &self.shard_shape_chunks)
    }

    pub fn locate(&self, chunk: GridCoord) -> ChunkLocation {
        let shard = self.shard_of(&chunk);
        let slot = self.slot_of(&chunk);
        ChunkLocation { chunk, shard, slot }
    }
}

/// One rectangle of a frame and the spatial chunk it lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTile {
    /// Spatial chunk index, height axis then width axis.
    pub chunk_y: u64,
    pub chunk_x: u64,
    /// Top-left corner of the source rectangle in the frame.
    pub row0: u64,
    pub col0: u64,
    /// Source rectangle extent, clipped to the frame at the boundary.
    pub rows: u64,
    pub cols: u64,
}

/// How a frame scatters over the spatial chunk grid.
///
/// Identical for every frame of a session, so built once at open.
#[derive(Debug, Clone)]
pub struct TilePlan {
    tiles: Vec<FrameTile>,
}

impl TilePlan {
    pub fn new(dims: &ArrayDims) -> Self {
        let n = dims.ndim();
        let [dy, dx] = [&dims.dims()[n - 2], &dims.dims()[n - 1]];
        let (h, w) = dims.frame_shape();
        let tiles = iproduct!(0..dy.chunk_count(), 0..dx.chunk_count())
            .map(|(cy, cx)| {
                let row0 = cy * dy.chunk_extent;
                let col0 = cx * dx.chunk_extent;
                FrameTile {
                    chunk_y: cy,
                    chunk_x: cx,
                    row0,
                    col0,
                    rows: dy.chunk_extent.min(h - row0),
                    cols: dx.chunk_extent.min(w - col0),
                }
            })
            .collect();
        Self { tiles }
    }

    pub fn tiles(&self) -> &[FrameTile] {
        &self.tiles
    }

    /// Full chunk index for a tile of the frame at `frame_chunk`
    /// (chunk indices along the non-spatial dimensions).
    pub fn tile_chunk(&self, frame_chunk: &[u64], tile: &FrameTile) -> GridCoord {
        let mut chunk: GridCoord = smallvec![0; frame_chunk.len() + 2];
        chunk[..frame_chunk.len()].copy_from_slice(frame_chunk);
        chunk[frame_chunk.len()] = tile.chunk_y;
        chunk[frame_chunk.len() + 1] = tile.chunk_x;
        chunk
    }
}
