use std::collections::HashMap;

use log::warn;

use crate::data_type::SampleType;
use crate::dimension::{ArrayDims, Dimension};
use crate::mapping::{to_linear_idx, FrameTile, TilePlan};
use crate::GridCoord;

/// A chunk buffer withdrawn from the accumulator, ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedChunk {
    pub chunk: GridCoord,
    pub data: Vec<u8>,
}

/// Extent of a chunk that actually lies inside the array along one
/// dimension. Boundary chunks are ragged.
fn in_range_extent(d: &Dimension, chunk_idx: u64) -> u64 {
    d.chunk_extent.min(d.array_extent - chunk_idx * d.chunk_extent)
}

/// One open chunk's backing buffer.
///
/// Frame (non-spatial) dimensions are allocated at their in-range extent;
/// spatial dimensions always at the nominal chunk extent, so ragged edge
/// chunks stay zero-padded to full size. Frame dimensions are outermost,
/// so each frame slot is one contiguous block of `data`.
struct ChunkBuf {
    shape: GridCoord,
    frame_shape: GridCoord,
    data: Vec<u8>,
    written: Vec<bool>,
    n_written: usize,
}

impl ChunkBuf {
    fn new(chunk: &[u64], dims: &ArrayDims, sample_nbytes: usize) -> Self {
        let frame_ndim = dims.frame_ndim();
        let mut shape = GridCoord::new();
        for (d, c) in dims.frame_dims().iter().zip(chunk.iter()) {
            shape.push(in_range_extent(d, *c));
        }
        for d in &dims.dims()[frame_ndim..] {
            shape.push(d.chunk_extent);
        }
        let frame_shape: GridCoord = shape[..frame_ndim].iter().copied().collect();

        let numel: u64 = shape.iter().product();
        let n_slots: u64 = frame_shape.iter().product();
        Self {
            shape,
            frame_shape,
            data: vec![0; numel as usize * sample_nbytes],
            written: vec![false; n_slots as usize],
            n_written: 0,
        }
    }

    /// Copies one tile's rectangle of `frame` into the slot's block.
    /// Returns (became complete, slot was already written).
    fn write_tile(
        &mut self,
        frame_slot: usize,
        tile: &FrameTile,
        frame: &[u8],
        frame_width: usize,
        sample_nbytes: usize,
    ) -> (bool, bool) {
        let n = self.shape.len();
        let block_width = self.shape[n - 1] as usize;
        let block = self.shape[n - 2] as usize * block_width;
        let base = frame_slot * block * sample_nbytes;
        let row_nbytes = tile.cols as usize * sample_nbytes;

        for r in 0..tile.rows as usize {
            let src = ((tile.row0 as usize + r) * frame_width + tile.col0 as usize) * sample_nbytes;
            let dst = base + r * block_width * sample_nbytes;
            self.data[dst..dst + row_nbytes].copy_from_slice(&frame[src..src + row_nbytes]);
        }

        let rewrite = self.written[frame_slot];
        if !rewrite {
            self.written[frame_slot] = true;
            self.n_written += 1;
        }
        (self.n_written == self.written.len(), rewrite)
    }

    fn close(self, chunk: GridCoord) -> ClosedChunk {
        ClosedChunk {
            chunk,
            data: self.data,
        }
    }

    /// Seals a partial buffer: the outermost dimension is cut after the
    /// last written frame, so a trailing chunk is sized to the frames it
    /// received. Interior gaps stay zero-filled.
    fn close_trimmed(mut self, chunk: GridCoord) -> ClosedChunk {
        let last = self.written.iter().rposition(|w| *w).unwrap_or(0);
        let slots_per_row: usize = self.frame_shape[1..]
            .iter()
            .map(|e| *e as usize)
            .product();
        let keep = last / slots_per_row + 1;
        let dim0 = self.frame_shape[0] as usize;
        if keep < dim0 {
            let dim0_stride = self.data.len() / dim0;
            self.data.truncate(keep * dim0_stride);
        }
        self.close(chunk)
    }
}

/// Gathers streamed frames into per-chunk buffers.
///
/// Buffers are created lazily on first touch and handed back as
/// [ClosedChunk]s the moment every in-range frame slot has been written.
/// Partially filled buffers stay open until [ChunkAccumulator::drain].
pub struct ChunkAccumulator {
    dims: ArrayDims,
    plan: TilePlan,
    sample_nbytes: usize,
    frame_width: usize,
    open: HashMap<GridCoord, ChunkBuf>,
}

impl ChunkAccumulator {
    pub fn new(dims: &ArrayDims, sample_type: SampleType) -> Self {
        Self {
            dims: dims.clone(),
            plan: TilePlan::new(dims),
            sample_nbytes: sample_type.nbytes(),
            frame_width: dims.frame_shape().1 as usize,
            open: HashMap::new(),
        }
    }

    pub fn open_chunks(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Scatters one frame over its spatial chunks, returning every chunk
    /// that this write completed. `coord` is the frame's position along
    /// the non-spatial dimensions, already bounds-checked.
    pub fn write_frame(&mut self, coord: &[u64], frame: &[u8]) -> Vec<ClosedChunk> {
        debug_assert_eq!(coord.len(), self.dims.frame_ndim());

        let mut fchunk = GridCoord::new();
        let mut foffset = GridCoord::new();
        let mut frame_extents = GridCoord::new();
        for (vx, d) in coord.iter().zip(self.dims.frame_dims()) {
            let c = vx / d.chunk_extent;
            fchunk.push(c);
            foffset.push(vx % d.chunk_extent);
            frame_extents.push(in_range_extent(d, c));
        }
        let frame_slot = to_linear_idx(&foffset, &frame_extents) as usize;

        let mut completed = Vec::new();
        let mut rewrites = 0usize;
        for tile in self.plan.tiles() {
            let chunk = self.plan.tile_chunk(&fchunk, tile);
            let buf = self
                .open
                .entry(chunk.clone())
                .or_insert_with(|| ChunkBuf::new(&chunk, &self.dims, self.sample_nbytes));
            let (complete, rewrite) =
                buf.write_tile(frame_slot, tile, frame, self.frame_width, self.sample_nbytes);
            rewrites += rewrite as usize;
            if complete {
                if let Some(buf) = self.open.remove(&chunk) {
                    completed.push(buf.close(chunk));
                }
            }
        }
        if rewrites > 0 {
            warn!(
                "Frame at {:?} overwrote previously written data in {} chunks",
                coord, rewrites
            );
        }
        completed
    }

    /// Closes every open buffer, trimmed, in chunk order.
    pub fn drain(&mut self) -> Vec<ClosedChunk> {
        let mut out: Vec<ClosedChunk> = self
            .open
            .drain()
            .map(|(chunk, buf)| buf.close_trimmed(chunk))
            .collect();
        out.sort_unstable_by(|a, b| a.chunk.cmp(&b.chunk));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;
    use smallvec::smallvec;

    fn dims(spec: &[(&str, DimensionKind, u64, u64)]) -> ArrayDims {
        ArrayDims::new(
            spec.iter()
                .map(|(n, k, a, c)| Dimension::new(*n, *k, *a, *c, 1).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn tyx(t_extent: u64, t_chunk: u64) -> ArrayDims {
        use DimensionKind::*;
        ArrayDims::new(vec![
            Dimension::new("t", Time, t_extent, t_chunk, 1).unwrap(),
            Dimension::new("y", Space, 2, 2, 1).unwrap(),
            Dimension::new("x", Space, 2, 2, 1).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn completes_when_all_frames_arrive() {
        let dims = tyx(2, 2);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);

        let done = acc.write_frame(&[0], &[1, 2, 3, 4]);
        assert!(done.is_empty());
        assert_eq!(acc.open_chunks(), 1);

        let done = acc.write_frame(&[1], &[5, 6, 7, 8]);
        assert_eq!(done.len(), 1);
        assert!(acc.is_empty());

        let expected_chunk: GridCoord = smallvec![0, 0, 0];
        assert_eq!(done[0].chunk, expected_chunk);
        assert_eq!(done[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn out_of_order_frames_complete_too() {
        let dims = tyx(2, 2);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);
        assert!(acc.write_frame(&[1], &[5, 6, 7, 8]).is_empty());
        let done = acc.write_frame(&[0], &[1, 2, 3, 4]);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn spatial_ragged_chunks_are_padded() {
        use DimensionKind::*;
        // 3x2 frame over 2x2 spatial chunks: bottom row of chunks is ragged
        let dims = dims(&[
            ("t", Time, 1, 1),
            ("y", Space, 3, 2),
            ("x", Space, 2, 2),
        ]);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);

        let done = acc.write_frame(&[0], &[1, 2, 3, 4, 5, 6]);
        // one frame fills every chunk of the t-extent-1 array
        assert_eq!(done.len(), 2);

        let top: GridCoord = smallvec![0, 0, 0];
        let bottom: GridCoord = smallvec![0, 1, 0];
        assert_eq!(done[0].chunk, top);
        assert_eq!(done[0].data, vec![1, 2, 3, 4]);
        // ragged spatial chunk keeps its nominal extent, zero-padded
        assert_eq!(done[1].chunk, bottom);
        assert_eq!(done[1].data, vec![5, 6, 0, 0]);
    }

    #[test]
    fn multibyte_samples_copy_whole_elements() {
        let dims = tyx(1, 1);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt16);
        let frame: Vec<u8> = vec![0x01, 0x10, 0x02, 0x20, 0x03, 0x30, 0x04, 0x40];
        let done = acc.write_frame(&[0], &frame);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data, frame);
    }

    #[test]
    fn drain_trims_to_last_written_frame() {
        let dims = tyx(4, 4);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);

        assert!(acc.write_frame(&[0], &[1; 4]).is_empty());
        assert!(acc.write_frame(&[2], &[3; 4]).is_empty());

        let drained = acc.drain();
        assert!(acc.is_empty());
        assert_eq!(drained.len(), 1);
        // three frames kept: the skipped middle one stays zero
        let mut expected = vec![1u8; 4];
        expected.extend([0; 4]);
        expected.extend([3; 4]);
        assert_eq!(drained[0].data, expected);
    }

    #[test]
    fn drain_keeps_full_buffers_whole() {
        use DimensionKind::*;
        // channel dimension: frame slots are (t, c) pairs
        let dims = dims(&[
            ("t", Time, 2, 2),
            ("c", Channel, 2, 2),
            ("y", Space, 2, 2),
            ("x", Space, 2, 2),
        ]);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);

        acc.write_frame(&[0, 0], &[1; 4]);
        acc.write_frame(&[0, 1], &[2; 4]);
        acc.write_frame(&[1, 0], &[3; 4]);
        let drained = acc.drain();
        assert_eq!(drained.len(), 1);
        // last written slot is (1, 0): both t rows kept, missing (1, 1) zero
        let mut expected = vec![1u8; 4];
        expected.extend([2; 4]);
        expected.extend([3; 4]);
        expected.extend([0; 4]);
        assert_eq!(drained[0].data, expected);
    }

    #[test]
    fn ragged_time_chunk_allocates_in_range() {
        // t extent 3 with chunks of 2: second chunk holds one frame
        let dims = tyx(3, 2);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);
        let done = acc.write_frame(&[2], &[9; 4]);
        // single in-range slot, so the chunk completes immediately
        assert_eq!(done.len(), 1);
        let chunk: GridCoord = smallvec![1, 0, 0];
        assert_eq!(done[0].chunk, chunk);
        assert_eq!(done[0].data, vec![9; 4]);
    }

    #[test]
    fn rewrites_overwrite_without_double_counting() {
        let dims = tyx(2, 2);
        let mut acc = ChunkAccumulator::new(&dims, SampleType::UInt8);
        assert!(acc.write_frame(&[0], &[1; 4]).is_empty());
        assert!(acc.write_frame(&[0], &[2; 4]).is_empty());
        let done = acc.write_frame(&[1], &[3; 4]);
        assert_eq!(done.len(), 1);
        let mut expected = vec![2u8; 4];
        expected.extend([3; 4]);
        assert_eq!(done[0].data, expected);
    }
}
