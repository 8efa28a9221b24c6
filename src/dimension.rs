use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GridCoord;

/// Role of an axis in the acquired stream.
///
/// The final two dimensions of an array are the frame plane and must be
/// [DimensionKind::Space]; every earlier dimension indexes frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionKind {
    Time,
    Channel,
    Space,
    Other,
}

impl DimensionKind {
    pub fn is_spatial(&self) -> bool {
        matches!(self, Self::Space)
    }
}

#[derive(Error, Debug)]
pub enum DimensionError {
    #[error("Dimension {name:?} has zero {what} extent")]
    ZeroExtent { name: String, what: &'static str },
    #[error("Got {0} dimensions, need at least 3")]
    TooFewDimensions(usize),
    #[error("Dimension {index} ({name:?}) must be spatial")]
    ExpectedSpatial { index: usize, name: String },
    #[error("Spatial dimension {index} ({name:?}) must be one of the last two")]
    UnexpectedSpatial { index: usize, name: String },
}

/// One axis of the output array, with its storage granularity.
///
/// `chunk_extent` is the extent of one chunk along this axis and
/// `shard_extent_chunks` the number of chunks per shard along it, so one
/// shard file covers `chunk_extent * shard_extent_chunks` array elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub kind: DimensionKind,
    pub array_extent: u64,
    pub chunk_extent: u64,
    pub shard_extent_chunks: u64,
}

impl Dimension {
    pub fn new(
        name: impl Into<String>,
        kind: DimensionKind,
        array_extent: u64,
        chunk_extent: u64,
        shard_extent_chunks: u64,
    ) -> Result<Self, DimensionError> {
        let d = Self {
            name: name.into(),
            kind,
            array_extent,
            chunk_extent,
            shard_extent_chunks,
        };
        d.validate()?;
        Ok(d)
    }

    fn validate(&self) -> Result<(), DimensionError> {
        for (extent, what) in [
            (self.array_extent, "array"),
            (self.chunk_extent, "chunk"),
            (self.shard_extent_chunks, "shard"),
        ] {
            if extent == 0 {
                return Err(DimensionError::ZeroExtent {
                    name: self.name.clone(),
                    what,
                });
            }
        }
        Ok(())
    }

    /// Number of chunks needed to cover the array extent.
    pub fn chunk_count(&self) -> u64 {
        ceil_div(self.array_extent, self.chunk_extent)
    }

    /// Number of shards needed to cover the chunks.
    pub fn shard_count(&self) -> u64 {
        ceil_div(self.chunk_count(), self.shard_extent_chunks)
    }

    /// Extent of one outer (zarr chunk grid) chunk, i.e. one shard.
    pub fn zarr_chunk_extent(&self) -> u64 {
        self.chunk_extent * self.shard_extent_chunks
    }
}

fn ceil_div(n: u64, d: u64) -> u64 {
    n / d + u64::from(n % d != 0)
}

/// Validated dimension set for one array.
///
/// Checked on construction: at least 3 dimensions, all extents nonzero,
/// spatial axes exactly the final two (frame height then width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDims {
    dims: Vec<Dimension>,
}

impl ArrayDims {
    pub fn new(dims: Vec<Dimension>) -> Result<Self, DimensionError> {
        if dims.len() < 3 {
            return Err(DimensionError::TooFewDimensions(dims.len()));
        }
        let spatial_from = dims.len() - 2;
        for (index, d) in dims.iter().enumerate() {
            d.validate()?;
            if index >= spatial_from && !d.kind.is_spatial() {
                return Err(DimensionError::ExpectedSpatial {
                    index,
                    name: d.name.clone(),
                });
            }
            if index < spatial_from && d.kind.is_spatial() {
                return Err(DimensionError::UnexpectedSpatial {
                    index,
                    name: d.name.clone(),
                });
            }
        }
        Ok(Self { dims })
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Dimensions indexing frames, i.e. all but the final two.
    pub fn frame_dims(&self) -> &[Dimension] {
        &self.dims[..self.frame_ndim()]
    }

    pub fn frame_ndim(&self) -> usize {
        self.dims.len() - 2
    }

    pub fn shape(&self) -> GridCoord {
        self.dims.iter().map(|d| d.array_extent).collect()
    }

    /// Per-chunk extents (the sharding codec's inner chunk shape).
    pub fn chunk_shape(&self) -> GridCoord {
        self.dims.iter().map(|d| d.chunk_extent).collect()
    }

    /// Per-shard extents in array elements (the outer chunk grid's shape).
    pub fn zarr_chunk_shape(&self) -> GridCoord {
        self.dims.iter().map(|d| d.zarr_chunk_extent()).collect()
    }

    pub fn shard_shape_chunks(&self) -> GridCoord {
        self.dims.iter().map(|d| d.shard_extent_chunks).collect()
    }

    pub fn chunk_counts(&self) -> GridCoord {
        self.dims.iter().map(|d| d.chunk_count()).collect()
    }

    pub fn shard_counts(&self) -> GridCoord {
        self.dims.iter().map(|d| d.shard_count()).collect()
    }

    /// Slots in each shard's index table.
    pub fn chunks_per_shard(&self) -> u64 {
        self.dims.iter().map(|d| d.shard_extent_chunks).product()
    }

    /// Elements in one full nominal chunk.
    pub fn chunk_numel(&self) -> u64 {
        self.dims.iter().map(|d| d.chunk_extent).product()
    }

    /// (height, width) of one frame.
    pub fn frame_shape(&self) -> (u64, u64) {
        let n = self.dims.len();
        (self.dims[n - 2].array_extent, self.dims[n - 1].array_extent)
    }

    /// Samples in one frame.
    pub fn frame_numel(&self) -> u64 {
        let (h, w) = self.frame_shape();
        h * w
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.dims.iter().map(|d| d.name.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use smallvec::smallvec;

    fn dim(name: &str, kind: DimensionKind, a: u64, c: u64, s: u64) -> Dimension {
        Dimension::new(name, kind, a, c, s).unwrap()
    }

    /// Dimensions from the acquire-zarr streaming test fixture.
    pub(crate) fn acquire_dims() -> ArrayDims {
        ArrayDims::new(vec![
            dim("t", DimensionKind::Time, 16, 16, 1),
            dim("c", DimensionKind::Channel, 1, 1, 1),
            dim("y", DimensionKind::Space, 1080, 154, 8),
            dim("x", DimensionKind::Space, 1920, 274, 8),
        ])
        .unwrap()
    }

    #[test]
    fn derived_geometry() {
        let dims = acquire_dims();
        let shape: GridCoord = smallvec![16, 1, 1080, 1920];
        let chunk: GridCoord = smallvec![16, 1, 154, 274];
        let zarr_chunk: GridCoord = smallvec![16, 1, 1232, 2192];
        let chunk_counts: GridCoord = smallvec![1, 1, 8, 8];
        let shard_counts: GridCoord = smallvec![1, 1, 1, 1];
        assert_eq!(dims.shape(), shape);
        assert_eq!(dims.chunk_shape(), chunk);
        assert_eq!(dims.zarr_chunk_shape(), zarr_chunk);
        assert_eq!(dims.chunk_counts(), chunk_counts);
        assert_eq!(dims.shard_counts(), shard_counts);
        assert_eq!(dims.chunks_per_shard(), 64);
        assert_eq!(dims.frame_shape(), (1080, 1920));
        assert_eq!(dims.chunk_numel(), 16 * 154 * 274);
    }

    #[test]
    fn ragged_chunk_counts() {
        let d = dim("y", DimensionKind::Space, 1080, 154, 8);
        // 1080 / 154 = 7.01..
        assert_eq!(d.chunk_count(), 8);
        assert_eq!(d.shard_count(), 1);
        let exact = dim("t", DimensionKind::Time, 32, 16, 2);
        assert_eq!(exact.chunk_count(), 2);
        assert_eq!(exact.shard_count(), 1);
    }

    #[test]
    fn rejects_zero_extents() {
        assert!(Dimension::new("t", DimensionKind::Time, 0, 16, 1).is_err());
        assert!(Dimension::new("t", DimensionKind::Time, 16, 0, 1).is_err());
        assert!(Dimension::new("t", DimensionKind::Time, 16, 16, 0).is_err());
    }

    #[test]
    fn rejects_bad_spatial_placement() {
        // too few
        assert!(ArrayDims::new(vec![
            dim("y", DimensionKind::Space, 8, 8, 1),
            dim("x", DimensionKind::Space, 8, 8, 1),
        ])
        .is_err());
        // non-spatial tail
        assert!(ArrayDims::new(vec![
            dim("t", DimensionKind::Time, 8, 8, 1),
            dim("y", DimensionKind::Space, 8, 8, 1),
            dim("c", DimensionKind::Channel, 8, 8, 1),
        ])
        .is_err());
        // spatial interior
        assert!(ArrayDims::new(vec![
            dim("z", DimensionKind::Space, 8, 8, 1),
            dim("t", DimensionKind::Time, 8, 8, 1),
            dim("y", DimensionKind::Space, 8, 8, 1),
            dim("x", DimensionKind::Space, 8, 8, 1),
        ])
        .is_err());
    }

    #[test]
    fn serde_kind_lowercase() {
        let s = serde_json::to_string(&DimensionKind::Space).unwrap();
        assert_eq!(s, "\"space\"");
        let k: DimensionKind = serde_json::from_str("\"time\"").unwrap();
        assert_eq!(k, DimensionKind::Time);
    }
}
