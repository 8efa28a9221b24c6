//! Zarr v3 metadata documents and their emission at finalise time.
use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};

use crate::chunk_key_encoding::{ChunkKeyEncoding, DefaultChunkKeyEncoding, Separator};
use crate::codecs::sharding::{ArrayCodec, ShardingIndexedCodec};
use crate::codecs::CodecChain;
use crate::data_type::SampleType;
use crate::dimension::ArrayDims;
use crate::store::{ArrayStore, ARRAY_NODE, EXTERNAL_METADATA_KEY, METADATA_KEY};
use crate::{variant_from_data, CoordVec, GridCoord, ZARR_FORMAT};

pub type JsonObject = HashMap<String, serde_json::Value>;

/// Attribute key for the physical pixel pitch, `[y, x]` in micrometers.
pub const SAMPLE_SPACING_KEY: &str = "sample_spacing_um";

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct RegularChunkGrid {
    chunk_shape: GridCoord,
}

impl RegularChunkGrid {
    pub fn new(chunk_shape: GridCoord) -> Self {
        Self { chunk_shape }
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(tag = "name", content = "configuration", rename_all = "lowercase")]
pub enum ChunkGridType {
    Regular(RegularChunkGrid),
}

variant_from_data!(ChunkGridType, Regular, RegularChunkGrid);

impl ChunkGridType {
    pub fn chunk_shape(&self) -> &[u64] {
        match self {
            Self::Regular(g) => g.chunk_shape(),
        }
    }
}

/// The `zarr.json` document describing the streamed array.
///
/// The chunk grid advertises the outer (shard) extent per dimension;
/// the true write granularity lives in the `sharding_indexed` codec's
/// `chunk_shape`. Use [ArrayMetadataBuilder] to construct this.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct ArrayMetadata {
    zarr_format: usize,
    shape: GridCoord,
    data_type: SampleType,
    chunk_grid: ChunkGridType,
    chunk_key_encoding: ChunkKeyEncoding,
    fill_value: serde_json::Value,
    codecs: Vec<ArrayCodec>,
    #[serde(default = "HashMap::default", skip_serializing_if = "HashMap::is_empty")]
    attributes: JsonObject,
    dimension_names: CoordVec<String>,
    #[serde(default = "Vec::default")]
    extensions: Vec<serde_json::Value>,
}

impl ArrayMetadata {
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn data_type(&self) -> SampleType {
        self.data_type
    }

    pub fn chunk_grid(&self) -> &ChunkGridType {
        &self.chunk_grid
    }

    pub fn chunk_key_encoding(&self) -> &ChunkKeyEncoding {
        &self.chunk_key_encoding
    }

    pub fn fill_value(&self) -> &serde_json::Value {
        &self.fill_value
    }

    pub fn codecs(&self) -> &[ArrayCodec] {
        &self.codecs
    }

    pub fn attributes(&self) -> &JsonObject {
        &self.attributes
    }

    pub fn dimension_names(&self) -> &[String] {
        &self.dimension_names
    }

    pub fn extensions(&self) -> &[serde_json::Value] {
        &self.extensions
    }
}

pub struct ArrayMetadataBuilder<'d> {
    dims: &'d ArrayDims,
    sample_type: SampleType,
    codecs: CodecChain,
    separator: Separator,
    attributes: JsonObject,
}

impl<'d> ArrayMetadataBuilder<'d> {
    pub fn new(dims: &'d ArrayDims, sample_type: SampleType) -> Self {
        Self {
            dims,
            sample_type,
            codecs: CodecChain::default(),
            separator: Separator::default(),
            attributes: JsonObject::default(),
        }
    }

    /// Set the chunk-encoding chain embedded in the sharding codec.
    pub fn codecs(mut self, codecs: CodecChain) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn separator(mut self, separator: Separator) -> Self {
        self.separator = separator;
        self
    }

    pub fn sample_spacing_um(mut self, spacing: [f64; 2]) -> Self {
        self.attributes.insert(
            SAMPLE_SPACING_KEY.to_string(),
            serde_json::json!([spacing[0], spacing[1]]),
        );
        self
    }

    pub fn attribute<S: Serialize>(
        mut self,
        key: &str,
        value: S,
    ) -> Result<Self, serde_json::Error> {
        let v = serde_json::to_value(value)?;
        self.attributes.insert(key.to_string(), v);
        Ok(self)
    }

    pub fn build(self) -> ArrayMetadata {
        let sharding = ShardingIndexedCodec::new(self.dims.chunk_shape(), self.codecs);
        ArrayMetadata {
            zarr_format: ZARR_FORMAT,
            shape: self.dims.shape(),
            data_type: self.sample_type,
            chunk_grid: RegularChunkGrid::new(self.dims.zarr_chunk_shape()).into(),
            chunk_key_encoding: DefaultChunkKeyEncoding::new(self.separator).into(),
            fill_value: self.sample_type.fill_value(),
            codecs: vec![sharding.into()],
            attributes: self.attributes,
            dimension_names: self.dims.dimension_names().into_iter().collect(),
            extensions: Vec::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct GroupMetadata {
    zarr_format: usize,
    #[serde(default = "HashMap::default", skip_serializing_if = "HashMap::is_empty")]
    attributes: JsonObject,
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
            attributes: JsonObject::default(),
        }
    }
}

impl GroupMetadata {
    pub fn zarr_format(&self) -> usize {
        self.zarr_format
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "node_type", rename_all = "lowercase")]
pub enum Metadata {
    Array(ArrayMetadata),
    Group(GroupMetadata),
}

impl Default for Metadata {
    fn default() -> Self {
        Self::Group(GroupMetadata::default())
    }
}

impl Metadata {
    pub fn is_array(&self) -> bool {
        match self {
            Self::Array(_) => true,
            _ => false,
        }
    }

    pub fn get_zarr_format(&self) -> usize {
        match self {
            Metadata::Array(m) => m.zarr_format,
            Metadata::Group(m) => m.zarr_format,
        }
    }
}

variant_from_data!(Metadata, Array, ArrayMetadata);
variant_from_data!(Metadata, Group, GroupMetadata);

/// Write the group, array, and external documents for a finished stream.
///
/// Called once all shard data is on disk, so the documents never describe
/// bytes which do not exist yet.
pub fn write_stream_metadata(
    store: &ArrayStore,
    array: ArrayMetadata,
    external: &serde_json::Value,
) -> io::Result<()> {
    store.write_json(&[METADATA_KEY], &Metadata::Group(GroupMetadata::default()))?;
    store.write_json(&[ARRAY_NODE, METADATA_KEY], &Metadata::Array(array))?;
    store.write_json(&[EXTERNAL_METADATA_KEY], external)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::dimension::tests::acquire_dims;

    const EXAMPLE_ARRAY_META: &str = r#"
        {
            "zarr_format": 3,
            "node_type": "array",
            "shape": [16, 1, 1080, 1920],
            "data_type": "uint8",
            "chunk_grid": {
                "name": "regular",
                "configuration": {
                    "chunk_shape": [16, 1, 1232, 2192]
                }
            },
            "chunk_key_encoding": {
                "name": "default",
                "configuration": {
                    "separator": "/"
                }
            },
            "fill_value": 0,
            "codecs": [{
                "name": "sharding_indexed",
                "configuration": {
                    "chunk_shape": [16, 1, 154, 274],
                    "codecs": [{
                        "name": "bytes",
                        "configuration": {
                            "endian": "little"
                        }
                    }]
                }
            }],
            "dimension_names": ["t", "c", "y", "x"],
            "extensions": []
        }
    "#;

    const EXAMPLE_GROUP_META: &str = r#"
        {
            "zarr_format": 3,
            "node_type": "group"
        }
    "#;

    #[test]
    fn array_meta_roundtrip() {
        let meta: Metadata =
            serde_json::from_str(EXAMPLE_ARRAY_META).expect("Could not deserialise array metadata");
        assert!(meta.is_array());
        assert_eq!(meta.get_zarr_format(), 3);
        let s2 = serde_json::to_string(&meta).expect("Couldn't serialize array metadata");
        let meta2: Metadata = serde_json::from_str(&s2).unwrap();
        assert_eq!(meta, meta2);
    }

    #[test]
    fn group_meta_roundtrip() {
        let meta: Metadata =
            serde_json::from_str(EXAMPLE_GROUP_META).expect("Could not deserialise group metadata");
        assert!(!meta.is_array());
        let s2 = serde_json::to_string(&meta).expect("Couldn't serialize group metadata");
        assert!(!s2.contains("attributes"));
    }

    #[test]
    fn builder_matches_example() {
        let dims = acquire_dims();
        let built = ArrayMetadataBuilder::new(&dims, SampleType::UInt8).build();
        let parsed: Metadata = serde_json::from_str(EXAMPLE_ARRAY_META).unwrap();
        assert_eq!(Metadata::Array(built), parsed);
    }

    #[test]
    fn zarr_chunk_grid_is_shard_sized() {
        let dims = acquire_dims();
        let meta = ArrayMetadataBuilder::new(&dims, SampleType::UInt8).build();
        let expected: GridCoord = smallvec![16, 1, 1232, 2192];
        assert_eq!(meta.chunk_grid().chunk_shape(), expected.as_slice());
        match &meta.codecs()[0] {
            ArrayCodec::ShardingIndexed(s) => {
                let inner: GridCoord = smallvec![16, 1, 154, 274];
                assert_eq!(s.chunk_shape, inner);
            }
        }
    }

    #[test]
    fn spacing_attribute() {
        let dims = acquire_dims();
        let meta = ArrayMetadataBuilder::new(&dims, SampleType::UInt8)
            .sample_spacing_um([0.9, 1.1])
            .build();
        assert_eq!(
            meta.attributes().get(SAMPLE_SPACING_KEY),
            Some(&serde_json::json!([0.9, 1.1]))
        );
    }

    #[test]
    fn custom_attributes_join_the_spacing() {
        let dims = acquire_dims();
        let meta = ArrayMetadataBuilder::new(&dims, SampleType::UInt8)
            .sample_spacing_um([0.9, 1.1])
            .attribute("exposure_ms", 12.5)
            .unwrap()
            .build();
        assert_eq!(
            meta.attributes().get("exposure_ms"),
            Some(&serde_json::json!(12.5))
        );
        assert_eq!(
            meta.attributes().get(SAMPLE_SPACING_KEY),
            Some(&serde_json::json!([0.9, 1.1]))
        );
    }

    #[test]
    fn documents_land_in_store() {
        let tmp = tempdir::TempDir::new("zarr3-sink-test").unwrap();
        let store = ArrayStore::create(tmp.path().join("run.zarr"), false).unwrap();
        let dims = acquire_dims();
        let meta = ArrayMetadataBuilder::new(&dims, SampleType::UInt8).build();
        write_stream_metadata(&store, meta, &serde_json::json!({"instrument": "sim"})).unwrap();

        let group: Metadata = serde_json::from_reader(
            std::fs::File::open(store.root().join(METADATA_KEY)).unwrap(),
        )
        .unwrap();
        assert!(!group.is_array());

        let array: Metadata = serde_json::from_reader(
            std::fs::File::open(store.array_path().join(METADATA_KEY)).unwrap(),
        )
        .unwrap();
        assert!(array.is_array());

        let external: serde_json::Value = serde_json::from_reader(
            std::fs::File::open(store.root().join(EXTERNAL_METADATA_KEY)).unwrap(),
        )
        .unwrap();
        assert_eq!(external["instrument"], "sim");
    }
}
