pub use crate::chunk_key_encoding::Separator;
#[cfg(feature = "gzip")]
pub use crate::codecs::gzip::GzipCodec;
pub use crate::codecs::CodecChain;
pub use crate::data_type::SampleType;
pub use crate::dimension::{ArrayDims, Dimension, DimensionKind};
pub use crate::metadata::{ArrayMetadata, ArrayMetadataBuilder, GroupMetadata, Metadata};
pub use crate::session::{ArraySession, SessionError, StreamSettings};
pub use crate::store::ArrayStore;
pub use crate::stream_to_zarr;

pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use smallvec;
