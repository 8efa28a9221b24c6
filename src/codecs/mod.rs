use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_type::SampleType;
use crate::variant_from_data;

#[cfg(feature = "gzip")]
pub mod gzip;
pub mod sharding;

#[cfg(feature = "gzip")]
use gzip::GzipCodec;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec chain must start with the bytes codec")]
    MissingBytesStage,
    #[error("bytes codec is only valid as the first stage")]
    BytesStageNotFirst,
    #[error("Endianness must be specified for multi-byte data type {0}")]
    MissingEndian(SampleType),
    #[error("Samples are produced little-endian; cannot store {0} big-endian")]
    BigEndianUnsupported(SampleType),
    #[error("Could not encode chunk")]
    Io(#[from] std::io::Error),
}

/// Common interface for byte-stream transforms applied to a chunk.
pub trait BBCodec {
    fn encode(&self, decoded: &[u8]) -> Result<Bytes, CodecError>;

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError>;
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Big,
    Little,
}

#[cfg(target_endian = "big")]
pub const NATIVE_ENDIAN: Endian = Endian::Big;
#[cfg(target_endian = "little")]
pub const NATIVE_ENDIAN: Endian = Endian::Little;

pub const ZARR_ENDIAN: Endian = Endian::Little;

impl Default for Endian {
    fn default() -> Self {
        ZARR_ENDIAN
    }
}

/// The zarr `bytes` codec.
///
/// Frames already arrive as little-endian sample bytes, so encoding is a
/// pass-through; any configuration that would require a byte swap is
/// rejected up front by [CodecChain::validate_for].
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BytesCodec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endian: Option<Endian>,
}

impl Default for BytesCodec {
    fn default() -> Self {
        Self {
            endian: Some(ZARR_ENDIAN),
        }
    }
}

impl BytesCodec {
    pub fn new(endian: Option<Endian>) -> Self {
        Self { endian }
    }

    pub fn new_little() -> Self {
        Self::new(Some(Endian::Little))
    }

    pub fn new_single_byte() -> Self {
        Self::new(None)
    }

    pub fn endian(&self) -> Option<Endian> {
        self.endian
    }
}

impl BBCodec for BytesCodec {
    fn encode(&self, decoded: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(decoded))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(encoded))
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(rename_all = "lowercase", tag = "name", content = "configuration")]
pub enum CodecType {
    Bytes(BytesCodec),
    #[cfg(feature = "gzip")]
    Gzip(GzipCodec),
}

impl BBCodec for CodecType {
    fn encode(&self, decoded: &[u8]) -> Result<Bytes, CodecError> {
        match self {
            Self::Bytes(c) => c.encode(decoded),

            #[cfg(feature = "gzip")]
            Self::Gzip(c) => c.encode(decoded),
        }
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        match self {
            Self::Bytes(c) => c.decode(encoded),

            #[cfg(feature = "gzip")]
            Self::Gzip(c) => c.decode(encoded),
        }
    }
}

variant_from_data!(CodecType, Bytes, BytesCodec);

#[cfg(feature = "gzip")]
variant_from_data!(CodecType, Gzip, GzipCodec);

/// Codecs applied to each chunk before it lands in a shard, in order.
///
/// Serializes as the inner `codecs` list of the sharding configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(transparent)]
pub struct CodecChain(Vec<CodecType>);

impl Default for CodecChain {
    fn default() -> Self {
        Self(vec![BytesCodec::default().into()])
    }
}

impl CodecChain {
    pub fn new(codecs: Vec<CodecType>) -> Self {
        Self(codecs)
    }

    #[cfg(feature = "gzip")]
    pub fn with_compressor(mut self, compressor: GzipCodec) -> Self {
        self.0.push(compressor.into());
        self
    }

    pub fn codecs(&self) -> &[CodecType] {
        &self.0
    }

    /// Checks stage order and endianness against the stored sample type.
    pub fn validate_for(&self, sample_type: SampleType) -> Result<(), CodecError> {
        let first = match self.0.first() {
            Some(CodecType::Bytes(b)) => b,
            _ => return Err(CodecError::MissingBytesStage),
        };
        if self.0[1..]
            .iter()
            .any(|c| matches!(c, CodecType::Bytes(_)))
        {
            return Err(CodecError::BytesStageNotFirst);
        }
        if sample_type.nbytes() > 1 {
            match first.endian() {
                Some(Endian::Little) => {}
                Some(Endian::Big) => {
                    return Err(CodecError::BigEndianUnsupported(sample_type));
                }
                None => return Err(CodecError::MissingEndian(sample_type)),
            }
        }
        Ok(())
    }
}

impl BBCodec for CodecChain {
    fn encode(&self, decoded: &[u8]) -> Result<Bytes, CodecError> {
        let mut it = self.0.iter();

        let mut out;

        if let Some(c) = it.next() {
            out = c.encode(decoded)?;
        } else {
            return Ok(Bytes::copy_from_slice(decoded));
        }

        for c in it {
            out = c.encode(&out[..])?;
        }

        Ok(out)
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        let mut it = self.0.iter().rev();

        let mut out;

        if let Some(c) = it.next() {
            out = c.decode(encoded)?;
        } else {
            return Ok(Bytes::copy_from_slice(encoded));
        }

        for c in it {
            out = c.decode(&out[..])?;
        }

        Ok(out)
    }
}
