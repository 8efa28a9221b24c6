use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::{BBCodec, CodecError};

/// Serializes as its numeric value, as the codec configuration expects.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum GzipLevel {
    None = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
    L5 = 5,
    L6 = 6,
    L7 = 7,
    L8 = 8,
    L9 = 9,
}

#[derive(Error, Debug)]
#[error("Invalid GZIP level {0} (must be 0-9)")]
pub struct InvalidGzipLevel(u32);

impl TryFrom<u32> for GzipLevel {
    type Error = InvalidGzipLevel;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::L1),
            2 => Ok(Self::L2),
            3 => Ok(Self::L3),
            4 => Ok(Self::L4),
            5 => Ok(Self::L5),
            6 => Ok(Self::L6),
            7 => Ok(Self::L7),
            8 => Ok(Self::L8),
            9 => Ok(Self::L9),
            other => Err(InvalidGzipLevel(other)),
        }
    }
}

impl Serialize for GzipLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(*self as u32)
    }
}

impl<'de> Deserialize<'de> for GzipLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = u32::deserialize(deserializer)?;
        v.try_into().map_err(de::Error::custom)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct GzipCodec {
    pub level: GzipLevel,
}

fn default_gzip_level() -> GzipLevel {
    GzipLevel::L6
}

impl GzipCodec {
    pub fn from_level(level: u32) -> Result<Self, InvalidGzipLevel> {
        Ok(Self {
            level: level.try_into()?,
        })
    }

    pub fn best() -> Self {
        Self {
            level: GzipLevel::L9,
        }
    }

    pub fn fastest() -> Self {
        Self {
            level: GzipLevel::L1,
        }
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self {
            level: default_gzip_level(),
        }
    }
}

impl BBCodec for GzipCodec {
    fn encode(&self, decoded: &[u8]) -> Result<Bytes, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), GzCompression::new(self.level as u32));
        encoder.write_all(decoded)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        GzDecoder::new(encoded).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}
