use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Element type of the stored array, named as zarr v3 core data types.
///
/// Frames arrive as raw little-endian sample bytes; an all-zero buffer is
/// the fill value for every variant (0 and 0.0 share a bit pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    Float32,
}

#[derive(Error, Debug)]
#[error("Unknown data type {0:?}")]
pub struct UnknownSampleType(String);

impl SampleType {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::Float32 => 4,
        }
    }

    /// Value read back from elements never written.
    pub fn fill_value(&self) -> serde_json::Value {
        match self {
            Self::Float32 => 0.0.into(),
            _ => 0.into(),
        }
    }
}

impl Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UInt8 => "uint8",
            Self::Int8 => "int8",
            Self::UInt16 => "uint16",
            Self::Int16 => "int16",
            Self::Float32 => "float32",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SampleType {
    type Err = UnknownSampleType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(Self::UInt8),
            "int8" => Ok(Self::Int8),
            "uint16" => Ok(Self::UInt16),
            "int16" => Ok(Self::Int16),
            "float32" => Ok(Self::Float32),
            other => Err(UnknownSampleType(other.to_owned())),
        }
    }
}

impl Serialize for SampleType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SampleType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
