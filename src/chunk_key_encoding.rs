use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::CoordVec;

#[enum_delegate::register]
pub trait ChunkKeyEncoder {
    /// Key components of a chunk's storage path, relative to the array node.
    fn components(&self, coord: &[u64]) -> CoordVec<String>;

    fn encode(&self, coord: &[u64]) -> String {
        self.components(coord).join("/")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    #[serde(rename = "/")]
    Slash,
    #[serde(rename = ".")]
    Dot,
}

impl Display for Separator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Separator::Slash => write!(f, "/"),
            Separator::Dot => write!(f, "."),
        }
    }
}

impl Default for Separator {
    fn default() -> Self {
        Separator::Slash
    }
}

fn slash() -> Separator {
    Separator::Slash
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DefaultChunkKeyEncoding {
    #[serde(default = "slash")]
    separator: Separator,
}

impl DefaultChunkKeyEncoding {
    pub fn new(separator: Separator) -> Self {
        Self { separator }
    }

    pub fn separator(&self) -> Separator {
        self.separator
    }
}

impl ChunkKeyEncoder for DefaultChunkKeyEncoding {
    fn components(&self, coord: &[u64]) -> CoordVec<String> {
        let mut out = CoordVec::default();
        match self.separator {
            Separator::Slash => {
                out.push("c".to_owned());
                for n in coord.iter() {
                    out.push(n.to_string());
                }
            }
            Separator::Dot => {
                let sep = self.separator.to_string();
                let s = coord
                    .iter()
                    .map(|n| n.to_string())
                    .fold(String::from("c"), |a, b| a + &sep + &b);
                out.push(s);
            }
        }
        out
    }
}

impl Default for DefaultChunkKeyEncoding {
    fn default() -> Self {
        Self {
            separator: Separator::Slash,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name", content = "configuration", rename_all = "lowercase")]
#[enum_delegate::implement(ChunkKeyEncoder)]
pub enum ChunkKeyEncoding {
    Default(DefaultChunkKeyEncoding),
}

impl Default for ChunkKeyEncoding {
    fn default() -> Self {
        Self::Default(DefaultChunkKeyEncoding::default())
    }
}
