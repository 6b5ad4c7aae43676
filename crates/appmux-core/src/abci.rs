use serde::{Deserialize, Serialize};

/// ABCI dialect spoken between an application build and the consensus engine.
///
/// Ordering follows protocol age, so a registry can require that later
/// application versions never regress to an older dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbciVersion {
    V1,
    V2,
}

impl AbciVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" | "abci1" => Some(Self::V1),
            "v2" | "2" | "abci2" => Some(Self::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for AbciVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
