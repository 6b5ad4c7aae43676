use std::fmt;

/// Application height used to pick the active version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainHeight {
    /// Nothing committed yet; the first registered version bootstraps the chain.
    Genesis,
    At(u64),
}

impl ChainHeight {
    pub fn value(self) -> u64 {
        match self {
            Self::Genesis => 0,
            Self::At(height) => height,
        }
    }

    pub fn from_persisted(height: Option<u64>) -> Self {
        match height {
            None | Some(0) => Self::Genesis,
            Some(height) => Self::At(height),
        }
    }
}

impl fmt::Display for ChainHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Genesis => f.write_str("genesis"),
            Self::At(height) => write!(f, "height {height}"),
        }
    }
}
