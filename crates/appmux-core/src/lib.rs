mod abci;
mod activation;
mod error;
mod height;
mod manifest;

pub use abci::AbciVersion;
pub use activation::ActivationOverride;
pub use error::{MultiplexerError, Result};
pub use height::ChainHeight;
pub use manifest::{VersionEntry, VersionsManifest, DEFAULT_BINARY_NAME};
