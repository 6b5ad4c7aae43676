use appmux_appd::AppBinary;
use appmux_core::{AbciVersion, ChainHeight};

/// Binds an application version to the build that implements it, the ABCI
/// dialect that build speaks, and the arguments it is started with.
#[derive(Debug)]
pub struct VersionDescriptor {
    app_version: u64,
    abci_version: AbciVersion,
    activation_height: Option<u64>,
    binary: AppBinary,
    start_args: Vec<String>,
}

impl VersionDescriptor {
    pub fn new(
        app_version: u64,
        abci_version: AbciVersion,
        binary: AppBinary,
        start_args: Vec<String>,
    ) -> Self {
        Self {
            app_version,
            abci_version,
            activation_height: None,
            binary,
            start_args,
        }
    }

    pub fn with_activation_height(mut self, height: u64) -> Self {
        self.activation_height = Some(height);
        self
    }

    pub fn app_version(&self) -> u64 {
        self.app_version
    }

    pub fn abci_version(&self) -> AbciVersion {
        self.abci_version
    }

    /// Height from which this version is authoritative; `None` means no
    /// lower bound.
    pub fn activation_height(&self) -> Option<u64> {
        self.activation_height
    }

    pub fn binary(&self) -> &AppBinary {
        &self.binary
    }

    pub fn start_args(&self) -> &[String] {
        &self.start_args
    }

    pub fn is_active_at(&self, height: ChainHeight) -> bool {
        match self.activation_height {
            None => true,
            Some(activation) => activation <= height.value(),
        }
    }

    pub(crate) fn set_activation_height(&mut self, height: u64) {
        self.activation_height = Some(height);
    }

    pub(crate) fn push_start_arg(&mut self, arg: String) {
        self.start_args.push(arg);
    }
}
