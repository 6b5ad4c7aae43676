mod height;
mod multiplexer;
mod output;
mod passthrough;

pub use height::{
    ChannelHeightMonitor, HeightEvent, HeightMonitor, HeightRecordFile, HeightStore,
    NodeHeightStore, RpcHeightMonitor, UpgradeInfoFile, ValidatorStateFile,
    DEFAULT_POLL_INTERVAL,
};
pub use multiplexer::{
    ChildOutput, LifecycleEvent, Multiplexer, MultiplexerState, ProxySettings, StartConfig,
    DEFAULT_READY_TIMEOUT,
};
pub use passthrough::{PassthroughDispatcher, VersionSelector};

#[cfg(test)]
mod tests;
