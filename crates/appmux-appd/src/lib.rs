mod binary;
mod extract;
mod fs_utils;
mod layout;
mod process;

pub use binary::{AppBinary, ExtractOutcome, PayloadSource};
pub use layout::{default_home, HomeLayout};
pub use process::{
    exit_code, RunningInstance, StdioBindings, StdioMode, StopOutcome, StopReport,
    DEFAULT_GRACE_PERIOD,
};
