use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use appmux_core::MultiplexerError;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Inherit,
    Null,
    Piped,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::Piped => Stdio::piped(),
        }
    }
}

/// Where a launched application's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioBindings {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl StdioBindings {
    /// Output captured by the caller, stdin closed.
    pub fn piped_output() -> Self {
        Self {
            stdin: StdioMode::Null,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Piped,
        }
    }

    /// Output shared with the multiplexer, stdin closed.
    pub fn inherit_output() -> Self {
        Self {
            stdin: StdioMode::Null,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }

    pub(crate) fn apply(self, command: &mut tokio::process::Command) {
        command
            .stdin(self.stdin.to_stdio())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after the interrupt.
    Graceful,
    /// Still alive when the grace period ran out and was killed.
    Forced,
    /// Had already exited before the stop was requested.
    AlreadyExited,
}

#[derive(Debug, Clone, Copy)]
pub struct StopReport {
    pub app_version: u64,
    pub outcome: StopOutcome,
    pub status: ExitStatus,
    pub stopped_at: Instant,
}

/// The live subprocess of one application version.
///
/// The child is spawned with kill-on-drop, so dropping an instance on an
/// error or panic path still terminates the process.
#[derive(Debug)]
pub struct RunningInstance {
    app_version: u64,
    pid: Option<u32>,
    child: Child,
    launched_at: Instant,
}

impl RunningInstance {
    pub(crate) fn new(app_version: u64, child: Child) -> Self {
        Self {
            app_version,
            pid: child.id(),
            child,
            launched_at: Instant::now(),
        }
    }

    pub fn app_version(&self) -> u64 {
        self.app_version
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn launched_at(&self) -> Instant {
        self.launched_at
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Waits for the process to exit on its own. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Interrupts the process, waits up to `grace`, then kills it. Returns only
    /// after the process has been reaped, so any sockets or locks it held are
    /// released.
    pub async fn shutdown(mut self, grace: Duration) -> Result<StopReport, MultiplexerError> {
        let app_version = self.app_version;
        let stop_error = |source| MultiplexerError::Stop {
            app_version,
            source,
        };

        if let Some(status) = self.child.try_wait().map_err(stop_error)? {
            debug!(app_version, %status, "app already exited before stop");
            return Ok(self.report(StopOutcome::AlreadyExited, status));
        }

        self.interrupt().map_err(stop_error)?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(app_version, %status, "app stopped gracefully");
                Ok(self.report(StopOutcome::Graceful, status))
            }
            Ok(Err(err)) => Err(stop_error(err)),
            Err(_) => {
                warn!(
                    app_version,
                    grace_ms = grace.as_millis() as u64,
                    "app ignored interrupt within grace period, killing"
                );
                self.child.kill().await.map_err(stop_error)?;
                let status = self.child.wait().await.map_err(stop_error)?;
                Ok(self.report(StopOutcome::Forced, status))
            }
        }
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn report(&self, outcome: StopOutcome, status: ExitStatus) -> StopReport {
        StopReport {
            app_version: self.app_version,
            outcome,
            status,
            stopped_at: Instant::now(),
        }
    }
}

/// Maps an exit status to the code a shell would report.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
