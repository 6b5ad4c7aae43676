use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use appmux_abci::{strip_tcp_scheme, AbciProxy, Route};
use appmux_appd::{
    exit_code, RunningInstance, StdioBindings, StopOutcome, DEFAULT_GRACE_PERIOD,
};
use appmux_core::{ChainHeight, MultiplexerError, Result};
use appmux_registry::{VersionDescriptor, VersionRegistry};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::height::{HeightEvent, HeightMonitor, HeightStore};
use crate::output::forward_output;

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_CAPACITY: usize = 64;

/// What happens to the output of a started app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildOutput {
    /// Shares the multiplexer's stdout and stderr.
    #[default]
    Inherit,
    /// Re-emitted line by line as log records under the `appd` target.
    Log,
}

impl ChildOutput {
    fn stdio(self) -> StdioBindings {
        match self {
            Self::Inherit => StdioBindings::inherit_output(),
            Self::Log => StdioBindings::piped_output(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Address the consensus engine dials.
    pub listen_address: String,
    /// Address every app version is told to serve ABCI on.
    pub app_address: String,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StartConfig {
    /// Node home handed to every app version with `--home`.
    pub home: PathBuf,
    /// Appended verbatim after the version's own start arguments.
    pub extra_args: Vec<String>,
    pub grace_period: Duration,
    pub child_output: ChildOutput,
    /// `None` runs the apps without a proxy in front of them; the consensus
    /// engine then reconnects to each version by itself.
    pub proxy: Option<ProxySettings>,
}

impl StartConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            extra_args: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            child_output: ChildOutput::default(),
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerState {
    Idle,
    Resolving,
    Running { app_version: u64 },
    Switching { from: u64, to: u64 },
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Launched {
        app_version: u64,
        pid: Option<u32>,
        at: Instant,
    },
    Ready {
        app_version: u64,
        at: Instant,
    },
    Stopped {
        app_version: u64,
        outcome: StopOutcome,
        at: Instant,
    },
    Crashed {
        app_version: u64,
        code: Option<i32>,
        at: Instant,
    },
}

impl LifecycleEvent {
    pub fn app_version(&self) -> u64 {
        match *self {
            Self::Launched { app_version, .. }
            | Self::Ready { app_version, .. }
            | Self::Stopped { app_version, .. }
            | Self::Crashed { app_version, .. } => app_version,
        }
    }

    pub fn at(&self) -> Instant {
        match *self {
            Self::Launched { at, .. }
            | Self::Ready { at, .. }
            | Self::Stopped { at, .. }
            | Self::Crashed { at, .. } => at,
        }
    }
}

enum Step {
    Shutdown,
    Exited(Option<i32>),
    Observed(Option<HeightEvent>),
}

enum Launch {
    Ready(RunningInstance),
    Interrupted,
}

enum Readiness {
    Listening,
    TimedOut,
    Exited(Option<i32>),
    Interrupted,
}

/// The start command: keeps exactly the app version that is authoritative
/// for the chain's height running, and replaces it when the chain crosses an
/// activation height.
pub struct Multiplexer {
    registry: Arc<VersionRegistry>,
    config: StartConfig,
    state: watch::Sender<MultiplexerState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Multiplexer {
    pub fn new(registry: Arc<VersionRegistry>, config: StartConfig) -> Self {
        let (state, _) = watch::channel(MultiplexerState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            config,
            state,
            events,
        }
    }

    pub fn registry(&self) -> &VersionRegistry {
        &self.registry
    }

    pub fn state(&self) -> MultiplexerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MultiplexerState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Runs until `shutdown` resolves (`Ok`) or something fails. Either way
    /// the running app has been stopped and the state is `Terminated` when
    /// this returns.
    pub async fn run<S, M, F>(&self, store: &S, monitor: M, shutdown: F) -> Result<()>
    where
        S: HeightStore + ?Sized,
        M: HeightMonitor,
        F: Future<Output = ()>,
    {
        let result = self.run_until_terminated(store, monitor, shutdown).await;
        self.set_state(MultiplexerState::Terminated);
        match &result {
            Ok(()) => info!("multiplexer stopped"),
            Err(err) => warn!("multiplexer terminated: {err}"),
        }
        result
    }

    async fn run_until_terminated<S, M, F>(&self, store: &S, monitor: M, shutdown: F) -> Result<()>
    where
        S: HeightStore + ?Sized,
        M: HeightMonitor,
        F: Future<Output = ()>,
    {
        self.set_state(MultiplexerState::Resolving);
        let height = store.persisted_height()?;
        let descriptor = self.registry.resolve_for_height(height)?;
        info!(
            %height,
            app_version = descriptor.app_version(),
            "resolved app version for persisted height"
        );

        let proxy = match &self.config.proxy {
            Some(settings) => Some(AbciProxy::bind(&settings.listen_address).await?),
            None => None,
        };
        let result = self
            .supervise(store, descriptor, proxy.as_ref(), monitor, shutdown)
            .await;
        if let Some(proxy) = proxy {
            proxy.shutdown().await;
        }
        result
    }

    async fn supervise<'a, S, M, F>(
        &'a self,
        store: &S,
        mut current: &'a VersionDescriptor,
        proxy: Option<&AbciProxy>,
        mut monitor: M,
        shutdown: F,
    ) -> Result<()>
    where
        S: HeightStore + ?Sized,
        M: HeightMonitor,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut instance = match self.launch_ready(current, proxy, shutdown.as_mut()).await? {
            Launch::Ready(instance) => instance,
            Launch::Interrupted => return Ok(()),
        };
        let mut monitoring = true;

        loop {
            let has_next = self.registry.next(current).is_some();
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Shutdown,
                status = instance.wait() => Step::Exited(status.ok().map(exit_code)),
                event = monitor.next_event(), if monitoring && has_next => Step::Observed(event),
            };

            match step {
                Step::Shutdown => {
                    info!(app_version = current.app_version(), "shutdown requested");
                    if let Some(proxy) = proxy {
                        proxy.deactivate();
                    }
                    self.stop(current, instance).await?;
                    return Ok(());
                }
                Step::Exited(code) => {
                    if let Some(proxy) = proxy {
                        proxy.deactivate();
                    }
                    return Err(self.crashed(current.app_version(), code));
                }
                Step::Observed(None) => {
                    warn!(
                        app_version = current.app_version(),
                        "height monitor ended, no further upgrades will be detected"
                    );
                    monitoring = false;
                }
                Step::Observed(Some(event)) => {
                    if let HeightEvent::Height(height) = event {
                        if let Err(err) = store.record_height(height) {
                            warn!(height, "failed to record committed height: {err}");
                        }
                    }
                    let Some(target) = self.switch_target(current, event) else {
                        continue;
                    };
                    info!(
                        from = current.app_version(),
                        to = target.app_version(),
                        ?event,
                        "switching app version"
                    );
                    self.set_state(MultiplexerState::Switching {
                        from: current.app_version(),
                        to: target.app_version(),
                    });
                    if let Some(proxy) = proxy {
                        proxy.deactivate();
                    }
                    self.stop(current, instance).await?;

                    current = target;
                    instance = match self.launch_ready(current, proxy, shutdown.as_mut()).await? {
                        Launch::Ready(instance) => instance,
                        Launch::Interrupted => return Ok(()),
                    };
                }
            }
        }
    }

    /// The version to switch to after `event`, if it is newer than `current`.
    /// Skipped activation heights jump straight to the greatest active
    /// version.
    fn switch_target(
        &self,
        current: &VersionDescriptor,
        event: HeightEvent,
    ) -> Option<&VersionDescriptor> {
        let target = match event {
            HeightEvent::Height(height) => self
                .registry
                .resolve_for_height(ChainHeight::At(height))
                .ok()?,
            HeightEvent::UpgradeNotice { app_version } => self
                .registry
                .iter()
                .take_while(|descriptor| descriptor.app_version() <= app_version)
                .last()?,
        };
        (target.app_version() > current.app_version()).then_some(target)
    }

    async fn launch_ready<F>(
        &self,
        descriptor: &VersionDescriptor,
        proxy: Option<&AbciProxy>,
        mut shutdown: Pin<&mut F>,
    ) -> Result<Launch>
    where
        F: Future<Output = ()>,
    {
        let app_version = descriptor.app_version();
        let args = self.launch_args(descriptor);
        let mut instance = descriptor
            .binary()
            .launch(&args, self.config.child_output.stdio())?;
        if self.config.child_output == ChildOutput::Log {
            forward_output(&mut instance);
        }
        self.emit(LifecycleEvent::Launched {
            app_version,
            pid: instance.pid(),
            at: instance.launched_at(),
        });

        if let Some(settings) = &self.config.proxy {
            let probe = wait_until_listening(
                strip_tcp_scheme(&settings.app_address),
                settings.ready_timeout,
            );
            let readiness = tokio::select! {
                biased;
                _ = shutdown.as_mut() => Readiness::Interrupted,
                status = instance.wait() => Readiness::Exited(status.ok().map(exit_code)),
                listening = probe => if listening { Readiness::Listening } else { Readiness::TimedOut },
            };

            match readiness {
                Readiness::Listening => {}
                Readiness::Interrupted => {
                    info!(app_version, "shutdown requested while waiting for app readiness");
                    self.stop(descriptor, instance).await?;
                    return Ok(Launch::Interrupted);
                }
                Readiness::Exited(code) => return Err(self.crashed(app_version, code)),
                Readiness::TimedOut => {
                    self.stop(descriptor, instance).await?;
                    return Err(MultiplexerError::NotReady {
                        app_version,
                        timeout: settings.ready_timeout,
                    });
                }
            }
        }

        self.emit(LifecycleEvent::Ready {
            app_version,
            at: Instant::now(),
        });
        if let (Some(proxy), Some(settings)) = (proxy, &self.config.proxy) {
            proxy.activate(Route {
                app_version,
                abci_version: descriptor.abci_version(),
                upstream: settings.app_address.clone(),
            });
        }
        self.set_state(MultiplexerState::Running { app_version });
        info!(
            app_version,
            abci = %descriptor.abci_version(),
            label = %descriptor.binary().label(),
            "app version running"
        );
        Ok(Launch::Ready(instance))
    }

    pub(crate) fn launch_args(&self, descriptor: &VersionDescriptor) -> Vec<String> {
        let mut args = vec!["start".to_string()];
        args.extend(descriptor.start_args().iter().cloned());
        args.push("--home".to_string());
        args.push(self.config.home.display().to_string());
        if let Some(settings) = &self.config.proxy {
            args.push(format!(
                "--address=tcp://{}",
                strip_tcp_scheme(&settings.app_address)
            ));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    async fn stop(&self, descriptor: &VersionDescriptor, instance: RunningInstance) -> Result<()> {
        let report = descriptor
            .binary()
            .stop(instance, self.config.grace_period)
            .await?;
        self.emit(LifecycleEvent::Stopped {
            app_version: report.app_version,
            outcome: report.outcome,
            at: report.stopped_at,
        });
        Ok(())
    }

    fn crashed(&self, app_version: u64, code: Option<i32>) -> MultiplexerError {
        self.emit(LifecycleEvent::Crashed {
            app_version,
            code,
            at: Instant::now(),
        });
        MultiplexerError::ChildProcessExited { app_version, code }
    }

    fn set_state(&self, state: MultiplexerState) {
        debug!(?state, "multiplexer state changed");
        self.state.send_replace(state);
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn wait_until_listening(address: &str, limit: Duration) -> bool {
    let probe = async {
        loop {
            match TcpStream::connect(address).await {
                Ok(_) => return,
                Err(err) => debug!(address, "app not listening yet: {err}"),
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    };
    tokio::time::timeout(limit, probe).await.is_ok()
}
