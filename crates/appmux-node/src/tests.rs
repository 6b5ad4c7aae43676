use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appmux_abci::AbciCodec;
use appmux_appd::{AppBinary, HomeLayout, PayloadSource, StopOutcome};
use appmux_core::{AbciVersion, ChainHeight, MultiplexerError};
use appmux_registry::{VersionDescriptor, VersionRegistry};
use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use semver::Version;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::*;
use crate::height::{parse_status, status_url};

const STEP: Duration = Duration::from_secs(10);

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> HomeLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "appmux-node-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create test home");
    HomeLayout::new(path)
}

fn script_payload(script: &str) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "appd", script.as_bytes())
        .expect("must append script");
    let encoder = builder.into_inner().expect("must finish tar");
    encoder.finish().expect("must finish gzip")
}

/// An app that records how it was started and runs until interrupted.
fn long_running_app(tag: &str, log: &Path) -> String {
    format!(
        "#!/bin/sh\ntrap 'exit 0' INT TERM\necho \"{tag} $*\" >> \"{}\"\nwhile :; do sleep 0.05; done\n",
        log.display()
    )
}

fn descriptor(
    layout: &HomeLayout,
    app_version: u64,
    abci: AbciVersion,
    activation: Option<u64>,
    script: String,
) -> VersionDescriptor {
    let binary = AppBinary::new(
        app_version,
        Version::new(app_version, 0, 0),
        PayloadSource::Embedded(Cow::Owned(script_payload(&script))),
        layout.clone(),
    );
    let descriptor = VersionDescriptor::new(app_version, abci, binary, Vec::new());
    match activation {
        Some(height) => descriptor.with_activation_height(height),
        None => descriptor,
    }
}

/// v1 from genesis, v2 from height 100; both record their launches in `log`.
fn upgrade_registry(layout: &HomeLayout, log: &Path) -> Arc<VersionRegistry> {
    Arc::new(
        VersionRegistry::new(vec![
            descriptor(layout, 1, AbciVersion::V1, None, long_running_app("v1", log)),
            descriptor(
                layout,
                2,
                AbciVersion::V2,
                Some(100),
                long_running_app("v2", log),
            ),
        ])
        .expect("registry must build"),
    )
}

fn start_config(layout: &HomeLayout) -> StartConfig {
    let mut config = StartConfig::new(layout.home());
    config.grace_period = Duration::from_secs(5);
    config
}

struct Harness {
    multiplexer: Arc<Multiplexer>,
    state: watch::Receiver<MultiplexerState>,
    events: broadcast::Receiver<LifecycleEvent>,
    heights: tokio::sync::mpsc::Sender<HeightEvent>,
    stop: Option<oneshot::Sender<()>>,
    run: JoinHandle<appmux_core::Result<()>>,
}

fn spawn_multiplexer<S>(registry: Arc<VersionRegistry>, config: StartConfig, store: S) -> Harness
where
    S: HeightStore + Send + Sync + 'static,
{
    let multiplexer = Arc::new(Multiplexer::new(registry, config));
    let state = multiplexer.subscribe_state();
    let events = multiplexer.subscribe_events();
    let (heights, monitor) = ChannelHeightMonitor::new(16);
    let (stop, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn({
        let multiplexer = Arc::clone(&multiplexer);
        async move {
            multiplexer
                .run(&store, monitor, async {
                    let _ = stop_rx.await;
                })
                .await
        }
    });
    Harness {
        multiplexer,
        state,
        events,
        heights,
        stop: Some(stop),
        run,
    }
}

impl Harness {
    async fn wait_for_state(&mut self, expected: MultiplexerState) {
        timeout(STEP, self.state.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"))
            .expect("multiplexer must keep publishing state");
    }

    async fn observe(&self, event: HeightEvent) {
        self.heights.send(event).await.expect("monitor must be listening");
    }

    async fn shutdown(mut self) -> (appmux_core::Result<()>, Vec<LifecycleEvent>) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.finish().await
    }

    async fn finish(mut self) -> (appmux_core::Result<()>, Vec<LifecycleEvent>) {
        let result = timeout(STEP, &mut self.run)
            .await
            .expect("multiplexer must finish in time")
            .expect("multiplexer task must not panic");
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        (result, events)
    }
}

fn kinds(events: &[LifecycleEvent]) -> Vec<(&'static str, u64)> {
    events
        .iter()
        .map(|event| {
            let kind = match event {
                LifecycleEvent::Launched { .. } => "launched",
                LifecycleEvent::Ready { .. } => "ready",
                LifecycleEvent::Stopped { .. } => "stopped",
                LifecycleEvent::Crashed { .. } => "crashed",
            };
            (kind, event.app_version())
        })
        .collect()
}

fn read_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_for_log_lines(path: &Path, count: usize) -> Vec<String> {
    for _ in 0..500 {
        let lines = read_log(path);
        if lines.len() >= count {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} lines in {}", path.display());
}

fn unused_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("must bind");
    listener.local_addr().expect("address").to_string()
}

#[test]
fn validator_state_file_reads_persisted_height() {
    let layout = test_layout();
    let path = layout.validator_state_path();
    fs::create_dir_all(layout.data_dir()).expect("data dir");

    let store = ValidatorStateFile::new(&path);
    assert_eq!(
        store.persisted_height().expect("missing file"),
        ChainHeight::Genesis
    );

    fs::write(
        &path,
        r#"{"height": "2371495", "round": 0, "step": 3, "signature": "AAAA"}"#,
    )
    .expect("write state");
    assert_eq!(
        store.persisted_height().expect("string height"),
        ChainHeight::At(2_371_495)
    );

    fs::write(&path, r#"{"height": 0, "round": 0, "step": 0}"#).expect("write state");
    assert_eq!(
        store.persisted_height().expect("numeric height"),
        ChainHeight::Genesis
    );

    fs::write(&path, r#"{"height": "tall"}"#).expect("write state");
    let err = store.persisted_height().expect_err("invalid height");
    assert!(matches!(err, MultiplexerError::HeightSource(_)));
    assert!(err.to_string().contains("tall"));

    let _ = fs::remove_dir_all(layout.home());
}

#[test]
fn parses_cometbft_status_response() {
    let body = r#"{
        "jsonrpc": "2.0",
        "id": -1,
        "result": {
            "node_info": {"protocol_version": {"p2p": "8", "block": "11", "app": "2"}},
            "sync_info": {"latest_block_height": "1042", "catching_up": false}
        }
    }"#;
    let status = parse_status(body).expect("status must parse");
    assert_eq!(status.height, 1042);
    assert_eq!(status.app_version, Some(2));

    let without_node_info =
        parse_status(r#"{"result": {"sync_info": {"latest_block_height": "7"}}}"#)
            .expect("status must parse");
    assert_eq!(without_node_info.height, 7);
    assert_eq!(without_node_info.app_version, None);

    assert!(parse_status(r#"{"result": {"sync_info": {"latest_block_height": "x"}}}"#).is_err());
    assert!(parse_status("not json").is_err());
}

#[test]
fn status_url_normalizes_rpc_address() {
    assert_eq!(
        status_url("tcp://127.0.0.1:26657"),
        "http://127.0.0.1:26657/status"
    );
    assert_eq!(status_url("127.0.0.1:26657"), "http://127.0.0.1:26657/status");
    assert_eq!(
        status_url("https://rpc.example.org/"),
        "https://rpc.example.org/status"
    );
}

#[test]
fn version_selector_parses_latest_and_pins() {
    assert_eq!("latest".parse::<VersionSelector>(), Ok(VersionSelector::Latest));
    assert_eq!("v3".parse::<VersionSelector>(), Ok(VersionSelector::App(3)));
    assert_eq!("4".parse::<VersionSelector>(), Ok(VersionSelector::App(4)));
    assert!("vx".parse::<VersionSelector>().is_err());
    assert_eq!(VersionSelector::App(3).to_string(), "v3");
}

#[cfg(unix)]
#[test]
fn passthrough_returns_exact_exit_code_and_forwards_args() {
    let layout = test_layout();
    let log = layout.home().join("passthrough.log");
    let script = |tag: &str, code: i32| {
        format!(
            "#!/bin/sh\necho {tag} >> \"{log}\"\nfor arg in \"$@\"; do echo \"$arg\" >> \"{log}\"; done\nexit {code}\n",
            log = log.display()
        )
    };
    let registry = Arc::new(
        VersionRegistry::new(vec![
            descriptor(&layout, 1, AbciVersion::V1, None, script("v1", 7)),
            descriptor(&layout, 2, AbciVersion::V2, Some(100), script("v2", 0)),
        ])
        .expect("registry must build"),
    );
    let dispatcher = PassthroughDispatcher::new(registry);

    let args = vec![
        "query".to_string(),
        "bank".to_string(),
        "--note=two words".to_string(),
    ];
    let code = dispatcher
        .run(VersionSelector::App(1), &args)
        .expect("passthrough must run");
    assert_eq!(code, 7);
    assert_eq!(read_log(&log), ["v1", "query", "bank", "--note=two words"]);

    fs::remove_file(&log).expect("reset log");
    let code = dispatcher
        .run(VersionSelector::Latest, &[])
        .expect("passthrough must run");
    assert_eq!(code, 0);
    assert_eq!(read_log(&log), ["v2"]);

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[test]
fn passthrough_maps_signal_exit_like_a_shell() {
    let layout = test_layout();
    let registry = Arc::new(
        VersionRegistry::new(vec![descriptor(
            &layout,
            1,
            AbciVersion::V1,
            None,
            "#!/bin/sh\nkill -TERM $$\n".to_string(),
        )])
        .expect("registry must build"),
    );
    let code = PassthroughDispatcher::new(registry)
        .run(VersionSelector::Latest, &[])
        .expect("passthrough must run");
    assert_eq!(code, 128 + 15);

    let _ = fs::remove_dir_all(layout.home());
}

#[test]
fn passthrough_rejects_unknown_version() {
    let layout = test_layout();
    let registry = Arc::new(
        VersionRegistry::new(vec![descriptor(
            &layout,
            1,
            AbciVersion::V1,
            None,
            "#!/bin/sh\n".to_string(),
        )])
        .expect("registry must build"),
    );
    let err = PassthroughDispatcher::new(registry)
        .run(VersionSelector::App(5), &[])
        .expect_err("unknown version");
    assert!(matches!(err, MultiplexerError::UnknownVersion(5)));

    let _ = fs::remove_dir_all(layout.home());
}

#[test]
fn launch_args_append_home_address_and_extra_args() {
    let layout = HomeLayout::new("/node");
    let base = descriptor(&layout, 1, AbciVersion::V1, None, "#!/bin/sh\n".to_string());
    let registry = Arc::new(
        VersionRegistry::new(vec![VersionDescriptor::new(
            1,
            AbciVersion::V1,
            AppBinary::new(
                1,
                Version::new(1, 0, 0),
                PayloadSource::File(PathBuf::from("/unused")),
                layout.clone(),
            ),
            vec!["--grpc.enable".to_string()],
        )])
        .expect("registry must build"),
    );
    let mut config = StartConfig::new("/node");
    config.extra_args = vec!["--log_level=debug".to_string()];
    config.proxy = Some(ProxySettings {
        listen_address: "tcp://127.0.0.1:26658".to_string(),
        app_address: "127.0.0.1:36658".to_string(),
        ready_timeout: DEFAULT_READY_TIMEOUT,
    });
    let multiplexer = Multiplexer::new(Arc::clone(&registry), config);

    assert_eq!(
        multiplexer.launch_args(registry.first()),
        [
            "start",
            "--grpc.enable",
            "--home",
            "/node",
            "--address=tcp://127.0.0.1:36658",
            "--log_level=debug",
        ]
    );
    assert_eq!(
        multiplexer.launch_args(&base)[..3],
        ["start", "--home", "/node"]
    );
    assert_eq!(multiplexer.state(), MultiplexerState::Idle);
}

#[cfg(unix)]
#[tokio::test]
async fn switches_versions_at_activation_height() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        start_config(&layout),
        ChainHeight::At(50),
    );

    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;
    harness.observe(HeightEvent::Height(99)).await;
    harness.observe(HeightEvent::Height(100)).await;
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    wait_for_log_lines(&log, 2).await;

    let (result, events) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert_eq!(
        kinds(&events),
        [
            ("launched", 1),
            ("ready", 1),
            ("stopped", 1),
            ("launched", 2),
            ("ready", 2),
            ("stopped", 2),
        ]
    );
    assert!(
        events[2].at() <= events[3].at(),
        "v1 must be stopped before v2 is launched"
    );

    let launches = read_log(&log);
    assert_eq!(launches.len(), 2);
    assert!(launches[0].starts_with("v1 start --home "));
    assert!(launches[1].starts_with("v2 start --home "));

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn upgrade_notice_switches_before_activation_height() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        start_config(&layout),
        ChainHeight::Genesis,
    );

    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;
    harness
        .observe(HeightEvent::UpgradeNotice { app_version: 1 })
        .await;
    harness
        .observe(HeightEvent::UpgradeNotice { app_version: 2 })
        .await;
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    assert_eq!(
        harness.multiplexer.state(),
        MultiplexerState::Running { app_version: 2 }
    );
    wait_for_log_lines(&log, 2).await;

    let (result, _) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert_eq!(read_log(&log).len(), 2);

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn starts_directly_on_version_active_at_persisted_height() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        start_config(&layout),
        ChainHeight::At(150),
    );

    harness
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    assert!(wait_for_log_lines(&log, 1).await[0].starts_with("v2 start"));
    let (result, events) = harness.shutdown().await;
    result.expect("shutdown must succeed");

    assert_eq!(
        kinds(&events),
        [("launched", 2), ("ready", 2), ("stopped", 2)]
    );
    assert!(matches!(
        events[2],
        LifecycleEvent::Stopped {
            outcome: StopOutcome::Graceful,
            ..
        }
    ));

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn crash_terminates_without_relaunch() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let crashing = format!(
        "#!/bin/sh\necho crashed >> \"{}\"\nexit 3\n",
        log.display()
    );
    let registry = Arc::new(
        VersionRegistry::new(vec![
            descriptor(&layout, 1, AbciVersion::V1, None, crashing),
            descriptor(
                &layout,
                2,
                AbciVersion::V2,
                Some(100),
                long_running_app("v2", &log),
            ),
        ])
        .expect("registry must build"),
    );
    let harness = spawn_multiplexer(registry, start_config(&layout), ChainHeight::At(10));

    let (result, events) = harness.finish().await;
    let err = result.expect_err("crash must surface");
    assert!(matches!(
        err,
        MultiplexerError::ChildProcessExited {
            app_version: 1,
            code: Some(3)
        }
    ));
    assert_eq!(
        kinds(&events),
        [("launched", 1), ("ready", 1), ("crashed", 1)]
    );
    assert_eq!(read_log(&log), ["crashed"]);

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn terminated_state_is_published_after_shutdown() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        start_config(&layout),
        ChainHeight::Genesis,
    );
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;

    let mut state = harness.state.clone();
    let (result, _) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert_eq!(*state.borrow_and_update(), MultiplexerState::Terminated);

    let _ = fs::remove_dir_all(layout.home());
}

#[tokio::test]
async fn unresolvable_height_terminates_before_launch() {
    let layout = test_layout();
    let registry = Arc::new(
        VersionRegistry::new(vec![descriptor(
            &layout,
            3,
            AbciVersion::V1,
            Some(1_000),
            "#!/bin/sh\n".to_string(),
        )])
        .expect("registry must build"),
    );
    let harness = spawn_multiplexer(registry, start_config(&layout), ChainHeight::At(5));

    let (result, events) = harness.finish().await;
    assert!(matches!(
        result,
        Err(MultiplexerError::NoActiveVersion {
            height: ChainHeight::At(5)
        })
    ));
    assert!(events.is_empty());

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn proxy_route_follows_ready_app() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let app_socket = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind app socket");
    let app_address = app_socket.local_addr().expect("address").to_string();

    let mut config = start_config(&layout);
    config.proxy = Some(ProxySettings {
        listen_address: "127.0.0.1:0".to_string(),
        app_address: app_address.clone(),
        ready_timeout: Duration::from_secs(5),
    });
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        config,
        ChainHeight::Genesis,
    );
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;

    let launches = wait_for_log_lines(&log, 1).await;
    assert!(launches[0].ends_with(&format!("--address=tcp://{app_address}")));

    let (result, _) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    drop(app_socket);

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn app_that_never_listens_is_not_ready() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let mut config = start_config(&layout);
    config.proxy = Some(ProxySettings {
        listen_address: "127.0.0.1:0".to_string(),
        app_address: unused_address(),
        ready_timeout: Duration::from_millis(300),
    });
    let harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        config,
        ChainHeight::Genesis,
    );

    let (result, events) = harness.finish().await;
    assert!(matches!(
        result,
        Err(MultiplexerError::NotReady { app_version: 1, .. })
    ));
    assert_eq!(kinds(&events), [("launched", 1), ("stopped", 1)]);

    let _ = fs::remove_dir_all(layout.home());
}

async fn serve_status_bodies(bodies: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind rpc");
    let address = listener.local_addr().expect("address").to_string();
    tokio::spawn(async move {
        let mut served = 0_usize;
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buf[..read]),
                }
            }
            let body = &bodies[served.min(bodies.len() - 1)];
            served += 1;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    address
}

fn status_body(height: u64, app_version: u64) -> String {
    format!(
        r#"{{"jsonrpc":"2.0","id":-1,"result":{{"node_info":{{"protocol_version":{{"app":"{app_version}"}}}},"sync_info":{{"latest_block_height":"{height}"}}}}}}"#
    )
}

#[tokio::test]
async fn rpc_monitor_reports_height_changes_and_upgrades() {
    let address = serve_status_bodies(vec![
        status_body(10, 1),
        status_body(10, 1),
        status_body(11, 2),
    ])
    .await;
    let mut monitor = RpcHeightMonitor::spawn(&format!("tcp://{address}"), Duration::from_millis(20))
        .expect("monitor must start");

    let mut events = Vec::new();
    while events.len() < 4 {
        let event = timeout(STEP, monitor.next_event())
            .await
            .expect("event must arrive")
            .expect("monitor must keep running");
        events.push(event);
    }
    assert_eq!(
        events,
        [
            HeightEvent::UpgradeNotice { app_version: 1 },
            HeightEvent::Height(10),
            HeightEvent::UpgradeNotice { app_version: 2 },
            HeightEvent::Height(11),
        ]
    );
    assert!(
        timeout(Duration::from_millis(200), monitor.next_event())
            .await
            .is_err(),
        "unchanged status must not produce events"
    );
}

#[test]
fn node_height_store_takes_highest_committed_height() {
    let layout = test_layout();
    let store = NodeHeightStore::for_home(&layout);
    assert_eq!(
        store.persisted_height().expect("empty home"),
        ChainHeight::Genesis
    );

    // A full node: no validator state, but the chain is past activation.
    fs::create_dir_all(layout.data_dir()).expect("data dir");
    store.record_height(150).expect("record height");
    assert_eq!(
        HeightRecordFile::new(layout.height_record_path())
            .persisted_height()
            .expect("record"),
        ChainHeight::At(150)
    );
    assert_eq!(
        store.persisted_height().expect("recorded height"),
        ChainHeight::At(150)
    );

    fs::write(
        layout.validator_state_path(),
        r#"{"height": "0", "round": 0, "step": 0}"#,
    )
    .expect("write validator state");
    fs::write(
        layout.upgrade_info_path(),
        r#"{"name": "v2", "height": 180, "info": ""}"#,
    )
    .expect("write upgrade info");
    assert_eq!(
        store.persisted_height().expect("upgrade info height"),
        ChainHeight::At(180)
    );

    fs::write(layout.height_record_path(), "{").expect("corrupt record");
    assert!(matches!(
        store.persisted_height(),
        Err(MultiplexerError::HeightSource(_))
    ));

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn full_node_restarts_on_version_active_at_recorded_height() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let registry = upgrade_registry(&layout, &log);

    let mut harness = spawn_multiplexer(
        Arc::clone(&registry),
        start_config(&layout),
        NodeHeightStore::for_home(&layout),
    );
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;
    harness.observe(HeightEvent::Height(100)).await;
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    wait_for_log_lines(&log, 2).await;
    let (result, _) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert!(!layout.validator_state_path().exists());

    let mut restarted = spawn_multiplexer(
        registry,
        start_config(&layout),
        NodeHeightStore::for_home(&layout),
    );
    restarted
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    let launches = wait_for_log_lines(&log, 3).await;
    assert!(launches[2].starts_with("v2 start"));
    let (result, events) = restarted.shutdown().await;
    result.expect("shutdown must succeed");
    assert_eq!(
        kinds(&events),
        [("launched", 2), ("ready", 2), ("stopped", 2)]
    );

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn signalled_crash_reports_shell_exit_code() {
    let layout = test_layout();
    let registry = Arc::new(
        VersionRegistry::new(vec![descriptor(
            &layout,
            1,
            AbciVersion::V1,
            None,
            "#!/bin/sh\nkill -KILL $$\n".to_string(),
        )])
        .expect("registry must build"),
    );
    let harness = spawn_multiplexer(registry, start_config(&layout), ChainHeight::Genesis);

    let (result, events) = harness.finish().await;
    assert!(matches!(
        result,
        Err(MultiplexerError::ChildProcessExited {
            app_version: 1,
            code: Some(137)
        })
    ));
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::Crashed {
            code: Some(137),
            ..
        })
    ));

    let _ = fs::remove_dir_all(layout.home());
}

#[cfg(unix)]
#[tokio::test]
async fn logged_output_survives_invalid_utf8() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let script = format!(
        "#!/bin/sh\ntrap 'exit 0' INT TERM\nprintf 'hello \\377\\n'\necho \"v1 $*\" >> \"{}\"\nwhile :; do echo tick; sleep 0.05; done\n",
        log.display()
    );
    let registry = Arc::new(
        VersionRegistry::new(vec![descriptor(&layout, 1, AbciVersion::V1, None, script)])
            .expect("registry must build"),
    );
    let mut config = start_config(&layout);
    config.child_output = ChildOutput::Log;
    let mut harness = spawn_multiplexer(registry, config, ChainHeight::Genesis);

    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!harness.run.is_finished(), "app must keep running");
    assert_eq!(
        harness.multiplexer.state(),
        MultiplexerState::Running { app_version: 1 }
    );

    let (result, events) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::Stopped {
            outcome: StopOutcome::Graceful,
            ..
        })
    ));

    let _ = fs::remove_dir_all(layout.home());
}

/// Stand-in for whichever app version is running: it listens on the shared
/// app address and tags answers with the version that launched last.
async fn serve_as_latest_launch(listener: TcpListener, log: PathBuf) {
    while let Ok((stream, _)) = listener.accept().await {
        let log = log.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, AbciCodec::default());
            while let Some(Ok(frame)) = framed.next().await {
                let launches = read_log(&log);
                let tag = launches
                    .last()
                    .and_then(|line| line.split_whitespace().next())
                    .unwrap_or("none")
                    .to_string();
                let mut reply = BytesMut::from(tag.as_bytes());
                reply.extend_from_slice(b":");
                reply.extend_from_slice(&frame);
                if framed.send(reply.freeze()).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn abci_request(client: &mut Framed<TcpStream, AbciCodec>, payload: &'static [u8]) -> Bytes {
    client
        .send(Bytes::from_static(payload))
        .await
        .expect("must send request");
    timeout(STEP, client.next())
        .await
        .expect("response must arrive in time")
        .expect("connection must stay open")
        .expect("response must decode")
}

#[cfg(unix)]
#[tokio::test]
async fn proxy_reconnects_consensus_across_dialect_switch() {
    let layout = test_layout();
    let log = layout.home().join("launches.log");
    let app_socket = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind app socket");
    let app_address = app_socket.local_addr().expect("address").to_string();
    tokio::spawn(serve_as_latest_launch(app_socket, log.clone()));

    let listen_address = unused_address();
    let mut config = start_config(&layout);
    config.proxy = Some(ProxySettings {
        listen_address: listen_address.clone(),
        app_address,
        ready_timeout: Duration::from_secs(5),
    });
    let mut harness = spawn_multiplexer(
        upgrade_registry(&layout, &log),
        config,
        ChainHeight::Genesis,
    );
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 1 })
        .await;
    wait_for_log_lines(&log, 1).await;

    let stream = TcpStream::connect(&listen_address)
        .await
        .expect("must connect to proxy");
    let mut consensus = Framed::new(stream, AbciCodec::default());
    assert_eq!(&abci_request(&mut consensus, b"info").await[..], b"v1:info");

    harness.observe(HeightEvent::Height(100)).await;
    harness
        .wait_for_state(MultiplexerState::Running { app_version: 2 })
        .await;
    wait_for_log_lines(&log, 2).await;

    // v1 spoke ABCI v1 and v2 speaks v2: the old connection must not survive.
    let next = timeout(STEP, consensus.next())
        .await
        .expect("proxy must close the consensus connection");
    assert!(
        matches!(next, None | Some(Err(_))),
        "expected closed connection, got {next:?}"
    );

    let stream = TcpStream::connect(&listen_address)
        .await
        .expect("must reconnect to proxy");
    let mut consensus = Framed::new(stream, AbciCodec::default());
    assert_eq!(&abci_request(&mut consensus, b"info").await[..], b"v2:info");

    let (result, events) = harness.shutdown().await;
    result.expect("shutdown must succeed");
    assert_eq!(
        kinds(&events),
        [
            ("launched", 1),
            ("ready", 1),
            ("stopped", 1),
            ("launched", 2),
            ("ready", 2),
            ("stopped", 2),
        ]
    );

    let _ = fs::remove_dir_all(layout.home());
}
