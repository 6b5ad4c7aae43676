use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use appmux_core::{AbciVersion, MultiplexerError, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::AbciCodec;

/// The application process consensus connections are currently forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub app_version: u64,
    pub abci_version: AbciVersion,
    pub upstream: String,
}

/// Why a connection stopped forwarding to its upstream.
enum Detach {
    RouteChanged,
    UpstreamClosed,
    ConsensusClosed,
    Shutdown,
}

/// Consensus-facing ABCI listener.
///
/// Connections accepted while no route is active wait until one is. When the
/// route changes, an idle connection whose negotiated dialect matches the new
/// route is reattached to the new upstream; a connection with requests in
/// flight, or one negotiated under another dialect, is closed so the
/// consensus engine reconnects and repeats its handshake.
pub struct AbciProxy {
    local_addr: SocketAddr,
    routes: watch::Sender<Option<Route>>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl AbciProxy {
    pub async fn bind(listen_address: &str) -> Result<Self> {
        let address = strip_tcp_scheme(listen_address);
        let listener = TcpListener::bind(address).await.map_err(|err| {
            MultiplexerError::Proxy(format!("failed to bind {listen_address}: {err}"))
        })?;
        let local_addr = listener.local_addr().map_err(|err| {
            MultiplexerError::Proxy(format!("failed to read bound address: {err}"))
        })?;

        let (routes, route_rx) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, route_rx, shutdown_rx));
        info!(address = %local_addr, "abci proxy listening");

        Ok(Self {
            local_addr,
            routes,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn activate(&self, route: Route) {
        info!(
            app_version = route.app_version,
            abci = %route.abci_version,
            upstream = %route.upstream,
            "abci proxy route activated"
        );
        self.routes.send_replace(Some(route));
    }

    /// Stops forwarding. Frames from the consensus engine stay buffered in
    /// the socket until a route is activated again.
    pub fn deactivate(&self) {
        if self.routes.send_replace(None).is_some() {
            info!("abci proxy route deactivated");
        }
    }

    pub fn active_route(&self) -> Option<Route> {
        self.routes.borrow().clone()
    }

    pub async fn shutdown(self) {
        self.routes.send_replace(None);
        self.shutdown.send_replace(true);
        let _ = self.accept_task.await;
    }
}

pub fn strip_tcp_scheme(address: &str) -> &str {
    address.strip_prefix("tcp://").unwrap_or(address)
}

async fn accept_loop(
    listener: TcpListener,
    routes: watch::Receiver<Option<Route>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted consensus connection");
                let routes = routes.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_connection(stream, routes, shutdown).await;
                    debug!(%peer, "consensus connection closed");
                });
            }
            Err(err) => warn!("failed to accept consensus connection: {err}"),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    mut routes: watch::Receiver<Option<Route>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (consensus_read, consensus_write) = stream.into_split();
    let mut requests = FramedRead::new(consensus_read, AbciCodec::default());
    let mut responses = FramedWrite::new(consensus_write, AbciCodec::default());
    let mut negotiated: Option<AbciVersion> = None;

    loop {
        let route = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            route = wait_for_route(&mut routes) => match route {
                Some(route) => route,
                None => return,
            },
        };

        if let Some(dialect) = negotiated {
            if dialect != route.abci_version {
                info!(
                    from = %dialect,
                    to = %route.abci_version,
                    "abci dialect changed, closing consensus connection for a fresh handshake"
                );
                return;
            }
        }
        negotiated = Some(route.abci_version);

        let upstream = match TcpStream::connect(strip_tcp_scheme(&route.upstream)).await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(
                    app_version = route.app_version,
                    upstream = %route.upstream,
                    "failed to reach app for consensus connection: {err}"
                );
                return;
            }
        };
        let (upstream_read, upstream_write) = upstream.into_split();
        let mut app_responses = FramedRead::new(upstream_read, AbciCodec::default());
        let mut app_requests = FramedWrite::new(upstream_write, AbciCodec::default());
        let in_flight = AtomicU64::new(0);

        let detach = {
            // The two directions never wait on each other.
            let to_app = forward_requests(&mut requests, &mut app_requests, &in_flight);
            let to_consensus =
                forward_responses(&mut app_responses, &mut responses, &in_flight, &route);
            tokio::pin!(to_app);
            tokio::pin!(to_consensus);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break Detach::Shutdown,
                    changed = routes.changed() => {
                        if changed.is_err() {
                            break Detach::Shutdown;
                        }
                        if routes.borrow_and_update().as_ref() != Some(&route) {
                            break Detach::RouteChanged;
                        }
                    }
                    detach = &mut to_app => break detach,
                    detach = &mut to_consensus => break detach,
                }
            }
        };

        let in_flight = in_flight.into_inner();
        match detach {
            Detach::RouteChanged if in_flight == 0 => {
                debug!(app_version = route.app_version, "detached idle consensus connection");
            }
            Detach::RouteChanged => {
                info!(
                    app_version = route.app_version,
                    in_flight,
                    "aborting in-flight abci requests across version switch"
                );
                return;
            }
            Detach::UpstreamClosed | Detach::ConsensusClosed | Detach::Shutdown => return,
        }
    }
}

/// Consensus engine to app. A request counts as in flight from the moment it
/// is read, so one dropped halfway through a write is never reattached.
async fn forward_requests(
    requests: &mut FramedRead<OwnedReadHalf, AbciCodec>,
    app: &mut FramedWrite<OwnedWriteHalf, AbciCodec>,
    in_flight: &AtomicU64,
) -> Detach {
    while let Some(frame) = requests.next().await {
        match frame {
            Ok(frame) => {
                in_flight.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = app.send(frame).await {
                    debug!("failed to forward request to app: {err}");
                    return Detach::UpstreamClosed;
                }
            }
            Err(err) => {
                warn!("invalid frame from consensus engine: {err}");
                return Detach::ConsensusClosed;
            }
        }
    }
    Detach::ConsensusClosed
}

/// App to consensus engine. A response leaves the in-flight count only once
/// it is fully flushed.
async fn forward_responses(
    app: &mut FramedRead<OwnedReadHalf, AbciCodec>,
    responses: &mut FramedWrite<OwnedWriteHalf, AbciCodec>,
    in_flight: &AtomicU64,
    route: &Route,
) -> Detach {
    while let Some(frame) = app.next().await {
        match frame {
            Ok(frame) => {
                if let Err(err) = responses.send(frame).await {
                    debug!("failed to forward response to consensus engine: {err}");
                    return Detach::ConsensusClosed;
                }
                let _ = in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                    Some(count.saturating_sub(1))
                });
            }
            Err(err) => {
                warn!(app_version = route.app_version, "invalid frame from app: {err}");
                return Detach::UpstreamClosed;
            }
        }
    }
    Detach::UpstreamClosed
}

/// Waits until a route is active. Returns `None` once the proxy is gone.
async fn wait_for_route(routes: &mut watch::Receiver<Option<Route>>) -> Option<Route> {
    loop {
        if let Some(route) = routes.borrow_and_update().clone() {
            return Some(route);
        }
        routes.changed().await.ok()?;
    }
}
