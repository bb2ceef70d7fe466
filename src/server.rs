use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use crate::request::{read_message, ReadLimits, Request};
use crate::response::{access_log_line, Response};

/// Application callback, called once per parsed request on the connection's
/// own task. It should call one of the response methods before returning and
/// must not block for long: nothing times it out.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request, response: &mut Response<'_>);
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Response<'_>) + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, response: &mut Response<'_>) {
        (self)(request, response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address in `host:port` form.
    pub addr: String,
    pub limits: ReadLimits,
    /// How long a stopping server waits for in-flight connections before
    /// aborting them.
    pub drain_timeout: Duration,
}

impl ServerConfig {
    pub fn new<A: Into<String>>(addr: A) -> Self {
        Self {
            addr: addr.into(),
            limits: ReadLimits::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_limits(mut self, limits: ReadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.limits.max_body_bytes = max;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:10001")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening(SocketAddr),
    Stopped,
}

/// A single-use HTTP server: `Created` until [Server::serve] binds the
/// listener, `Listening` until a [ServerHandle] signals stop, then `Stopped`.
pub struct Server {
    config: ServerConfig,
    dispatch: Dispatch,
    started: AtomicBool,
    stop: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<ServerState>>,
}

/// Cloneable remote control for a [Server].
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<ServerState>>,
}

impl Server {
    pub fn new<A: Into<String>>(addr: A) -> Self {
        Self::with_config(ServerConfig::new(addr))
    }

    /// Log output goes to the dispatcher that is current when the server is
    /// created; see [Server::with_dispatch].
    pub fn with_config(config: ServerConfig) -> Self {
        let (stop, _) = watch::channel(false);
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            config,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
            started: AtomicBool::new(false),
            stop: Arc::new(stop),
            state: Arc::new(state),
        }
    }

    /// Sends the server's logs, access log included, to `dispatch`.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            state: Arc::clone(&self.state),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Binds the listener, accepts connections on a background task and
    /// returns once [ServerHandle::stop] has been called and in-flight
    /// connections are drained. Fails if binding fails or if the server was
    /// already started.
    pub async fn serve<H: Handler>(&self, handler: H) -> anyhow::Result<()> {
        let dispatch = self.dispatch.clone();
        self.run(Arc::new(handler)).with_subscriber(dispatch).await
    }

    async fn run<H: Handler>(&self, handler: Arc<H>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("server has already been started");
        }

        let listener = match TcpListener::bind(&self.config.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(e).with_context(|| format!("failed to listen on {}", self.config.addr));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(e.into());
            }
        };
        self.state.send_replace(ServerState::Listening(local_addr));
        info!(addr = %local_addr, "server listening.");

        let accept_task = tokio::spawn(
            accept_loop(
                listener,
                handler,
                self.config.clone(),
                self.dispatch.clone(),
                self.stop.subscribe(),
            )
            .with_subscriber(self.dispatch.clone()),
        );

        stopped(&mut self.stop.subscribe()).await;
        info!("stop signal received.");
        if let Err(e) = accept_task.await {
            error!(error = %e, "accept loop ended abnormally.");
        }
        self.state.send_replace(ServerState::Stopped);
        info!("server stopped.");
        Ok(())
    }
}

impl ServerHandle {
    /// Signals shutdown. Stopping before the server starts makes it stop
    /// right after binding.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Waits until the server has bound its listener and returns the local
    /// address, or `None` if it stopped without listening.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = *rx.wait_for(|s| *s != ServerState::Created).await.ok()?;
        match state {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Resolves once stop was signaled or the server is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn accept_loop<H: Handler>(
    listener: TcpListener,
    handler: Arc<H>,
    config: ServerConfig,
    dispatch: Dispatch,
    mut stop: watch::Receiver<bool>,
) {
    let conn_stop = stop.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection.");
                    let task = handle_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        config.limits,
                        conn_stop.clone(),
                    );
                    connections.spawn(task.with_subscriber(dispatch.clone()));
                }
                Err(e) => warn!(error = %e, "failed to accept connection."),
            },
        }
        while let Some(finished) = connections.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "connection task failed.");
            }
        }
    }
    drop(listener);
    drain(connections, config.drain_timeout).await;
}

async fn drain(mut connections: JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    info!(in_flight = connections.len(), "waiting for in-flight connections.");
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "drain timeout elapsed, aborting connections.");
        connections.shutdown().await;
    }
}

#[tracing::instrument(name = "connection", skip_all, fields(peer = %peer))]
async fn handle_connection<H: Handler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    limits: ReadLimits,
    mut stop: watch::Receiver<bool>,
) {
    let raw = tokio::select! {
        read = read_message(&mut stream, &limits) => match read {
            Ok(raw) => raw,
            Err(e) => {
                info!(error = %e, "dropping connection.");
                return;
            }
        },
        _ = stopped(&mut stop) => {
            debug!("server stopping, dropping idle connection.");
            return;
        }
    };

    let message = String::from_utf8_lossy(&raw);
    let request = match Request::parse(&message, &peer.to_string()) {
        Ok(req) => req,
        Err(e) => {
            info!(reason = %e, "not an HTTP request, dropping connection.");
            return;
        }
    };
    debug!(method = %request.method(), path = request.path(), "parsed request.");

    let (status, output) = {
        let mut response = Response::new(&request);
        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(&request, &mut response)
        }));
        if call.is_err() {
            error!("handler panicked, closing connection without response.");
            return;
        }
        response.into_output()
    };

    if !output.is_empty() {
        if let Err(e) = stream.write_all(&output).await {
            info!(error = %e, "failed to write response.");
            return;
        }
    }
    if let Some(status) = status {
        info!(target: "rawhttp::access", "{}", access_log_line(&request, status, SystemTime::now()));
    }
    let _ = stream.shutdown().await;
}
