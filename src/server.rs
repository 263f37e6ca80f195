//! TCP server: accept loop, admission control and shared server state.
//!
//! The accept loop never waits on downstream backpressure. A socket that
//! arrives while the registry is at `max_conn` is closed on the spot.
//!
//! Connection ids come from a `u32` counter that wraps around without
//! checking for ids still in use. Only a server that has accepted more
//! than 2^32 connections while keeping very old ones alive can collide.

use crate::codec::{DataPack, Packet};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Request;
use crate::registry::ConnectionRegistry;
use crate::router::{MsgHandler, Router};
use crate::worker::WorkerPool;
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Callback run on a connection's own task when it starts or stops.
pub type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Clone)]
struct Hooks {
    on_conn_start: ConnHook,
    on_conn_stop: ConnHook,
}

impl Default for Hooks {
    fn default() -> Self {
        let noop: ConnHook = Arc::new(|_: &Arc<Connection>| {});
        Self {
            on_conn_start: Arc::clone(&noop),
            on_conn_stop: noop,
        }
    }
}

/// State shared between the server handle and every connection.
pub(crate) struct ServerCore {
    config: Config,
    packet: Box<dyn Packet>,
    msg_handler: Arc<MsgHandler>,
    workers: WorkerPool,
    registry: ConnectionRegistry,
    hooks: RwLock<Hooks>,
    next_conn_id: AtomicU32,
    shutdown: CancellationToken,
}

impl ServerCore {
    pub(crate) fn new(config: Config, packet: impl Packet) -> Arc<Self> {
        let workers = WorkerPool::new(config.worker_pool_size, config.max_worker_task_len);
        Arc::new(Self {
            config,
            packet: Box::new(packet),
            msg_handler: Arc::new(MsgHandler::new()),
            workers,
            registry: ConnectionRegistry::new(),
            hooks: RwLock::new(Hooks::default()),
            next_conn_id: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn packet(&self) -> &dyn Packet {
        self.packet.as_ref()
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn set_on_conn_start(&self, hook: ConnHook) {
        self.hooks.write().on_conn_start = hook;
    }

    pub(crate) fn set_on_conn_stop(&self, hook: ConnHook) {
        self.hooks.write().on_conn_stop = hook;
    }

    pub(crate) fn call_on_conn_start(&self, conn: &Arc<Connection>) {
        let hook = Arc::clone(&self.hooks.read().on_conn_start);
        debug!(conn_id = conn.conn_id(), "Calling connection start hook");
        hook(conn);
    }

    pub(crate) fn call_on_conn_stop(&self, conn: &Arc<Connection>) {
        let hook = Arc::clone(&self.hooks.read().on_conn_stop);
        debug!(conn_id = conn.conn_id(), "Calling connection stop hook");
        hook(conn);
    }

    /// Hand a decoded request to the worker pool, or run it on its own
    /// task when pooling is off.
    pub(crate) async fn submit(&self, request: Request) {
        if self.workers.is_enabled() {
            if let Err(e) = self.workers.submit(request).await {
                warn!(error = %e, "Dropping request");
            }
        } else {
            let handler = Arc::clone(&self.msg_handler);
            tokio::spawn(async move { handler.dispatch(request).await });
        }
    }

    /// Admission check run for every accepted socket.
    fn admit(&self) -> Result<()> {
        if self.registry.len() >= self.config.max_conn {
            return Err(Error::Capacity {
                limit: self.config.max_conn,
            });
        }
        Ok(())
    }

    fn next_conn_id(&self) -> u32 {
        // fetch_add wraps on overflow
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Server instance
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// Create a server using the default [`DataPack`] codec.
    pub fn new(config: Config) -> Self {
        let packet = DataPack::new(config.max_packet_size);
        Self::with_packet(config, packet)
    }

    /// Create a server with a custom frame codec.
    pub fn with_packet(config: Config, packet: impl Packet) -> Self {
        Server {
            core: ServerCore::new(config, packet),
        }
    }

    pub fn config(&self) -> &Config {
        self.core.config()
    }

    /// Bind `router` to `msg_id`. Fails if the id is already bound.
    pub fn add_router(&self, msg_id: u32, router: impl Router) -> Result<()> {
        self.core.msg_handler.add_router(msg_id, Arc::new(router))
    }

    pub fn set_on_conn_start<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.core.set_on_conn_start(Arc::new(hook));
    }

    /// Install the hook run once when a connection is torn down.
    ///
    /// The connection is already [`ConnState::Closed`](crate::ConnState::Closed)
    /// when the hook runs. Its properties are still readable and it is still
    /// in the registry, but `send_msg` and `send_buff_msg` fail with
    /// [`Error::ConnectionClosed`](crate::Error::ConnectionClosed).
    pub fn set_on_conn_stop<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.core.set_on_conn_stop(Arc::new(hook));
    }

    pub fn connection_registry(&self) -> &ConnectionRegistry {
        self.core.registry()
    }

    /// Bind the listener, start the workers and spawn the accept loop.
    ///
    /// Returns once the socket is listening, with the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = self.core.config.bind_addr();
        let addr = tokio::net::lookup_host(&bind_addr)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{bind_addr} did not resolve to an address"),
                )
            })?;

        self.core.workers.start(Arc::clone(&self.core.msg_handler));

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(
            name = %self.core.config.name,
            address = %local_addr,
            max_conn = self.core.config.max_conn,
            workers = self.core.workers.size(),
            "Server listening"
        );

        tokio::spawn(accept_loop(Arc::clone(&self.core), listener));
        Ok(local_addr)
    }

    /// Start the server and wait until it is stopped.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        self.core.shutdown.cancelled().await;
        Ok(())
    }

    /// Stop every connection and stop accepting new ones.
    pub fn stop(&self) {
        info!(name = %self.core.config.name, "Stopping server");
        self.core.registry.clear_conn();
        self.core.shutdown.cancel();
    }
}

/// Accept connections until the server is stopped.
async fn accept_loop(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if let Err(e) = core.admit() {
            warn!(peer = %peer, error = %e, "Rejecting connection");
            drop(stream);
            continue;
        }

        spawn_connection(&core, stream, peer);
    }

    info!("Accept loop stopped");
}

fn spawn_connection(core: &Arc<ServerCore>, stream: TcpStream, peer: SocketAddr) {
    let conn_id = core.next_conn_id();
    match Connection::new(Arc::clone(core), stream, conn_id) {
        Ok(conn) => {
            info!(conn_id, peer = %peer, "New connection");
            tokio::spawn(conn.start());
        }
        Err(e) => {
            warn!(conn_id, peer = %peer, error = %e, "Failed to set up connection");
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
