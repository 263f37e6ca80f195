//! tcpframe demo server
//!
//! Binds two routes:
//! - id 0: `PingRouter`, replies `ping...ping...ping`
//! - id 1: `HelloRouter`, replies with a greeting
//!
//! Configuration via CLI arguments or TOML file; Ctrl-C stops the server.

use async_trait::async_trait;
use std::sync::Arc;
use tcpframe::config::Config;
use tcpframe::{Connection, Request, Router, Server};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const PING_ID: u32 = 0;
const HELLO_ID: u32 = 1;

struct PingRouter;

#[async_trait]
impl Router for PingRouter {
    async fn handle(&self, request: &Request) {
        debug!(
            msg_id = request.msg_id(),
            data = %String::from_utf8_lossy(request.data()),
            "Ping received"
        );
        if let Err(e) = request
            .connection()
            .send_buff_msg(PING_ID, &b"ping...ping...ping"[..])
            .await
        {
            warn!(error = %e, "Ping reply failed");
        }
    }
}

struct HelloRouter;

#[async_trait]
impl Router for HelloRouter {
    async fn handle(&self, request: &Request) {
        debug!(
            msg_id = request.msg_id(),
            data = %String::from_utf8_lossy(request.data()),
            "Hello received"
        );
        if let Err(e) = request
            .connection()
            .send_buff_msg(HELLO_ID, &b"Hello from tcpframe"[..])
            .await
        {
            warn!(error = %e, "Hello reply failed");
        }
    }
}

fn on_conn_start(conn: &Arc<Connection>) {
    conn.set_property("peer", conn.remote_addr().to_string());
    info!(conn_id = conn.conn_id(), peer = %conn.remote_addr(), "Client connected");
}

fn on_conn_stop(conn: &Arc<Connection>) {
    match conn.get_property("peer") {
        Ok(peer) => info!(conn_id = conn.conn_id(), peer = ?peer, "Client disconnected"),
        Err(e) => warn!(conn_id = conn.conn_id(), error = %e, "Client disconnected"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        name = %config.name,
        address = %config.bind_addr(),
        max_conn = config.max_conn,
        max_packet_size = config.max_packet_size,
        workers = config.worker_pool_size,
        "Starting tcpframe server"
    );

    let server = Server::new(config);
    server.add_router(PING_ID, PingRouter)?;
    server.add_router(HELLO_ID, HelloRouter)?;
    server.set_on_conn_start(on_conn_start);
    server.set_on_conn_stop(on_conn_stop);

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!(error = %e, "Server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            server.stop();
        }
    }

    Ok(())
}
