//! Connection state machine for managing TCP connections.
//!
//! A connection moves `Created -> Running -> Closed`. Starting it spawns a
//! reader task and a writer task, so each direction applies backpressure
//! on its own. Both tasks watch one cancellation token; whichever side
//! fails first cancels it, and the task that ran [`Connection::start`]
//! performs the single teardown.

use crate::codec;
use crate::error::{Error, Result};
use crate::message::{Message, Request};
use crate::server::ServerCore;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered, I/O tasks not spawned yet.
    Created,
    /// Reader and writer tasks are running.
    Running,
    /// Teardown has run; the socket is closed.
    Closed,
}

/// A session-scoped value stored on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl From<bool> for Property {
    fn from(v: bool) -> Self {
        Property::Bool(v)
    }
}

impl From<i64> for Property {
    fn from(v: i64) -> Self {
        Property::Int(v)
    }
}

impl From<u64> for Property {
    fn from(v: u64) -> Self {
        Property::UInt(v)
    }
}

impl From<f64> for Property {
    fn from(v: f64) -> Self {
        Property::Float(v)
    }
}

impl From<String> for Property {
    fn from(v: String) -> Self {
        Property::Text(v)
    }
}

impl From<&str> for Property {
    fn from(v: &str) -> Self {
        Property::Text(v.to_string())
    }
}

impl From<Bytes> for Property {
    fn from(v: Bytes) -> Self {
        Property::Bytes(v)
    }
}

/// A single client connection.
pub struct Connection {
    conn_id: u32,
    remote_addr: SocketAddr,
    core: Arc<ServerCore>,
    /// Lifecycle state; also the guard for one-time teardown.
    state: Mutex<ConnState>,
    /// Handed to the reader task on start.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Shared by the writer task and direct sends. `None` once closed.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Outbound queue of encoded frames. Dropping the sender closes it.
    outbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Application state; never locked by the I/O path.
    properties: RwLock<HashMap<String, Property>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap an accepted socket and register it with the server's registry.
    pub(crate) fn new(core: Arc<ServerCore>, stream: TcpStream, conn_id: u32) -> Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(core.config().max_msg_chan_len.max(1));

        let conn = Arc::new(Self {
            conn_id,
            remote_addr,
            core,
            state: Mutex::new(ConnState::Created),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            properties: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        conn.core.registry().add(Arc::clone(&conn));
        Ok(conn)
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Token cancelled when this connection stops. Application tasks tied
    /// to the session can select on it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the connection until it is stopped.
    ///
    /// Spawns the reader and writer, calls the start hook on this task, then
    /// waits for cancellation and tears the connection down exactly once.
    pub async fn start(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ConnState::Created {
                warn!(conn_id = self.conn_id, state = ?*state, "Connection already started");
                return;
            }
            *state = ConnState::Running;
        }

        let reader = self.reader.lock().take();
        let outbound = self.outbound_rx.lock().take();
        if let Some(reader) = reader {
            tokio::spawn(Arc::clone(&self).run_reader(reader));
        }
        if let Some(outbound) = outbound {
            tokio::spawn(Arc::clone(&self).run_writer(outbound));
        }

        debug!(conn_id = self.conn_id, peer = %self.remote_addr, "Connection started");
        self.core.call_on_conn_start(&self);

        self.cancel.cancelled().await;
        self.finalize().await;
    }

    /// Request shutdown. Safe to call any number of times from any task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One-time teardown. The state flips to `Closed` before the stop hook
    /// runs, so the hook still sees its properties and a registered
    /// connection, but any send it attempts is rejected.
    async fn finalize(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Closed;
        }

        self.core.call_on_conn_stop(self);

        // Close the outbound queue, then the socket.
        self.outbound_tx.lock().take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(conn_id = self.conn_id, error = %e, "Socket shutdown failed");
            }
        }

        self.core.registry().remove(self.conn_id);
        info!(conn_id = self.conn_id, peer = %self.remote_addr, "Connection closed");
    }

    async fn run_reader(self: Arc<Self>, mut reader: OwnedReadHalf) {
        trace!(conn_id = self.conn_id, "Reader running");

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = codec::read_message(self.core.packet(), &mut reader) => result,
            };

            match result {
                Ok(msg) => {
                    trace!(
                        conn_id = self.conn_id,
                        msg_id = msg.msg_id(),
                        len = msg.data_len(),
                        "Received message"
                    );
                    let request = Request::new(Arc::clone(&self), msg);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.core.submit(request) => {}
                    }
                }
                Err(e) if e.is_peer_closed() => {
                    debug!(conn_id = self.conn_id, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    error!(conn_id = self.conn_id, error = %e, "Read failed, closing connection");
                    break;
                }
            }
        }

        trace!(conn_id = self.conn_id, "Reader exit");
        self.stop();
    }

    async fn run_writer(self: Arc<Self>, mut outbound: mpsc::Receiver<Bytes>) {
        trace!(conn_id = self.conn_id, "Writer running");

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = outbound.recv() => frame,
            };

            let Some(frame) = frame else {
                debug!(conn_id = self.conn_id, "Outbound queue closed");
                break;
            };

            // A peer that stops reading stalls the write; cancellation must
            // still release the writer lock so teardown can close the socket.
            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.write_frame(&frame) => result,
            };

            if let Err(e) = written {
                error!(conn_id = self.conn_id, error = %e, "Write failed, closing connection");
                break;
            }
        }

        trace!(conn_id = self.conn_id, "Writer exit");
        self.stop();
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::ConnectionClosed(self.conn_id))?;
        writer.write_all(frame).await?;
        Ok(())
    }

    fn pack(&self, msg_id: u32, data: Bytes) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.conn_id));
        }
        self.core
            .packet()
            .pack(&Message::new(msg_id, data))
            .inspect_err(|e| warn!(conn_id = self.conn_id, msg_id, error = %e, "Pack failed"))
    }

    /// Encode and write a message straight to the socket.
    ///
    /// Gives up with [`Error::ConnectionClosed`] if the connection is stopped
    /// while the write is still waiting on the peer.
    pub async fn send_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<()> {
        let frame = self.pack(msg_id, data.into())?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::ConnectionClosed(self.conn_id)),
            result = self.write_frame(&frame) => result,
        }
    }

    /// Encode a message and queue it for the writer task.
    ///
    /// Waits at most the configured send timeout for room in the outbound
    /// queue, then fails with [`Error::SendTimeout`]; the frame is dropped.
    pub async fn send_buff_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<()> {
        let frame = self.pack(msg_id, data.into())?;
        let tx = self
            .outbound_tx
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed(self.conn_id))?;

        let timeout = self.core.config().send_timeout();
        tx.send_timeout(frame, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => Error::SendTimeout(timeout),
            SendTimeoutError::Closed(_) => Error::ConnectionClosed(self.conn_id),
        })
    }

    /// Store a property, replacing any previous value under `key`.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Property>) {
        self.properties.write().insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Result<Property> {
        self.properties
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PropertyNotFound(key.to_string()))
    }

    /// Remove a property. Absent keys are ignored.
    pub fn remove_property(&self, key: &str) {
        self.properties.write().remove(key);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{DataPack, Packet};
    use crate::config::Config;
    use crate::server::ServerCore;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Build a registered connection over a loopback socket. Returns the
    /// server side connection and the client side stream.
    pub(crate) async fn loopback(core: &Arc<ServerCore>, conn_id: u32) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Arc::clone(core), server, conn_id).unwrap();
        (conn, client)
    }

    pub(crate) fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            worker_pool_size: 0,
            ..Config::default()
        }
    }

    async fn read_frame(client: &mut TcpStream) -> Message {
        codec::read_message(&DataPack::new(0), client).await.unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_new_connection_is_registered() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, _client) = loopback(&core, 7).await;

        assert_eq!(conn.conn_id(), 7);
        assert_eq!(conn.state(), ConnState::Created);
        assert_eq!(core.registry().len(), 1);
        assert_eq!(core.registry().get(7).unwrap().conn_id(), 7);
    }

    #[tokio::test]
    async fn test_properties() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, _client) = loopback(&core, 1).await;

        conn.set_property("user", "alice");
        conn.set_property("level", 3i64);
        assert_eq!(conn.get_property("user").unwrap(), Property::Text("alice".into()));

        // Overwrite replaces
        conn.set_property("user", "bob");
        assert_eq!(conn.get_property("user").unwrap(), Property::Text("bob".into()));

        conn.remove_property("level");
        assert!(matches!(
            conn.get_property("level"),
            Err(Error::PropertyNotFound(key)) if key == "level"
        ));

        // Removing an absent key is a no-op
        conn.remove_property("level");
        conn.remove_property("never-set");
        assert!(conn.get_property("user").is_ok());
    }

    #[tokio::test]
    async fn test_send_msg_writes_frame() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, mut client) = loopback(&core, 1).await;

        conn.send_msg(9, &b"direct"[..]).await.unwrap();

        let msg = read_frame(&mut client).await;
        assert_eq!(msg.msg_id(), 9);
        assert_eq!(msg.data().as_ref(), b"direct");
    }

    #[tokio::test]
    async fn test_send_buff_msg_through_writer() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, mut client) = loopback(&core, 1).await;
        tokio::spawn(Arc::clone(&conn).start());

        conn.send_buff_msg(1, &b"first"[..]).await.unwrap();
        conn.send_buff_msg(2, &b"second"[..]).await.unwrap();

        let first = read_frame(&mut client).await;
        let second = read_frame(&mut client).await;
        assert_eq!((first.msg_id(), first.data().as_ref()), (1, &b"first"[..]));
        assert_eq!((second.msg_id(), second.data().as_ref()), (2, &b"second"[..]));
    }

    #[tokio::test]
    async fn test_send_buff_msg_times_out_when_queue_full() {
        let config = Config {
            max_msg_chan_len: 1,
            send_timeout_ms: 5,
            ..test_config()
        };
        let core = ServerCore::new(config, DataPack::new(4096));
        let (conn, mut client) = loopback(&core, 1).await;

        // No writer yet, so the queue saturates after one frame.
        conn.send_buff_msg(1, &b"queued"[..]).await.unwrap();
        match conn.send_buff_msg(2, &b"dropped"[..]).await {
            Err(Error::SendTimeout(bound)) => assert_eq!(bound, Duration::from_millis(5)),
            other => panic!("unexpected: {:?}", other),
        }

        tokio::spawn(Arc::clone(&conn).start());
        let msg = read_frame(&mut client).await;
        assert_eq!(msg.msg_id(), 1);

        // Nothing else was ever written.
        let mut buf = [0u8; 1];
        let more = tokio::time::timeout(Duration::from_millis(50), client.read(&mut buf)).await;
        assert!(more.is_err(), "timed-out frame reached the socket");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let stops = count_stops(&core);

        let (conn, mut client) = loopback(&core, 1).await;
        let running = tokio::spawn(Arc::clone(&conn).start());
        wait_for(|| conn.state() == ConnState::Running).await;

        let (a, b) = (Arc::clone(&conn), Arc::clone(&conn));
        let _ = tokio::join!(
            tokio::spawn(async move { a.stop() }),
            tokio::spawn(async move { b.stop() }),
        );
        conn.stop();
        running.await.unwrap();

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(core.registry().is_empty());

        // Peer sees EOF; sends after close are rejected.
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            conn.send_msg(1, Bytes::new()).await,
            Err(Error::ConnectionClosed(1))
        ));
        assert!(matches!(
            conn.send_buff_msg(1, Bytes::new()).await,
            Err(Error::ConnectionClosed(1))
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_finalizes() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, client) = loopback(&core, 3).await;
        let running = tokio::spawn(Arc::clone(&conn).start());

        drop(client);
        running.await.unwrap();

        assert!(conn.is_closed());
        assert!(core.registry().get(3).is_err());
    }

    fn count_stops(core: &Arc<ServerCore>) -> Arc<AtomicUsize> {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        core.set_on_conn_stop(Arc::new(move |_conn: &Arc<Connection>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        stops
    }

    #[tokio::test]
    async fn test_stop_with_stalled_writer() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let stops = count_stops(&core);

        // The client never reads, so the socket buffers fill and the writer
        // blocks mid-frame.
        let (conn, _client) = loopback(&core, 1).await;
        let running = tokio::spawn(Arc::clone(&conn).start());
        for _ in 0..24 {
            conn.send_buff_msg(1, vec![0u8; 1 << 20]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnState::Running);

        conn.stop();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("teardown blocked on the stalled writer")
            .unwrap();

        assert!(conn.is_closed());
        assert!(core.registry().is_empty());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_send_msg() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let (conn, _client) = loopback(&core, 2).await;
        let running = tokio::spawn(Arc::clone(&conn).start());

        let sender = Arc::clone(&conn);
        let send = tokio::spawn(async move { sender.send_msg(1, vec![0u8; 24 << 20]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished());

        conn.stop();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("teardown blocked on the direct send")
            .unwrap();

        assert!(matches!(send.await.unwrap(), Err(Error::ConnectionClosed(2))));
        assert!(core.registry().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let stops = count_stops(&core);
        let (conn, client) = loopback(&core, 5).await;

        // Keep the read half out of the reader task so only the writer can
        // notice the peer is gone.
        let _read_half = conn.reader.lock().take();
        let running = tokio::spawn(Arc::clone(&conn).start());

        // Abortive close: the next writes hit a reset socket.
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        for _ in 0..200 {
            if conn.send_buff_msg(1, &b"orphaned"[..]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("write failure did not close the connection")
            .unwrap();
        assert!(conn.is_closed());
        assert!(core.registry().is_empty());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_hook_sees_closed_connection() {
        let core = ServerCore::new(test_config(), DataPack::new(4096));
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let hook_core = Arc::clone(&core);
        core.set_on_conn_stop(Arc::new(move |conn: &Arc<Connection>| {
            let rejected = matches!(
                conn.send_buff_msg(1, &b"bye"[..]).now_or_never(),
                Some(Err(Error::ConnectionClosed(_)))
            );
            *record.lock() = Some((
                conn.is_closed(),
                conn.get_property("user").is_ok(),
                hook_core.registry().get(conn.conn_id()).is_ok(),
                rejected,
            ));
        }));

        let (conn, _client) = loopback(&core, 6).await;
        conn.set_property("user", "alice");
        let running = tokio::spawn(Arc::clone(&conn).start());
        wait_for(|| conn.state() == ConnState::Running).await;

        conn.stop();
        running.await.unwrap();

        assert_eq!(*seen.lock(), Some((true, true, true, true)));
        assert!(core.registry().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_connection() {
        let core = ServerCore::new(test_config(), DataPack::new(8));
        let (conn, mut client) = loopback(&core, 4).await;
        let running = tokio::spawn(Arc::clone(&conn).start());

        let frame = DataPack::new(0)
            .pack(&Message::new(1, vec![0u8; 64]))
            .unwrap();
        client.write_all(&frame).await.unwrap();

        running.await.unwrap();
        assert!(conn.is_closed());
        assert!(core.registry().is_empty());
    }
}
