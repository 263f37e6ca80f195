//! tcpframe: a TCP server framework for a length-prefixed binary protocol
//!
//! Frames are an 8-byte little-endian header (payload length, message id)
//! followed by the payload. The framework:
//! - Accepts connections and enforces a live-connection limit
//! - Decodes frames with a two-phase header/body read
//! - Routes each message id to a [`Router`] with pre/handle/post hooks
//! - Dispatches through a fixed worker pool that keeps per-connection order
//! - Queues outbound frames with a bounded, time-limited buffered send
//!
//! ```no_run
//! use async_trait::async_trait;
//! use tcpframe::{Config, Request, Router, Server};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Router for Echo {
//!     async fn handle(&self, request: &Request) {
//!         let _ = request
//!             .connection()
//!             .send_buff_msg(request.msg_id(), request.data().clone())
//!             .await;
//!     }
//! }
//!
//! # async fn run() -> tcpframe::Result<()> {
//! let server = Server::new(Config::default());
//! server.add_router(1, Echo)?;
//! server.serve().await
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod worker;

pub use codec::{DataPack, FrameHeader, Packet, HEADER_LEN};
pub use config::Config;
pub use connection::{ConnState, Connection, Property};
pub use error::{Error, ProtocolError, Result};
pub use message::{Message, Request};
pub use registry::ConnectionRegistry;
pub use router::{MsgHandler, Router};
pub use server::{ConnHook, Server};
pub use worker::WorkerPool;
