//! Decoded messages and the requests that carry them to handlers.

use crate::connection::Connection;
use bytes::Bytes;
use std::sync::Arc;

/// One application message: an id plus an opaque payload.
///
/// The payload length is always derived from the payload itself, so the
/// two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data: Bytes,
}

impl Message {
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    pub fn msg_id(&self) -> u32 {
        self.id
    }

    /// Payload length as it appears on the wire.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// A decoded message paired with the connection it arrived on.
///
/// Built once per frame by the connection reader and consumed by exactly
/// one dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    conn: Arc<Connection>,
    msg: Message,
}

impl Request {
    pub fn new(conn: Arc<Connection>, msg: Message) -> Self {
        Self { conn, msg }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.msg_id()
    }

    pub fn data(&self) -> &Bytes {
        self.msg.data()
    }
}
