//! Message routing.
//!
//! A [`Router`] handles one message id through three ordered hooks. The
//! [`MsgHandler`] owns the id-to-router table and is the single place where
//! handler panics are caught, so a faulty handler can never take down the
//! worker or connection task that invoked it.

use crate::error::{Error, Result};
use crate::message::Request;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Handler for one message id.
///
/// Every hook defaults to a no-op, so implementors override only what they
/// need. Hooks run in order `pre_handle`, `handle`, `post_handle`.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn pre_handle(&self, _request: &Request) {}

    async fn handle(&self, _request: &Request) {}

    async fn post_handle(&self, _request: &Request) {}
}

/// Dispatch table from message id to router.
#[derive(Default)]
pub struct MsgHandler {
    apis: RwLock<HashMap<u32, Arc<dyn Router>>>,
}

impl MsgHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `router` to `msg_id`. An id can be bound only once; a second
    /// binding fails and leaves the first in place.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<()> {
        let mut apis = self.apis.write();
        if apis.contains_key(&msg_id) {
            return Err(Error::DuplicateRoute(msg_id));
        }
        apis.insert(msg_id, router);
        info!(msg_id, "Router added");
        Ok(())
    }

    pub fn contains(&self, msg_id: u32) -> bool {
        self.apis.read().contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.apis.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the router bound to the request's message id.
    ///
    /// Unknown ids are logged and dropped. A panic in any hook is caught
    /// and logged; hooks after the panicking one do not run.
    pub async fn dispatch(&self, request: Request) {
        let msg_id = request.msg_id();
        let conn_id = request.connection().conn_id();

        let router = self.apis.read().get(&msg_id).cloned();
        let Some(router) = router else {
            warn!(msg_id, conn_id, "No router bound for message id, dropping request");
            return;
        };

        debug!(msg_id, conn_id, "Dispatching request");
        let outcome = AssertUnwindSafe(async {
            router.pre_handle(&request).await;
            router.handle(&request).await;
            router.post_handle(&request).await;
        })
        .catch_unwind()
        .await;

        if let Err(panic) = outcome {
            error!(
                msg_id,
                conn_id,
                fault = panic_message(&*panic),
                "Router panicked while handling request"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
