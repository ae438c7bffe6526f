use std::{
    collections::BTreeMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use proximity_ws::models::{Ack, Request, RequestCommand, RequestId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Connection closed before request {0} was acknowledged")]
    Closed(RequestId),
}

/// Multiplexes correlated requests over one socket.
///
/// Request ids are allocated per correlator, so per connection. Each pending
/// request resolves exactly once: with the first matching ACK, or with
/// [`RequestError::Closed`] once the connection goes away.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_request_id: AtomicU64,
    pending: Mutex<BTreeMap<RequestId, oneshot::Sender<Option<String>>>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl RequestCorrelator {
    /// `outbound` receives the framed requests to write to the socket.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            next_request_id: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
            outbound,
        }
    }

    fn pending(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<RequestId, oneshot::Sender<Option<String>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `command` and waits for its ACK.
    ///
    /// `Ok(None)` means the server acknowledged the request but the operation
    /// failed.
    ///
    /// # Errors
    ///
    /// * If the connection closes before the ACK arrives
    pub async fn send(
        &self,
        command: RequestCommand,
        argument: Option<String>,
    ) -> Result<Option<String>, RequestError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        let request = Request {
            command,
            request_id,
            argument,
        };
        log::trace!("send: {request}");

        if self.outbound.send(request.to_string()).is_err() {
            self.pending().remove(&request_id);
            return Err(RequestError::Closed(request_id));
        }

        rx.await.map_err(|_| RequestError::Closed(request_id))
    }

    /// Resolves the pending request `message` acknowledges.
    ///
    /// Returns `false` if `message` isn't an ACK, so the caller can treat it
    /// as an event instead.
    pub fn handle_incoming(&self, message: &str) -> bool {
        let Some(ack) = Ack::parse(message) else {
            return false;
        };

        let pending = self.pending().remove(&ack.request_id);
        match pending {
            Some(tx) => {
                if tx.send(ack.payload).is_err() {
                    log::debug!("handle_incoming: request {} was abandoned", ack.request_id);
                }
            }
            None => log::debug!("handle_incoming: unmatched ACK {}", ack.request_id),
        }

        true
    }

    /// Fails every pending request. Call when the socket closes.
    pub fn fail_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending());
        if !pending.is_empty() {
            log::debug!("fail_all: failing {} pending request(s)", pending.len());
        }
        pending.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}
