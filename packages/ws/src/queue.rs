//! Per-connection serial processing.
//!
//! Each socket gets one [`ConnectionQueue`]. Messages are handled strictly in
//! arrival order and the close is always the last thing it processes, even
//! when the socket closes while earlier messages are still in flight.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt as _;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    ProximityState, WebsocketContext, connect, disconnect, process_message,
    topics::WebsocketSender,
};

#[derive(Debug)]
pub enum QueueCommand {
    Message(String),
    Close,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection queue is closed")]
    Closed,
}

impl From<flume::SendError<QueueCommand>> for QueueError {
    fn from(_value: flume::SendError<QueueCommand>) -> Self {
        Self::Closed
    }
}

pub struct ConnectionQueue {
    state: Arc<ProximityState>,
    sender: Arc<dyn WebsocketSender>,
    context: WebsocketContext,
    tx: flume::Sender<QueueCommand>,
    rx: flume::Receiver<QueueCommand>,
    token: CancellationToken,
}

impl ConnectionQueue {
    #[must_use]
    pub fn new(
        state: Arc<ProximityState>,
        sender: Arc<dyn WebsocketSender>,
        context: WebsocketContext,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            state,
            sender,
            context,
            tx,
            rx,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionQueueHandle {
        ConnectionQueueHandle {
            connection_id: self.context.connection_id.clone(),
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }

    /// Registers the connection and starts draining its queue.
    ///
    /// A message whose handler panics is logged and skipped. The task ends after processing [`QueueCommand::Close`], after every
    /// handle is dropped, or when cancelled. The connection is torn down in
    /// all three cases.
    pub fn start(self) -> JoinHandle<()> {
        connect(&self.state, &self.context);

        let Self {
            state,
            sender,
            context,
            tx,
            rx,
            token,
        } = self;
        drop(tx);

        tokio::spawn(async move {
            let id = &context.connection_id;

            loop {
                let command = tokio::select! {
                    () = token.cancelled() => {
                        log::debug!("ConnectionQueue for {id} was cancelled");
                        break;
                    }
                    command = rx.recv_async() => command,
                };

                match command {
                    Ok(QueueCommand::Message(message)) => {
                        match AssertUnwindSafe(process_message(
                            &state,
                            sender.as_ref(),
                            &context,
                            &message,
                        ))
                        .catch_unwind()
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => log::warn!("Failed to process message from {id}: {e}"),
                            Err(panic) => log::error!(
                                "Handler panicked on message from {id}: {}",
                                panic_message(&*panic)
                            ),
                        }
                    }
                    Ok(QueueCommand::Close) => break,
                    Err(flume::RecvError::Disconnected) => {
                        log::debug!("ConnectionQueue for {id} lost every handle");
                        break;
                    }
                }
            }

            match AssertUnwindSafe(disconnect(&state, sender.as_ref(), &context))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Failed to disconnect {id}: {e}"),
                Err(panic) => log::error!(
                    "Disconnect of {id} panicked: {}",
                    panic_message(&*panic)
                ),
            }

            log::debug!("Stopped ConnectionQueue for {id}");
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[derive(Debug, Clone)]
pub struct ConnectionQueueHandle {
    connection_id: String,
    tx: flume::Sender<QueueCommand>,
    token: CancellationToken,
}

impl ConnectionQueueHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// # Errors
    ///
    /// * If the queue has already stopped
    pub fn enqueue(&self, message: impl Into<String>) -> Result<(), QueueError> {
        Ok(self.tx.send(QueueCommand::Message(message.into()))?)
    }

    /// Queues the teardown behind every message already enqueued.
    ///
    /// # Errors
    ///
    /// * If the queue has already stopped
    pub fn close(&self) -> Result<(), QueueError> {
        Ok(self.tx.send(QueueCommand::Close)?)
    }

    /// Stops without draining the messages still queued. The connection is
    /// still torn down.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
