//! The ws server actor.
//!
//! Socket handlers talk to it through a [`WsServerHandle`]. Commands are
//! processed one at a time in the order they were sent, so a connection's
//! messages reach its [`ConnectionQueue`] in arrival order and its close is
//! always queued behind them.

use std::{collections::BTreeMap, io, sync::Arc};

use proximity_config::RoomConfig;
use proximity_ws::{
    ProximityState, WebsocketContext,
    queue::{ConnectionQueue, ConnectionQueueHandle},
    topics::{TopicHub, WebsocketSender},
};
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ws::{ConnId, Msg};

/// A command received by the [`WsServer`].
#[derive(Debug, AsRefStr)]
pub enum Command {
    Connect {
        room: Arc<RoomConfig>,
        conn_tx: mpsc::UnboundedSender<Msg>,
        res_tx: oneshot::Sender<ConnId>,
    },

    Disconnect {
        conn: ConnId,
    },

    Message {
        msg: Msg,
        conn: ConnId,
    },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Call and spawn [`run`](Self::run) to start processing commands.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct WsServer {
    state: Arc<ProximityState>,
    hub: Arc<TopicHub>,
    queues: BTreeMap<ConnId, ConnectionQueueHandle>,
    cmd_rx: flume::Receiver<Command>,
    token: CancellationToken,
}

impl WsServer {
    #[must_use]
    pub fn new(state: Arc<ProximityState>) -> (Self, WsServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let token = CancellationToken::new();
        let handle = WsServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                state,
                hub: Arc::new(TopicHub::new()),
                queues: BTreeMap::new(),
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Registers the socket and starts its queue under a fresh id.
    fn connect(&mut self, room: Arc<RoomConfig>, conn_tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        let id = uuid::Uuid::new_v4().to_string();
        log::info!("connect: {id} opened a socket in '{}'", room.id);

        self.hub.attach(&id, conn_tx);

        let sender: Arc<dyn WebsocketSender> = self.hub.clone();
        let queue = ConnectionQueue::new(
            self.state.clone(),
            sender,
            WebsocketContext {
                connection_id: id.clone(),
                room,
            },
        );
        self.queues.insert(id.clone(), queue.handle());
        let task = queue.start();

        let hub = self.hub.clone();
        let conn = id.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                log::error!("ConnectionQueue for {conn} failed: {e:?}");
            }
            hub.detach(&conn);
            log::debug!("Detached {conn}");
        });

        log::debug!("Open sockets: {}", self.queues.len());

        id
    }

    fn disconnect(&mut self, conn: &str) {
        let Some(queue) = self.queues.remove(conn) else {
            log::debug!("disconnect: {conn} was already disconnected");
            return;
        };

        if let Err(e) = queue.close() {
            log::error!("Failed to close connection {conn}: {e:?}");
        }

        log::debug!("Open sockets: {}", self.queues.len());
    }

    fn on_message(&self, conn: &str, msg: Msg) {
        match self.queues.get(conn) {
            Some(queue) => {
                if let Err(e) = queue.enqueue(msg) {
                    log::error!("Failed to queue message from {conn}: {e:?}");
                }
            }
            None => log::debug!("on_message: dropping message from unknown connection {conn}"),
        }
    }

    fn process_command(&mut self, cmd: Command) {
        let cmd_str = cmd.to_string();

        proximity_logging::debug_or_trace!(
            ("process_command: cmd={cmd_str}"),
            ("process_command: cmd={cmd:?}")
        );

        match cmd {
            Command::Connect {
                room,
                conn_tx,
                res_tx,
            } => {
                let conn_id = self.connect(room, conn_tx);
                if let Err(conn_id) = res_tx.send(conn_id) {
                    log::debug!("Socket went away before receiving its id {conn_id}");
                    self.disconnect(&conn_id);
                }
            }

            Command::Disconnect { conn } => self.disconnect(&conn),

            Command::Message { msg, conn } => self.on_message(&conn, msg),
        }

        log::trace!("process_command: Finished processing cmd {cmd_str}");
    }

    /// Processes commands until cancelled.
    ///
    /// # Errors
    ///
    /// * Never; kept fallible to match the other services' join handles
    pub async fn run(mut self) -> io::Result<()> {
        let token = self.token.clone();
        let cmd_rx = self.cmd_rx.clone();

        while let Ok(Ok(cmd)) = tokio::select!(
            () = token.cancelled() => {
                log::debug!("WsServer was cancelled");
                Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "Cancelled"))
            }
            cmd = cmd_rx.recv_async() => { Ok(cmd) }
        ) {
            log::trace!("Received WsServer command {cmd}");
            self.process_command(cmd);
        }

        for conn in self.queues.keys().cloned().collect::<Vec<_>>() {
            self.disconnect(&conn);
        }

        log::debug!("Stopped WsServer");

        Ok(())
    }
}

/// Handle and command sender for ws server.
#[derive(Debug, Clone)]
pub struct WsServerHandle {
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl WsServerHandle {
    /// Registers a socket's outbound channel and obtains its connection id.
    ///
    /// Returns `None` if the server has stopped.
    pub async fn connect(
        &self,
        room: Arc<RoomConfig>,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> Option<ConnId> {
        log::trace!("Sending Connect command");

        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Connect {
                room,
                conn_tx,
                res_tx,
            })
            .await
        {
            log::error!("Failed to send command: {e:?}");
            return None;
        }

        res_rx
            .await
            .inspect_err(|e| log::error!("Failed to recv response from ws server: {e:?}"))
            .ok()
    }

    /// Queues a text frame received from `conn`.
    pub async fn send_message(&self, conn: &str, msg: impl Into<String> + Send) {
        log::trace!("Sending Message command");

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Message {
                msg: msg.into(),
                conn: conn.to_string(),
            })
            .await
        {
            log::error!("Failed to send command: {e:?}");
        }
    }

    /// Queues the teardown of `conn` behind its pending messages.
    pub async fn disconnect(&self, conn: &str) {
        log::trace!("Sending Disconnect command");

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Disconnect {
                conn: conn.to_string(),
            })
            .await
        {
            log::error!("Failed to send command: {e:?}");
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use proximity_config::RoomRegistry;
    use proximity_media::simulator::SimulatedMediaEngine;

    use super::*;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Msg>) -> Msg {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn messages_flow_through_the_server_in_order() {
        let state = Arc::new(ProximityState::new(
            RoomRegistry::new(vec![]),
            Arc::new(SimulatedMediaEngine::default()),
        ));
        let room = state.rooms.get("main").unwrap();
        let (server, handle) = WsServer::new(state.clone());
        let join = tokio::spawn(server.run());

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let a = handle.connect(room.clone(), a_tx).await.unwrap();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let b = handle.connect(room, b_tx).await.unwrap();
        assert_ne!(a, b);

        handle.send_message(&a, "connect,Alice").await;
        recv(&mut a_rx).await;
        recv(&mut a_rx).await;
        handle.send_message(&b, "connect,Bob").await;
        recv(&mut b_rx).await;
        recv(&mut b_rx).await;
        recv(&mut a_rx).await;

        handle.send_message(&a, "pos,,7,8").await;
        handle.disconnect(&a).await;

        assert_eq!(recv(&mut b_rx).await, format!("{a},,7,8"));
        assert_eq!(recv(&mut b_rx).await, format!(r#"{{"leave":{{"id":"{a}"}}}}"#));

        handle.shutdown();
        join.await.unwrap().unwrap();
    }
}
