use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use actix_ws::Message;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use proximity_config::RoomConfig;
use tokio::{pin, sync::mpsc, time::interval};

use crate::ws::server::WsServerHandle;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards text frames to the ws server, writes back whatever the server
/// routes to this connection, and drops clients that stop answering pings.
///
/// A close frame, a stream error, the end of the stream and a heartbeat
/// timeout all end up in the same disconnect.
#[allow(clippy::future_not_send)]
pub async fn handle_ws(
    ws_server: WsServerHandle,
    room: Arc<RoomConfig>,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let Some(conn_id) = ws_server.connect(room, conn_tx).await else {
        let _ = session.close(None).await;
        return;
    };

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // commands & messages received from client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    last_heartbeat = Instant::now();
                    if let Err(e) = session.pong(&bytes).await {
                        log::debug!("Failed to pong {conn_id}: {e:?}");
                        break None;
                    }
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();
                    ws_server.send_message(&conn_id, text.trim()).await;
                }

                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        last_heartbeat = Instant::now();
                        ws_server.send_message(&conn_id, text.trim()).await;
                    }
                    Err(e) => {
                        log::warn!("unexpected binary message from {conn_id}: {e:?}");
                    }
                },

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("{conn_id}: {err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => break None,

            // messages routed to this connection
            Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                if let Err(err) = session.text(ws_msg).await {
                    log::error!("Failed to send text message to {conn_id}: {err:?}");
                    break None;
                }
            }

            // detached by the ws server
            Either::Left((Either::Right((None, _)), _)) => break None,

            // heartbeat internal tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "{conn_id} has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        }
    };

    ws_server.disconnect(&conn_id).await;

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;
}
