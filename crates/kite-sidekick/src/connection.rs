//! Per-client WebSocket connection handling.
//!
//! Each connection gets a writer task draining its outbound queue (plus a
//! heartbeat ping) and a reader loop handling the five inbound frame kinds.
//! A bad frame gets an `error` reply; it never closes the connection.

use crate::broker::ConnectionId;
use crate::error::SidekickError;
use crate::queue::OutboundQueue;
use crate::server::SidekickState;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use kite_core::{ChannelError, Fault, Params, RelayInbound, RelayOutbound};
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub async fn handle_connection(socket: WebSocket, state: Arc<SidekickState>) {
    let (conn_id, queue) = state.broker.open_connection().await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = {
        let queue = queue.clone();
        let heartbeat = state.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the immediate first tick
            loop {
                tokio::select! {
                    frame = queue.recv() => match frame {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                debug!("Connection {}: send failed, client gone", conn_id);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.close().await;
        })
    };

    info!("Connection {} started", conn_id);

    loop {
        let next = match timeout(state.settings.idle_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(
                    "Connection {}: idle timeout ({}s)",
                    conn_id,
                    state.settings.idle_timeout.as_secs()
                );
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_frame(&state, conn_id, &queue, &text).await;
            }
            Some(Ok(Message::Binary(_))) => {
                reply_error(
                    &state,
                    &queue,
                    ChannelError::detached(Fault::Sidekick, "Binary frames are not supported"),
                );
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!("Connection {}: client closed", conn_id);
                break;
            }
            Some(Err(e)) => {
                warn!("Connection {}: websocket error: {}", conn_id, e);
                break;
            }
        }
    }

    // Releases subscriptions and closes the queue, which stops the writer
    state.broker.close_connection(conn_id).await;
    let _ = writer.await;

    info!("Connection {} closed", conn_id);
}

fn reply_error(state: &SidekickState, queue: &OutboundQueue, error: ChannelError) {
    state
        .broker
        .send_to(queue, &RelayOutbound::Error { error });
}

fn reply(state: &SidekickState, queue: &OutboundQueue, frame: RelayOutbound) {
    state.broker.send_to(queue, &frame);
}

/// Handle one inbound text frame.
pub(crate) async fn handle_frame(
    state: &Arc<SidekickState>,
    conn_id: ConnectionId,
    queue: &Arc<OutboundQueue>,
    text: &str,
) {
    let frame: RelayInbound = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Connection {}: malformed frame: {}", conn_id, e);
            let error = SidekickError::MalformedFrame {
                message: e.to_string(),
            };
            reply_error(state, queue, error.into_channel_error("", &Params::new()));
            return;
        }
    };

    match frame {
        RelayInbound::Listen { resources } => {
            match state.broker.listen(conn_id, &resources).await {
                Ok(()) => reply(state, queue, RelayOutbound::Listening { resources }),
                Err(e) => reply_error(state, queue, e.into_channel_error("", &Params::new())),
            }
        }
        RelayInbound::Unlisten { resources } => {
            match state.broker.unlisten(conn_id, &resources).await {
                Ok(()) => reply(state, queue, RelayOutbound::Unlistening { resources }),
                Err(e) => reply_error(state, queue, e.into_channel_error("", &Params::new())),
            }
        }
        RelayInbound::Subscribe { token } => match state.broker.subscribe(conn_id, &token).await {
            Ok((channel, params)) => reply(state, queue, RelayOutbound::Subscribed { channel, params }),
            Err(e) => reply_error(state, queue, e.into_channel_error("", &Params::new())),
        },
        RelayInbound::Unsubscribe { token } => {
            match state.broker.unsubscribe(conn_id, &token).await {
                Ok((channel, params)) => {
                    reply(state, queue, RelayOutbound::Unsubscribed { channel, params })
                }
                Err(e) => reply_error(state, queue, e.into_channel_error("", &Params::new())),
            }
        }
        RelayInbound::Send {
            token,
            channel,
            params,
            data,
        } => {
            let forward = match state
                .broker
                .resolve_send(conn_id, &token, &channel, &params, data)
                .await
            {
                Ok(forward) => forward,
                Err(e) => {
                    reply_error(state, queue, e.into_channel_error(&channel, &params));
                    return;
                }
            };

            // One slow handler must not hold up this connection's other frames
            let state = state.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                if let Err(error) = state.forwarder.forward(&forward).await {
                    debug!(
                        "Connection {}: forward on {} failed ({} fault): {}",
                        conn_id, forward.channel, error.fault, error.message
                    );
                    reply_error(&state, &queue, error);
                }
            });
        }
    }
}
