//! WebSocket connection handler
//!
//! Bridges one established WebSocket to the hub: handshake with the user
//! identity taken from the `user_id` query parameter, then an independent
//! writer (queue → socket, plus keepalive) and reader (socket → dispatch).
//! Either side may unregister; the hub ignores the second call.

use std::io;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::connection::{ConnectionHandle, Registration};
use crate::error::{AppError, FrameError};
use crate::hub::HubHandle;
use crate::message::{ClientMessage, Event};
use crate::types::UserId;

/// Longest a single frame write may take before the peer counts as gone
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the reader gets to see the peer's close after the writer finished
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake and serves the connection until both
/// directions have finished.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    config: HubConfig,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut user_id = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match user_id_from_query(req.uri().query()) {
            Some(id) => {
                user_id = Some(id);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("missing or invalid user_id".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let user_id = user_id.ok_or(AppError::MissingUserId)?;

    info!("User {} connected from {}", user_id, peer_addr);
    serve(ws_stream, user_id, hub, config.keepalive_interval()).await
}

/// Serve an established WebSocket for `user_id`
///
/// Returns once both the reader and the writer have exited.
pub async fn serve<S>(
    ws_stream: WebSocketStream<S>,
    user_id: UserId,
    hub: HubHandle,
    keepalive: Duration,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let registration = hub.register(user_id).await?;
    serve_registered(ws_stream, registration, hub, keepalive).await
}

/// Serve an established WebSocket for a connection already registered
///
/// The caller may keep a clone of the registration's handle to observe
/// the connection's lifecycle.
pub async fn serve_registered<S>(
    ws_stream: WebSocketStream<S>,
    registration: Registration,
    hub: HubHandle,
    keepalive: Duration,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Registration { handle, events } = registration;
    let connection_id = handle.id;
    let (ws_sender, ws_receiver) = ws_stream.split();

    let mut write_task = tokio::spawn(write_loop(
        ws_sender,
        events,
        handle.clone(),
        hub.clone(),
        keepalive,
    ));
    let mut read_task = tokio::spawn(read_loop(ws_receiver, handle, hub));

    tokio::select! {
        _ = &mut read_task => {
            // Unregister closes the queue, which ends the writer
            let _ = write_task.await;
        }
        _ = &mut write_task => {
            if time::timeout(CLOSE_GRACE, &mut read_task).await.is_err() {
                debug!("Peer {} did not close in time, dropping reader", connection_id);
                read_task.abort();
            }
        }
    }

    info!("Connection {} finished", connection_id);
    Ok(())
}

/// Drain the outbound queue onto the socket
///
/// Sends a keepalive ping after `keepalive` without application traffic.
/// Ends on a write failure or when the hub closes the queue.
async fn write_loop<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, Message>,
    mut events: mpsc::Receiver<Event>,
    handle: ConnectionHandle,
    hub: HubHandle,
    keepalive: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let (event, from_queue) = tokio::select! {
            biased;
            maybe = events.recv() => match maybe {
                Some(event) => (event, true),
                None => {
                    debug!("Queue closed for {}", handle.id);
                    break;
                }
            },
            _ = ticker.tick() => (Event::ping(), false),
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                // Continue - don't break on serialization errors
                error!("Failed to serialize {} event: {}", event.kind(), e);
                continue;
            }
        };

        if let Err(e) = send_text(&mut ws_sender, json).await {
            debug!("Write to {} failed: {}", handle.id, e);
            handle.mark_closing();
            break;
        }

        if from_queue {
            ticker.reset();
        }
    }

    // Send close frame when done
    if time::timeout(WRITE_TIMEOUT, ws_sender.close()).await.is_err() {
        warn!("Close handshake to {} timed out", handle.id);
    }
    let _ = hub.unregister(handle.id).await;
    handle.mark_closed();
    debug!("Write task ended for {}", handle.id);
}

async fn send_text<S>(
    ws_sender: &mut SplitSink<WebSocketStream<S>, Message>,
    json: String,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match time::timeout(WRITE_TIMEOUT, ws_sender.send(Message::Text(json.into()))).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

/// Decode client frames and hand them to the hub
///
/// Ends on a read error, a close frame, or end of stream.
async fn read_loop<S>(
    mut ws_receiver: SplitStream<WebSocketStream<S>>,
    handle: ConnectionHandle,
    hub: HubHandle,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg_result) = ws_receiver.next().await {
        let frame: Result<ClientMessage, FrameError> = match msg_result {
            Ok(Message::Text(text)) => ClientMessage::decode(&text),
            Ok(Message::Binary(_)) => Err(FrameError::Binary),
            Ok(Message::Close(_)) => {
                debug!("Connection {} sent close frame", handle.id);
                break;
            }
            Ok(_) => {
                // Ping/Pong frames are answered by tungstenite
                continue;
            }
            Err(e) => {
                debug!("WebSocket error for {}: {}", handle.id, e);
                handle.mark_closing();
                break;
            }
        };

        if hub.inbound(handle.id, frame).await.is_err() {
            debug!("Hub stopped, ending read task for {}", handle.id);
            break;
        }
    }

    let _ = hub.unregister(handle.id).await;
    debug!("Read task ended for {}", handle.id);
}

/// Extract `user_id` from a query string such as `user_id=7&token=abc`
fn user_id_from_query(query: Option<&str>) -> Option<UserId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user_id")
        .and_then(|(_, value)| value.parse().ok())
}
