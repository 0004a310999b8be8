//! WebSocket listener and per-connection tasks.
//!
//! Every connection gets a reader loop that feeds frames to the router in
//! arrival order and a writer task that drains the bounded outbound queue
//! and pings the remote end. Registry and peer-link cleanup happen in guard
//! drops, so every exit path releases the connection exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use olaf_protocol::messaging::{encode_frame, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::federation::LinkGuard;
use crate::registry::{ConnectionHandle, ConnectionId, RegistrationGuard};
use crate::router::{self, Role};
use crate::server_state::ServerState;

/// Accept WebSocket connections until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listen = %addr, address = %state.address, "listening for connections");
    }

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let state = Arc::clone(&state);
                tokio::spawn(accept_connection(stream, remote, state));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

async fn accept_connection(stream: TcpStream, remote: SocketAddr, state: Arc<ServerState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(remote = %remote, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (handle, rx) = state.open_connection();
    tracing::debug!(remote = %remote, connection = handle.id(), "connection opened");
    run_connection(ws, state, handle, rx, Role::Unidentified, None).await;
    tracing::debug!(remote = %remote, "connection closed");
}

/// Drive one connection until either side closes it.
///
/// With `refresh` set, a `client_update_request` is queued on every tick;
/// outbound peer links use this to pull the neighbour's directory.
pub(crate) async fn run_connection<S>(
    ws: WebSocketStream<S>,
    state: Arc<ServerState>,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<String>,
    mut role: Role,
    refresh: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = handle.id();
    let _registration = RegistrationGuard::new(Arc::clone(&state.registry), connection);
    let _link = LinkGuard::new(Arc::clone(&state.peers), connection);

    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(write_loop(sink, rx, state.ping_interval, connection));

    let mut refresh = refresh.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    router::handle_text(&state, &handle, &mut role, text.as_str());
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!(connection, "ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection, error = %e, "read error");
                    break;
                }
            },
            () = tick(&mut refresh) => match encode_frame(&Frame::ClientUpdateRequest) {
                Ok(text) => {
                    handle.send(text);
                }
                Err(e) => {
                    tracing::error!(connection, error = %e, "failed to encode refresh request");
                }
            },
        }
    }

    writer.abort();
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<String>,
    ping_interval: Duration,
    connection: ConnectionId,
) where
    W: futures::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        let message = tokio::select! {
            text = rx.recv() => match text {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(connection, error = %e, "write error");
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::trace!(connection, error = %e, "close error");
    }
}
