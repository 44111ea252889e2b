//! WebSocket listener for design-client sessions.
//!
//! One axum route upgrades each connection and hands it to the broker. Each
//! socket runs two tasks: a writer draining the broker's outbound channel
//! into the sink, and a reader feeding inbound text frames to
//! [`Broker::handle_frame`]. Whichever side finishes first tears down the
//! other, then the broker is told the transport closed.

use std::net::SocketAddr;
use std::sync::Mutex;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

use super::broker::Broker;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server already running")]
    AlreadyRunning,
}

#[derive(Clone)]
struct WsState {
    broker: Broker,
    max_message_bytes: usize,
}

/// Build the WebSocket router. Clients connect at the root path.
pub fn router(broker: Broker, max_message_bytes: usize) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(WsState {
            broker,
            max_message_bytes,
        })
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Owns the TCP listener lifecycle around one [`Broker`].
pub struct BridgeServer {
    broker: Broker,
    config: ServerConfig,
    running: Mutex<Option<Running>>,
}

impl BridgeServer {
    pub fn new(broker: Broker, config: ServerConfig) -> Self {
        Self {
            broker,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Bind the listener and start serving. Returns the bound address, which
    /// differs from the configured one when port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
        {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let app = router(self.broker.clone(), self.config.max_message_bytes);
        let (shutdown, mut signal) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.changed().await;
                })
                .await
        });

        let mut slot = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            // Lost a start race; tear the extra listener down.
            let _ = shutdown.send(true);
            task.abort();
            return Err(ServerError::AlreadyRunning);
        }
        tracing::info!(%local, "websocket listener started");
        *slot = Some(Running { shutdown, task });
        Ok(local)
    }

    /// Stop accepting connections, then shut the broker down. Idempotent.
    pub async fn stop(&self) {
        let running = {
            let mut slot = self.running.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            match running.task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%err, "listener exited with error"),
                Err(err) => tracing::warn!(%err, "listener task panicked"),
            }
        }
        self.broker.shutdown().await;
        tracing::info!("server stopped");
    }
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.broker))
}

async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let transport = broker.attach_transport(tx);

    // Writer: closed-channel means the broker dropped this transport
    // (identification deadline, replacement, or shutdown).
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = broker.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => reader.handle_frame(transport, &text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(transport, %err, "socket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    broker.transport_closed(transport);
    tracing::debug!(transport, "socket handler finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn test_server() -> BridgeServer {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        BridgeServer::new(Broker::new(BrokerConfig::default()), config)
    }

    #[tokio::test]
    async fn start_binds_an_ephemeral_port() {
        let server = test_server();
        let addr = server.start().await.unwrap();
        assert!(addr.port() != 0);
        assert!(addr.ip().is_loopback());
        server.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let server = test_server();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = test_server();
        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_only_shuts_the_broker_down() {
        let server = test_server();
        server.stop().await;
        assert!(!server.broker().is_any_client_connected());
    }
}
