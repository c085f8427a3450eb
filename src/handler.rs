//! Per-connection message handler
//!
//! Each connection is owned by exactly one handler, modeled as an actor:
//! one task reads frames off the socket, one task drains a FIFO outbox.
//! Both directions are serialized by construction, and back-to-back sends
//! leave in queue order, so no stream is ever shared between two writers.
//!
//! Receiving or sending `bye` terminates the handler; the socket is
//! closed after the `bye` frame is flushed.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{Transport, TransportMode};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Callbacks a connection owner registers on its handler.
///
/// Both run on the handler's reader task, so invocations for one
/// connection never overlap.
#[async_trait]
pub trait HandlerEvents: Send + Sync {
    /// A parsed message arrived.
    async fn on_receive(&self, handler: Arc<MessageHandler>, msg: Message);

    /// The connection is established (after the TLS handshake for the
    /// secure modes) and the read loop is about to start.
    async fn on_connected(&self, handler: Arc<MessageHandler>) {
        let _ = handler;
    }
}

/// Handle to a live connection. Cloneable via `Arc`; sending is queueing.
pub struct MessageHandler {
    peer: String,
    mode: TransportMode,
    outbox: mpsc::UnboundedSender<Message>,
    closed: watch::Receiver<bool>,
}

impl MessageHandler {
    /// Takes ownership of a connected transport and starts the reader and
    /// writer tasks. `events.on_connected` fires before the first read.
    pub fn spawn(
        transport: Transport,
        mode: TransportMode,
        peer: String,
        events: Arc<dyn HandlerEvents>,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let handler = Arc::new(Self {
            peer,
            mode,
            outbox,
            closed,
        });

        let (read_half, write_half) = tokio::io::split(transport);

        tokio::spawn(write_loop(
            write_half,
            outbox_rx,
            handler.peer.clone(),
            closed_tx.clone(),
        ));
        tokio::spawn(read_loop(read_half, handler.clone(), events, closed_tx));

        handler
    }

    /// Queues a message for sending. FIFO order is preserved.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.outbox
            .send(msg)
            .map_err(|e| Error::Transport(format!("{}: connection closed: {}", self.peer, e.0)))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Resolves when either direction of the connection has stopped.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<Transport>,
    mut outbox_rx: mpsc::UnboundedReceiver<Message>,
    peer: String,
    closed_tx: Arc<watch::Sender<bool>>,
) {
    while let Some(msg) = outbox_rx.recv().await {
        let frame = msg.to_frame();
        if let Err(e) = write_half.write_all(&frame).await {
            error!(peer = %peer, error = %e, "Write failed");
            break;
        }
        info!(peer = %peer, len = frame.len() - 4, "Message sent: {}", msg);

        if msg.cmd() == "bye" {
            let _ = write_half.flush().await;
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let _ = closed_tx.send(true);
    debug!(peer = %peer, "Writer stopped");
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<Transport>,
    handler: Arc<MessageHandler>,
    events: Arc<dyn HandlerEvents>,
    closed_tx: Arc<watch::Sender<bool>>,
) {
    events.on_connected(handler.clone()).await;

    loop {
        let len = match read_half.read_u32().await {
            Ok(len) => len as usize,
            Err(e) => {
                debug!(peer = %handler.peer, error = %e, "Connection closed");
                break;
            }
        };

        let mut payload = vec![0u8; len];
        if let Err(e) = read_half.read_exact(&mut payload).await {
            error!(peer = %handler.peer, error = %e, "Truncated frame");
            break;
        }

        let msg = match Message::from_bytes(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                // Protocol error: close this connection, leave the rest
                // of the process alone.
                error!(peer = %handler.peer, error = %e, "Message parse failed");
                break;
            }
        };
        debug!(peer = %handler.peer, len, "Message received: {}", msg);

        let is_bye = msg.cmd() == "bye";
        events.on_receive(handler.clone(), msg).await;
        if is_bye {
            debug!(peer = %handler.peer, "Peer said bye");
            break;
        }
    }

    let _ = closed_tx.send(true);
    debug!(peer = %handler.peer, "Reader stopped");
}

/// Logs and drops a message nobody handles.
pub fn ignore_unknown(peer: &str, msg: &Message) {
    warn!(peer = %peer, cmd = %msg.cmd(), "Unknown command, ignored");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Acceptor, Connector};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedSender;

    struct Recorder {
        tx: UnboundedSender<Message>,
        announce: Option<Message>,
    }

    #[async_trait]
    impl HandlerEvents for Recorder {
        async fn on_receive(&self, _handler: Arc<MessageHandler>, msg: Message) {
            self.tx.send(msg).expect("record");
        }

        async fn on_connected(&self, handler: Arc<MessageHandler>) {
            if let Some(msg) = &self.announce {
                handler.send(msg.clone()).expect("send on connect");
            }
        }
    }

    fn test_settings() -> crate::config::Settings {
        crate::config::Settings {
            app_home: std::path::PathBuf::from("/tmp"),
            num_threads: 2,
            coordinator_host: "127.0.0.1".to_string(),
            worker_manager_port: 0,
            enable_ratls: false,
            mrenclave: None,
            mrsigner: None,
            tls_cert_path: None,
            tls_key_path: None,
            storage_engine: "filesystem".to_string(),
            ledgebase_base_path: None,
            ledgebase_storage_path: None,
            scheduler_slots: 2,
            scheduler_compat_check: true,
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = Acceptor::new(TransportMode::Plaintext, &test_settings(), None)
            .expect("acceptor");

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.expect("accept");
            let transport = acceptor.accept(socket).await.expect("handshake");
            MessageHandler::spawn(
                transport,
                TransportMode::Plaintext,
                peer.to_string(),
                Arc::new(Recorder {
                    tx: server_tx,
                    announce: None,
                }),
            );
        });

        let connector = Connector::new(TransportMode::Plaintext, None).expect("connector");
        let transport = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("connect");

        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let client = MessageHandler::spawn(
            transport,
            TransportMode::Plaintext,
            "coordinator".to_string(),
            Arc::new(Recorder {
                tx: client_tx,
                announce: Some(Message::new("W1", "ready", vec!["W1".to_string()])),
            }),
        );

        // The on_connected announcement arrives first, then an explicit send.
        client
            .send(Message::without_args("W1", "ping"))
            .expect("send");

        let first = server_rx.recv().await.expect("first");
        assert_eq!(first.cmd(), "ready");
        assert_eq!(first.args(), ["W1".to_string()]);

        let second = server_rx.recv().await.expect("second");
        assert_eq!(second.cmd(), "ping");
    }

    #[tokio::test]
    async fn test_bye_closes_connection_after_flush() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.expect("accept");
            MessageHandler::spawn(
                Transport::Plain(socket),
                TransportMode::Plaintext,
                peer.to_string(),
                Arc::new(Recorder {
                    tx: server_tx,
                    announce: None,
                }),
            );
        });

        let connector = Connector::new(TransportMode::Plaintext, None).expect("connector");
        let transport = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let client = MessageHandler::spawn(
            transport,
            TransportMode::Plaintext,
            "coordinator".to_string(),
            Arc::new(Recorder {
                tx: client_tx,
                announce: None,
            }),
        );

        client
            .send(Message::without_args("W1", "bye"))
            .expect("send bye");

        // The bye frame is flushed before the socket closes.
        let received = server_rx.recv().await.expect("bye received");
        assert_eq!(received.cmd(), "bye");
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                MessageHandler::spawn(
                    Transport::Plain(socket),
                    TransportMode::Plaintext,
                    peer.to_string(),
                    Arc::new(Recorder {
                        tx: server_tx.clone(),
                        announce: None,
                    }),
                );
            }
        });

        // First peer sends a frame that is not a valid message.
        {
            let mut raw = tokio::net::TcpStream::connect(addr).await.expect("connect");
            raw.write_all(&7u32.to_be_bytes()).await.expect("len");
            raw.write_all(b"garbage").await.expect("body");
            raw.flush().await.expect("flush");
        }

        // A well-formed peer still gets through.
        let connector = Connector::new(TransportMode::Plaintext, None).expect("connector");
        let transport = connector
            .connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let client = MessageHandler::spawn(
            transport,
            TransportMode::Plaintext,
            "coordinator".to_string(),
            Arc::new(Recorder {
                tx: client_tx,
                announce: None,
            }),
        );
        client
            .send(Message::without_args("W2", "ping"))
            .expect("send");

        let received = server_rx.recv().await.expect("receive");
        assert_eq!(received.cmd(), "ping");
        assert_eq!(received.sender_id(), "W2");
    }
}
