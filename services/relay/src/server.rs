//! TCP accept loop and connection role discrimination.
//!
//! One listener, one handler task per accepted connection.  The first frame
//! decides the role: REGISTER starts an editor session, REQUEST or a control
//! frame starts a client session, anything else is a protocol error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use relay_protocol::{ErrorMessage, FramedReader, FramedWriter, Message, error_codes};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client_session::run_client_session;
use crate::config::RelayConfig;
use crate::editor_session::run_editor_session;
use crate::registry::Registry;

/// Everything a connection handler needs, owned by the [`Relay`] aggregate
/// rather than process-wide state.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
}

/// A bound, not-yet-running relay.
pub struct Relay {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: RelayState,
}

impl Relay {
    /// Bind the listen socket.  Fails fast on bind errors so the binary can
    /// exit non-zero before daemonizing.
    pub async fn bind(config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(Registry::new(config.clone()));
        Ok(Self {
            listener,
            local_addr,
            state: RelayState {
                config: Arc::new(config),
                registry,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the shutdown channel flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "relay listening");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let state = self.state.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(handle_connection(state, stream, peer, shutdown));
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
            }
        }
        info!("relay stopped accepting");
    }

    /// Bind and run on a background task; the returned handle carries the
    /// bound address and the shutdown switch.  This is how tests (and any
    /// in-process embedding) host a relay without a well-known port.
    pub async fn spawn(config: RelayConfig) -> io::Result<RelayHandle> {
        let relay = Self::bind(config).await?;
        let addr = relay.local_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(relay.run(shutdown_rx));
        Ok(RelayHandle {
            addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a relay running on a background task.
pub struct RelayHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and tear down sessions.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

/// Single writer per connection: every session funnels outbound frames
/// through this task's mpsc lane.
pub(crate) fn spawn_writer<W>(
    mut writer: FramedWriter<W>,
    mut rx: mpsc::Receiver<Message>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.write_frame(&msg).await {
                debug!(error = %e, "outbound write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

async fn handle_connection(
    state: RelayState,
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedReader::new(read_half);
    let mut writer = FramedWriter::new(write_half);

    let first = tokio::time::timeout(state.config.handshake_timeout, reader.read_frame()).await;
    match first {
        Err(_) => {
            debug!(%peer, "no first frame within the handshake window");
            send_final_error(
                &mut writer,
                error_codes::PROTOCOL_ERROR,
                "no frame received within the handshake window",
            )
            .await;
        }
        Ok(Ok(None)) => debug!(%peer, "connection closed before the first frame"),
        Ok(Ok(Some(Message::Register(reg)))) => {
            run_editor_session(state, reader, writer, reg, peer, shutdown).await;
        }
        Ok(Ok(Some(
            first @ (Message::Request(_) | Message::ListInstances(_) | Message::SetDefault(_)),
        ))) => {
            run_client_session(state, reader, writer, first, peer, shutdown).await;
        }
        Ok(Ok(Some(_))) => {
            warn!(%peer, "unrecognized first frame");
            send_final_error(
                &mut writer,
                error_codes::PROTOCOL_ERROR,
                "first frame must be REGISTER, REQUEST, LIST_INSTANCES or SET_DEFAULT",
            )
            .await;
        }
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "framing error on first frame");
            send_final_error(&mut writer, e.code(), &e.to_string()).await;
        }
    }
}

/// Best-effort final ERROR frame before closing a misbehaving connection.
async fn send_final_error<W: AsyncWrite + Unpin>(
    writer: &mut FramedWriter<W>,
    code: &str,
    message: &str,
) {
    let _ = writer
        .write_frame(&Message::Error(ErrorMessage {
            id: None,
            code: code.to_owned(),
            message: message.to_owned(),
        }))
        .await;
    let _ = writer.shutdown().await;
}
