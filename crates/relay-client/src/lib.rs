// relay-client: Client-side transport for the editor relay.
//
// Maintains one TCP connection to the relay per client, synthesizes
// idempotency-keyed request identifiers, and retries transient errors with
// capped exponential backoff.  The at-most-once guarantee is a joint
// property of this retry loop (identifier reuse) and the relay's cache.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use relay_protocol::{
    FrameError, FramedReader, FramedWriter, InstanceInfo, ListInstances, Message, Request,
    Response, SetDefault, error_codes, now_ms,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod backoff;

pub use backoff::{Backoff, RetryPolicy};

/// Deadline sent with a call when the caller does not override it.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    /// Structured error reply from the relay (or relayed from the editor).
    #[error("relay error {code}: {message}")]
    Relay { code: String, message: String },
    #[error("relay closed the connection")]
    ConnectionClosed,
    #[error("no reply within the attempt window")]
    AttemptTimeout,
}

impl ClientError {
    /// Whether the same logical call (same identifier) should be retried.
    /// Connection loss counts as a transient timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::AttemptTimeout => {
                true
            }
            ClientError::Relay { code, .. } => error_codes::is_transient(code),
            ClientError::Frame(_) => false,
        }
    }

    fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Frame(_)
                | ClientError::ConnectionClosed
                | ClientError::AttemptTimeout
        )
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Target instance; the relay's default instance when absent.
    pub instance_id: Option<String>,
    /// Request deadline enforced by the relay.
    pub timeout_ms: Option<u64>,
}

struct Connection {
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
}

/// A client session against one relay endpoint.
///
/// The `client_id` is stable for the process lifetime of this value, so
/// request identifiers stay unique across reconnects.
pub struct RelayClient {
    addr: SocketAddr,
    client_id: String,
    retry: RetryPolicy,
    conn: Option<Connection>,
}

impl RelayClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_policy(addr, RetryPolicy::default())
    }

    pub fn with_policy(addr: SocketAddr, retry: RetryPolicy) -> Self {
        Self {
            addr,
            client_id: format!("cli-{}", Uuid::new_v4().simple()),
            retry,
            conn: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// One logical command round-trip with automatic retry on transient
    /// errors.  Every attempt reuses the same request identifier, so a
    /// retried call that already executed is answered from the relay's
    /// idempotency cache instead of running twice.
    pub async fn call(
        &mut self,
        command: &str,
        params: serde_json::Value,
        options: CallOptions,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let id = format!("{}:{}", self.client_id, Uuid::new_v4());
        let started = Instant::now();
        let mut backoff = Backoff::new(self.retry.clone());

        loop {
            match self.attempt(&id, command, &params, &options).await {
                Ok(response) => return Ok(response.data),
                Err(e) if e.is_transient() => match backoff.next_delay(started.elapsed()) {
                    Some(delay) => {
                        debug!(id = %id, error = %e, delay_ms = delay.as_millis() as u64, "transient error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(id = %id, error = %e, "retry budget exhausted");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Point-in-time snapshot of registered instances.
    pub async fn list_instances(&mut self) -> Result<Vec<InstanceInfo>, ClientError> {
        let conn = self.connection().await?;
        let result = Self::list_on(conn).await;
        self.reset_on_error(&result);
        result
    }

    /// Select the instance used by calls that name none.
    pub async fn set_default(&mut self, instance_id: &str) -> Result<(), ClientError> {
        let conn = self.connection().await?;
        let result = Self::set_default_on(conn, instance_id).await;
        self.reset_on_error(&result);
        result
    }

    async fn attempt(
        &mut self,
        id: &str,
        command: &str,
        params: &serde_json::Value,
        options: &CallOptions,
    ) -> Result<Response, ClientError> {
        let conn = self.connection().await?;
        let result = Self::roundtrip(conn, id, command, params, options).await;
        self.reset_on_error(&result);
        result
    }

    async fn roundtrip(
        conn: &mut Connection,
        id: &str,
        command: &str,
        params: &serde_json::Value,
        options: &CallOptions,
    ) -> Result<Response, ClientError> {
        conn.writer
            .write_frame(&Message::Request(Request {
                id: id.to_owned(),
                instance_id: options.instance_id.clone(),
                command: command.to_owned(),
                params: params.clone(),
                timeout_ms: options.timeout_ms,
                ts: now_ms(),
            }))
            .await?;

        // The relay answers every REQUEST within its deadline; the extra
        // margin only catches a relay that went away entirely.
        let window =
            Duration::from_millis(options.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS) + 2_000);
        loop {
            let frame = tokio::time::timeout(window, conn.reader.read_frame())
                .await
                .map_err(|_| ClientError::AttemptTimeout)??;
            match frame {
                Some(Message::Response(response)) if response.id == id => {
                    if response.success {
                        return Ok(response);
                    }
                    let err = response.error.unwrap_or_else(|| {
                        relay_protocol::ErrorBody::new(
                            error_codes::INTERNAL_ERROR,
                            "error response without a body",
                        )
                    });
                    return Err(ClientError::Relay {
                        code: err.code,
                        message: err.message,
                    });
                }
                Some(Message::Response(stale)) => {
                    debug!(id = %stale.id, "ignoring stale response");
                }
                Some(Message::Error(err)) => {
                    return Err(ClientError::Relay {
                        code: err.code,
                        message: err.message,
                    });
                }
                Some(other) => {
                    debug!(?other, "ignoring unexpected frame");
                }
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    async fn list_on(conn: &mut Connection) -> Result<Vec<InstanceInfo>, ClientError> {
        conn.writer
            .write_frame(&Message::ListInstances(ListInstances {}))
            .await?;
        loop {
            match conn.reader.read_frame().await? {
                Some(Message::Instances(snapshot)) => return Ok(snapshot.instances),
                Some(Message::Error(err)) => {
                    return Err(ClientError::Relay {
                        code: err.code,
                        message: err.message,
                    });
                }
                Some(other) => debug!(?other, "ignoring unexpected frame"),
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    async fn set_default_on(conn: &mut Connection, instance_id: &str) -> Result<(), ClientError> {
        conn.writer
            .write_frame(&Message::SetDefault(SetDefault {
                instance_id: instance_id.to_owned(),
            }))
            .await?;
        loop {
            match conn.reader.read_frame().await? {
                Some(Message::Ack(_)) => return Ok(()),
                Some(Message::Error(err)) => {
                    return Err(ClientError::Relay {
                        code: err.code,
                        message: err.message,
                    });
                }
                Some(other) => debug!(?other, "ignoring unexpected frame"),
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut Connection, ClientError> {
        if self.conn.is_none() {
            let stream = TcpStream::connect(self.addr).await?;
            let (read_half, write_half) = stream.into_split();
            self.conn = Some(Connection {
                reader: FramedReader::new(read_half),
                writer: FramedWriter::new(write_half),
            });
            debug!(addr = %self.addr, "connected to relay");
        }
        Ok(self.conn.as_mut().expect("connection just installed"))
    }

    /// A broken connection is dropped so the next attempt reconnects and
    /// re-sends with the same identifier.
    fn reset_on_error<T>(&mut self, result: &Result<T, ClientError>) {
        if let Err(e) = result
            && e.breaks_connection()
        {
            self.conn = None;
        }
    }
}
