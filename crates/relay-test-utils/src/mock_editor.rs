//! Scriptable editor double.
//!
//! Speaks the editor side of the relay protocol over a real TCP connection:
//! registers, answers probes, and either executes commands under test
//! control or runs a background auto-echo loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_protocol::{
    Command, CommandResult, FramedReader, FramedWriter, InstanceStatus, Message, PROTOCOL_VERSION,
    Pong, Register, Registered, StatusUpdate, now_ms,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockEditor {
    pub instance_id: String,
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
}

impl MockEditor {
    pub async fn connect(addr: SocketAddr, instance_id: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            instance_id: instance_id.to_owned(),
            reader: FramedReader::new(read_half),
            writer: FramedWriter::new(write_half),
        })
    }

    /// Connect and complete the REGISTER handshake, panicking on rejection.
    pub async fn connect_registered(addr: SocketAddr, instance_id: &str) -> Self {
        let mut editor = Self::connect(addr, instance_id)
            .await
            .expect("connect to relay");
        let registered = editor.register().await;
        assert!(
            registered.success,
            "registration rejected: {:?}",
            registered.error
        );
        editor
    }

    /// Send REGISTER and wait for the REGISTERED reply.
    pub async fn register(&mut self) -> Registered {
        self.send(Message::Register(Register {
            protocol_version: PROTOCOL_VERSION,
            instance_id: self.instance_id.clone(),
            project_name: format!("proj-{}", self.instance_id),
            unity_version: "2022.3.10f1".to_owned(),
            capabilities: vec!["echo".to_owned()],
            ts: now_ms(),
        }))
        .await;
        match self.recv().await {
            Some(Message::Registered(registered)) => registered,
            Some(other) => panic!("expected REGISTERED, got {other:?}"),
            None => panic!("relay closed the connection during registration"),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        self.writer
            .write_frame(&msg)
            .await
            .expect("write frame to relay");
    }

    /// Next frame, or `None` when the relay closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame from the relay")
            .expect("read frame from relay")
    }

    /// Wait for the next COMMAND, transparently answering liveness probes.
    pub async fn expect_command(&mut self) -> Command {
        loop {
            match self.recv().await {
                Some(Message::Command(cmd)) => return cmd,
                Some(Message::Ping(ping)) => {
                    self.send(Message::Pong(Pong {
                        ts: now_ms(),
                        echo_ts: ping.ts,
                    }))
                    .await;
                }
                Some(other) => panic!("expected COMMAND, got {other:?}"),
                None => panic!("relay closed the connection while waiting for a command"),
            }
        }
    }

    /// Assert that no COMMAND arrives within `window` (probes are answered
    /// and ignored).
    pub async fn expect_no_command(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let frame = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => return,
                frame = self.reader.read_frame() => frame.expect("read frame from relay"),
            };
            match frame {
                Some(Message::Ping(ping)) => {
                    self.send(Message::Pong(Pong {
                        ts: now_ms(),
                        echo_ts: ping.ts,
                    }))
                    .await;
                }
                Some(Message::Command(cmd)) => {
                    panic!("unexpected COMMAND {} within the quiet window", cmd.id)
                }
                Some(_) => {}
                None => return,
            }
        }
    }

    pub async fn reply_success(&mut self, id: &str, data: serde_json::Value) {
        self.send(Message::CommandResult(CommandResult {
            id: id.to_owned(),
            success: true,
            data: Some(data),
            error: None,
            ts: now_ms(),
        }))
        .await;
    }

    pub async fn reply_error(&mut self, id: &str, code: &str, message: &str) {
        self.send(Message::CommandResult(CommandResult {
            id: id.to_owned(),
            success: false,
            data: None,
            error: Some(relay_protocol::ErrorBody::new(code, message)),
            ts: now_ms(),
        }))
        .await;
    }

    /// Announce an in-process reload.  Callers usually drop the editor right
    /// after, mimicking the torn-down network stack.
    pub async fn send_reloading(&mut self) {
        let instance_id = self.instance_id.clone();
        self.send(Message::Status(StatusUpdate {
            instance_id,
            status: InstanceStatus::Reloading,
            detail: Some("domain reload".to_owned()),
            ts: now_ms(),
        }))
        .await;
    }

    /// Run this editor on a background task: every COMMAND is answered with
    /// its own params as success data, every PING with a PONG.
    pub fn spawn_echo(self) -> MockEditorHandle {
        let executed = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let counter = executed.clone();
        let mut editor = self;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() { break; }
                    }
                    frame = editor.reader.read_frame() => {
                        match frame {
                            Ok(Some(Message::Command(cmd))) => {
                                counter.fetch_add(1, Ordering::SeqCst);
                                editor.reply_success(&cmd.id, cmd.params).await;
                            }
                            Ok(Some(Message::Ping(ping))) => {
                                editor
                                    .send(Message::Pong(Pong { ts: now_ms(), echo_ts: ping.ts }))
                                    .await;
                            }
                            Ok(Some(_)) => {}
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }
        });
        MockEditorHandle {
            executed,
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a background auto-echo editor.
pub struct MockEditorHandle {
    executed: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MockEditorHandle {
    /// Number of COMMAND frames this editor has executed.
    pub fn commands_executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Stop the loop and close the connection.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
