//! Raw framed client for protocol-level tests.
//!
//! Unlike `relay-client`, this double never retries and exposes every frame,
//! so tests can assert on exact error codes and frame sequences.

use std::net::SocketAddr;
use std::time::Duration;

use relay_protocol::{
    FramedReader, FramedWriter, InstanceInfo, ListInstances, Message, Request, Response,
    SetDefault, now_ms,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockClient {
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
}

impl MockClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedReader::new(read_half),
            writer: FramedWriter::new(write_half),
        })
    }

    pub async fn send(&mut self, msg: Message) {
        self.writer
            .write_frame(&msg)
            .await
            .expect("write frame to relay");
    }

    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame from the relay")
            .expect("read frame from relay")
    }

    /// Send one REQUEST and wait for its RESPONSE.
    pub async fn request(
        &mut self,
        id: &str,
        instance_id: Option<&str>,
        command: &str,
        params: serde_json::Value,
    ) -> Response {
        self.request_with_timeout(id, instance_id, command, params, None)
            .await
    }

    pub async fn request_with_timeout(
        &mut self,
        id: &str,
        instance_id: Option<&str>,
        command: &str,
        params: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Response {
        self.send(Message::Request(Request {
            id: id.to_owned(),
            instance_id: instance_id.map(str::to_owned),
            command: command.to_owned(),
            params,
            timeout_ms,
            ts: now_ms(),
        }))
        .await;
        self.expect_response(id).await
    }

    /// Wait for the RESPONSE carrying `id`, skipping unrelated frames.
    pub async fn expect_response(&mut self, id: &str) -> Response {
        loop {
            match self.recv().await {
                Some(Message::Response(response)) if response.id == id => return response,
                Some(Message::Response(_)) => {}
                Some(other) => panic!("expected RESPONSE {id}, got {other:?}"),
                None => panic!("relay closed the connection while waiting for {id}"),
            }
        }
    }

    pub async fn list_instances(&mut self) -> Vec<InstanceInfo> {
        self.send(Message::ListInstances(ListInstances {})).await;
        match self.recv().await {
            Some(Message::Instances(snapshot)) => snapshot.instances,
            other => panic!("expected INSTANCES, got {other:?}"),
        }
    }

    pub async fn set_default(&mut self, instance_id: &str) {
        self.send(Message::SetDefault(SetDefault {
            instance_id: instance_id.to_owned(),
        }))
        .await;
        match self.recv().await {
            Some(Message::Ack(ack)) => assert_eq!(ack.instance_id, instance_id),
            other => panic!("expected ACK, got {other:?}"),
        }
    }
}
