//! Client-side connection handler.
//!
//! Reads zero-or-more REQUEST / control frames.  Each REQUEST is dispatched
//! inline (preserving arrival order) and then waited on by its own task, so
//! a slow command never blocks LIST_INSTANCES or further requests on the
//! same connection.  Replies funnel through the single writer lane.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use relay_protocol::{
    Ack, ErrorMessage, FramedReader, FramedWriter, Instances, Message, Request, Response,
    error_codes,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::registry::PendingRequest;
use crate::server::{RelayState, spawn_writer};

pub async fn run_client_session(
    state: RelayState,
    mut reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
    first: Message,
    peer: SocketAddr,
    mut global_shutdown: watch::Receiver<bool>,
) {
    let (outbound, outbound_rx) = mpsc::channel(64);
    let _writer_task = spawn_writer(writer, outbound_rx);
    debug!(%peer, "client session started");

    if !handle_client_frame(&state, &outbound, first).await {
        return;
    }

    loop {
        tokio::select! {
            biased;
            changed = global_shutdown.changed() => {
                if changed.is_err() || *global_shutdown.borrow() { break; }
            }
            frame = reader.read_frame() => {
                match frame {
                    Ok(Some(msg)) => {
                        if !handle_client_frame(&state, &outbound, msg).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%peer, error = %e, "client connection framing error");
                        let _ = outbound
                            .send(Message::Error(ErrorMessage {
                                id: None,
                                code: e.code().to_owned(),
                                message: e.to_string(),
                            }))
                            .await;
                        break;
                    }
                }
            }
        }
    }
    debug!(%peer, "client session ended");
}

/// Handle one client frame.  Returns `false` when the connection must close.
async fn handle_client_frame(
    state: &RelayState,
    outbound: &mpsc::Sender<Message>,
    msg: Message,
) -> bool {
    match msg {
        Message::Request(req) => {
            handle_request(state, outbound, req).await;
            true
        }
        Message::ListInstances(_) => outbound
            .send(Message::Instances(Instances {
                instances: state.registry.list(),
            }))
            .await
            .is_ok(),
        Message::SetDefault(set) => {
            state.registry.set_default(&set.instance_id);
            outbound
                .send(Message::Ack(Ack {
                    instance_id: set.instance_id,
                }))
                .await
                .is_ok()
        }
        other => {
            // Protocol errors are fatal for the offending connection.
            let _ = outbound
                .send(Message::Error(ErrorMessage {
                    id: None,
                    code: error_codes::PROTOCOL_ERROR.to_owned(),
                    message: format!("unexpected frame on a client connection: {other:?}"),
                }))
                .await;
            false
        }
    }
}

/// Dispatch one REQUEST and arrange for its single RESPONSE.
///
/// Dispatch itself runs inline so requests on one connection reach the
/// registry in arrival order; only the wait on the completion slot is
/// spawned, so a slow command never blocks the read loop.  The deadline is
/// enforced here: if the slot stays empty past it, the client gets TIMEOUT
/// while the instance keeps its in-flight record (a late result is
/// discarded by the registry).
async fn handle_request(state: &RelayState, outbound: &mpsc::Sender<Message>, req: Request) {
    let deadline = req
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.config.default_deadline);
    let (reply_tx, reply_rx) = oneshot::channel();
    let pending = PendingRequest {
        id: req.id.clone(),
        command: req.command,
        params: req.params,
        timeout_ms: req.timeout_ms,
        deadline: Instant::now() + deadline,
        reply: reply_tx,
    };

    if let Some(immediate) = state.registry.dispatch(req.instance_id.as_deref(), pending).await {
        let _ = outbound.send(Message::Response(immediate)).await;
        return;
    }

    let outbound = outbound.clone();
    let id = req.id;
    tokio::spawn(async move {
        let response = match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::error(
                &id,
                error_codes::INTERNAL_ERROR,
                "relay dropped the completion slot",
            ),
            Err(_) => {
                debug!(id = %id, "request deadline reached");
                Response::error(
                    &id,
                    error_codes::TIMEOUT,
                    format!("no reply within {} ms", deadline.as_millis()),
                )
            }
        };
        let _ = outbound.send(Message::Response(response)).await;
    });
}
