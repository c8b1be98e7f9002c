//! Editor-side connection handler.
//!
//! Runs after the first frame of a connection turned out to be REGISTER.
//! Validates the handshake, installs the instance, then drives two
//! concurrent activities: the inbound reader (COMMAND_RESULT, STATUS, PONG)
//! and the liveness probe schedule.  All outbound frames go through the
//! per-connection writer lane; this task never touches the socket's write
//! half directly.

use std::net::SocketAddr;

use relay_protocol::{
    ErrorBody, ErrorMessage, FrameError, FramedReader, FramedWriter, Message, PROTOCOL_VERSION,
    Ping, Register, Registered, error_codes,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::registry::{EditorConnection, ProbeVerdict};
use crate::server::{RelayState, spawn_writer};

pub async fn run_editor_session(
    state: RelayState,
    mut reader: FramedReader<OwnedReadHalf>,
    mut writer: FramedWriter<OwnedWriteHalf>,
    reg: Register,
    peer: SocketAddr,
    mut global_shutdown: watch::Receiver<bool>,
) {
    if let Some(rejection) = validate_register(&reg) {
        warn!(%peer, code = %rejection.code, "rejecting registration");
        let _ = writer
            .write_frame(&Message::Registered(Registered {
                success: false,
                heartbeat_interval_ms: 0,
                error: Some(rejection),
            }))
            .await;
        return;
    }

    let instance_id = reg.instance_id.clone();
    let (outbound, outbound_rx) = mpsc::channel(64);
    let (shutdown_tx, mut displaced_rx) = watch::channel(false);
    let conn_id = state.registry.next_conn_id();
    let _writer_task = spawn_writer(writer, outbound_rx);

    // REGISTERED is enqueued before the registry can route any COMMAND onto
    // this lane, so the editor always sees it first.
    let heartbeat_interval_ms = state.config.heartbeat_interval.as_millis() as u64;
    if outbound
        .send(Message::Registered(Registered {
            success: true,
            heartbeat_interval_ms,
            error: None,
        }))
        .await
        .is_err()
    {
        return;
    }

    let outcome = state.registry.register(
        &reg,
        EditorConnection {
            conn_id,
            outbound: outbound.clone(),
            shutdown: shutdown_tx,
        },
    );
    info!(instance_id = %instance_id, %peer, "editor session started");
    if let Some(resume) = outcome.resume
        && outbound.send(resume).await.is_err()
    {
        state.registry.mark_lost(&instance_id, conn_id);
        return;
    }

    // Dedicated inbound reader: `read_frame` is not cancellation-safe, so it
    // never races the probe timer in a select.  Frames funnel through a
    // channel the main loop can await safely.
    let (inbound_tx, mut inbound) = mpsc::channel::<Result<Option<Message>, FrameError>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = reader.read_frame().await;
            let terminal = !matches!(frame, Ok(Some(_)));
            if inbound_tx.send(frame).await.is_err() || terminal {
                break;
            }
        }
    });

    let mut probes = tokio::time::interval(state.config.heartbeat_interval);
    probes.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = global_shutdown.changed() => {
                if changed.is_err() || *global_shutdown.borrow() { break; }
            }
            changed = displaced_rx.changed() => {
                if changed.is_err() {
                    // Registry entry is gone (reload grace expired); fall
                    // through to the cleanup path.
                    break;
                }
                if *displaced_rx.borrow() {
                    debug!(instance_id = %instance_id, "connection displaced");
                    reader_task.abort();
                    return; // the replacement owns the record now
                }
            }
            _ = probes.tick() => {
                match state.registry.liveness_tick(&instance_id, conn_id) {
                    ProbeVerdict::Ping { ts } => {
                        if outbound.send(Message::Ping(Ping { ts })).await.is_err() {
                            break;
                        }
                    }
                    ProbeVerdict::Suspended => {}
                    ProbeVerdict::Lost | ProbeVerdict::Stale => {
                        reader_task.abort();
                        return;
                    }
                }
            }
            frame = inbound.recv() => {
                match frame {
                    Some(Ok(Some(Message::CommandResult(result)))) => {
                        state.registry.complete(&instance_id, conn_id, result).await;
                    }
                    Some(Ok(Some(Message::Status(status)))) => {
                        if status.instance_id != instance_id {
                            warn!(
                                instance_id = %instance_id,
                                reported = %status.instance_id,
                                "status frame for a different instance ignored"
                            );
                            continue;
                        }
                        state.registry.notify_status(
                            &instance_id,
                            conn_id,
                            status.status,
                            status.detail.as_deref(),
                        );
                    }
                    Some(Ok(Some(Message::Pong(pong)))) => {
                        state.registry.record_pong(&instance_id, conn_id, pong.echo_ts);
                    }
                    Some(Ok(Some(other))) => {
                        warn!(instance_id = %instance_id, frame = frame_name(&other), "unexpected frame from editor ignored");
                    }
                    Some(Ok(None)) | None => break,
                    Some(Err(e)) => {
                        warn!(instance_id = %instance_id, error = %e, "editor connection framing error");
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

    reader_task.abort();
    state.registry.mark_lost(&instance_id, conn_id);
    debug!(instance_id = %instance_id, "editor session ended");
}

fn validate_register(reg: &Register) -> Option<ErrorBody> {
    if reg.protocol_version != PROTOCOL_VERSION {
        return Some(ErrorBody::new(
            error_codes::PROTOCOL_VERSION_MISMATCH,
            format!(
                "relay speaks protocol {PROTOCOL_VERSION}, editor sent {}",
                reg.protocol_version
            ),
        ));
    }
    if reg.instance_id.is_empty() {
        return Some(ErrorBody::new(
            error_codes::PROTOCOL_ERROR,
            "instance_id must not be empty",
        ));
    }
    None
}

fn frame_name(msg: &Message) -> &'static str {
    match msg {
        Message::Register(_) => "register",
        Message::Registered(_) => "registered",
        Message::Status(_) => "status",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Request(_) => "request",
        Message::Command(_) => "command",
        Message::CommandResult(_) => "command_result",
        Message::Response(_) => "response",
        Message::ListInstances(_) => "list_instances",
        Message::Instances(_) => "instances",
        Message::SetDefault(_) => "set_default",
        Message::Ack(_) => "ack",
        Message::Error(_) => "error",
    }
}
