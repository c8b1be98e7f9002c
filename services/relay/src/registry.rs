//! Instance registry and request routing.
//!
//! Owns every editor instance record: connection lane, state machine
//! (READY / BUSY / RELOADING / DISCONNECTED), the single in-flight request,
//! the FIFO overflow queue and liveness bookkeeping.  All mutation happens
//! under one mutex; outbound frames are sent through the per-connection
//! channel after the guard is dropped, never while holding it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use relay_protocol::{
    Command, CommandResult, InstanceInfo, InstanceStatus, Message, Register, Response, error_codes,
    now_ms,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::IdempotencyCache;
use crate::config::RelayConfig;

/// Completion slot: created by the client-facing path, fired exactly once by
/// the registry with the terminal RESPONSE for that request.
pub type ReplySlot = oneshot::Sender<Response>;

/// A client request travelling through the relay.
pub struct PendingRequest {
    pub id: String,
    pub command: String,
    pub params: serde_json::Value,
    pub timeout_ms: Option<u64>,
    /// Absolute deadline; queued requests past it are dropped, not forwarded.
    pub deadline: Instant,
    pub reply: ReplySlot,
}

impl PendingRequest {
    fn fail(self, code: &str, message: impl Into<String>) {
        let _ = self.reply.send(Response::error(&self.id, code, message));
    }

    fn to_command(&self) -> Message {
        Message::Command(Command {
            id: self.id.clone(),
            command: self.command.clone(),
            params: self.params.clone(),
            timeout_ms: self.timeout_ms,
        })
    }
}

/// Handle to one editor connection's outbound lane.
///
/// `conn_id` distinguishes a displaced connection from its replacement so
/// stale liveness or grace events cannot touch a newer connection.
#[derive(Clone)]
pub struct EditorConnection {
    pub conn_id: u64,
    pub outbound: mpsc::Sender<Message>,
    pub shutdown: watch::Sender<bool>,
}

/// What `register` asks the editor session to do next.
pub struct RegisterOutcome {
    pub heartbeat_interval_ms: u64,
    /// COMMAND to write right after REGISTERED: the re-forwarded in-flight
    /// request of a reload, or the next queued request.
    pub resume: Option<Message>,
}

/// Verdict of one liveness tick for an editor connection.
#[derive(Debug)]
pub enum ProbeVerdict {
    /// Send a PING carrying this timestamp.
    Ping { ts: u64 },
    /// Instance is RELOADING; probing is suspended in favour of the grace
    /// timer.
    Suspended,
    /// Probe-loss limit reached; the instance has been marked lost and the
    /// session should close.
    Lost,
    /// The connection was displaced or removed; the session should close.
    Stale,
}

struct InstanceMeta {
    project_name: String,
    unity_version: String,
    capabilities: Vec<String>,
}

struct Liveness {
    outstanding_probe: Option<u64>,
    missed: u32,
    last_pong_ms: u64,
}

struct InstanceEntry {
    meta: InstanceMeta,
    status: InstanceStatus,
    conn: EditorConnection,
    in_flight: Option<PendingRequest>,
    queue: VecDeque<PendingRequest>,
    liveness: Liveness,
    reg_seq: u64,
    /// Bumped on every (re-)register and reload; stale grace timers carry an
    /// older value and become no-ops.
    reload_epoch: u64,
}

impl InstanceEntry {
    fn info(&self, id: &str) -> InstanceInfo {
        InstanceInfo {
            id: id.to_owned(),
            project_name: self.meta.project_name.clone(),
            version: self.meta.unity_version.clone(),
            status: self.status,
            capabilities: self.meta.capabilities.clone(),
        }
    }

    /// Fail the in-flight request and everything queued with `code`.
    fn fail_all(&mut self, code: &str, message: &str) {
        if let Some(req) = self.in_flight.take() {
            req.fail(code, message.to_owned());
        }
        for req in self.queue.drain(..) {
            req.fail(code, message.to_owned());
        }
    }

    /// Pop queued requests until one is still worth forwarding.
    ///
    /// Dead entries (deadline passed, client gone) are dropped.  A queued
    /// retry whose identifier completed meanwhile is answered from the cache
    /// here, so one identifier never reaches the editor twice through the
    /// queue.
    fn next_live(&mut self, cache: &IdempotencyCache) -> Option<PendingRequest> {
        let now = Instant::now();
        while let Some(req) = self.queue.pop_front() {
            if req.deadline <= now || req.reply.is_closed() {
                debug!(id = %req.id, "dropping dead queued request");
                continue;
            }
            if let Some(data) = cache.get(&req.id) {
                debug!(id = %req.id, "queued request answered from cache");
                let _ = req.reply.send(Response::success(&req.id, data));
                continue;
            }
            return Some(req);
        }
        None
    }
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, InstanceEntry>,
    /// Last explicitly SET_DEFAULT identifier; resolution falls back to
    /// registration order while it is absent.
    default_id: Option<String>,
    next_reg_seq: u64,
}

/// The relay-wide instance registry.  One per [`crate::server::Relay`]; no
/// process-global state.
pub struct Registry {
    inner: Mutex<Inner>,
    cache: IdempotencyCache,
    config: RelayConfig,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            cache: IdempotencyCache::new(config.cache_ttl),
            inner: Mutex::new(Inner::default()),
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Atomically install or replace the record for `reg.instance_id`.
    ///
    /// A replacement over a RELOADING entry is the reload-resume path: the
    /// queue carries over and a live in-flight request is re-forwarded on the
    /// new connection.  A replacement over a live connection is a hard
    /// displacement: the old connection is told to shut down and its pending
    /// work fails with `INSTANCE_DISCONNECTED`.
    pub fn register(&self, reg: &Register, conn: EditorConnection) -> RegisterOutcome {
        let mut inner = self.inner.lock().unwrap();
        let meta = InstanceMeta {
            project_name: reg.project_name.clone(),
            unity_version: reg.unity_version.clone(),
            capabilities: reg.capabilities.clone(),
        };
        let heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64;

        let resume = match inner.instances.remove(&reg.instance_id) {
            Some(mut old) => {
                let _ = old.conn.shutdown.send(true);
                let resuming = old.status == InstanceStatus::Reloading;
                if !resuming {
                    info!(instance_id = %reg.instance_id, "displacing live connection");
                    old.fail_all(
                        error_codes::INSTANCE_DISCONNECTED,
                        "instance connection displaced by a new registration",
                    );
                }

                let mut entry = InstanceEntry {
                    meta,
                    status: InstanceStatus::Ready,
                    conn,
                    in_flight: None,
                    queue: std::mem::take(&mut old.queue),
                    liveness: Liveness {
                        outstanding_probe: None,
                        missed: 0,
                        last_pong_ms: now_ms(),
                    },
                    reg_seq: old.reg_seq,
                    reload_epoch: old.reload_epoch + 1,
                };

                let resume = if resuming {
                    match old.in_flight.take() {
                        Some(req) if req.deadline > Instant::now() && !req.reply.is_closed() => {
                            info!(instance_id = %reg.instance_id, id = %req.id, "re-forwarding in-flight request after reload");
                            Some(req)
                        }
                        Some(req) => {
                            debug!(instance_id = %reg.instance_id, id = %req.id, "dropping expired in-flight request after reload");
                            drop(req);
                            entry.next_live(&self.cache)
                        }
                        None => entry.next_live(&self.cache),
                    }
                } else {
                    None
                };
                let resume = resume.map(|req| {
                    let cmd = req.to_command();
                    entry.status = InstanceStatus::Busy;
                    entry.in_flight = Some(req);
                    cmd
                });
                inner.instances.insert(reg.instance_id.clone(), entry);
                resume
            }
            None => {
                let reg_seq = inner.next_reg_seq;
                inner.next_reg_seq += 1;
                inner.instances.insert(
                    reg.instance_id.clone(),
                    InstanceEntry {
                        meta,
                        status: InstanceStatus::Ready,
                        conn,
                        in_flight: None,
                        queue: VecDeque::new(),
                        liveness: Liveness {
                            outstanding_probe: None,
                            missed: 0,
                            last_pong_ms: now_ms(),
                        },
                        reg_seq,
                        reload_epoch: 0,
                    },
                );
                None
            }
        };

        info!(
            instance_id = %reg.instance_id,
            project = %reg.project_name,
            version = %reg.unity_version,
            "instance registered"
        );
        RegisterOutcome {
            heartbeat_interval_ms,
            resume,
        }
    }

    /// Route one client request.
    ///
    /// Returns `Some` when the request is answered immediately (cache hit or
    /// routing error); `None` when it was forwarded or queued, in which case
    /// the terminal RESPONSE arrives through the reply slot.
    pub async fn dispatch(&self, target: Option<&str>, req: PendingRequest) -> Option<Response> {
        enum Verdict {
            Immediate(Response),
            Forward {
                instance_id: String,
                tx: mpsc::Sender<Message>,
                cmd: Message,
            },
            Queued,
        }

        let verdict = {
            let mut inner = self.inner.lock().unwrap();
            let instance_id = match target {
                Some(id) => inner.instances.contains_key(id).then(|| id.to_owned()),
                None => Self::resolve_default(&inner),
            };
            let Some(instance_id) = instance_id else {
                return Some(Response::error(
                    &req.id,
                    error_codes::INSTANCE_NOT_FOUND,
                    match target {
                        Some(id) => format!("no instance registered as {id}"),
                        None => "no instances registered".to_owned(),
                    },
                ));
            };

            // Resolution first, then the idempotency window: a repeated
            // identifier is answered from cache without re-forwarding.
            if let Some(data) = self.cache.get(&req.id) {
                debug!(id = %req.id, "idempotency cache hit");
                return Some(Response::success(&req.id, data));
            }

            let entry = inner.instances.get_mut(&instance_id).unwrap();

            match entry.status {
                InstanceStatus::Ready => {
                    let cmd = req.to_command();
                    entry.status = InstanceStatus::Busy;
                    entry.in_flight = Some(req);
                    Verdict::Forward {
                        instance_id,
                        tx: entry.conn.outbound.clone(),
                        cmd,
                    }
                }
                InstanceStatus::Busy => {
                    if self.config.queue_capacity == 0 {
                        Verdict::Immediate(Response::error(
                            &req.id,
                            error_codes::INSTANCE_BUSY,
                            format!("instance {instance_id} has a command in flight"),
                        ))
                    } else if entry.queue.len() >= self.config.queue_capacity {
                        Verdict::Immediate(Response::error(
                            &req.id,
                            error_codes::QUEUE_FULL,
                            format!(
                                "instance {instance_id} queue is at capacity {}",
                                self.config.queue_capacity
                            ),
                        ))
                    } else {
                        entry.queue.push_back(req);
                        Verdict::Queued
                    }
                }
                InstanceStatus::Reloading => Verdict::Immediate(Response::error(
                    &req.id,
                    error_codes::INSTANCE_RELOADING,
                    format!("instance {instance_id} is reloading"),
                )),
                InstanceStatus::Disconnected => Verdict::Immediate(Response::error(
                    &req.id,
                    error_codes::INSTANCE_DISCONNECTED,
                    format!("instance {instance_id} is disconnected"),
                )),
            }
        };

        match verdict {
            Verdict::Immediate(resp) => Some(resp),
            Verdict::Queued => None,
            Verdict::Forward {
                instance_id,
                tx,
                cmd,
            } => {
                let id = match &cmd {
                    Message::Command(c) => c.id.clone(),
                    _ => unreachable!(),
                };
                debug!(instance_id = %instance_id, id = %id, "forwarding command");
                if tx.send(cmd).await.is_err() {
                    self.fail_in_flight(&instance_id, &id);
                }
                None
            }
        }
    }

    /// The forward lane died under us; fail the request we just installed.
    fn fail_in_flight(&self, instance_id: &str, request_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.instances.get_mut(instance_id)
            && entry
                .in_flight
                .as_ref()
                .is_some_and(|req| req.id == request_id)
        {
            let req = entry.in_flight.take().unwrap();
            req.fail(
                error_codes::INSTANCE_DISCONNECTED,
                "instance connection closed before the command was sent",
            );
        }
    }

    /// Apply a COMMAND_RESULT from an editor connection.
    ///
    /// A result matching the outstanding request completes it (and, on
    /// success, enters the idempotency cache).  A result arriving after the
    /// client's deadline finds a dead reply slot: it is not delivered, but a
    /// late success is still cached so a retry of the same identifier cannot
    /// execute twice.  Anything else is logged and discarded.
    pub async fn complete(&self, instance_id: &str, conn_id: u64, result: CommandResult) {
        let forward = {
            let mut inner = self.inner.lock().unwrap();
            let Some(entry) = inner.instances.get_mut(instance_id) else {
                warn!(instance_id, id = %result.id, "result for unknown instance discarded");
                return;
            };
            if entry.conn.conn_id != conn_id {
                warn!(instance_id, id = %result.id, "result from displaced connection discarded");
                return;
            }
            if !entry
                .in_flight
                .as_ref()
                .is_some_and(|req| req.id == result.id)
            {
                warn!(instance_id, id = %result.id, "result with no matching in-flight discarded");
                return;
            }

            let req = entry.in_flight.take().unwrap();
            entry.status = InstanceStatus::Ready;

            if result.success {
                self.cache.insert(&result.id, result.data.clone());
            }
            let resp = if result.success {
                Response::success(&result.id, result.data)
            } else {
                let err = result.error.unwrap_or_else(|| {
                    relay_protocol::ErrorBody::new(
                        error_codes::INTERNAL_ERROR,
                        "editor reported failure without an error body",
                    )
                });
                Response::error(&result.id, &err.code, err.message)
            };
            if req.reply.send(resp).is_err() {
                debug!(instance_id, id = %result.id, "late result discarded (client deadline passed)");
            }

            entry.next_live(&self.cache).map(|next| {
                let cmd = next.to_command();
                entry.status = InstanceStatus::Busy;
                entry.in_flight = Some(next);
                (entry.conn.outbound.clone(), cmd)
            })
        };

        if let Some((tx, cmd)) = forward {
            let id = match &cmd {
                Message::Command(c) => c.id.clone(),
                _ => unreachable!(),
            };
            debug!(instance_id, id = %id, "draining queued command");
            if tx.send(cmd).await.is_err() {
                self.fail_in_flight(instance_id, &id);
            }
        }
    }

    /// Apply an editor-reported status change.
    ///
    /// Only `reloading` transitions state: in-flight work is held (not
    /// failed), probing is suspended, and the grace timer is armed.  Other
    /// reports are informational.
    pub fn notify_status(
        self: &std::sync::Arc<Self>,
        instance_id: &str,
        conn_id: u64,
        status: InstanceStatus,
        detail: Option<&str>,
    ) {
        if status != InstanceStatus::Reloading {
            debug!(instance_id, %status, detail, "status report ignored");
            return;
        }
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            let Some(entry) = inner.instances.get_mut(instance_id) else {
                return;
            };
            if entry.conn.conn_id != conn_id {
                return;
            }
            entry.status = InstanceStatus::Reloading;
            entry.liveness.outstanding_probe = None;
            entry.liveness.missed = 0;
            entry.reload_epoch += 1;
            entry.reload_epoch
        };
        info!(instance_id, detail, "instance reloading, grace timer armed");

        let registry = self.clone();
        let instance_id = instance_id.to_owned();
        let grace = self.config.reload_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.grace_expired(&instance_id, epoch);
        });
    }

    /// The reload grace elapsed without a re-register.
    fn grace_expired(&self, instance_id: &str, epoch: u64) {
        let mut inner = self.inner.lock().unwrap();
        let expired = inner.instances.get(instance_id).is_some_and(|entry| {
            entry.status == InstanceStatus::Reloading && entry.reload_epoch == epoch
        });
        if !expired {
            return;
        }
        let mut entry = inner.instances.remove(instance_id).unwrap();
        entry.status = InstanceStatus::Disconnected;
        entry.fail_all(
            error_codes::INSTANCE_DISCONNECTED,
            "instance did not return from reload within the grace period",
        );
        info!(instance_id, "reload grace expired, instance disconnected");
    }

    /// The connection closed or the liveness monitor gave up on it.
    ///
    /// A RELOADING entry is left for the grace timer; anything else is
    /// removed and its pending work failed.
    pub fn mark_lost(&self, instance_id: &str, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.instances.get(instance_id) else {
            return;
        };
        if entry.conn.conn_id != conn_id || entry.status == InstanceStatus::Reloading {
            return;
        }
        let mut entry = inner.instances.remove(instance_id).unwrap();
        entry.status = InstanceStatus::Disconnected;
        entry.fail_all(
            error_codes::INSTANCE_DISCONNECTED,
            "instance connection lost",
        );
        info!(instance_id, "instance disconnected");
    }

    /// One heartbeat tick for an editor connection.
    ///
    /// At most one probe is outstanding per connection: an unanswered probe
    /// is declared lost before the next one is issued, and
    /// `probe_loss_limit` consecutive losses mark the instance lost.
    pub fn liveness_tick(&self, instance_id: &str, conn_id: u64) -> ProbeVerdict {
        let mut inner = self.inner.lock().unwrap();
        let lost = {
            let Some(entry) = inner.instances.get_mut(instance_id) else {
                return ProbeVerdict::Stale;
            };
            if entry.conn.conn_id != conn_id {
                return ProbeVerdict::Stale;
            }
            if entry.status == InstanceStatus::Reloading {
                return ProbeVerdict::Suspended;
            }
            if entry.liveness.outstanding_probe.is_some() {
                entry.liveness.missed += 1;
                warn!(instance_id, missed = entry.liveness.missed, "liveness probe lost");
                entry.liveness.missed >= self.config.probe_loss_limit
            } else {
                false
            }
        };
        if lost {
            let mut entry = inner.instances.remove(instance_id).unwrap();
            entry.status = InstanceStatus::Disconnected;
            entry.fail_all(
                error_codes::INSTANCE_DISCONNECTED,
                "instance stopped answering liveness probes",
            );
            info!(instance_id, "instance lost after missed probes");
            return ProbeVerdict::Lost;
        }
        let ts = now_ms();
        let entry = inner.instances.get_mut(instance_id).unwrap();
        entry.liveness.outstanding_probe = Some(ts);
        ProbeVerdict::Ping { ts }
    }

    /// Record a PONG, clearing the outstanding probe.
    pub fn record_pong(&self, instance_id: &str, conn_id: u64, echo_ts: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.instances.get_mut(instance_id)
            && entry.conn.conn_id == conn_id
        {
            if entry.liveness.outstanding_probe != Some(echo_ts) {
                debug!(instance_id, echo_ts, "pong for a probe already declared lost");
            }
            entry.liveness.outstanding_probe = None;
            entry.liveness.missed = 0;
            entry.liveness.last_pong_ms = now_ms();
        }
    }

    /// Update the default instance identifier.  The identifier need not be
    /// registered yet; resolution falls back to registration order until it
    /// is.
    pub fn set_default(&self, instance_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.default_id = Some(instance_id.to_owned());
        info!(instance_id, "default instance set");
    }

    /// Point-in-time snapshot in registration order.
    pub fn list(&self) -> Vec<InstanceInfo> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<_> = inner.instances.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.reg_seq);
        entries.into_iter().map(|(id, entry)| entry.info(id)).collect()
    }

    fn resolve_default(inner: &Inner) -> Option<String> {
        if let Some(id) = &inner.default_id
            && inner.instances.contains_key(id)
        {
            return Some(id.clone());
        }
        inner
            .instances
            .iter()
            .min_by_key(|(_, entry)| entry.reg_seq)
            .map(|(id, _)| id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config() -> RelayConfig {
        RelayConfig {
            reload_grace: Duration::from_millis(100),
            ..RelayConfig::for_tests()
        }
    }

    fn registry_with(config: RelayConfig) -> Arc<Registry> {
        Arc::new(Registry::new(config))
    }

    struct TestEditor {
        conn: EditorConnection,
        rx: mpsc::Receiver<Message>,
        _shutdown_rx: watch::Receiver<bool>,
    }

    fn editor_conn(registry: &Registry) -> TestEditor {
        let (outbound, rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        TestEditor {
            conn: EditorConnection {
                conn_id: registry.next_conn_id(),
                outbound,
                shutdown,
            },
            rx,
            _shutdown_rx: shutdown_rx,
        }
    }

    fn register_msg(id: &str) -> Register {
        Register {
            protocol_version: relay_protocol::PROTOCOL_VERSION,
            instance_id: id.to_owned(),
            project_name: "Proj".to_owned(),
            unity_version: "2022.3".to_owned(),
            capabilities: vec![],
            ts: now_ms(),
        }
    }

    fn pending(id: &str) -> (PendingRequest, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                id: id.to_owned(),
                command: "echo".to_owned(),
                params: json!({ "v": 1 }),
                timeout_ms: None,
                deadline: Instant::now() + Duration::from_secs(5),
                reply: tx,
            },
            rx,
        )
    }

    fn result_ok(id: &str, data: serde_json::Value) -> CommandResult {
        CommandResult {
            id: id.to_owned(),
            success: true,
            data: Some(data),
            error: None,
            ts: now_ms(),
        }
    }

    #[tokio::test]
    async fn dispatch_forwards_to_ready_instance_and_completes() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        assert!(registry.dispatch(None, req).await.is_none());

        match editor.rx.recv().await.unwrap() {
            Message::Command(cmd) => {
                assert_eq!(cmd.id, "c1:r1");
                assert_eq!(cmd.command, "echo");
            }
            other => panic!("expected Command, got {other:?}"),
        }

        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r1", json!({ "v": 1 })))
            .await;
        let resp = rx.await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.data, Some(json!({ "v": 1 })));
    }

    #[tokio::test]
    async fn second_dispatch_hits_cache_without_new_command() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();
        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r1", json!(7)))
            .await;
        rx.await.unwrap();

        let (req, _rx) = pending("c1:r1");
        let resp = registry.dispatch(None, req).await.expect("cache hit");
        assert!(resp.success);
        assert_eq!(resp.data, Some(json!(7)));
        assert!(
            editor.rx.try_recv().is_err(),
            "cached replay must not reach the editor"
        );
    }

    #[tokio::test]
    async fn error_results_are_not_cached() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();
        registry
            .complete(
                "/p/A",
                editor.conn.conn_id,
                CommandResult {
                    id: "c1:r1".to_owned(),
                    success: false,
                    data: None,
                    error: Some(relay_protocol::ErrorBody::new(
                        error_codes::INTERNAL_ERROR,
                        "boom",
                    )),
                    ts: now_ms(),
                },
            )
            .await;
        let resp = rx.await.unwrap();
        assert!(!resp.success);

        // Same identifier is forwarded again, not replayed from cache.
        let (req, _rx) = pending("c1:r1");
        assert!(registry.dispatch(None, req).await.is_none());
        assert!(matches!(
            editor.rx.recv().await.unwrap(),
            Message::Command(_)
        ));
    }

    #[tokio::test]
    async fn busy_instance_rejects_when_queue_disabled() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, _rx1) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        let (req, _rx2) = pending("c1:r2");
        let resp = registry.dispatch(None, req).await.expect("immediate reply");
        assert_eq!(resp.error.unwrap().code, error_codes::INSTANCE_BUSY);
    }

    #[tokio::test]
    async fn queue_bound_is_enforced() {
        let config = RelayConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let registry = registry_with(config);
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, _rx0) = pending("c1:r0");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        let (req, _rx1) = pending("c1:r1");
        assert!(registry.dispatch(None, req).await.is_none(), "enqueued");
        let (req, _rx2) = pending("c1:r2");
        assert!(registry.dispatch(None, req).await.is_none(), "enqueued");
        let (req, _rx3) = pending("c1:r3");
        let resp = registry.dispatch(None, req).await.expect("queue full");
        assert_eq!(resp.error.unwrap().code, error_codes::QUEUE_FULL);
    }

    #[tokio::test]
    async fn completion_drains_one_queued_request() {
        let config = RelayConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let registry = registry_with(config);
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx0) = pending("c1:r0");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();
        let (req, _rx1) = pending("c1:r1");
        registry.dispatch(None, req).await;

        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r0", json!(0)))
            .await;
        assert!(rx0.await.unwrap().success);
        match editor.rx.recv().await.unwrap() {
            Message::Command(cmd) => assert_eq!(cmd.id, "c1:r1"),
            other => panic!("expected drained Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_with_no_instances_is_not_found() {
        let registry = registry_with(test_config());
        let (req, _rx) = pending("c1:r1");
        let resp = registry.dispatch(None, req).await.unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::INSTANCE_NOT_FOUND);
    }

    #[tokio::test]
    async fn default_instance_is_earliest_registered_until_set() {
        let registry = registry_with(test_config());
        let mut editor_a = editor_conn(&registry);
        let mut editor_b = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor_a.conn.clone());
        registry.register(&register_msg("/p/B"), editor_b.conn.clone());

        let (req, _rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        assert!(editor_a.rx.try_recv().is_ok(), "earliest registered wins");

        registry.set_default("/p/B");
        let (req, _rx) = pending("c1:r2");
        registry.dispatch(None, req).await;
        assert!(editor_b.rx.try_recv().is_ok(), "explicit default wins");
    }

    #[tokio::test]
    async fn displacement_fails_old_in_flight() {
        let registry = registry_with(test_config());
        let mut old = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), old.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        old.rx.recv().await.unwrap();

        let new = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), new.conn.clone());

        let resp = rx.await.unwrap();
        assert_eq!(
            resp.error.unwrap().code,
            error_codes::INSTANCE_DISCONNECTED
        );
        assert!(*old._shutdown_rx.borrow(), "old connection told to close");
    }

    #[tokio::test]
    async fn reload_holds_in_flight_and_resumes_on_reregister() {
        let registry = registry_with(test_config());
        let mut old = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), old.conn.clone());

        let (req, rx) = pending("c1:r2");
        registry.dispatch(None, req).await;
        old.rx.recv().await.unwrap();

        registry.notify_status("/p/A", old.conn.conn_id, InstanceStatus::Reloading, None);
        // In-flight is held, not failed; new dispatches are told to retry.
        let (req, _rx) = pending("c1:r3");
        let resp = registry.dispatch(None, req).await.unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::INSTANCE_RELOADING);

        let new = editor_conn(&registry);
        let outcome = registry.register(&register_msg("/p/A"), new.conn.clone());
        match outcome.resume {
            Some(Message::Command(cmd)) => assert_eq!(cmd.id, "c1:r2"),
            other => panic!("expected resume Command, got {other:?}"),
        }

        registry
            .complete("/p/A", new.conn.conn_id, result_ok("c1:r2", json!(2)))
            .await;
        assert!(rx.await.unwrap().success);
    }

    #[tokio::test]
    async fn grace_expiry_fails_held_request_and_removes_instance() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        registry.notify_status("/p/A", editor.conn.conn_id, InstanceStatus::Reloading, None);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let resp = rx.await.unwrap();
        assert_eq!(
            resp.error.unwrap().code,
            error_codes::INSTANCE_DISCONNECTED
        );
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn reregister_within_grace_defuses_the_timer() {
        let registry = registry_with(test_config());
        let editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());
        registry.notify_status("/p/A", editor.conn.conn_id, InstanceStatus::Reloading, None);

        let new = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), new.conn.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = registry.list();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, InstanceStatus::Ready);
    }

    #[tokio::test]
    async fn mark_lost_fails_pending_and_removes_instance() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        registry.mark_lost("/p/A", editor.conn.conn_id);
        let resp = rx.await.unwrap();
        assert_eq!(
            resp.error.unwrap().code,
            error_codes::INSTANCE_DISCONNECTED
        );
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn liveness_gives_up_after_loss_limit() {
        let registry = registry_with(test_config());
        let editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());
        let conn_id = editor.conn.conn_id;

        assert!(matches!(
            registry.liveness_tick("/p/A", conn_id),
            ProbeVerdict::Ping { .. }
        ));
        // Unanswered: each following tick declares a loss and re-probes.
        assert!(matches!(
            registry.liveness_tick("/p/A", conn_id),
            ProbeVerdict::Ping { .. }
        ));
        assert!(matches!(
            registry.liveness_tick("/p/A", conn_id),
            ProbeVerdict::Ping { .. }
        ));
        assert!(matches!(
            registry.liveness_tick("/p/A", conn_id),
            ProbeVerdict::Lost
        ));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn pong_resets_the_loss_counter() {
        let registry = registry_with(test_config());
        let editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());
        let conn_id = editor.conn.conn_id;

        for _ in 0..10 {
            let ts = match registry.liveness_tick("/p/A", conn_id) {
                ProbeVerdict::Ping { ts } => ts,
                other => panic!("expected Ping, got {other:?}"),
            };
            registry.record_pong("/p/A", conn_id, ts);
        }
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn late_success_after_client_timeout_is_cached() {
        let registry = registry_with(test_config());
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();
        drop(rx); // client deadline passed

        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r1", json!(9)))
            .await;

        // Retry of the same identifier short-circuits instead of executing twice.
        let (req, _rx) = pending("c1:r1");
        let resp = registry.dispatch(None, req).await.expect("cache hit");
        assert!(resp.success);
        assert_eq!(resp.data, Some(json!(9)));
        assert!(editor.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_queued_requests_are_skipped_on_drain() {
        let config = RelayConfig {
            queue_capacity: 4,
            ..test_config()
        };
        let registry = registry_with(config);
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, _rx0) = pending("c1:r0");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        let (req, rx1) = pending("c1:r1");
        registry.dispatch(None, req).await;
        let (req, _rx2) = pending("c1:r2");
        registry.dispatch(None, req).await;
        drop(rx1); // first queued client gave up

        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r0", json!(0)))
            .await;
        match editor.rx.recv().await.unwrap() {
            Message::Command(cmd) => assert_eq!(cmd.id, "c1:r2", "dead entry skipped"),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_duplicate_of_completed_identifier_drains_from_cache() {
        let config = RelayConfig {
            queue_capacity: 4,
            ..test_config()
        };
        let registry = registry_with(config);
        let mut editor = editor_conn(&registry);
        registry.register(&register_msg("/p/A"), editor.conn.clone());

        let (req, rx_first) = pending("c1:r1");
        registry.dispatch(None, req).await;
        editor.rx.recv().await.unwrap();

        // A retry of the same identifier lands while the original is still
        // in flight and gets queued.
        let (req, rx_retry) = pending("c1:r1");
        assert!(registry.dispatch(None, req).await.is_none());

        registry
            .complete("/p/A", editor.conn.conn_id, result_ok("c1:r1", json!(7)))
            .await;

        let first = rx_first.await.unwrap();
        let retry = rx_retry.await.unwrap();
        assert!(first.success && retry.success);
        assert_eq!(retry.data, Some(json!(7)));
        assert!(
            editor.rx.try_recv().is_err(),
            "the drained duplicate must not reach the editor"
        );
    }

    #[tokio::test]
    async fn snapshot_lists_instances_in_registration_order() {
        let registry = registry_with(test_config());
        let b = editor_conn(&registry);
        let a = editor_conn(&registry);
        registry.register(&register_msg("/p/B"), b.conn.clone());
        registry.register(&register_msg("/p/A"), a.conn.clone());

        let ids: Vec<_> = registry.list().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["/p/B".to_owned(), "/p/A".to_owned()]);
    }
}
