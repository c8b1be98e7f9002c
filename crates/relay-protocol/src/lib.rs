// relay-protocol: Editor relay wire protocol types and framing.
//
// All frames carry a top-level `type` field for discriminated
// deserialization.  The enum variants map 1:1 to the frozen v1 message types.

use serde::{Deserialize, Serialize};

pub mod framing;

pub use framing::{FrameError, FramedReader, FramedWriter, MAX_FRAME_LEN};

/// Protocol version spoken by both sides of the relay.
///
/// A REGISTER carrying any other version is rejected with
/// `PROTOCOL_VERSION_MISMATCH`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port of the relay endpoint.
pub const DEFAULT_PORT: u16 = 6500;

/// Current wall-clock time as Unix milliseconds, as carried in `ts` fields.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Lifecycle state of an editor instance as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Ready,
    Busy,
    Reloading,
    Disconnected,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Ready => "ready",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Reloading => "reloading",
            InstanceStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Structured error payload embedded in REGISTERED, COMMAND_RESULT and
/// RESPONSE frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of the frozen v1 [`error_codes`].
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One entry in an INSTANCES snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Stable instance identifier (the absolute project path).
    pub id: String,
    pub project_name: String,
    pub version: String,
    pub status: InstanceStatus,
    pub capabilities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Editor -> Relay messages
// ---------------------------------------------------------------------------

/// Editor registration handshake, the first frame of every editor connection.
///
/// A REGISTER for an identifier that is already connected displaces the prior
/// connection.  An editor re-registers with the same identifier after every
/// in-process reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub protocol_version: u32,
    /// Stable identity: the absolute project path.
    pub instance_id: String,
    pub project_name: String,
    pub unity_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ts: u64,
}

/// Editor-reported state change, e.g. `reloading` before a domain reload
/// tears the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub instance_id: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub ts: u64,
}

/// Reply to a liveness probe.  `echo_ts` is the `ts` of the PING being
/// answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub ts: u64,
    pub echo_ts: u64,
}

/// Result of one executed command.  `data` and `error` are mutually
/// exclusive, keyed off `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub ts: u64,
}

// ---------------------------------------------------------------------------
// Relay -> Editor messages
// ---------------------------------------------------------------------------

/// Registration outcome.  On success carries the negotiated liveness
/// interval the editor should expect probes at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registered {
    pub success: bool,
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Liveness probe.  The editor echoes `ts` back in its PONG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub ts: u64,
}

/// A command forwarded to the editor for execution.  `params` is an opaque
/// blob the relay never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Client <-> Relay messages
// ---------------------------------------------------------------------------

/// A client command request.
///
/// `id` has the shape `<client-id>:<uuid>` and doubles as the idempotency
/// key: retries of the same logical call reuse it unchanged.  A missing
/// `instance_id` targets the default instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub ts: u64,
}

/// The single reply a client receives for each REQUEST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(ErrorBody::new(code, message)),
        }
    }
}

/// Request for a point-in-time snapshot of all registered instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInstances {}

/// Snapshot reply to LIST_INSTANCES, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instances {
    pub instances: Vec<InstanceInfo>,
}

/// Select the instance used when a REQUEST names none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDefault {
    pub instance_id: String,
}

/// Acknowledgement of SET_DEFAULT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub instance_id: String,
}

/// Terminal protocol error, sent best-effort before the relay closes a
/// misbehaving connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// One of the frozen v1 [`error_codes`].
    pub code: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Frozen v1 error codes.
pub mod error_codes {
    pub const INSTANCE_NOT_FOUND: &str = "INSTANCE_NOT_FOUND";
    pub const INSTANCE_RELOADING: &str = "INSTANCE_RELOADING";
    pub const INSTANCE_BUSY: &str = "INSTANCE_BUSY";
    pub const INSTANCE_DISCONNECTED: &str = "INSTANCE_DISCONNECTED";
    pub const COMMAND_NOT_FOUND: &str = "COMMAND_NOT_FOUND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const MALFORMED_JSON: &str = "MALFORMED_JSON";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const PROTOCOL_VERSION_MISMATCH: &str = "PROTOCOL_VERSION_MISMATCH";
    pub const CAPABILITY_NOT_SUPPORTED: &str = "CAPABILITY_NOT_SUPPORTED";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";

    /// Whether a client should retry the same logical call (with the same
    /// request identifier) after seeing this code.
    ///
    /// | Code                 | Transient |
    /// |----------------------|-----------|
    /// | INSTANCE_RELOADING   | yes       |
    /// | INSTANCE_BUSY        | yes       |
    /// | QUEUE_FULL           | yes       |
    /// | TIMEOUT              | yes       |
    /// | everything else      | no        |
    pub fn is_transient(code: &str) -> bool {
        matches!(
            code,
            INSTANCE_RELOADING | INSTANCE_BUSY | QUEUE_FULL | TIMEOUT
        )
    }
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame types in the v1 relay protocol.
///
/// Serializes/deserializes using the `type` field as a tag.
///
/// ```json
/// { "type": "register", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Register(Register),
    Registered(Registered),
    Status(StatusUpdate),
    Ping(Ping),
    Pong(Pong),
    Request(Request),
    Command(Command),
    CommandResult(CommandResult),
    Response(Response),
    ListInstances(ListInstances),
    Instances(Instances),
    SetDefault(SetDefault),
    Ack(Ack),
    Error(ErrorMessage),
}
