//! # Protocol: wire vocabulary shared by Map, Engines and Caller
//!
//! ## Responsibility
//! Define the messages exchanged over every [`crate::exchange::ExchangeChannel`],
//! the identifiers used to correlate them, and the command manifests each
//! receiver exposes.
//!
//! ## Guarantees
//! - Transport-agnostic: the same [`Message`] values travel over files and sockets
//! - Tagged: every message serializes with a `"command"` discriminator
//! - Closed: an unknown `"command"` value never deserializes into a [`Message`]
//!
//! ## NOT Responsible For
//! - On-disk layouts (see: `exchange::board`)
//! - Socket framing (see: `exchange::socket`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Task identity: the position of the parameter vector in its batch.
pub type TaskId = u64;

/// Named parameter values handed to an evaluator (`name → value`).
pub type ParamSet = BTreeMap<String, f64>;

/// Named scalar features returned by an evaluator (`feature_name → scalar`).
pub type Features = BTreeMap<String, f64>;

/// Correlation token for a delayed-reply request.
///
/// # Panics
///
/// No methods on this type panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh, random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(host, port)` pair another process can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lifecycle status of an Engine.
///
/// Engines progress `Connecting → Ready → Busy → Submitted → Ready`, and any
/// state may move to `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Descriptor published, waiting for the Map's `connect`.
    Connecting,
    /// Idle and able to accept an `eval`.
    Ready,
    /// Running the evaluator.
    Busy,
    /// Result handed back, waiting for the Map to free the slot.
    Submitted,
    /// `stop` received, leaving the poll loop.
    Stopping,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Submitted => "submitted",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Every message the dispatch protocol knows about.
///
/// Serialized with an internal `"command"` tag, e.g.
/// `{"command": "eval", "task_id": 3, "params": {"x0": 0.5}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Message {
    /// Map → Engine: open the return leg towards `endpoint` (socket transport)
    /// or simply go ready (file transport, `endpoint` is `None`).
    Connect {
        /// Where the Map listens for this Engine's traffic.
        #[serde(default)]
        endpoint: Option<Endpoint>,
    },
    /// Map → Engine: evaluate one task (delayed reply).
    Eval {
        /// Task being evaluated.
        task_id: TaskId,
        /// Named parameter values.
        params: ParamSet,
    },
    /// Map → Engine: result consumed, return to `ready`.
    #[serde(rename = "get ready")]
    GetReady,
    /// Any upstream → downstream: shut down.
    Stop,
    /// Engine → Map: status advertisement.
    Status {
        /// The Engine's new status.
        status: EngineStatus,
    },
    /// Engine → Map: reply to [`Message::Eval`].
    EvalResult {
        /// Task the features belong to.
        task_id: TaskId,
        /// Feature mapping produced by the evaluator.
        objs: Features,
    },
    /// Caller → Map: evaluate a whole batch (delayed reply).
    Map {
        /// Parameter vectors in caller order.
        params_list: Vec<Vec<f64>>,
    },
    /// Map → Caller: reply to [`Message::Map`], in caller order.
    MapResult {
        /// One objective vector per input parameter vector.
        objs_list: Vec<Vec<f64>>,
    },
}

impl Message {
    /// The `"command"` tag of this message.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Eval { .. } => "eval",
            Self::GetReady => "get ready",
            Self::Stop => "stop",
            Self::Status { .. } => "status",
            Self::EvalResult { .. } => "eval_result",
            Self::Map { .. } => "map",
            Self::MapResult { .. } => "map_result",
        }
    }
}

/// A message picked up by `poll_incoming`.
///
/// `request_id` is `Some` when the sender expects a delayed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// Correlation token to pass to `reply`, if the sender expects one.
    pub request_id: Option<RequestId>,
    /// The message itself.
    pub message: Message,
}

impl Incoming {
    /// A fire-and-forget message.
    pub fn notify(message: Message) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    /// A message awaiting a delayed reply under `request_id`.
    pub fn request(request_id: RequestId, message: Message) -> Self {
        Self {
            request_id: Some(request_id),
            message,
        }
    }
}

/// How a command expects to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Notification; no reply.
    WithoutReply,
    /// Synchronous call/response.
    WithImmediateReply,
    /// Correlation token now, payload picked up later via `check_for_reply`.
    WithDelayedReply,
}

/// A named parameter of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParameter {
    /// Field name in the message.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
}

/// Declaration of one command a receiver accepts.
///
/// # Example
///
/// ```rust
/// use tokio_eval_dispatch::protocol::{CommandManifest, CommandType};
///
/// let eval = CommandManifest::new("eval", "evaluate parameters", CommandType::WithDelayedReply)
///     .with_param("task_id", "task id")
///     .with_param("params", "parameters");
/// assert_eq!(eval.params.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandManifest {
    /// The `"command"` tag this manifest matches.
    pub action: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Parameters carried by the command.
    pub params: Vec<CommandParameter>,
    /// Reply mode.
    pub command_type: CommandType,
}

impl CommandManifest {
    /// Declare a command with no parameters.
    pub fn new(action: &'static str, description: &'static str, command_type: CommandType) -> Self {
        Self {
            action,
            description,
            params: Vec::new(),
            command_type,
        }
    }

    /// Add a parameter declaration.
    pub fn with_param(mut self, name: &'static str, description: &'static str) -> Self {
        self.params.push(CommandParameter { name, description });
        self
    }
}

/// Commands an Engine accepts from the Map.
pub fn engine_commands() -> Vec<CommandManifest> {
    vec![
        CommandManifest::new(
            "connect",
            "open the return channel to the map",
            CommandType::WithoutReply,
        )
        .with_param("endpoint", "map host and port"),
        CommandManifest::new(
            "eval",
            "evaluate parameters and return objectives",
            CommandType::WithDelayedReply,
        )
        .with_param("task_id", "task_id")
        .with_param("params", "parameters"),
        CommandManifest::new(
            "get ready",
            "result consumed, accept the next task",
            CommandType::WithoutReply,
        ),
        CommandManifest::new("stop", "shut the engine down", CommandType::WithoutReply),
    ]
}

/// Notifications the Map accepts from an Engine.
pub fn engine_notifications() -> Vec<CommandManifest> {
    vec![
        CommandManifest::new("status", "engine status advertisement", CommandType::WithoutReply)
            .with_param("status", "engine status"),
    ]
}

/// Commands the Map accepts from its Caller.
pub fn map_commands() -> Vec<CommandManifest> {
    vec![
        CommandManifest::new(
            "map",
            "evaluate a list of parameter sets",
            CommandType::WithDelayedReply,
        )
        .with_param("params_list", "list of parameter vectors"),
        CommandManifest::new("stop", "shut the map down", CommandType::WithoutReply),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_eval_serializes_with_command_tag() {
        let mut params = ParamSet::new();
        params.insert("gnabar_hh".to_string(), 0.1);
        let msg = Message::Eval { task_id: 2, params };
        let json = serde_json::to_value(&msg).unwrap_or_default();
        assert_eq!(json["command"], "eval");
        assert_eq!(json["task_id"], 2);
        assert_eq!(json["params"]["gnabar_hh"], 0.1);
    }

    #[test]
    fn test_message_get_ready_uses_spaced_tag() {
        let json = serde_json::to_string(&Message::GetReady).unwrap_or_default();
        assert_eq!(json, r#"{"command":"get ready"}"#);
        let back: Result<Message, _> = serde_json::from_str(&json);
        assert!(matches!(back, Ok(Message::GetReady)));
    }

    #[test]
    fn test_message_unknown_command_fails_to_decode() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"command":"dance"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_connect_without_endpoint_decodes() {
        let msg: Result<Message, _> = serde_json::from_str(r#"{"command":"connect"}"#);
        assert!(matches!(msg, Ok(Message::Connect { endpoint: None })));
    }

    #[test]
    fn test_message_action_matches_serialized_tag() {
        let messages = vec![
            Message::Connect { endpoint: None },
            Message::GetReady,
            Message::Stop,
            Message::Status {
                status: EngineStatus::Ready,
            },
            Message::Map {
                params_list: vec![vec![1.0]],
            },
            Message::MapResult { objs_list: vec![] },
        ];
        for msg in messages {
            let json = serde_json::to_value(&msg).unwrap_or_default();
            assert_eq!(json["command"], msg.action());
        }
    }

    #[test]
    fn test_engine_status_display_matches_serde() {
        for status in [
            EngineStatus::Connecting,
            EngineStatus::Ready,
            EngineStatus::Busy,
            EngineStatus::Submitted,
            EngineStatus::Stopping,
        ] {
            let json = serde_json::to_value(status).unwrap_or_default();
            assert_eq!(json, status.to_string());
        }
    }

    #[test]
    fn test_endpoint_address_joins_host_and_port() {
        assert_eq!(Endpoint::new("map", 4000).address(), "map:4000");
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_engine_commands_declare_eval_as_delayed() {
        let eval = engine_commands()
            .into_iter()
            .find(|m| m.action == "eval");
        assert_eq!(
            eval.map(|m| m.command_type),
            Some(CommandType::WithDelayedReply)
        );
    }
}
