//! On-disk formats of the shared-directory transport.
//!
//! ## Responsibility
//! Read, write and consume the JSON marker files that carry discovery
//! descriptors, engine results, the Map's command board and the Caller's
//! batch files.
//!
//! ## Guarantees
//! - Atomic: writes go to `<name>.tmp` and are renamed into place
//! - Idempotent: `consume_json` deletes what it read, so a second poll sees nothing
//! - Missing is not an error: absent files read as `Ok(None)`
//!
//! ## NOT Responsible For
//! - Deciding what to do with the contents (see: `exchange::file`)

use super::ExchangeError;
use crate::protocol::{EngineStatus, Endpoint, Features, Message, RequestId, TaskId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File an Engine publishes to announce itself.
pub const DISCOVERY_FILE: &str = "engine.json";
/// File an Engine writes status updates and results into.
pub const RESULT_FILE: &str = "result.json";

/// `<dir>/engine.json`.
pub fn descriptor_path(dir: &Path) -> PathBuf {
    dir.join(DISCOVERY_FILE)
}

/// `<dir>/result.json`.
pub fn result_path(dir: &Path) -> PathBuf {
    dir.join(RESULT_FILE)
}

fn io_error(path: &Path, source: std::io::Error) -> ExchangeError {
    ExchangeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Serialize `value` to `path` through a temporary file and a rename.
///
/// Parent directories are created as needed.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ExchangeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

/// Read and decode `path`, `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ExchangeError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        ExchangeError::ProtocolViolation(format!("malformed {}: {e}", path.display()))
    })
}

/// Read, decode and delete `path`.
///
/// The file is first renamed to a private name, so a writer replacing
/// `path` concurrently is never deleted unread. It is removed before
/// decoding so a malformed file is not re-read on every tick.
pub fn consume_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ExchangeError> {
    let mut claimed = path.as_os_str().to_owned();
    claimed.push(format!(".{}.claimed", Uuid::new_v4()));
    let claimed = PathBuf::from(claimed);
    match std::fs::rename(path, &claimed) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    }
    let bytes = std::fs::read(&claimed).map_err(|e| io_error(&claimed, e))?;
    remove_if_exists(&claimed)?;
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        ExchangeError::ProtocolViolation(format!("malformed {}: {e}", path.display()))
    })
}

/// Delete `path`, ignoring a file that is already gone.
pub fn remove_if_exists(path: &Path) -> Result<(), ExchangeError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}

// ── Engine → Map ─────────────────────────────────────────────────────────

/// Contents of `engine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDescriptor {
    /// Engine identity, fresh for every process start.
    pub id: Uuid,
    /// Advertised status; must be `connecting` at first sight.
    pub status: EngineStatus,
    /// Where the Engine listens (socket transport), `null` otherwise.
    #[serde(default)]
    pub payload: Option<Endpoint>,
}

impl DiscoveryDescriptor {
    /// A freshly started Engine.
    pub fn connecting(id: Uuid, endpoint: Option<Endpoint>) -> Self {
        Self {
            id,
            status: EngineStatus::Connecting,
            payload: endpoint,
        }
    }
}

/// Contents of `result.json`: a status update, or a result when
/// `request_id` and `payload` are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    /// Engine that wrote the file.
    pub id: Uuid,
    /// Engine status at the time of writing.
    pub status: EngineStatus,
    /// Task the payload belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Features returned by the evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Features>,
    /// Board request this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl ResultFile {
    /// A bare status update.
    pub fn status(id: Uuid, status: EngineStatus) -> Self {
        Self {
            id,
            status,
            task_id: None,
            payload: None,
            request_id: None,
        }
    }

    /// A submitted evaluation result.
    pub fn submitted(id: Uuid, request_id: RequestId, task_id: TaskId, payload: Features) -> Self {
        Self {
            id,
            status: EngineStatus::Submitted,
            task_id: Some(task_id),
            payload: Some(payload),
            request_id: Some(request_id),
        }
    }
}

// ── Map → Engine ─────────────────────────────────────────────────────────

/// One command posted for one Engine on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardTask {
    /// `connect` | `run` | `get ready` | `stop`.
    pub command: String,
    /// Task being run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Command arguments: parameters for `run`, endpoint for `connect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Engines act at most once per id.
    pub request_id: RequestId,
}

impl BoardTask {
    /// Encode a Map → Engine message.
    pub fn from_message(request_id: RequestId, message: &Message) -> Result<Self, ExchangeError> {
        let (command, task_id, payload) = match message {
            Message::Connect { endpoint } => (
                "connect",
                None,
                endpoint.as_ref().map(serde_json::to_value).transpose()?,
            ),
            Message::Eval { task_id, params } => {
                ("run", Some(*task_id), Some(serde_json::to_value(params)?))
            }
            Message::GetReady => ("get ready", None, None),
            Message::Stop => ("stop", None, None),
            other => {
                return Err(ExchangeError::Unsupported(format!(
                    "{} cannot be posted on the command board",
                    other.action()
                )))
            }
        };
        Ok(Self {
            command: command.to_string(),
            task_id,
            payload,
            request_id,
        })
    }

    /// Decode into a message.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::ProtocolViolation`] for an unknown command or a `run`
    /// without task id or parameters.
    pub fn into_message(self) -> Result<Message, ExchangeError> {
        let violation = |what: &str| {
            ExchangeError::ProtocolViolation(format!("board command {}: {what}", self.command))
        };
        match self.command.as_str() {
            "connect" => {
                let endpoint = match self.payload.clone() {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        serde_json::from_value(v).map_err(|e| violation(&e.to_string()))?,
                    ),
                };
                Ok(Message::Connect { endpoint })
            }
            "run" => {
                let task_id = self.task_id.ok_or_else(|| violation("missing task_id"))?;
                let payload = self.payload.clone().ok_or_else(|| violation("missing payload"))?;
                let params = serde_json::from_value(payload).map_err(|e| violation(&e.to_string()))?;
                Ok(Message::Eval { task_id, params })
            }
            "get ready" => Ok(Message::GetReady),
            "stop" => Ok(Message::Stop),
            other => Err(ExchangeError::ProtocolViolation(format!(
                "unknown command: {other}"
            ))),
        }
    }

    /// `true` when the Engine owes a reply for this command.
    pub fn expects_reply(&self) -> bool {
        self.command == "run"
    }
}

/// Per-engine slot on the board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardEntry {
    /// Latest command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<BoardTask>,
}

/// Contents of `master.json`. Only the Map writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandBoard {
    /// One entry per registered Engine, keyed by engine id.
    #[serde(default)]
    pub engines: BTreeMap<String, BoardEntry>,
    /// Identity of the Map that owns the board.
    pub id: Uuid,
}

impl CommandBoard {
    /// Write a fresh, empty board owned by `map_id`.
    pub fn init(path: &Path, map_id: Uuid) -> Result<(), ExchangeError> {
        let board = Self {
            engines: BTreeMap::new(),
            id: map_id,
        };
        write_json_atomic(path, &board)?;
        info!(path = %path.display(), map_id = %map_id, "Command board initialised");
        Ok(())
    }

    /// Replace `engine_id`'s slot with `task` (read-modify-write).
    pub fn post_task(path: &Path, engine_id: Uuid, task: BoardTask) -> Result<(), ExchangeError> {
        let mut board: Self = read_json(path)?.ok_or_else(|| {
            ExchangeError::ProtocolViolation(format!(
                "command board {} missing; map not started",
                path.display()
            ))
        })?;
        debug!(engine_id = %engine_id, command = %task.command, "Posting board task");
        board
            .engines
            .insert(engine_id.to_string(), BoardEntry { task: Some(task) });
        write_json_atomic(path, &board)
    }

    /// Read only `engine_id`'s task from the board at `path`.
    ///
    /// Other engines' entries are never decoded, so a malformed neighbour
    /// cannot break this Engine.
    pub fn read_task(path: &Path, engine_id: Uuid) -> Result<Option<BoardTask>, ExchangeError> {
        let Some(raw) = read_json::<Value>(path)? else {
            return Ok(None);
        };
        let Some(task) = raw
            .get("engines")
            .and_then(|engines| engines.get(engine_id.to_string()))
            .and_then(|entry| entry.get("task"))
        else {
            return Ok(None);
        };
        if task.is_null() {
            return Ok(None);
        }
        serde_json::from_value(task.clone()).map(Some).map_err(|e| {
            ExchangeError::ProtocolViolation(format!("malformed board entry for {engine_id}: {e}"))
        })
    }
}

// ── Caller ↔ Map ─────────────────────────────────────────────────────────

/// Contents of `params.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CallerRequest {
    /// Evaluate a batch.
    Run {
        /// Parameter vectors in caller order.
        params: Vec<Vec<f64>>,
        /// Correlation token of the batch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    /// Shut the Map down.
    Stop,
}

// ── Discovery ────────────────────────────────────────────────────────────

/// The Map's view of the discovery directories.
#[derive(Debug, Clone)]
pub struct DiscoveryBoard {
    dirs: Vec<PathBuf>,
}

impl DiscoveryBoard {
    /// Watch `dirs`, one per engine slot.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Directories being watched.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Delete stale descriptors and results left by earlier runs.
    pub fn clear(&self) -> Result<(), ExchangeError> {
        for dir in &self.dirs {
            for path in [descriptor_path(dir), result_path(dir)] {
                if path.exists() {
                    warn!(path = %path.display(), "Removing stale engine file");
                }
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Consume every published descriptor, paired with its directory.
    pub fn scan(&self) -> Result<Vec<(PathBuf, DiscoveryDescriptor)>, ExchangeError> {
        let mut found = Vec::new();
        for dir in &self.dirs {
            if let Some(desc) = consume_json(&descriptor_path(dir))? {
                found.push((dir.clone(), desc));
            }
        }
        Ok(found)
    }

    /// Publish `descriptor` into `dir` (Engine side).
    pub fn publish(dir: &Path, descriptor: &DiscoveryDescriptor) -> Result<(), ExchangeError> {
        write_json_atomic(&descriptor_path(dir), descriptor)?;
        info!(engine_id = %descriptor.id, dir = %dir.display(), "Published discovery descriptor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParamSet;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_read_json_missing_file_is_none() {
        let dir = tmp();
        let result: Result<Option<Value>, _> = read_json(&dir.path().join("nope.json"));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_write_json_atomic_leaves_no_tmp_file() {
        let dir = tmp();
        let path = dir.path().join("nested").join("x.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("x.json.tmp").exists());
        let back: Option<Vec<i32>> = read_json(&path).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_consume_json_is_idempotent() {
        let dir = tmp();
        let path = dir.path().join("result.json");
        write_json_atomic(&path, &ResultFile::status(Uuid::new_v4(), EngineStatus::Ready)).unwrap();
        let first: Option<ResultFile> = consume_json(&path).unwrap();
        let second: Option<ResultFile> = consume_json(&path).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn test_consume_json_malformed_file_is_removed_and_reported() {
        let dir = tmp();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, b"{not json").unwrap();
        let result: Result<Option<DiscoveryDescriptor>, _> = consume_json(&path);
        assert!(matches!(result, Err(ExchangeError::ProtocolViolation(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_discovery_descriptor_matches_wire_shape() {
        let id = Uuid::new_v4();
        let desc = DiscoveryDescriptor::connecting(id, Some(Endpoint::new("evaluator", 5000)));
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["payload"]["host"], "evaluator");
        assert_eq!(json["payload"]["port"], 5000);
    }

    #[test]
    fn test_result_file_submitted_shape() {
        let mut objs = Features::new();
        objs.insert("step1.Spikecount".to_string(), 3.0);
        let file = ResultFile::submitted(Uuid::new_v4(), RequestId::new(), 4, objs);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["status"], "submitted");
        assert_eq!(json["task_id"], 4);
        assert_eq!(json["payload"]["step1.Spikecount"], 3.0);
    }

    #[test]
    fn test_board_task_run_round_trips_to_eval() {
        let mut params = ParamSet::new();
        params.insert("gnabar_hh".to_string(), 0.1);
        let msg = Message::Eval {
            task_id: 1,
            params: params.clone(),
        };
        let task = BoardTask::from_message(RequestId::new(), &msg).unwrap();
        assert_eq!(task.command, "run");
        assert!(task.expects_reply());
        assert_eq!(task.into_message().unwrap(), msg);
    }

    #[test]
    fn test_board_task_unknown_command_is_violation() {
        let task = BoardTask {
            command: "dance".to_string(),
            task_id: None,
            payload: None,
            request_id: RequestId::new(),
        };
        match task.into_message() {
            Err(ExchangeError::ProtocolViolation(msg)) => assert!(msg.contains("dance")),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_board_task_rejects_engine_to_map_messages() {
        let msg = Message::Status {
            status: EngineStatus::Ready,
        };
        assert!(matches!(
            BoardTask::from_message(RequestId::new(), &msg),
            Err(ExchangeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_command_board_post_and_read_task() {
        let dir = tmp();
        let path = dir.path().join("master.json");
        let engine = Uuid::new_v4();
        CommandBoard::init(&path, Uuid::new_v4()).unwrap();
        assert!(CommandBoard::read_task(&path, engine).unwrap().is_none());

        let task = BoardTask::from_message(RequestId::new(), &Message::Stop).unwrap();
        CommandBoard::post_task(&path, engine, task.clone()).unwrap();
        assert_eq!(CommandBoard::read_task(&path, engine).unwrap(), Some(task));
        assert!(CommandBoard::read_task(&path, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_command_board_post_without_init_is_error() {
        let dir = tmp();
        let task = BoardTask::from_message(RequestId::new(), &Message::Stop).unwrap();
        let result = CommandBoard::post_task(&dir.path().join("master.json"), Uuid::new_v4(), task);
        assert!(result.is_err());
    }

    #[test]
    fn test_caller_request_wire_shape() {
        let json = serde_json::to_value(CallerRequest::Run {
            params: vec![vec![0.1, 0.2]],
            request_id: None,
        })
        .unwrap();
        assert_eq!(json["command"], "run");
        assert_eq!(json["params"][0][1], 0.2);
        let stop: CallerRequest = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(stop, CallerRequest::Stop);
    }

    #[test]
    fn test_discovery_board_clear_and_scan() {
        let dir = tmp();
        let slots = vec![dir.path().join("engine_0"), dir.path().join("engine_1")];
        let board = DiscoveryBoard::new(slots.clone());

        let stale = DiscoveryDescriptor::connecting(Uuid::new_v4(), None);
        DiscoveryBoard::publish(&slots[0], &stale).unwrap();
        board.clear().unwrap();
        assert!(board.scan().unwrap().is_empty());

        let fresh = DiscoveryDescriptor::connecting(Uuid::new_v4(), None);
        DiscoveryBoard::publish(&slots[1], &fresh).unwrap();
        let found = board.scan().unwrap();
        assert_eq!(found, vec![(slots[1].clone(), fresh)]);
        assert!(board.scan().unwrap().is_empty());
    }
}
