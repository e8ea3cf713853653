//! File Exchange: marker files in a shared directory, consumed by polling.
//!
//! ## Responsibility
//! Implement [`ExchangeChannel`] for each end of each link on top of the
//! files described in `exchange::board`.
//!
//! | Role          | Reads                       | Writes                       |
//! |---------------|-----------------------------|------------------------------|
//! | `Engine`      | own entry of `master.json`  | `<engine_dir>/result.json`   |
//! | `MapToEngine` | `<engine_dir>/result.json`  | engine's entry of `master.json` |
//! | `MapUpstream` | `params.json`               | `objs.json`                  |
//! | `Caller`      | `objs.json`                 | `params.json`                |
//!
//! ## Guarantees
//! - Result and params files are consumed (read then deleted), never reprocessed
//! - The board is never deleted by an Engine; each board request is acted on once
//! - A crash between read and delete loses that message (accepted, not retried)

use super::board::{self, BoardTask, CallerRequest, CommandBoard, ResultFile};
use super::{validate_incoming, ExchangeChannel, ExchangeError};
use crate::protocol::{CommandManifest, Incoming, Message, RequestId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// Which end of which link a [`FileExchange`] serves.
#[derive(Debug, Clone)]
pub enum FileRole {
    /// Engine side of Map ↔ Engine.
    Engine {
        /// This Engine's id (its key on the board).
        engine_id: Uuid,
        /// Path of `master.json`.
        board: PathBuf,
        /// Path of this Engine's `result.json`.
        result: PathBuf,
    },
    /// Map side of Map ↔ Engine.
    MapToEngine {
        /// The linked Engine.
        engine_id: Uuid,
        /// Path of `master.json`.
        board: PathBuf,
        /// Path of the Engine's `result.json`.
        result: PathBuf,
    },
    /// Caller side of Caller ↔ Map.
    Caller {
        /// Path of `params.json`.
        params: PathBuf,
        /// Path of `objs.json`.
        objs: PathBuf,
    },
    /// Map side of Caller ↔ Map.
    MapUpstream {
        /// Path of `params.json`.
        params: PathBuf,
        /// Path of `objs.json`.
        objs: PathBuf,
    },
}

/// Shared-directory implementation of [`ExchangeChannel`].
#[derive(Debug)]
pub struct FileExchange {
    role: FileRole,
    exposed: Vec<CommandManifest>,
    incoming: VecDeque<Incoming>,
    replies: HashMap<RequestId, Message>,
    outstanding: Option<RequestId>,
    last_seen: Option<RequestId>,
    closed: bool,
}

impl FileExchange {
    /// Create a channel for `role`, accepting `exposed` commands.
    pub fn new(role: FileRole, exposed: Vec<CommandManifest>) -> Self {
        Self {
            role,
            exposed,
            incoming: VecDeque::new(),
            replies: HashMap::new(),
            outstanding: None,
            last_seen: None,
            closed: false,
        }
    }

    /// The role this channel serves.
    pub fn role(&self) -> &FileRole {
        &self.role
    }

    fn ensure_open(&self) -> Result<(), ExchangeError> {
        if self.closed {
            Err(ExchangeError::Closed)
        } else {
            Ok(())
        }
    }

    fn unsupported(&self, what: &str) -> ExchangeError {
        let role = match self.role {
            FileRole::Engine { .. } => "engine",
            FileRole::MapToEngine { .. } => "map-to-engine",
            FileRole::Caller { .. } => "caller",
            FileRole::MapUpstream { .. } => "map-upstream",
        };
        ExchangeError::Unsupported(format!("{what} on {role} file channel"))
    }

    fn accept(&mut self, incoming: Incoming) -> Result<(), ExchangeError> {
        validate_incoming(&self.exposed, &incoming)?;
        self.incoming.push_back(incoming);
        Ok(())
    }

    /// Move whatever the peer wrote into the local buffers.
    fn drain_inbox(&mut self) -> Result<(), ExchangeError> {
        match self.role.clone() {
            FileRole::Engine {
                engine_id, board, ..
            } => {
                let Some(task) = CommandBoard::read_task(&board, engine_id)? else {
                    return Ok(());
                };
                if self.last_seen == Some(task.request_id) {
                    return Ok(());
                }
                self.last_seen = Some(task.request_id);
                let request_id = task.request_id;
                let expects_reply = task.expects_reply();
                let message = task.into_message()?;
                debug!(engine_id = %engine_id, action = message.action(), "Board command picked up");
                let incoming = if expects_reply {
                    Incoming::request(request_id, message)
                } else {
                    Incoming::notify(message)
                };
                self.accept(incoming)
            }
            FileRole::MapToEngine {
                engine_id, result, ..
            } => {
                // Peek first: the slot directory may hold a newer Engine's file.
                match board::read_json::<ResultFile>(&result)? {
                    Some(file) if file.id == engine_id => {}
                    _ => return Ok(()),
                }
                let Some(file) = board::consume_json::<ResultFile>(&result)? else {
                    return Ok(());
                };
                if file.id != engine_id {
                    warn!(engine_id = %engine_id, found = %file.id, "Result file changed owner while consuming");
                    return Ok(());
                }
                match (file.request_id, file.task_id, file.payload) {
                    (Some(request_id), Some(task_id), Some(objs)) => {
                        self.replies
                            .insert(request_id, Message::EvalResult { task_id, objs });
                        Ok(())
                    }
                    _ => self.accept(Incoming::notify(Message::Status {
                        status: file.status,
                    })),
                }
            }
            FileRole::MapUpstream { params, .. } => {
                let Some(request) = board::consume_json::<CallerRequest>(&params)? else {
                    return Ok(());
                };
                let incoming = match request {
                    CallerRequest::Run { params, request_id } => {
                        let request_id = request_id.unwrap_or_default();
                        self.outstanding = Some(request_id);
                        Incoming::request(request_id, Message::Map { params_list: params })
                    }
                    CallerRequest::Stop => Incoming::notify(Message::Stop),
                };
                self.accept(incoming)
            }
            FileRole::Caller { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeChannel for FileExchange {
    fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        match (&self.role, message) {
            (FileRole::Engine { engine_id, result, .. }, Message::Status { status }) => {
                board::write_json_atomic(result, &ResultFile::status(*engine_id, status))
            }
            (FileRole::MapToEngine { engine_id, board, .. }, message) => {
                let task = BoardTask::from_message(RequestId::new(), &message)?;
                CommandBoard::post_task(board, *engine_id, task)
            }
            (FileRole::Caller { params, .. }, Message::Stop) => {
                board::write_json_atomic(params, &CallerRequest::Stop)
            }
            (_, message) => Err(self.unsupported(&format!("send {}", message.action()))),
        }
    }

    fn poll_incoming(&mut self) -> Result<Vec<Incoming>, ExchangeError> {
        self.ensure_open()?;
        self.drain_inbox()?;
        Ok(self.incoming.drain(..).collect())
    }

    fn request_with_delayed_reply(&mut self, message: Message) -> Result<RequestId, ExchangeError> {
        self.ensure_open()?;
        let request_id = RequestId::new();
        match (&self.role, message) {
            (FileRole::MapToEngine { engine_id, board, .. }, message) => {
                let task = BoardTask::from_message(request_id, &message)?;
                CommandBoard::post_task(board, *engine_id, task)?;
            }
            (FileRole::Caller { params, objs }, Message::Map { params_list }) => {
                board::remove_if_exists(objs)?;
                let request = CallerRequest::Run {
                    params: params_list,
                    request_id: Some(request_id),
                };
                board::write_json_atomic(params, &request)?;
                self.outstanding = Some(request_id);
            }
            (_, message) => {
                return Err(self.unsupported(&format!("request {}", message.action())))
            }
        }
        Ok(request_id)
    }

    fn check_for_reply(&mut self, token: RequestId) -> Result<Option<Message>, ExchangeError> {
        self.ensure_open()?;
        if let FileRole::Caller { params, objs } = &self.role {
            if self.outstanding != Some(token) {
                return Ok(None);
            }
            let Some(objs_list) = board::consume_json::<Vec<Vec<f64>>>(objs)? else {
                return Ok(None);
            };
            board::remove_if_exists(params)?;
            self.outstanding = None;
            return Ok(Some(Message::MapResult { objs_list }));
        }
        self.drain_inbox()?;
        Ok(self.replies.remove(&token))
    }

    fn reply(&mut self, request_id: RequestId, message: Message) -> Result<(), ExchangeError> {
        self.ensure_open()?;
        match (&self.role, message) {
            (FileRole::Engine { engine_id, result, .. }, Message::EvalResult { task_id, objs }) => {
                let file = ResultFile::submitted(*engine_id, request_id, task_id, objs);
                board::write_json_atomic(result, &file)
            }
            (FileRole::MapUpstream { objs, .. }, Message::MapResult { objs_list }) => {
                if self.outstanding != Some(request_id) {
                    warn!(request_id = %request_id, "Replying to a batch that is not the open one");
                }
                board::write_json_atomic(objs, &objs_list)?;
                self.outstanding = None;
                Ok(())
            }
            (_, message) => Err(self.unsupported(&format!("reply {}", message.action()))),
        }
    }

    fn acknowledges_delivery(&self) -> bool {
        false
    }

    async fn close(&mut self) {
        self.closed = true;
        self.incoming.clear();
        self.replies.clear();
    }
}
