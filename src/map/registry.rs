//! Registered Engines, in registration order.

use crate::exchange::ExchangeChannel;
use crate::protocol::{EngineStatus, Endpoint, RequestId, TaskId};
use std::path::PathBuf;
use uuid::Uuid;

/// The task an Engine is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Correlation token of the `eval` request.
    pub request_id: RequestId,
    /// Task sent with it.
    pub task_id: TaskId,
}

/// The Map's record of one Engine.
pub struct EngineEntry {
    /// Engine identity.
    pub id: Uuid,
    /// Last known status.
    pub status: EngineStatus,
    /// Endpoint from the discovery descriptor.
    pub endpoint: Option<Endpoint>,
    /// Discovery directory it was found in.
    pub dir: PathBuf,
    /// Holding a task whose slot has not been freed yet.
    pub submitted: bool,
    /// Outstanding `eval`.
    pub in_flight: Option<InFlight>,
    /// Link to the Engine.
    pub channel: Box<dyn ExchangeChannel>,
}

impl std::fmt::Debug for EngineEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEntry")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("endpoint", &self.endpoint)
            .field("dir", &self.dir)
            .field("submitted", &self.submitted)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl EngineEntry {
    /// `true` when a task may be dispatched to this Engine.
    pub fn can_accept(&self) -> bool {
        self.status == EngineStatus::Ready && !self.submitted
    }
}

/// Engines keyed by id, iterated in registration order.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    entries: Vec<EngineEntry>,
}

impl EngineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `id` is registered.
    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Add `entry`. Returns `false`, and drops `entry`, if its id is already
    /// registered.
    pub fn insert(&mut self, entry: EngineEntry) -> bool {
        if self.contains(entry.id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Number of registered Engines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered ids, in registration order.
    pub fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Mutable iteration in registration order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, EngineEntry> {
        self.entries.iter_mut()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<EngineEntry> {
        std::mem::take(&mut self.entries)
    }
}
