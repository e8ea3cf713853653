//! Task queues of the open batch.
//!
//! Every task id of the batch lives in exactly one of `pending`, `running`
//! or `finished`. The batch is drained when `pending` and `running` are both
//! empty.

use crate::protocol::TaskId;
use crate::DispatchError;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for an Engine.
    Pending,
    /// Sent to an Engine.
    Running,
    /// Result attached.
    Finished,
}

/// One parameter vector of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Position of the vector in the caller's batch.
    pub id: TaskId,
    /// Raw parameter vector.
    pub params: Vec<f64>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Objective vector, once finished.
    pub result: Option<Vec<f64>>,
}

/// `pending`, `running` and `finished` queues.
#[derive(Debug, Default)]
pub struct TaskQueues {
    pending: Vec<Task>,
    running: Vec<Task>,
    finished: Vec<Task>,
}

impl TaskQueues {
    /// Empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all queues with one pending task per vector, ids in input order.
    pub fn populate(&mut self, params_list: Vec<Vec<f64>>) {
        self.running.clear();
        self.finished.clear();
        self.pending = params_list
            .into_iter()
            .enumerate()
            .map(|(id, params)| Task {
                id: id as TaskId,
                params,
                status: TaskStatus::Pending,
                result: None,
            })
            .collect();
    }

    /// Move the most recently enqueued pending task to `running` and return
    /// a copy of it. Dispatch order is LIFO.
    pub fn start_next(&mut self) -> Option<Task> {
        let mut task = self.pending.pop()?;
        task.status = TaskStatus::Running;
        self.running.push(task.clone());
        Some(task)
    }

    /// Attach `result` to running task `task_id` and move it to `finished`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownTask`] if no running task has that id.
    pub fn finish(&mut self, task_id: TaskId, result: Vec<f64>) -> Result<(), DispatchError> {
        let position = self
            .running
            .iter()
            .position(|t| t.id == task_id)
            .ok_or(DispatchError::UnknownTask { task_id })?;
        let mut task = self.running.swap_remove(position);
        task.status = TaskStatus::Finished;
        task.result = Some(result);
        self.finished.push(task);
        Ok(())
    }

    /// `true` when nothing is pending or running.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Number of pending tasks.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of running tasks.
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Number of finished tasks.
    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Empty `finished` and return its results sorted by task id.
    pub fn take_finished_sorted(&mut self) -> Vec<Vec<f64>> {
        let mut finished = std::mem::take(&mut self.finished);
        finished.sort_by_key(|t| t.id);
        finished
            .into_iter()
            .map(|t| t.result.unwrap_or_default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![i as f64]).collect()
    }

    #[test]
    fn test_populate_assigns_ids_in_input_order() {
        let mut q = TaskQueues::new();
        q.populate(batch(3));
        assert_eq!(q.pending_len(), 3);
        assert!(!q.is_drained());
    }

    #[test]
    fn test_start_next_is_lifo() {
        let mut q = TaskQueues::new();
        q.populate(batch(3));
        let ids: Vec<TaskId> = std::iter::from_fn(|| q.start_next()).map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
        assert_eq!(q.running_len(), 3);
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn test_finish_unknown_task_is_error() {
        let mut q = TaskQueues::new();
        q.populate(batch(1));
        let err = q.finish(0, vec![1.0]).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask { task_id: 0 }));
    }

    #[test]
    fn test_finish_twice_is_error() {
        let mut q = TaskQueues::new();
        q.populate(batch(1));
        q.start_next();
        q.finish(0, vec![1.0]).unwrap();
        assert!(q.finish(0, vec![1.0]).is_err());
    }

    #[test]
    fn test_drained_only_when_pending_and_running_empty() {
        let mut q = TaskQueues::new();
        q.populate(batch(2));
        q.start_next();
        q.start_next();
        q.finish(1, vec![10.0]).unwrap();
        assert!(!q.is_drained());
        q.finish(0, vec![0.0]).unwrap();
        assert!(q.is_drained());
    }

    #[test]
    fn test_take_finished_sorted_restores_input_order() {
        let mut q = TaskQueues::new();
        q.populate(batch(3));
        while q.start_next().is_some() {}
        q.finish(0, vec![0.5]).unwrap();
        q.finish(2, vec![2.5]).unwrap();
        q.finish(1, vec![1.5]).unwrap();
        assert_eq!(q.take_finished_sorted(), vec![vec![0.5], vec![1.5], vec![2.5]]);
        assert_eq!(q.finished_len(), 0);
    }

    #[test]
    fn test_task_ids_never_in_two_queues() {
        let mut q = TaskQueues::new();
        q.populate(batch(4));
        q.start_next();
        q.start_next();
        q.finish(3, vec![]).unwrap();
        let mut ids: Vec<TaskId> = q
            .pending
            .iter()
            .chain(&q.running)
            .chain(&q.finished)
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
