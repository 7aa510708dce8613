//! Per-task event bus
//!
//! One broadcast channel per live task. Observers see every event published
//! after they attach, in publish order; nothing is replayed (take a snapshot
//! with `get_task` for history). Publishing never waits on observers: a
//! subscriber that falls more than `capacity` events behind skips ahead and
//! the gap is logged. The channel closes after the terminal event.

use crate::types::{Agent, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which artifact changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Specification
    Spec,
    /// Implementation files
    Code,
    /// Test files
    Tests,
    /// Sandbox run summary
    SandboxReport,
    /// Review verdict
    Review,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event on every subscription
    ConnectionEstablished,
    /// Status transition
    StatusChanged {
        /// Previous status
        old: TaskStatus,
        /// New status
        new: TaskStatus,
    },
    /// Message appended to the task
    AgentMessage {
        /// Author
        agent: Agent,
        /// Body
        content: String,
    },
    /// Artifact replaced
    ArtifactUpdated {
        /// Which artifact
        kind: ArtifactKind,
    },
    /// Error recorded on the task
    Error {
        /// Error text
        message: String,
    },
    /// Task reached a terminal status; no further events follow
    WorkflowCompleted {
        /// Terminal status
        outcome: TaskStatus,
    },
}

/// Event delivered to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event belongs to
    pub task_id: TaskId,
    /// Publish time
    pub timestamp: DateTime<Utc>,
    /// Payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    fn now(task_id: TaskId, kind: EventKind) -> Self {
        Self {
            task_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Multiplexer of per-task channels
#[derive(Debug)]
pub struct EventBus {
    channels: DashMap<TaskId, broadcast::Sender<TaskEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create bus with per-task buffer capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open the channel for a task (no-op when already open)
    pub fn open(&self, task_id: &TaskId) {
        self.channels
            .entry(task_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Check whether a task's channel is open
    #[must_use]
    pub fn is_open(&self, task_id: &TaskId) -> bool {
        self.channels.contains_key(task_id)
    }

    /// Publish an event; closes the channel after `WorkflowCompleted`
    ///
    /// Returns the number of observers that received it.
    pub fn publish(&self, task_id: &TaskId, kind: EventKind) -> usize {
        let closing = matches!(kind, EventKind::WorkflowCompleted { .. });
        let event = TaskEvent::now(task_id.clone(), kind);
        let delivered = self
            .channels
            .get(task_id)
            .map_or(0, |sender| sender.send(event).unwrap_or(0));
        if closing {
            self.close(task_id);
        }
        delivered
    }

    /// Attach an observer
    ///
    /// A task whose channel is closed still yields the connection event,
    /// then ends.
    #[must_use]
    pub fn subscribe(&self, task_id: &TaskId) -> Subscription {
        let receiver = self.channels.get(task_id).map(|sender| sender.subscribe());
        Subscription {
            task_id: task_id.clone(),
            greeting: Some(TaskEvent::now(task_id.clone(), EventKind::ConnectionEstablished)),
            receiver,
        }
    }

    /// Close a task's channel; attached observers drain and end
    pub fn close(&self, task_id: &TaskId) {
        self.channels.remove(task_id);
    }

    /// Observers currently attached to a task
    #[must_use]
    pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.channels
            .get(task_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

/// Observer handle for one task
#[derive(Debug)]
pub struct Subscription {
    task_id: TaskId,
    greeting: Option<TaskEvent>,
    receiver: Option<broadcast::Receiver<TaskEvent>>,
}

impl Subscription {
    /// Next event, or `None` once the task's channel has closed
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(task_id = %self.task_id, skipped, "event observer lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Task this subscription observes
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Convert into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}
