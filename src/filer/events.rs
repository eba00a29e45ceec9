use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use crate::filer::task::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TaskStarted { task_id: TaskId },
    TaskCompleted { task_id: TaskId, status: TaskStatus },
    TaskFailed { task_id: TaskId, error: String },
    ConfigChanged,
}

impl EngineEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskStarted { task_id }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. } => Some(*task_id),
            Self::ConfigChanged => None,
        }
    }

    /// Whether this event closes a task's run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted { .. } | Self::TaskFailed { .. })
    }
}

/// Fan-out of engine events to any number of subscribers. Subscribers whose
/// receiver has been dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(EngineEvent::TaskStarted { task_id: id });

        assert_eq!(a.try_recv().expect("a"), EngineEvent::TaskStarted { task_id: id });
        assert_eq!(b.try_recv().expect("b").task_id(), Some(id));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(EngineEvent::ConfigChanged);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(!kept.try_recv().expect("event").is_terminal());
    }
}
