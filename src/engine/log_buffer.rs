use crate::model::AgentEvent;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Ordered, bounded history of received events.
///
/// When the history is full the oldest event is evicted. Clones share the
/// same buffer.
#[derive(Clone)]
pub struct LogAccumulator {
    inner: Arc<Mutex<VecDeque<AgentEvent>>>,
    capacity: usize,
}

impl LogAccumulator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AgentEvent>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, event: AgentEvent) {
        let mut logs = self.lock();
        if logs.len() == self.capacity {
            logs.pop_front();
        }
        logs.push_back(event);
    }

    /// Copy of the current history, oldest first.
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Consume `rx` until the channel closes, appending every event.
    ///
    /// Each event is also forwarded to `forward`, if given, after it has been
    /// recorded. A closed forward channel is ignored.
    pub fn spawn(
        &self,
        mut rx: mpsc::Receiver<AgentEvent>,
        forward: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                this.push(ev.clone());
                if let Some(tx) = forward.as_ref() {
                    let _ = tx.send(ev);
                }
            }
        })
    }
}

#[allow(dead_code)]
impl LogAccumulator {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
