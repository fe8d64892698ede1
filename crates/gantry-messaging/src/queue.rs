use crate::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    interrupted: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// FIFO of inbound messages shared by a transport (producer) and one
/// message processor (consumer).
///
/// `interrupt` wakes a blocked consumer without dropping anything: pending
/// messages stay in place until the queue is `reset` and read again.
#[derive(Clone, Default)]
pub struct MessageQueue {
    shared: Arc<Shared>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self, message: Message) {
        self.lock().messages.push_back(message);
        self.shared.available.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a message is available. Returns `None` once the queue
    /// has been interrupted.
    pub fn take(&self) -> Option<Message> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return None;
            }
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of `take`.
    pub fn try_take(&self) -> Option<Message> {
        let mut state = self.lock();
        if state.interrupted {
            return None;
        }
        state.messages.pop_front()
    }

    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.shared.available.notify_all();
    }

    pub fn reset(&self) {
        self.lock().interrupted = false;
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageQueue")
            .field("pending", &state.messages.len())
            .field("interrupted", &state.interrupted)
            .finish()
    }
}
