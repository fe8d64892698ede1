use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Clients that neither poll nor subscribe for this long are forgotten.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

struct ClientState {
    /// Undelivered messages.
    mailbox: VecDeque<Value>,
    last_active: Instant,
}

impl ClientState {
    fn new() -> Self {
        Self {
            mailbox: VecDeque::new(),
            last_active: Instant::now(),
        }
    }
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, ClientState>,
    /// Topic → subscribed clients.
    topics: BTreeMap<String, BTreeSet<String>>,
    published: u64,
}

impl HubState {
    fn touch(&mut self, client: &str) -> bool {
        match self.clients.get_mut(client) {
            Some(state) => {
                state.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    fn forget(&mut self, client: &str) {
        self.clients.remove(client);
        for subscribers in self.topics.values_mut() {
            subscribers.remove(client);
        }
        self.topics.retain(|_, s| !s.is_empty());
    }

    fn idle_clients(&self, timeout: Duration, now: Instant) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_active) > timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Topic fan-out into per-client mailboxes.
///
/// Messages are opaque JSON values; the hub never inspects them. A
/// publication is copied into the mailbox of every client subscribed to
/// its topic at that moment, and clients drain their mailbox by polling.
///
/// A client that crashed without disconnecting stops polling. Once it has
/// been idle for longer than the idle timeout it is evicted, mailbox and
/// subscriptions included, the next time a publication or sweep runs. The
/// timeout must exceed the longest poll wait.
pub struct Hub {
    state: Mutex<HubState>,
    arrived: Condvar,
    idle_timeout: Duration,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            arrived: Condvar::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct HubStats {
    pub clients: usize,
    pub topics: usize,
    pub published: u64,
    pub queued: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `client`. Reconnecting keeps the existing mailbox.
    pub fn connect(&self, client: &str) {
        let mut state = self.lock();
        if !state.touch(client) {
            state.clients.insert(client.to_owned(), ClientState::new());
        }
        debug!("client {client} connected");
    }

    /// Forget `client`, its mailbox and its subscriptions.
    pub fn disconnect(&self, client: &str) {
        self.lock().forget(client);
        self.arrived.notify_all();
        debug!("client {client} disconnected");
    }

    pub fn is_connected(&self, client: &str) -> bool {
        self.lock().clients.contains_key(client)
    }

    /// Forget every client idle for longer than the idle timeout. Returns
    /// the evicted clients.
    pub fn evict_idle(&self) -> Vec<String> {
        let mut state = self.lock();
        let idle = state.idle_clients(self.idle_timeout, Instant::now());
        for client in &idle {
            state.forget(client);
            info!("evicted idle client {client}");
        }
        idle
    }

    /// Returns `false` when the client is unknown.
    pub fn subscribe(&self, client: &str, topic: &str) -> bool {
        let mut state = self.lock();
        if !state.touch(client) {
            return false;
        }
        state
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(client.to_owned());
        true
    }

    pub fn unsubscribe(&self, client: &str, topic: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(client);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    /// Deliver `message` to every subscriber of `topic`. Returns the number
    /// of mailboxes it landed in.
    pub fn publish(&self, topic: &str, message: &Value) -> usize {
        let mut state = self.lock();
        state.published += 1;
        let subscribers: Vec<String> = state
            .topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let now = Instant::now();
        let mut delivered = 0;
        let mut idle = Vec::new();
        for client in &subscribers {
            let Some(target) = state.clients.get_mut(client) else {
                continue;
            };
            if now.saturating_duration_since(target.last_active) > self.idle_timeout {
                idle.push(client);
                continue;
            }
            target.mailbox.push_back(message.clone());
            delivered += 1;
        }
        for client in idle {
            state.forget(client);
            info!("evicted idle client {client}");
        }
        drop(state);
        if delivered > 0 {
            self.arrived.notify_all();
        }
        delivered
    }

    /// Drain `client`'s mailbox, waiting up to `wait` for something to
    /// arrive. `None` means the client is unknown.
    pub fn poll(&self, client: &str, wait: Duration) -> Option<Vec<Value>> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();
        loop {
            let target = state.clients.get_mut(client)?;
            target.last_active = Instant::now();
            if !target.mailbox.is_empty() {
                return Some(target.mailbox.drain(..).collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Some(Vec::new());
            }
            state = self
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drop every topic whose name starts with `prefix`.
    pub fn purge(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let before = state.topics.len();
        state.topics.retain(|topic, _| !topic.starts_with(prefix));
        before - state.topics.len()
    }

    /// Forget everything, as a freshly started broker would.
    pub fn reset(&self) {
        *self.lock() = HubState::default();
        self.arrived.notify_all();
    }

    pub fn stats(&self) -> HubStats {
        let state = self.lock();
        HubStats {
            clients: state.clients.len(),
            topics: state.topics.len(),
            published: state.published,
            queued: state.clients.values().map(|c| c.mailbox.len()).sum(),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, BTreeSet::len)
    }
}
