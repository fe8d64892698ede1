use crate::channel::{application_topic_prefix, Channel};
use crate::config::IN_MEMORY_TRANSPORT;
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::transport::MessagingClient;
use crate::MessagingError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

type ClientId = u64;

#[derive(Default)]
struct BrokerState {
    next_id: ClientId,
    /// Topic → subscribed clients.
    topics: BTreeMap<String, BTreeSet<ClientId>>,
    /// Connected clients and their bound queue, if any.
    connected: HashMap<ClientId, Option<MessageQueue>>,
    published: u64,
}

/// Process-local topic broker. Clones share the same state, so a DM and
/// its agents created from the same broker can talk to each other.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a client bound to this broker. `owner` is only used in logs.
    pub fn client(&self, owner: &str) -> InMemoryClient {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            state.next_id
        };
        InMemoryClient {
            broker: self.clone(),
            id,
            owner: owner.to_owned(),
            connected: AtomicBool::new(false),
            queue: Mutex::new(None),
        }
    }

    fn connect(&self, id: ClientId, queue: Option<MessageQueue>) {
        self.lock().connected.insert(id, queue);
    }

    fn disconnect(&self, id: ClientId) {
        let mut state = self.lock();
        state.connected.remove(&id);
        for subscribers in state.topics.values_mut() {
            subscribers.remove(&id);
        }
        state.topics.retain(|_, s| !s.is_empty());
    }

    fn bind_queue(&self, id: ClientId, queue: MessageQueue) {
        if let Some(slot) = self.lock().connected.get_mut(&id) {
            *slot = Some(queue);
        }
    }

    fn subscribe(&self, id: ClientId, topic: String) {
        self.lock().topics.entry(topic).or_default().insert(id);
    }

    fn unsubscribe(&self, id: ClientId, topic: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    fn publish(&self, topic: &str, message: &Message) -> usize {
        let mut state = self.lock();
        state.published += 1;
        let Some(subscribers) = state.topics.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for id in subscribers {
            if let Some(Some(queue)) = state.connected.get(id) {
                queue.store(message.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every topic belonging to `application`.
    pub fn purge_application(&self, application: &str) -> usize {
        let prefix = application_topic_prefix(application);
        let mut state = self.lock();
        let before = state.topics.len();
        state.topics.retain(|topic, _| !topic.starts_with(&prefix));
        before - state.topics.len()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.lock()
            .topics
            .get(&channel.topic())
            .map_or(0, BTreeSet::len)
    }

    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }

    pub fn published_count(&self) -> u64 {
        self.lock().published
    }
}

/// A connection to an `InMemoryBroker`.
pub struct InMemoryClient {
    broker: InMemoryBroker,
    id: ClientId,
    owner: String,
    connected: AtomicBool,
    queue: Mutex<Option<MessageQueue>>,
}

impl InMemoryClient {
    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MessagingError::NotConnected(self.owner.clone()))
        }
    }

    fn current_queue(&self) -> Option<MessageQueue> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MessagingClient for InMemoryClient {
    fn transport_type(&self) -> &str {
        IN_MEMORY_TRANSPORT
    }

    fn open_connection(&self) -> Result<(), MessagingError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.broker.connect(self.id, self.current_queue());
            debug!("{}: connected to in-memory broker", self.owner);
        }
        Ok(())
    }

    fn close_connection(&self) -> Result<(), MessagingError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.disconnect(self.id);
            debug!("{}: disconnected from in-memory broker", self.owner);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let delivered = self.broker.publish(&channel.topic(), message);
        trace!(
            "{}: published {} to {channel} ({delivered} subscriber(s))",
            self.owner,
            message.kind()
        );
        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        self.broker.subscribe(self.id, channel.topic());
        Ok(())
    }

    fn unsubscribe(&self, channel: &Channel) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        self.broker.unsubscribe(self.id, &channel.topic());
        Ok(())
    }

    fn set_message_queue(&self, queue: MessageQueue) {
        *self.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue.clone());
        if self.is_connected() {
            self.broker.bind_queue(self.id, queue);
        }
    }

    fn delete_messaging_server_artifacts(&self, application: &str) -> Result<(), MessagingError> {
        let removed = self.broker.purge_application(application);
        debug!("{}: purged {removed} topic(s) of '{application}'", self.owner);
        Ok(())
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        let _ = self.close_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_model::InstancePath;

    fn msg(path: &str) -> Message {
        Message::StopInstance {
            path: InstancePath::parse(path).unwrap(),
        }
    }

    fn connected(broker: &InMemoryBroker, owner: &str) -> (InMemoryClient, MessageQueue) {
        let client = broker.client(owner);
        let queue = MessageQueue::new();
        client.set_message_queue(queue.clone());
        client.open_connection().unwrap();
        (client, queue)
    }

    #[test]
    fn publish_reaches_subscribers_only() {
        let broker = InMemoryBroker::new();
        let (a, qa) = connected(&broker, "a");
        let (b, qb) = connected(&broker, "b");
        let channel = Channel::agent("shop", "vm1");
        a.subscribe(&channel).unwrap();

        b.publish(&channel, &msg("/vm1")).unwrap();
        assert_eq!(qa.try_take(), Some(msg("/vm1")));
        assert!(qb.is_empty());
    }

    #[test]
    fn duplicate_subscription_delivers_once() {
        let broker = InMemoryBroker::new();
        let (a, qa) = connected(&broker, "a");
        let channel = Channel::dm("shop");
        a.subscribe(&channel).unwrap();
        a.subscribe(&channel).unwrap();
        a.publish(&channel, &msg("/x")).unwrap();
        assert_eq!(qa.len(), 1);
    }

    #[test]
    fn closed_client_cannot_publish_and_loses_subscriptions() {
        let broker = InMemoryBroker::new();
        let (a, _) = connected(&broker, "a");
        let channel = Channel::imports("shop", "db");
        a.subscribe(&channel).unwrap();
        assert_eq!(broker.subscriber_count(&channel), 1);

        a.close_connection().unwrap();
        a.close_connection().unwrap();
        assert_eq!(broker.subscriber_count(&channel), 0);
        assert!(matches!(
            a.publish(&channel, &msg("/x")),
            Err(MessagingError::NotConnected(_))
        ));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broker = InMemoryBroker::new();
        let (a, qa) = connected(&broker, "a");
        let channel = Channel::exports("shop", "db");
        a.subscribe(&channel).unwrap();
        a.unsubscribe(&channel).unwrap();
        a.publish(&channel, &msg("/x")).unwrap();
        assert!(qa.is_empty());
    }

    #[test]
    fn purge_is_application_scoped() {
        let broker = InMemoryBroker::new();
        let (a, _) = connected(&broker, "a");
        a.subscribe(&Channel::dm("shop")).unwrap();
        a.subscribe(&Channel::imports("shop", "db")).unwrap();
        a.subscribe(&Channel::dm("blog")).unwrap();
        a.delete_messaging_server_artifacts("shop").unwrap();
        assert_eq!(broker.topic_count(), 1);
        assert_eq!(broker.subscriber_count(&Channel::dm("blog")), 1);
    }

    #[test]
    fn queue_bound_after_connect_receives() {
        let broker = InMemoryBroker::new();
        let client = broker.client("late");
        client.open_connection().unwrap();
        let channel = Channel::dm("shop");
        client.subscribe(&channel).unwrap();
        let queue = MessageQueue::new();
        client.set_message_queue(queue.clone());
        client.publish(&channel, &msg("/x")).unwrap();
        assert_eq!(queue.len(), 1);
    }
}
