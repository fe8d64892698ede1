use crate::channel::{application_topic_prefix, Channel};
use crate::config::{MessagingConfig, HTTP_TRANSPORT};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::retry::Backoff;
use crate::transport::MessagingClient;
use crate::{MessagingError, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Client of the gantry HTTP broker.
///
/// Expects a small JSON API, every call a `POST` with a JSON body:
/// - `/connect`, `/disconnect`: `{client}`
/// - `/subscribe`, `/unsubscribe`: `{client, topic}`
/// - `/publish`: `{topic, message}`
/// - `/poll`: `{client, wait_ms}` → `{messages: [...]}`, 404 for unknown clients
/// - `/purge`: `{prefix}`
///
/// A background poller long-polls the broker and feeds the bound queue.
/// When the broker forgets the client (restart), the poller registers again
/// and restores every subscription.
pub struct HttpClient {
    endpoint: Endpoint,
    poll_wait_ms: u64,
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    queue: Mutex<Option<MessageQueue>>,
    subscriptions: Mutex<BTreeSet<String>>,
}

impl Shared {
    fn queue(&self) -> Option<MessageQueue> {
        lock(&self.queue).clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize)]
struct ClientBody<'a> {
    client: &'a str,
}

#[derive(Serialize)]
struct SubscriptionBody<'a> {
    client: &'a str,
    topic: &'a str,
}

#[derive(Serialize)]
struct PublishBody<'a> {
    topic: &'a str,
    message: &'a Message,
}

#[derive(Serialize)]
struct PollBody<'a> {
    client: &'a str,
    wait_ms: u64,
}

#[derive(Serialize)]
struct PurgeBody<'a> {
    prefix: &'a str,
}

#[derive(Deserialize)]
struct PollResponse {
    messages: Vec<Message>,
}

#[derive(Clone)]
struct Endpoint {
    base_url: String,
    client_id: String,
    agent: ureq::Agent,
}

impl Endpoint {
    fn post<B: Serialize>(&self, route: &str, body: &B) -> Result<Vec<u8>, MessagingError> {
        let url = format!("{}/{route}", self.base_url);
        let payload =
            serde_json::to_vec(body).map_err(|e| MessagingError::Serialization(e.to_string()))?;
        let resp = match self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .header("X-Gantry-Protocol", &PROTOCOL_VERSION.to_string())
            .send(&payload[..])
        {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) if route == "poll" => {
                return Err(MessagingError::UnknownClient(self.client_id.clone()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(MessagingError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(MessagingError::Http(e.to_string())),
        };
        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| MessagingError::Http(e.to_string()))?;
        Ok(body)
    }

    fn connect(&self) -> Result<(), MessagingError> {
        self.post("connect", &ClientBody { client: &self.client_id })?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), MessagingError> {
        self.post(
            "subscribe",
            &SubscriptionBody {
                client: &self.client_id,
                topic,
            },
        )?;
        Ok(())
    }

    fn poll(&self, wait_ms: u64) -> Result<Vec<Message>, MessagingError> {
        let body = self.post(
            "poll",
            &PollBody {
                client: &self.client_id,
                wait_ms,
            },
        )?;
        let parsed: PollResponse = serde_json::from_slice(&body)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        Ok(parsed.messages)
    }
}

impl HttpClient {
    pub fn new(config: &MessagingConfig, owner: &str) -> Result<Self, MessagingError> {
        let base_url = config.broker_url()?.to_owned();
        let poll_wait_ms = config.poll_wait_ms()?;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(Self {
            endpoint: Endpoint {
                base_url,
                client_id: format!("{owner}-{}-{nanos}", std::process::id()),
                agent: ureq::Agent::new_with_defaults(),
            },
            poll_wait_ms,
            shared: Arc::new(Shared::default()),
            poller: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.endpoint.client_id
    }

    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MessagingError::NotConnected(self.endpoint.client_id.clone()))
        }
    }
}

impl MessagingClient for HttpClient {
    fn transport_type(&self) -> &str {
        HTTP_TRANSPORT
    }

    fn open_connection(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            return Ok(());
        }
        self.endpoint.connect()?;
        self.shared.connected.store(true, Ordering::SeqCst);

        let endpoint = self.endpoint.clone();
        let shared = Arc::clone(&self.shared);
        let wait_ms = self.poll_wait_ms;
        let handle = std::thread::Builder::new()
            .name("gantry-http-poller".to_owned())
            .spawn(move || poll_loop(&endpoint, &shared, wait_ms))?;
        *lock(&self.poller) = Some(handle);
        info!(
            "connected to broker {} as {}",
            self.endpoint.base_url, self.endpoint.client_id
        );
        Ok(())
    }

    fn close_connection(&self) -> Result<(), MessagingError> {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.shared.subscriptions).clear();
        let result = self
            .endpoint
            .post(
                "disconnect",
                &ClientBody {
                    client: &self.endpoint.client_id,
                },
            )
            .map(|_| ());
        if let Some(handle) = lock(&self.poller).take() {
            if handle.join().is_err() {
                warn!("http poller thread panicked");
            }
        }
        debug!("disconnected {} from broker", self.endpoint.client_id);
        result
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let topic = channel.topic();
        self.endpoint.post(
            "publish",
            &PublishBody {
                topic: &topic,
                message,
            },
        )?;
        debug!("published {} to {topic}", message.kind());
        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let topic = channel.topic();
        self.endpoint.subscribe(&topic)?;
        lock(&self.shared.subscriptions).insert(topic);
        Ok(())
    }

    fn unsubscribe(&self, channel: &Channel) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        let topic = channel.topic();
        self.endpoint.post(
            "unsubscribe",
            &SubscriptionBody {
                client: &self.endpoint.client_id,
                topic: &topic,
            },
        )?;
        lock(&self.shared.subscriptions).remove(&topic);
        Ok(())
    }

    fn set_message_queue(&self, queue: MessageQueue) {
        *lock(&self.shared.queue) = Some(queue);
    }

    fn delete_messaging_server_artifacts(&self, application: &str) -> Result<(), MessagingError> {
        let prefix = application_topic_prefix(application);
        self.endpoint.post("purge", &PurgeBody { prefix: &prefix })?;
        Ok(())
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        if let Err(e) = self.close_connection() {
            debug!("close on drop failed: {e}");
        }
    }
}

const IDLE_SLICE: Duration = Duration::from_millis(50);

/// Sleep up to `total`, returning early once the client disconnects.
fn sleep_while_connected(shared: &Shared, total: Duration) {
    let deadline = Instant::now() + total;
    while shared.is_connected() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(IDLE_SLICE.min(deadline - now));
    }
}

fn poll_loop(endpoint: &Endpoint, shared: &Shared, wait_ms: u64) {
    let backoff = Backoff::default();
    let mut failures: u32 = 0;
    while shared.is_connected() {
        // Messages wait in the broker mailbox until someone can take them.
        let Some(queue) = shared.queue() else {
            sleep_while_connected(shared, IDLE_SLICE);
            continue;
        };
        match endpoint.poll(wait_ms) {
            Ok(messages) => {
                failures = 0;
                for message in messages {
                    queue.store(message);
                }
            }
            Err(MessagingError::UnknownClient(id)) => {
                warn!("broker no longer knows {id}, registering again");
                if let Err(e) = reregister(endpoint, shared) {
                    failures += 1;
                    warn!("re-registration failed: {e}");
                    sleep_while_connected(shared, backoff.delay(failures));
                }
            }
            Err(e) => {
                if !shared.is_connected() {
                    break;
                }
                failures += 1;
                let delay = backoff.delay(failures);
                warn!("poll failed ({e}), retrying in {delay:?}");
                sleep_while_connected(shared, delay);
            }
        }
    }
}

fn reregister(endpoint: &Endpoint, shared: &Shared) -> Result<(), MessagingError> {
    endpoint.connect()?;
    let topics: Vec<String> = lock(&shared.subscriptions).iter().cloned().collect();
    for topic in &topics {
        endpoint.subscribe(topic)?;
    }
    info!("restored {} subscription(s)", topics.len());
    Ok(())
}
