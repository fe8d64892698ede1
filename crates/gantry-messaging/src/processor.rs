use crate::message::Message;
use crate::queue::MessageQueue;
use crate::MessagingError;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Role-specific logic that consumes messages one at a time.
pub trait MessageHandler: Send + 'static {
    type Error: Display;

    fn handle(&mut self, message: Message) -> Result<(), Self::Error>;
}

/// Single worker thread draining one endpoint's queue in arrival order.
///
/// A failing or panicking handler is logged and the worker moves on to the
/// next message. Stopping interrupts the queue; messages not yet taken
/// remain queued and are processed after a restart.
pub struct MessageProcessor<H: MessageHandler> {
    name: String,
    queue: MessageQueue,
    handler: Arc<Mutex<H>>,
    processed: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl<H: MessageHandler> MessageProcessor<H> {
    pub fn new(name: &str, handler: H) -> Self {
        Self::with_queue(name, handler, MessageQueue::new())
    }

    pub fn with_queue(name: &str, handler: H, queue: MessageQueue) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            handler: Arc::new(Mutex::new(handler)),
            processed: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue transports should deliver into.
    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    pub fn handler(&self) -> Arc<Mutex<H>> {
        Arc::clone(&self.handler)
    }

    /// Run `f` with the handler locked; waits for an in-flight message.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut guard = lock_handler(&self.handler);
        f(&mut guard)
    }

    pub fn start(&mut self) -> Result<(), MessagingError> {
        if self.worker.is_some() {
            return Err(MessagingError::AlreadyRunning(self.name.clone()));
        }
        self.queue.reset();
        let name = self.name.clone();
        let queue = self.queue.clone();
        let handler = Arc::clone(&self.handler);
        let processed = Arc::clone(&self.processed);
        let worker = std::thread::Builder::new()
            .name(format!("{}-processor", self.name))
            .spawn(move || run(&name, &queue, &handler, &processed))?;
        self.worker = Some(worker);
        debug!("{}: message processor started", self.name);
        Ok(())
    }

    /// Interrupt the worker and wait for it. The message being handled, if
    /// any, completes first.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.queue.interrupt();
        if worker.join().is_err() {
            error!("{}: message processor thread panicked", self.name);
        }
        debug!(
            "{}: message processor stopped, {} message(s) still queued",
            self.name,
            self.queue.len()
        );
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn store_message(&self, message: Message) {
        self.queue.store(message);
    }

    pub fn has_pending_messages(&self) -> bool {
        self.queue.has_pending()
    }

    /// Messages taken off the queue since creation, including failed ones.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }
}

impl<H: MessageHandler> Drop for MessageProcessor<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_handler<H>(handler: &Mutex<H>) -> MutexGuard<'_, H> {
    handler.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run<H: MessageHandler>(
    name: &str,
    queue: &MessageQueue,
    handler: &Mutex<H>,
    processed: &AtomicU64,
) {
    while let Some(message) = queue.take() {
        let kind = message.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            lock_handler(handler).handle(message)
        }));
        match outcome {
            Ok(Ok(())) => debug!("{name}: processed {kind}"),
            Ok(Err(e)) => warn!("{name}: failed to process {kind}: {e}"),
            Err(_) => error!("{name}: handler panicked while processing {kind}"),
        }
        processed.fetch_add(1, Ordering::SeqCst);
    }
}
