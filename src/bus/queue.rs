//! Queues, redrive and dead letters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Attributes, BusError, BusMessage};

/// How long parked messages stay in a dead-letter queue.
const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(3 * 24 * 3600);

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Consumer callback for a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> HandlerResult;
}

/// Where failing messages go.
#[derive(Clone)]
pub struct RedrivePolicy {
    pub dead_letter: DeadLetterQueue,
    /// Deliveries after which a failing message is parked.
    pub max_receive_count: u32,
    /// Delay before a failed message is redelivered.
    pub visibility_timeout: Duration,
}

struct QueueInner {
    name: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<BusMessage>>,
    pending: AtomicUsize,
    redrive: Option<RedrivePolicy>,
}

/// Named FIFO queue. Cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub fn new(name: &str) -> Self {
        Self::build(name, None)
    }

    pub fn with_redrive(name: &str, policy: RedrivePolicy) -> Self {
        Self::build(name, Some(policy))
    }

    fn build(name: &str, redrive: Option<RedrivePolicy>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                tx,
                rx: Mutex::new(rx),
                pending: AtomicUsize::new(0),
                redrive,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Messages waiting to be received.
    pub fn len(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn send(&self, body: String) -> Result<(), BusError> {
        self.send_message(BusMessage::new(body, Attributes::new()))
    }

    pub fn send_message(&self, message: BusMessage) -> Result<(), BusError> {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.tx.send(message).map_err(|_| {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            BusError::Closed(self.inner.name.clone())
        })
    }

    /// Enqueue `body` once `delay` has elapsed.
    pub fn send_delayed(&self, body: String, delay: Duration) {
        self.send_message_delayed(BusMessage::new(body, Attributes::new()), delay);
    }

    fn send_message_delayed(&self, message: BusMessage, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.send_message(message) {
                warn!("Delayed send dropped: {e}");
            }
        });
    }

    /// Wait for the next message. Increments its receive count.
    pub async fn receive(&self) -> Option<BusMessage> {
        let mut rx = self.inner.rx.lock().await;
        let mut message = rx.recv().await?;
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        message.receive_count += 1;
        Some(message)
    }

    /// Take the next message if one is ready and no consumer holds the queue.
    #[cfg(test)]
    pub(crate) fn try_receive(&self) -> Option<BusMessage> {
        let mut rx = self.inner.rx.try_lock().ok()?;
        let mut message = rx.try_recv().ok()?;
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        message.receive_count += 1;
        Some(message)
    }

    /// Apply the redrive policy to a message whose handler failed.
    pub fn fail(&self, message: BusMessage) {
        let Some(ref policy) = self.inner.redrive else {
            error!("Queue '{}': dropping failed message {}", self.inner.name, message.id);
            return;
        };
        if message.receive_count >= policy.max_receive_count {
            warn!(
                "Queue '{}': message {} failed {} time(s), moving to '{}'",
                self.inner.name,
                message.id,
                message.receive_count,
                policy.dead_letter.name()
            );
            policy.dead_letter.park(message, self.clone());
        } else {
            info!(
                "Queue '{}': redelivering message {} in {:?}",
                self.inner.name, message.id, policy.visibility_timeout
            );
            self.send_message_delayed(message, policy.visibility_timeout);
        }
    }
}

struct DeadLetter {
    message: BusMessage,
    source: Queue,
    parked_at: Instant,
}

/// Parking lot for messages that exhausted their deliveries.
#[derive(Clone)]
pub struct DeadLetterQueue {
    name: String,
    letters: Arc<StdMutex<VecDeque<DeadLetter>>>,
    retention: Duration,
}

impl DeadLetterQueue {
    pub fn new(name: &str) -> Self {
        Self::with_retention(name, DEAD_LETTER_RETENTION)
    }

    pub fn with_retention(name: &str, retention: Duration) -> Self {
        Self {
            name: name.to_string(),
            letters: Arc::new(StdMutex::new(VecDeque::new())),
            retention,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.evict_expired();
        self.letters.lock().expect("dead letters lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn park(&self, message: BusMessage, source: Queue) {
        self.letters
            .lock()
            .expect("dead letters lock poisoned")
            .push_back(DeadLetter {
                message,
                source,
                parked_at: Instant::now(),
            });
    }

    #[cfg(test)]
    pub(crate) fn park_for_test(&self, source: &Queue, body: &str) {
        self.park(BusMessage::new(body.to_string(), Attributes::new()), source.clone());
    }

    fn evict_expired(&self) {
        let mut letters = self.letters.lock().expect("dead letters lock poisoned");
        let before = letters.len();
        letters.retain(|l| l.parked_at.elapsed() < self.retention);
        let evicted = before - letters.len();
        if evicted > 0 {
            info!("Dead-letter queue '{}': dropped {} expired message(s)", self.name, evicted);
        }
    }

    /// Move every retained message back to the queue it failed on, with a
    /// fresh receive count. Returns how many were moved.
    pub fn redrive(&self) -> usize {
        self.evict_expired();
        let drained: Vec<DeadLetter> = self
            .letters
            .lock()
            .expect("dead letters lock poisoned")
            .drain(..)
            .collect();

        let mut moved = 0;
        for letter in drained {
            let mut message = letter.message;
            message.receive_count = 0;
            match letter.source.send_message(message) {
                Ok(()) => moved += 1,
                Err(e) => warn!("Redrive to '{}' failed: {e}", letter.source.name()),
            }
        }
        info!("Dead-letter queue '{}': redrove {} message(s)", self.name, moved);
        moved
    }
}

/// Drain `queue` with at most `concurrency` handlers in flight.
pub fn spawn_consumer(queue: Queue, handler: Arc<dyn MessageHandler>, concurrency: usize) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    tokio::spawn(async move {
        info!("Consumer started for queue '{}'", queue.name());
        while let Some(message) = queue.receive().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let handler = handler.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let result = handler.handle(&message).await;
                drop(permit);
                if let Err(e) = result {
                    error!("Queue '{}': handler failed for {}: {e}", queue.name(), message.id);
                    queue.fail(message);
                }
            });
        }
        info!("Consumer stopped for queue '{}'", queue.name());
    })
}
