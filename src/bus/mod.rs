//! In-process pub/sub bus.
//!
//! One [`Topic`] fans published messages out to every subscribed [`Queue`]
//! whose [`FilterPolicy`] matches the message attributes. Queues are drained
//! by consumers; failed deliveries are redelivered and eventually parked in a
//! [`DeadLetterQueue`].

mod queue;

pub use queue::{DeadLetterQueue, HandlerResult, MessageHandler, Queue, RedrivePolicy, spawn_consumer};

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("queue '{0}' is closed")]
    Closed(String),
}

/// A single message attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    List(Vec<String>),
}

/// Message attributes used for subscription filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(HashMap<String, AttributeValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_string(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_string(), AttributeValue::String(value.to_string()));
    }

    pub fn insert_list(&mut self, name: &str, values: impl IntoIterator<Item = String>) {
        self.0.insert(name.to_string(), AttributeValue::List(values.into_iter().collect()));
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.0.get(name)
    }

    /// True when the attribute exists and its value (or any list element)
    /// is one of `allowed`.
    pub fn matches_any<S: AsRef<str>>(&self, name: &str, allowed: &[S]) -> bool {
        match self.0.get(name) {
            Some(AttributeValue::String(v)) => allowed.iter().any(|a| a.as_ref() == v),
            Some(AttributeValue::List(values)) => values
                .iter()
                .any(|v| allowed.iter().any(|a| a.as_ref() == v)),
            None => false,
        }
    }
}

/// Attribute allow-lists a subscription requires. Every rule must match;
/// an empty policy accepts all messages.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    rules: HashMap<String, Vec<String>>,
}

impl FilterPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, attribute: &str, values: &[&str]) -> Self {
        self.rules
            .entry(attribute.to_string())
            .or_default()
            .extend(values.iter().map(|v| v.to_string()));
        self
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.rules
            .iter()
            .all(|(name, allowed)| attributes.matches_any(name, allowed))
    }
}

/// A message as delivered to a queue consumer.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: String,
    pub body: String,
    pub attributes: Attributes,
    /// Number of times this message has been handed to a consumer.
    pub receive_count: u32,
    pub sent_at: Instant,
}

impl BusMessage {
    pub fn new(body: String, attributes: Attributes) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            body,
            attributes,
            receive_count: 0,
            sent_at: Instant::now(),
        }
    }
}

struct Subscription {
    queue: Queue,
    policy: FilterPolicy,
}

/// Fan-out topic.
pub struct Topic {
    name: String,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, queue: Queue, policy: FilterPolicy) {
        debug!("Subscribing queue '{}' to topic '{}'", queue.name(), self.name);
        self.subscriptions
            .write()
            .expect("subscriptions lock poisoned")
            .push(Subscription { queue, policy });
    }

    /// Deliver a copy of the message to every matching subscription.
    /// Returns the number of queues that received it.
    pub fn publish(&self, body: String, attributes: Attributes) -> usize {
        let subscriptions = self.subscriptions.read().expect("subscriptions lock poisoned");
        let mut delivered = 0;
        for sub in subscriptions.iter().filter(|s| s.policy.matches(&attributes)) {
            match sub.queue.send_message(BusMessage::new(body.clone(), attributes.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Topic '{}' could not deliver: {e}", self.name),
            }
        }
        if delivered == 0 {
            warn!("Topic '{}': no subscriber matched {:?}", self.name, attributes);
        }
        delivered
    }

    pub fn publish_json<T: Serialize>(&self, value: &T, attributes: Attributes) -> Result<usize, BusError> {
        let body = serde_json::to_string(value)?;
        Ok(self.publish(body, attributes))
    }
}
