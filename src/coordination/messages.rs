//! Inter-agent message queue over the shared marker store
//!
//! Each recipient owns a partition `messages/{agent_id}`. Direct messages are
//! written to the recipient's partition; broadcasts are copied into the
//! partition of every agent whose persisted subscriptions match the message
//! type. Record keys start with a monotonic stamp so messages from one sender
//! to one receiver are consumed in publish order.

use crate::file_storage::{decode_record, encode_record, is_readable_version, MarkerStore, RECORD_VERSION};
use crate::utils::{generate_id, lock_mutex_recover, stamp_key, MonotonicStamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MESSAGES_NAMESPACE: &str = "messages";
pub const SUBSCRIPTIONS_NAMESPACE: &str = "subscriptions";

/// Recipient id addressing every subscriber; as a subscription type, matches
/// every message type
pub const BROADCAST: &str = "*";

/// Advisory priority; never changes delivery order
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub version: u32,
    pub id: String,
    pub sender_id: String,
    /// Agent id, or [`BROADCAST`]
    pub recipient_id: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            id: generate_id(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type: message_type.into(),
            payload,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
        }
    }

    /// Message addressed to every subscriber of `message_type`
    pub fn broadcast(sender_id: impl Into<String>, message_type: impl Into<String>, payload: Value) -> Self {
        Self::new(sender_id, BROADCAST, message_type, payload)
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST
    }
}

/// Most urgent first; arrival order is kept within one priority
pub fn sort_by_priority(messages: &mut [Message]) {
    messages.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Drop `agent_id`'s subscriptions and undelivered messages.
///
/// Returns how many pending messages were discarded.
pub(crate) fn purge_mailbox(store: &dyn MarkerStore, agent_id: &str) -> usize {
    if let Err(e) = store.remove(SUBSCRIPTIONS_NAMESPACE, agent_id) {
        log::warn!("Failed to remove subscriptions for {}: {}", agent_id, e);
    }

    let partition = format!("{}/{}", MESSAGES_NAMESPACE, agent_id);
    let keys = store.list(&partition).unwrap_or_else(|e| {
        log::warn!("Failed to list messages for {}: {}", agent_id, e);
        Vec::new()
    });
    let discarded = keys
        .iter()
        .filter(|key| store.remove(&partition, key).unwrap_or(false))
        .count();
    if discarded > 0 {
        log::debug!("Discarded {} undelivered messages for {}", discarded, agent_id);
    }
    discarded
}

/// Persisted set of message types an agent listens to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRecord {
    #[serde(default)]
    version: u32,
    agent_id: String,
    message_types: BTreeSet<String>,
    updated_at: DateTime<Utc>,
}

pub type MessageHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

struct QueueInner {
    store: Arc<dyn MarkerStore>,
    agent_id: String,
    poll_interval: Duration,
    stamp: MonotonicStamp,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    running: AtomicBool,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

/// One agent's view of the message queue. Clones share state.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn MarkerStore>, agent_id: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                agent_id: agent_id.into(),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                stamp: MonotonicStamp::new(),
                handlers: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Accept a message for delivery.
    ///
    /// `true` means the message was written for every current recipient, not
    /// that anyone has consumed it. A broadcast with no subscribers is accepted.
    pub fn publish(&self, message: Message) -> bool {
        if !message.is_broadcast() {
            return self.write_to(&message.recipient_id, &message);
        }

        let recipients: Vec<String> = self
            .subscription_records()
            .into_iter()
            .filter(|record| record.agent_id != message.sender_id)
            .filter(|record| {
                record.message_types.contains(&message.message_type)
                    || record.message_types.contains(BROADCAST)
            })
            .map(|record| record.agent_id)
            .collect();

        log::debug!(
            "Broadcasting {} from {} to {} subscribers",
            message.message_type,
            message.sender_id,
            recipients.len()
        );

        recipients
            .iter()
            .map(|recipient| self.write_to(recipient, &message))
            .fold(true, |all, ok| all && ok)
    }

    fn write_to(&self, recipient: &str, message: &Message) -> bool {
        let key = format!("{}-{}", stamp_key(self.inner.stamp.next()), message.id);
        let namespace = format!("{}/{}", MESSAGES_NAMESPACE, recipient);

        let result = encode_record(message)
            .and_then(|content| self.inner.store.create_if_absent(&namespace, &key, &content));
        match result {
            Ok(true) => true,
            Ok(false) => {
                log::warn!("Message key {} already exists for {}", key, recipient);
                false
            }
            Err(e) => {
                log::warn!("Failed to publish {} to {}: {}", message.id, recipient, e);
                false
            }
        }
    }

    /// Register `handler` for `message_type` ([`BROADCAST`] for all types) and
    /// persist the subscription so broadcasts from other processes reach us
    pub fn subscribe<F>(&self, message_type: &str, handler: F) -> bool
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock_mutex_recover(&self.inner.handlers)
            .entry(message_type.to_string())
            .or_default()
            .push(Arc::new(handler));
        self.persist_subscriptions()
    }

    /// Drop every handler for `message_type`
    pub fn unsubscribe(&self, message_type: &str) -> bool {
        let removed = lock_mutex_recover(&self.inner.handlers)
            .remove(message_type)
            .is_some();
        if removed {
            self.persist_subscriptions();
        }
        removed
    }

    fn persist_subscriptions(&self) -> bool {
        let message_types: BTreeSet<String> = lock_mutex_recover(&self.inner.handlers)
            .keys()
            .cloned()
            .collect();

        let result = if message_types.is_empty() {
            self.inner
                .store
                .remove(SUBSCRIPTIONS_NAMESPACE, &self.inner.agent_id)
                .map(|_| ())
        } else {
            let record = SubscriptionRecord {
                version: RECORD_VERSION,
                agent_id: self.inner.agent_id.clone(),
                message_types,
                updated_at: Utc::now(),
            };
            encode_record(&record).and_then(|content| {
                self.inner
                    .store
                    .replace(SUBSCRIPTIONS_NAMESPACE, &self.inner.agent_id, &content)
            })
        };

        result
            .map_err(|e| log::warn!("Failed to persist subscriptions for {}: {}", self.inner.agent_id, e))
            .is_ok()
    }

    fn subscription_records(&self) -> Vec<SubscriptionRecord> {
        let keys = self.inner.store.list(SUBSCRIPTIONS_NAMESPACE).unwrap_or_else(|e| {
            log::warn!("Failed to list subscriptions: {}", e);
            Vec::new()
        });

        keys.iter()
            .filter_map(|key| match self.inner.store.read(SUBSCRIPTIONS_NAMESPACE, key) {
                Ok(Some(bytes)) => decode_record::<SubscriptionRecord>(&bytes).ok(),
                _ => None,
            })
            .filter(|record| is_readable_version(record.version))
            .collect()
    }

    fn partition(&self) -> String {
        format!("{}/{}", MESSAGES_NAMESPACE, self.inner.agent_id)
    }

    /// Readable pending messages with their keys, oldest first
    fn pending(&self) -> Vec<(String, Message)> {
        let partition = self.partition();
        let keys = self.inner.store.list(&partition).unwrap_or_else(|e| {
            log::warn!("Failed to list messages for {}: {}", self.inner.agent_id, e);
            Vec::new()
        });

        keys.into_iter()
            .filter_map(|key| {
                let bytes = self.inner.store.read(&partition, &key).ok()??;
                match decode_record::<Message>(&bytes) {
                    Ok(message) if is_readable_version(message.version) => Some((key, message)),
                    Ok(message) => {
                        log::debug!("Leaving message {} with newer record version", message.id);
                        None
                    }
                    Err(e) => {
                        log::warn!("Skipping unreadable message {}: {}", key, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Remove a pending record; `true` only for the consumer that removed it
    fn claim(&self, key: &str) -> bool {
        self.inner
            .store
            .remove(&self.partition(), key)
            .unwrap_or_else(|e| {
                log::warn!("Failed to claim message {}: {}", key, e);
                false
            })
    }

    /// Claim and return every pending message without running handlers
    pub fn drain(&self) -> Vec<Message> {
        self.pending()
            .into_iter()
            .filter(|(key, _)| self.claim(key))
            .map(|(_, message)| message)
            .collect()
    }

    /// Dispatch pending messages to subscribed handlers.
    ///
    /// Messages with no matching handler stay queued. Returns how many
    /// messages were delivered.
    pub fn deliver_pending(&self) -> usize {
        let mut delivered = 0;

        for (key, message) in self.pending() {
            let handlers = self.handlers_for(&message.message_type);
            if handlers.is_empty() || !self.claim(&key) {
                continue;
            }

            for handler in handlers {
                match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!(
                        "Handler for {} failed on message {}: {}",
                        message.message_type,
                        message.id,
                        e
                    ),
                    Err(_) => log::error!(
                        "Handler for {} panicked on message {}",
                        message.message_type,
                        message.id
                    ),
                }
            }
            delivered += 1;
        }

        delivered
    }

    fn handlers_for(&self, message_type: &str) -> Vec<MessageHandler> {
        let handlers = lock_mutex_recover(&self.inner.handlers);
        handlers
            .get(message_type)
            .into_iter()
            .chain(handlers.get(BROADCAST))
            .flatten()
            .cloned()
            .collect()
    }

    /// Start the background delivery loop on the current tokio runtime.
    ///
    /// Returns `false` if already running or no runtime is available.
    pub fn start(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No tokio runtime; message loop for {} not started", self.inner.agent_id);
            return false;
        };
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *lock_mutex_recover(&self.inner.stop_tx) = Some(stop_tx);

        let queue = self.clone();
        runtime.spawn(async move {
            let mut interval = tokio::time::interval(queue.inner.poll_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let tick = queue.clone();
                        let delivered = tokio::task::spawn_blocking(move || tick.deliver_pending())
                            .await
                            .unwrap_or(0);
                        if delivered > 0 {
                            log::debug!("Delivered {} messages to {}", delivered, queue.inner.agent_id);
                        }
                    }
                    _ = stop_rx.recv() => {
                        log::debug!("Message loop for {} shutting down", queue.inner.agent_id);
                        break;
                    }
                }
            }
        });

        log::info!("Message loop started for {}", self.inner.agent_id);
        true
    }

    /// Stop the background loop; `false` if it was not running
    pub fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = lock_mutex_recover(&self.inner.stop_tx).take() {
            let _ = tx.try_send(());
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_storage::MemoryMarkerStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn queue(store: &Arc<dyn MarkerStore>, agent_id: &str) -> MessageQueue {
        MessageQueue::new(store.clone(), agent_id, Duration::from_millis(10))
    }

    fn store() -> Arc<dyn MarkerStore> {
        Arc::new(MemoryMarkerStore::new())
    }

    #[test]
    fn test_purge_mailbox_stops_fan_out() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let gone = queue(&store, "agent-gone");
        gone.subscribe("status", |_| Ok(()));
        assert!(sender.publish(Message::broadcast("agent-x", "status", json!(1))));

        assert_eq!(purge_mailbox(store.as_ref(), "agent-gone"), 1);
        assert!(store.list(SUBSCRIPTIONS_NAMESPACE).unwrap().is_empty());

        assert!(sender.publish(Message::broadcast("agent-x", "status", json!(2))));
        assert!(store.list("messages/agent-gone").unwrap().is_empty());
    }

    #[test]
    fn test_direct_messages_are_fifo_per_sender() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let receiver = queue(&store, "agent-y");

        for i in 0..5 {
            assert!(sender.publish(Message::new("agent-x", "agent-y", "progress", json!(i))));
        }

        let payloads: Vec<Value> = receiver.drain().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(receiver.drain().is_empty());
    }

    #[test]
    fn test_handler_errors_and_panics_are_isolated() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let receiver = queue(&store, "agent-y");
        let calls = Arc::new(AtomicUsize::new(0));

        receiver.subscribe("status", |_| Err(anyhow::anyhow!("boom")));
        receiver.subscribe("status", |_| panic!("handler bug"));
        let counter = calls.clone();
        receiver.subscribe("status", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        sender.publish(Message::new("agent-x", "agent-y", "status", json!({})));
        sender.publish(Message::new("agent-x", "agent-y", "status", json!({})));

        assert_eq!(receiver.deliver_pending(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(receiver.deliver_pending(), 0);
    }

    #[test]
    fn test_unhandled_types_stay_queued() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let receiver = queue(&store, "agent-y");
        receiver.subscribe("status", |_| Ok(()));

        sender.publish(Message::new("agent-x", "agent-y", "other", json!(null)));
        assert_eq!(receiver.deliver_pending(), 0);
        assert_eq!(receiver.drain().len(), 1);
    }

    #[test]
    fn test_wildcard_subscription_receives_broadcasts() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let listener = queue(&store, "agent-y");
        listener.subscribe(BROADCAST, |_| Ok(()));

        assert!(sender.publish(Message::broadcast("agent-x", "anything", json!(1))));
        let received = listener.drain();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_broadcast());
    }

    #[test]
    fn test_unsubscribe_stops_broadcast_fan_out() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let listener = queue(&store, "agent-y");

        listener.subscribe("alert", |_| Ok(()));
        assert!(listener.unsubscribe("alert"));
        assert!(!listener.unsubscribe("alert"));

        sender.publish(Message::broadcast("agent-x", "alert", json!(null)));
        assert!(listener.drain().is_empty());
    }

    #[test]
    fn test_sort_by_priority_is_stable() {
        let mut messages = vec![
            Message::new("a", "b", "t", json!(1)),
            Message::new("a", "b", "t", json!(2)).with_priority(MessagePriority::Urgent),
            Message::new("a", "b", "t", json!(3)),
            Message::new("a", "b", "t", json!(4)).with_priority(MessagePriority::Low),
        ];
        sort_by_priority(&mut messages);

        let order: Vec<Value> = messages.into_iter().map(|m| m.payload).collect();
        assert_eq!(order, vec![json!(2), json!(1), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_background_loop_delivers_until_stopped() {
        let store = store();
        let sender = queue(&store, "agent-x");
        let receiver = queue(&store, "agent-y");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        receiver.subscribe("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(receiver.start());
        assert!(!receiver.start());
        assert!(receiver.is_running());

        sender.publish(Message::new("agent-x", "agent-y", "ping", json!(null)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(receiver.stop());
        assert!(!receiver.stop());
        tokio::time::sleep(Duration::from_millis(20)).await;

        sender.publish(Message::new("agent-x", "agent-y", "ping", json!(null)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
