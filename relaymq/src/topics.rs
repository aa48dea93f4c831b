// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide subscription registry, publish fan-out lookup and retained
//! message store.
//!
//! Sessions register once to obtain a [`SubscriberHandle`], a stable identity
//! token carrying the typed capability to receive fan-out publishes. Handles
//! are what the manager hands back from [`TopicManager::subscribers`]; they
//! never expose the owning session.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::control_packet::{min_qos, Publish, QoS};
use crate::topic::{TopicFilter, TopicName, TopicParseError};

/// Error raised by [`TopicManager`] operations.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// The topic filter does not parse.
    #[error("invalid topic filter: {0}")]
    InvalidFilter(#[source] TopicParseError),
    /// The topic name does not parse.
    #[error("invalid topic name: {0}")]
    InvalidTopic(#[source] TopicParseError),
    /// The subscriber holds no subscription for this filter.
    #[error("no subscription on {filter} for subscriber {id:?}")]
    NoSuchSubscription {
        /// The topic filter that was being unsubscribed
        filter: String,
        /// The subscriber that held no subscription
        id: SubscriberId,
    },
}

/// Error raised when delivering a publish to a subscriber.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The subscriber's delivery capability has gone away.
    #[error("subscriber {0:?} can no longer receive publishes")]
    InvalidSubscriber(SubscriberId),
}

/// Stable identity of a subscriber registered with the topic manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A subscriber's identity together with its delivery capability.
#[derive(Clone, Debug)]
pub struct SubscriberHandle {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Publish>,
}

impl SubscriberHandle {
    /// The stable identity of this subscriber.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Hand a publish to the subscriber.
    ///
    /// # Errors
    /// [`DeliveryError::InvalidSubscriber`] if the receiving side has gone.
    pub fn deliver(&self, publish: Publish) -> Result<(), DeliveryError> {
        self.tx
            .send(publish)
            .map_err(|_| DeliveryError::InvalidSubscriber(self.id))
    }
}

/// A single subscription held under a topic filter.
struct Subscription {
    handle: SubscriberHandle,
    granted: QoS,
}

/// All subscriptions sharing one topic filter.
struct FilterEntry {
    filter: TopicFilter,
    subscribers: Vec<Subscription>,
}

/// The last retained publish on a topic, with its parsed topic name.
struct RetainedMessage {
    topic: TopicName,
    publish: Publish,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, FilterEntry>,
    retained: HashMap<String, RetainedMessage>,
}

/// Process-wide subscription and retained-message registry.
///
/// Shared by every session; all operations are internally synchronized.
pub struct TopicManager {
    /// Highest QoS this manager will grant on subscribe
    max_granted_qos: QoS,
    next_subscriber_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl TopicManager {
    /// Create a manager with the default granted-QoS cap of
    /// [`QoS::AtLeastOnce`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_granted_qos(QoS::AtLeastOnce)
    }

    /// Create a manager granting subscriptions up to `max_granted_qos`.
    #[must_use]
    pub fn with_max_granted_qos(max_granted_qos: QoS) -> Self {
        Self {
            max_granted_qos,
            next_subscriber_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a new subscriber.
    ///
    /// Returns its handle and the receiving end of its delivery capability.
    #[must_use]
    pub fn register(&self) -> (SubscriberHandle, mpsc::UnboundedReceiver<Publish>) {
        let id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriberHandle { id, tx }, rx)
    }

    /// Add (or update) a subscription, returning the granted QoS.
    ///
    /// Re-subscribing to the same filter replaces the granted level.
    ///
    /// # Errors
    /// [`SubscribeError::InvalidFilter`] if the filter does not parse.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handle: &SubscriberHandle,
    ) -> Result<QoS, SubscribeError> {
        let parsed = TopicFilter::from_str(filter).map_err(SubscribeError::InvalidFilter)?;
        let granted = min_qos(qos, self.max_granted_qos);

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .subscriptions
            .entry(filter.to_string())
            .or_insert_with(|| FilterEntry {
                filter: parsed,
                subscribers: Vec::new(),
            });
        if let Some(existing) = entry
            .subscribers
            .iter_mut()
            .find(|s| s.handle.id() == handle.id())
        {
            existing.granted = granted;
            existing.handle = handle.clone();
        } else {
            entry.subscribers.push(Subscription {
                handle: handle.clone(),
                granted,
            });
        }
        log::debug!("subscriber {:?} on {filter} granted {granted:?}", handle.id());
        Ok(granted)
    }

    /// Remove a subscription.
    ///
    /// # Errors
    /// [`SubscribeError::NoSuchSubscription`] if the subscriber holds no
    /// subscription for this filter.
    pub fn unsubscribe(&self, filter: &str, id: SubscriberId) -> Result<(), SubscribeError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.subscriptions.get_mut(filter) else {
            return Err(SubscribeError::NoSuchSubscription {
                filter: filter.to_string(),
                id,
            });
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.handle.id() != id);
        if entry.subscribers.len() == before {
            return Err(SubscribeError::NoSuchSubscription {
                filter: filter.to_string(),
                id,
            });
        }
        if entry.subscribers.is_empty() {
            inner.subscriptions.remove(filter);
        }
        Ok(())
    }

    /// Look up the subscribers a publish on `topic` fans out to.
    ///
    /// Each matching subscriber appears once, with its delivery QoS downgraded
    /// to `min(qos, granted)`; a subscriber matched through several filters
    /// keeps the highest granted level.
    ///
    /// # Errors
    /// [`SubscribeError::InvalidTopic`] if the topic name does not parse.
    pub fn subscribers(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<Vec<(SubscriberHandle, QoS)>, SubscribeError> {
        let name = TopicName::from_str(topic).map_err(SubscribeError::InvalidTopic)?;
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(SubscriberHandle, QoS)> = Vec::new();
        for entry in inner.subscriptions.values() {
            if !entry.filter.matches_topic_name(&name) {
                continue;
            }
            for sub in &entry.subscribers {
                let downgraded = min_qos(qos, sub.granted);
                match out.iter_mut().find(|(h, _)| h.id() == sub.handle.id()) {
                    Some((_, existing)) => {
                        if (downgraded as u8) > (*existing as u8) {
                            *existing = downgraded;
                        }
                    }
                    None => out.push((sub.handle.clone(), downgraded)),
                }
            }
        }
        Ok(out)
    }

    /// Store, replace or delete the retained message for a topic.
    ///
    /// An empty payload deletes any retained message; a non-empty payload
    /// replaces it.
    ///
    /// # Errors
    /// [`SubscribeError::InvalidTopic`] if the publish topic does not parse.
    pub fn retain(&self, publish: &Publish) -> Result<(), SubscribeError> {
        let topic = TopicName::from_str(&publish.topic).map_err(SubscribeError::InvalidTopic)?;
        let mut inner = self.inner.lock().unwrap();
        if publish.payload.is_empty() {
            inner.retained.remove(&publish.topic);
            log::debug!("retained message on {} deleted", publish.topic);
        } else {
            inner.retained.insert(
                publish.topic.clone(),
                RetainedMessage {
                    topic,
                    publish: publish.clone(),
                },
            );
            log::debug!("retained message on {} stored", publish.topic);
        }
        Ok(())
    }

    /// Collect the retained messages whose topics match `filter`.
    ///
    /// # Errors
    /// [`SubscribeError::InvalidFilter`] if the filter does not parse.
    pub fn retained(&self, filter: &str) -> Result<Vec<Publish>, SubscribeError> {
        let parsed = TopicFilter::from_str(filter).map_err(SubscribeError::InvalidFilter)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .retained
            .values()
            .filter(|retained| parsed.matches_topic_name(&retained.topic))
            .map(|retained| retained.publish.clone())
            .collect())
    }
}

impl Default for TopicManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str, qos: QoS, payload: &[u8]) -> Publish {
        Publish::new(topic, qos, payload)
    }

    #[test]
    fn granted_qos_is_capped_by_manager_policy() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        let granted = manager
            .subscribe("a/b", QoS::ExactlyOnce, &handle)
            .unwrap();
        assert_eq!(granted, QoS::AtLeastOnce);

        let manager = TopicManager::with_max_granted_qos(QoS::ExactlyOnce);
        let (handle, _rx) = manager.register();
        let granted = manager
            .subscribe("a/b", QoS::ExactlyOnce, &handle)
            .unwrap();
        assert_eq!(granted, QoS::ExactlyOnce);
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        assert!(matches!(
            manager.subscribe("a/#/b", QoS::AtMostOnce, &handle),
            Err(SubscribeError::InvalidFilter(_))
        ));
    }

    #[test]
    fn resubscribe_replaces_granted_level() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        manager.subscribe("a/b", QoS::AtLeastOnce, &handle).unwrap();
        manager.subscribe("a/b", QoS::AtMostOnce, &handle).unwrap();

        let subs = manager.subscribers("a/b", QoS::AtLeastOnce).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].1, QoS::AtMostOnce);
    }

    #[test]
    fn fanout_downgrades_to_publisher_qos() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        manager.subscribe("a/+", QoS::AtLeastOnce, &handle).unwrap();

        let subs = manager.subscribers("a/b", QoS::AtMostOnce).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].1, QoS::AtMostOnce);
    }

    #[test]
    fn overlapping_filters_deliver_once_at_highest_grant() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        manager.subscribe("a/#", QoS::AtMostOnce, &handle).unwrap();
        manager.subscribe("a/b", QoS::AtLeastOnce, &handle).unwrap();

        let subs = manager.subscribers("a/b", QoS::AtLeastOnce).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0.id(), handle.id());
        assert_eq!(subs[0].1, QoS::AtLeastOnce);
    }

    #[test]
    fn unsubscribe_removes_the_subscription() {
        let manager = TopicManager::new();
        let (handle, _rx) = manager.register();
        manager.subscribe("a/b", QoS::AtLeastOnce, &handle).unwrap();

        manager.unsubscribe("a/b", handle.id()).unwrap();
        assert!(manager.subscribers("a/b", QoS::AtLeastOnce).unwrap().is_empty());

        assert!(matches!(
            manager.unsubscribe("a/b", handle.id()),
            Err(SubscribeError::NoSuchSubscription { .. })
        ));
    }

    #[test]
    fn retained_messages_replace_and_delete() {
        let manager = TopicManager::new();

        manager
            .retain(&publish("a/b", QoS::AtLeastOnce, b"first"))
            .unwrap();
        manager
            .retain(&publish("a/b", QoS::AtLeastOnce, b"second"))
            .unwrap();
        let found = manager.retained("a/b").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].payload[..], b"second");

        // Empty payload deletes
        manager.retain(&publish("a/b", QoS::AtLeastOnce, b"")).unwrap();
        assert!(manager.retained("a/b").unwrap().is_empty());
    }

    #[test]
    fn retained_lookup_honors_wildcards() {
        let manager = TopicManager::new();
        manager.retain(&publish("a/b", QoS::AtMostOnce, b"1")).unwrap();
        manager.retain(&publish("a/c", QoS::AtMostOnce, b"2")).unwrap();
        manager.retain(&publish("b/d", QoS::AtMostOnce, b"3")).unwrap();

        let mut topics: Vec<String> = manager
            .retained("a/+")
            .unwrap()
            .into_iter()
            .map(|p| p.topic)
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["a/b".to_string(), "a/c".to_string()]);
    }

    #[test]
    fn delivery_to_dropped_subscriber_is_invalid() {
        let manager = TopicManager::new();
        let (handle, rx) = manager.register();
        drop(rx);
        assert!(matches!(
            handle.deliver(publish("a/b", QoS::AtMostOnce, b"x")),
            Err(DeliveryError::InvalidSubscriber(_))
        ));
    }

    #[tokio::test]
    async fn delivery_reaches_the_registered_receiver() {
        let manager = TopicManager::new();
        let (handle, mut rx) = manager.register();
        manager.subscribe("a/b", QoS::AtLeastOnce, &handle).unwrap();

        let subs = manager.subscribers("a/b", QoS::AtLeastOnce).unwrap();
        subs[0].0.deliver(publish("a/b", QoS::AtLeastOnce, b"x")).unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.topic, "a/b");
        assert_eq!(&delivered.payload[..], b"x");
    }
}
