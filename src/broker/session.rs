//! Per-connection broker state and the retained message store.

use crate::packet::{Publish, QoS, Will};
use crate::topic::TopicFilter;
use std::collections::BTreeMap;

/// An accepted connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) client_id: String,
    pub(crate) will: Option<Will>,
    /// Set once DISCONNECT arrives; the will is then discarded.
    pub(crate) disconnected: bool,
    subscriptions: Vec<(TopicFilter, QoS)>,
}

impl Session {
    pub(crate) fn new(client_id: impl Into<String>, will: Option<Will>) -> Self {
        Self {
            client_id: client_id.into(),
            will,
            disconnected: false,
            subscriptions: Vec::new(),
        }
    }

    /// Add a subscription, replacing one with the same filter.
    pub(crate) fn subscribe(&mut self, filter: TopicFilter, qos: QoS) {
        match self
            .subscriptions
            .iter_mut()
            .find(|(existing, _)| existing.as_str() == filter.as_str())
        {
            Some(entry) => entry.1 = qos,
            None => self.subscriptions.push((filter, qos)),
        }
    }

    pub(crate) fn unsubscribe(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|(existing, _)| existing.as_str() != filter);
        self.subscriptions.len() != before
    }

    /// Highest QoS granted by any subscription matching `topic`.
    pub(crate) fn granted_for(&self, topic: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| filter.matches_str(topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Last retained message per topic.
#[derive(Debug, Default)]
pub(crate) struct RetainedStore {
    messages: BTreeMap<String, Publish>,
}

impl RetainedStore {
    /// Store a retained publish. An empty payload deletes the topic's entry.
    pub(crate) fn store(&mut self, publish: &Publish) {
        if publish.is_retained_delete() {
            self.messages.remove(&publish.topic);
            return;
        }
        let stored = Publish::new(publish.topic.clone(), publish.payload.clone())
            .with_qos(publish.qos)
            .with_retain(true);
        self.messages.insert(publish.topic.clone(), stored);
    }

    pub(crate) fn get(&self, topic: &str) -> Option<&Publish> {
        self.messages.get(topic)
    }

    pub(crate) fn matching<'a>(
        &'a self,
        filter: &'a TopicFilter,
    ) -> impl Iterator<Item = &'a Publish> + 'a {
        self.messages
            .values()
            .filter(move |publish| filter.matches_str(&publish.topic))
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    #[test]
    fn test_subscribe_replaces_same_filter() {
        let mut session = Session::new("c1", None);
        session.subscribe(filter("a/+"), QoS::AtMostOnce);
        session.subscribe(filter("a/+"), QoS::AtLeastOnce);
        assert_eq!(session.subscription_count(), 1);
        assert_eq!(session.granted_for("a/b"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn test_granted_for_takes_highest_match() {
        let mut session = Session::new("c1", None);
        session.subscribe(filter("a/#"), QoS::AtMostOnce);
        session.subscribe(filter("a/b"), QoS::AtLeastOnce);
        assert_eq!(session.granted_for("a/b"), Some(QoS::AtLeastOnce));
        assert_eq!(session.granted_for("a/c"), Some(QoS::AtMostOnce));
        assert_eq!(session.granted_for("b"), None);
    }

    #[test]
    fn test_unsubscribe() {
        let mut session = Session::new("c1", None);
        session.subscribe(filter("x"), QoS::AtMostOnce);
        assert!(session.unsubscribe("x"));
        assert!(!session.unsubscribe("x"));
        assert_eq!(session.granted_for("x"), None);
    }

    #[test]
    fn test_retained_store_and_delete() {
        let mut store = RetainedStore::default();
        store.store(&Publish::new("a/b", "1").with_retain(true));
        store.store(&Publish::new("a/c", "2").with_retain(true));
        assert_eq!(store.len(), 2);

        let f = filter("a/+");
        assert_eq!(store.matching(&f).count(), 2);
        assert!(store.get("a/b").unwrap().retain);

        store.store(&Publish::new("a/b", "").with_retain(true));
        assert_eq!(store.len(), 1);
        assert!(store.get("a/b").is_none());
    }

    #[test]
    fn test_retained_store_replaces_previous() {
        let mut store = RetainedStore::default();
        store.store(&Publish::new("t", "old").with_retain(true));
        store.store(&Publish::new("t", "new").with_qos(QoS::AtLeastOnce).with_retain(true));
        let stored = store.get("t").unwrap();
        assert_eq!(&stored.payload[..], b"new");
        assert_eq!(stored.qos, QoS::AtLeastOnce);
        assert_eq!(stored.message_id, 0);
    }
}
