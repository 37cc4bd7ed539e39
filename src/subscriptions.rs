//! Subscription index, shared by both ends of the fabric.
//!
//! Keys have the form `<sourcePO>.<sourceMailbox>.<major>` or
//! `<sourcePO>.<sourceMailbox>.<major>.<minor>`; the value set maps each
//! subscriber address to a per-side payload (the local mailbox handle in a
//! post office, nothing in the broker). Publish routing probes the full
//! `major.minor` key and the major-only key and unions the results.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::message::major_of;

/// Build the index key for a source address and subscription type.
pub fn subscription_key(source: &str, kind: &str) -> String {
    format!("{source}.{kind}")
}

/// Split an index key back into its source address and subscription type.
pub(crate) fn split_key(key: &str) -> Option<(&str, &str)> {
    let first = key.find('.')?;
    let second = key[first + 1..].find('.')? + first + 1;
    Some((&key[..second], &key[second + 1..]))
}

pub struct SubscriptionIndex<V> {
    inner: Mutex<HashMap<String, HashMap<String, V>>>,
}

impl<V: Clone> SubscriptionIndex<V> {
    pub fn new() -> SubscriptionIndex<V> {
        SubscriptionIndex {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Add `subscriber` under `key`. Re-adding is idempotent (the payload is
    /// replaced).
    pub fn add(&self, key: &str, subscriber: &str, value: V) {
        let mut inner = self.inner.lock().expect("subscription index poisoned");
        inner
            .entry(key.to_string())
            .or_default()
            .insert(subscriber.to_string(), value);
    }

    /// Remove `subscriber` from `key`. Removing an absent entry is a no-op.
    pub fn remove(&self, key: &str, subscriber: &str) {
        let mut inner = self.inner.lock().expect("subscription index poisoned");
        if let Some(bucket) = inner.get_mut(key) {
            bucket.remove(subscriber);
            if bucket.is_empty() {
                inner.remove(key);
            }
        }
    }

    /// Subscribers for a publish from `from` with type `kind`: the union of
    /// the exact-type probe and the major-only probe, one entry per
    /// subscriber address.
    pub fn publish_targets(&self, from: &str, kind: &str) -> Vec<(String, V)> {
        let full = subscription_key(from, kind);
        let major = major_of(&full);

        let inner = self.inner.lock().expect("subscription index poisoned");
        let mut targets: Vec<(String, V)> = Vec::new();
        for key in [full.as_str(), major] {
            if let Some(bucket) = inner.get(key) {
                for (subscriber, value) in bucket {
                    if !targets.iter().any(|(addr, _)| addr == subscriber) {
                        targets.push((subscriber.clone(), value.clone()));
                    }
                }
            }
        }
        targets
    }

    /// Snapshot of every key with its subscriber addresses.
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.inner.lock().expect("subscription index poisoned");
        inner
            .iter()
            .map(|(key, bucket)| (key.clone(), bucket.keys().cloned().collect()))
            .collect()
    }
}

impl<V: Clone> Default for SubscriptionIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_remove_undoes_it() {
        let index: SubscriptionIndex<u32> = SubscriptionIndex::new();
        index.add("alpha.io.sensor", "beta.io", 1);
        index.add("alpha.io.sensor", "beta.io", 1);
        assert_eq!(index.publish_targets("alpha.io", "sensor").len(), 1);

        index.remove("alpha.io.sensor", "beta.io");
        assert!(index.publish_targets("alpha.io", "sensor").is_empty());
        index.remove("alpha.io.sensor", "beta.io");
        assert!(index.entries().is_empty());
    }

    #[test]
    fn publish_probes_both_exact_and_major_keys() {
        let index: SubscriptionIndex<u32> = SubscriptionIndex::new();
        index.add("alpha.io.sensor", "beta.io", 1);
        index.add("alpha.io.sensor.temperature", "gamma.io", 2);

        let targets = index.publish_targets("alpha.io", "sensor.temperature");
        let mut addrs: Vec<&str> = targets.iter().map(|(a, _)| a.as_str()).collect();
        addrs.sort_unstable();
        assert_eq!(addrs, vec!["beta.io", "gamma.io"]);

        // a bare-major publish does not reach the minor-specific subscriber
        let targets = index.publish_targets("alpha.io", "sensor");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "beta.io");
    }

    #[test]
    fn keys_split_back_into_source_and_kind() {
        assert_eq!(
            split_key("alpha.io.sensor.temperature"),
            Some(("alpha.io", "sensor.temperature"))
        );
        assert_eq!(split_key("alpha.io.sensor"), Some(("alpha.io", "sensor")));
        assert_eq!(split_key("alpha.io"), None);
        assert_eq!(split_key("alpha"), None);
    }

    #[test]
    fn duplicate_subscriber_across_probes_delivers_once() {
        let index: SubscriptionIndex<u32> = SubscriptionIndex::new();
        index.add("alpha.io.sensor", "beta.io", 1);
        index.add("alpha.io.sensor.temperature", "beta.io", 1);
        let targets = index.publish_targets("alpha.io", "sensor.temperature");
        assert_eq!(targets.len(), 1);
    }
}
