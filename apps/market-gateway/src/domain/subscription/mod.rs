//! Subscription Deduplication
//!
//! Domain types for sharing one upstream subscription between many
//! subscribers.
//!
//! # Design
//!
//! Every subscribe call is reduced to a canonical [`DedupKey`] built from
//! its sorted, normalized markets, codes, qualified names, namespace and
//! options. The [`SubscriptionTable`] keeps one entry per key holding:
//! - The upstream subscription id (once confirmed)
//! - The callbacks of every attached subscriber
//!
//! The entry's reference count is its number of attached callbacks. An
//! upstream subscription is created when a key gains its first subscriber
//! and torn down when it loses its last.
//!
//! The requested field list is deliberately left out of the key, so
//! subscribers asking for different fields on the same key share one
//! upstream payload.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::schema::local_name;

// =============================================================================
// Types
// =============================================================================

/// Identifier handed to a hub subscriber.
pub type SubscriberId = u64;

/// Identifier of an upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an identifier received from upstream.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-call options of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Field projection; the schema's named fields when `None`.
    pub fields: Option<Vec<String>>,
    /// Bar granularities to stream (empty for ticks).
    pub granularities: Vec<u32>,
}

/// Fully resolved upstream subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Market codes.
    pub markets: Vec<String>,
    /// Instrument codes.
    pub codes: Vec<String>,
    /// Shapes to stream.
    pub qualified_names: Vec<String>,
    /// Namespace of the shapes.
    pub namespace: u32,
    /// Field projection sent upstream.
    pub fields: Vec<String>,
    /// Bar granularities.
    pub granularities: Vec<u32>,
}

// =============================================================================
// Dedup Key
// =============================================================================

/// Canonical identity of equivalent subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

#[derive(Serialize)]
struct KeyParts<'a> {
    markets: BTreeSet<&'a str>,
    codes: BTreeSet<&'a str>,
    qualified_names: BTreeSet<&'a str>,
    namespace: u32,
    granularities: BTreeSet<u32>,
}

impl DedupKey {
    /// Build the key. Order and duplicates in the inputs do not matter.
    #[must_use]
    pub fn new(
        markets: &[String],
        codes: &[String],
        qualified_names: &[String],
        namespace: u32,
        options: &SubscribeOptions,
    ) -> Self {
        let parts = KeyParts {
            markets: normalized(markets),
            codes: normalized(codes),
            qualified_names: qualified_names
                .iter()
                .map(|q| local_name(q.trim()))
                .filter(|q| !q.is_empty())
                .collect(),
            namespace,
            granularities: options.granularities.iter().copied().collect(),
        };
        // Serializing sets of strings and integers cannot fail.
        Self(serde_json::to_string(&parts).unwrap_or_default())
    }

    /// Key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalized(values: &[String]) -> BTreeSet<&str> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect()
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Result of attaching a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// The key already had subscribers; no upstream traffic needed.
    Shared {
        /// Subscribers now attached to the key.
        reference_count: usize,
    },
    /// The key has no upstream subscription yet; one must be made.
    Open,
}

/// Result of detaching a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detachment {
    /// Key the subscriber was attached to.
    pub key: DedupKey,
    /// Subscribers left on the key.
    pub remaining: usize,
    /// Upstream subscription to tear down, set only when `remaining == 0`.
    pub orphaned: Option<SubscriptionId>,
}

#[derive(Debug)]
struct Entry<C> {
    underlying: Option<SubscriptionId>,
    subscribers: HashMap<SubscriberId, C>,
}

/// Dedup entries and the subscribers attached to them.
#[derive(Debug)]
pub struct SubscriptionTable<C> {
    entries: HashMap<DedupKey, Entry<C>>,
    subscriber_keys: HashMap<SubscriberId, DedupKey>,
}

impl<C> Default for SubscriptionTable<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            subscriber_keys: HashMap::new(),
        }
    }
}

impl<C: Clone> SubscriptionTable<C> {
    /// Attach `callback` under `key`.
    ///
    /// Only a key backed by an upstream subscription is shared; a key
    /// without one (new, or cleared by [`Self::clear_underlying`]) asks the
    /// caller to open it.
    pub fn attach(&mut self, key: &DedupKey, subscriber: SubscriberId, callback: C) -> Attachment {
        self.subscriber_keys.insert(subscriber, key.clone());
        let entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            underlying: None,
            subscribers: HashMap::new(),
        });
        entry.subscribers.insert(subscriber, callback);
        if entry.underlying.is_some() {
            Attachment::Shared {
                reference_count: entry.subscribers.len(),
            }
        } else {
            Attachment::Open
        }
    }

    /// Record the upstream subscription backing `key`.
    pub fn set_underlying(&mut self, key: &DedupKey, id: SubscriptionId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.underlying = Some(id);
        }
    }

    /// Forget the upstream subscription backing `key`, keeping its
    /// subscribers attached.
    pub fn clear_underlying(&mut self, key: &DedupKey) -> Option<SubscriptionId> {
        self.entries.get_mut(key)?.underlying.take()
    }

    /// Upstream subscription backing `key`.
    #[must_use]
    pub fn underlying(&self, key: &DedupKey) -> Option<&SubscriptionId> {
        self.entries.get(key)?.underlying.as_ref()
    }

    /// Detach a subscriber. `None` if it is unknown.
    ///
    /// The key's entry is removed together with its last subscriber.
    pub fn detach(&mut self, subscriber: SubscriberId) -> Option<Detachment> {
        let key = self.subscriber_keys.remove(&subscriber)?;
        let entry = self.entries.get_mut(&key)?;
        entry.subscribers.remove(&subscriber);
        let remaining = entry.subscribers.len();
        let orphaned = if remaining == 0 {
            self.entries.remove(&key).and_then(|e| e.underlying)
        } else {
            None
        };
        Some(Detachment {
            key,
            remaining,
            orphaned,
        })
    }

    /// Callbacks attached to `key`.
    #[must_use]
    pub fn callbacks(&self, key: &DedupKey) -> Vec<(SubscriberId, C)> {
        self.entries.get(key).map_or_else(Vec::new, |entry| {
            entry
                .subscribers
                .iter()
                .map(|(id, cb)| (*id, cb.clone()))
                .collect()
        })
    }

    /// Remove keys without subscribers, returning their upstream ids.
    pub fn sweep_orphans(&mut self) -> Vec<(DedupKey, Option<SubscriptionId>)> {
        let orphans: Vec<DedupKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.subscribers.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        orphans
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|e| (key, e.underlying)))
            .collect()
    }

    /// Remove everything, returning every upstream id.
    pub fn drain(&mut self) -> Vec<(DedupKey, Option<SubscriptionId>)> {
        self.subscriber_keys.clear();
        self.entries
            .drain()
            .map(|(key, entry)| (key, entry.underlying))
            .collect()
    }

    /// Key a subscriber is attached to.
    #[must_use]
    pub fn key_of(&self, subscriber: SubscriberId) -> Option<&DedupKey> {
        self.subscriber_keys.get(&subscriber)
    }

    /// Subscribers attached to `key`.
    #[must_use]
    pub fn reference_count(&self, key: &DedupKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.subscribers.len())
    }

    /// Counts for health reporting.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            keys: self.entries.len(),
            subscribers: self.subscriber_keys.len(),
            upstream: self
                .entries
                .values()
                .filter(|e| e.underlying.is_some())
                .count(),
        }
    }
}

/// Subscription counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Distinct dedup keys.
    pub keys: usize,
    /// Attached subscribers.
    pub subscribers: usize,
    /// Keys backed by a confirmed upstream subscription.
    pub upstream: usize,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn key(markets: &[&str], codes: &[&str]) -> DedupKey {
        DedupKey::new(
            &strings(markets),
            &strings(codes),
            &strings(&["SampleQuote"]),
            0,
            &SubscribeOptions::default(),
        )
    }

    #[test]
    fn key_ignores_order_whitespace_and_duplicates() {
        assert_eq!(
            key(&["DCE", "SHFE"], &["i2409", "rb2410"]),
            key(&[" SHFE", "DCE", "DCE"], &["rb2410", "i2409 "])
        );
    }

    #[test]
    fn key_ignores_namespace_prefix_and_fields() {
        let plain = key(&["DCE"], &["i2409"]);
        let prefixed = DedupKey::new(
            &strings(&["DCE"]),
            &strings(&["i2409"]),
            &strings(&["global::SampleQuote"]),
            0,
            &SubscribeOptions {
                fields: Some(strings(&["close"])),
                granularities: Vec::new(),
            },
        );
        assert_eq!(plain, prefixed);
    }

    #[test]
    fn key_varies_with_namespace_and_granularity() {
        let base = key(&["DCE"], &["i2409"]);
        let private = DedupKey::new(
            &strings(&["DCE"]),
            &strings(&["i2409"]),
            &strings(&["SampleQuote"]),
            1,
            &SubscribeOptions::default(),
        );
        let bars = DedupKey::new(
            &strings(&["DCE"]),
            &strings(&["i2409"]),
            &strings(&["SampleQuote"]),
            0,
            &SubscribeOptions {
                fields: None,
                granularities: vec![60],
            },
        );
        assert_ne!(base, private);
        assert_ne!(base, bars);
    }

    #[test]
    fn attach_opens_then_shares() {
        let mut table = SubscriptionTable::default();
        let k = key(&["DCE"], &["i2409"]);
        assert_eq!(table.attach(&k, 1, "a"), Attachment::Open);
        table.set_underlying(&k, SubscriptionId::new("sub-1"));
        assert_eq!(
            table.attach(&k, 2, "b"),
            Attachment::Shared { reference_count: 2 }
        );
        assert_eq!(table.reference_count(&k), 2);
    }

    #[test]
    fn cleared_underlying_reopens_on_next_attach() {
        let mut table = SubscriptionTable::default();
        let k = key(&["DCE"], &["i2409"]);
        table.attach(&k, 1, "a");
        table.set_underlying(&k, SubscriptionId::new("dead"));

        assert_eq!(table.clear_underlying(&k), Some(SubscriptionId::new("dead")));
        assert_eq!(table.attach(&k, 2, "b"), Attachment::Open);
        assert_eq!(table.reference_count(&k), 2);
        assert_eq!(table.stats().upstream, 0);
    }

    #[test]
    fn detach_last_subscriber_orphans_underlying() {
        let mut table = SubscriptionTable::default();
        let k = key(&["DCE"], &["i2409"]);
        table.attach(&k, 1, ());
        table.attach(&k, 2, ());
        table.set_underlying(&k, SubscriptionId::new("sub-1"));

        let first = table.detach(1).unwrap();
        assert_eq!(first.remaining, 1);
        assert_eq!(first.orphaned, None);

        let last = table.detach(2).unwrap();
        assert_eq!(last.remaining, 0);
        assert_eq!(last.orphaned, Some(SubscriptionId::new("sub-1")));
        assert!(table.detach(2).is_none());
        assert_eq!(table.stats(), SubscriptionStats::default());
    }

    #[test]
    fn drain_returns_every_underlying() {
        let mut table = SubscriptionTable::default();
        let a = key(&["DCE"], &["i2409"]);
        let b = key(&["SHFE"], &["rb2410"]);
        table.attach(&a, 1, ());
        table.attach(&b, 2, ());
        table.set_underlying(&a, SubscriptionId::new("a"));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.key_of(1).is_none());
    }

    proptest! {
        #[test]
        fn key_is_permutation_invariant(
            mut markets in proptest::collection::vec("[A-Z]{2,5}", 1..6),
            mut codes in proptest::collection::vec("[a-z]{1,3}[0-9]{4}", 1..6),
        ) {
            let before = DedupKey::new(&markets, &codes, &strings(&["SampleQuote"]), 0, &SubscribeOptions::default());
            markets.reverse();
            codes.rotate_left(1);
            let after = DedupKey::new(&markets, &codes, &strings(&["SampleQuote"]), 0, &SubscribeOptions::default());
            prop_assert_eq!(before, after);
        }
    }
}
