//! Subscription routing.
//!
//! [`TopicTree`] stores subscribers at the trie node of their filter, keyed
//! by `(group, client_id)`. [`Router`] adds per-client bookkeeping and picks
//! one member of every matched shared subscription group.

use bytestring::ByteString;
use itertools::Itertools;

use mqttd_utils::Counter;

use crate::topic::{parse_shared, validate_topic_filter};
use crate::trie::Trie;
use crate::types::{ClientId, DashMap, HashMap, SharedGroup, Subscriber, TopicFilter};
use crate::Result;

pub type SubscriberMap = HashMap<(Option<SharedGroup>, ClientId), Subscriber>;

/// Subscribers matched by one topic.
#[derive(Debug, Default)]
pub struct Matched {
    /// Plain subscriptions, every one receives the message.
    pub subscribers: Vec<Subscriber>,
    /// One entry per `(filter, group)` share, holding all of its members.
    pub shared: Vec<Vec<Subscriber>>,
}

#[derive(Default)]
pub struct TopicTree {
    trie: Trie<SubscriberMap>,
}

impl TopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the subscription of `subscriber.client_id` on
    /// `filter`, which may be a `$share/<group>/<filter>` filter.
    ///
    /// Returns the replaced subscriber, if any.
    pub fn subscribe(&self, filter: &str, subscriber: Subscriber) -> Result<Option<Subscriber>> {
        let (group, filter) = parse_shared(filter)?;
        validate_topic_filter(filter)?;
        let subscriber = subscriber.with_group(group.map(ByteString::from));
        let key = (subscriber.group.clone(), subscriber.client_id.clone());
        Ok(self.trie.update(filter, |subs| subs.insert(key, subscriber)))
    }

    /// Removes the subscription of `client_id` on `filter`. Unknown
    /// subscriptions are ignored.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> Option<Subscriber> {
        let (group, filter) = parse_shared(filter).ok()?;
        let key = (group.map(ByteString::from), ClientId::from(client_id));
        self.trie.remove(filter, |subs| subs.remove(&key)).flatten()
    }

    /// Every subscriber whose filter matches `topic`, shared members included.
    pub fn matches(&self, topic: &str) -> Vec<Subscriber> {
        let mut out = Vec::new();
        self.trie.match_topic(topic, &mut |subs: &SubscriberMap| out.extend(subs.values().cloned()));
        out
    }

    /// Like [`matches`](Self::matches), with shared members grouped per share.
    pub fn matches_grouped(&self, topic: &str) -> Matched {
        let mut matched = Matched::default();
        self.trie.match_topic(topic, &mut |subs: &SubscriberMap| {
            let mut groups: HashMap<&SharedGroup, Vec<Subscriber>> = HashMap::default();
            for sub in subs.values() {
                match sub.group.as_ref() {
                    Some(group) => groups.entry(group).or_default().push(sub.clone()),
                    None => matched.subscribers.push(sub.clone()),
                }
            }
            matched.shared.extend(groups.into_values());
        });
        matched
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }
}

/// Picks one member of a share, preferring online ones.
///
/// Members are tried in random order; if none is online the last one tried
/// is returned so the message is queued for an offline session.
pub fn choice<'a, F>(members: &'a [Subscriber], is_online: &F) -> Option<&'a Subscriber>
where
    F: Fn(&str) -> bool,
{
    let mut candidates = members.iter().collect::<Vec<_>>();
    while !candidates.is_empty() {
        let idx = if candidates.len() == 1 { 0 } else { (rand::random::<u64>() as usize) % candidates.len() };
        let sub = candidates.remove(idx);
        if is_online(&sub.client_id) || candidates.is_empty() {
            return Some(sub);
        }
    }
    None
}

pub struct Router {
    tree: TopicTree,
    relations: DashMap<ClientId, HashMap<TopicFilter, Subscriber>>,
    subscriptions: Counter,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { tree: TopicTree::new(), relations: DashMap::default(), subscriptions: Counter::new() }
    }

    #[inline]
    pub fn tree(&self) -> &TopicTree {
        &self.tree
    }

    pub fn subscribe(&self, filter: &str, subscriber: Subscriber) -> Result<Option<Subscriber>> {
        let client_id = subscriber.client_id.clone();
        let prev = self.tree.subscribe(filter, subscriber.clone())?;
        self.relations.entry(client_id).or_default().insert(TopicFilter::from(filter), subscriber);
        if prev.is_none() {
            self.subscriptions.inc();
        }
        Ok(prev)
    }

    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> Option<Subscriber> {
        let removed = self.tree.unsubscribe(filter, client_id);
        self.relations.remove_if_mut(client_id, |_, filters| {
            filters.remove(filter);
            filters.is_empty()
        });
        if removed.is_some() {
            self.subscriptions.dec();
        }
        removed
    }

    /// Recipients of a publish on `topic`: every plain subscriber plus one
    /// chosen member per matched share.
    pub fn matches<F>(&self, topic: &str, is_online: F) -> Vec<Subscriber>
    where
        F: Fn(&str) -> bool,
    {
        let Matched { mut subscribers, shared } = self.tree.matches_grouped(topic);
        subscribers.extend(shared.iter().filter_map(|members| choice(members, &is_online)).cloned());
        subscribers
    }

    /// Drops every subscription of `client_id`, returning how many there were.
    pub fn remove_client(&self, client_id: &str) -> usize {
        let filters = match self.relations.remove(client_id) {
            Some((_, filters)) => filters,
            None => return 0,
        };
        let mut removed = 0;
        for filter in filters.keys() {
            if self.tree.unsubscribe(filter, client_id).is_some() {
                self.subscriptions.dec();
                removed += 1;
            }
        }
        log::debug!("{:?} removed {} subscriptions", client_id, removed);
        removed
    }

    /// The filters `client_id` is subscribed to, sorted.
    pub fn subscriptions(&self, client_id: &str) -> Vec<(TopicFilter, Subscriber)> {
        self.relations
            .get(client_id)
            .map(|filters| {
                filters.iter().map(|(f, s)| (f.clone(), s.clone())).sorted_by(|a, b| a.0.cmp(&b.0)).collect()
            })
            .unwrap_or_default()
    }

    #[inline]
    pub fn has_subscription(&self, client_id: &str, filter: &str) -> bool {
        self.relations.get(client_id).map(|filters| filters.contains_key(filter)).unwrap_or(false)
    }

    #[inline]
    pub fn counter(&self) -> &Counter {
        &self.subscriptions
    }
}
