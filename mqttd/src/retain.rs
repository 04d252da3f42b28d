//! Retained messages, one per concrete topic.
//!
//! The store is a trie keyed by topic name; lookups walk it with a
//! subscription filter. Expired messages are skipped by [`RetainTree::get`]
//! and removed right after the walk.

use std::time::Duration;

use mqttd_utils::{timestamp_millis, Counter};

use crate::codec::{Property, PropertyId, Publish};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::trie::Trie;
use crate::types::{TimestampMillis, TopicName};
use crate::Result;

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub publish: Publish,
    pub stored_at: TimestampMillis,
    /// Absolute expiry in unix milliseconds, `None` never expires.
    pub expiry_at: Option<TimestampMillis>,
}

impl RetainedMessage {
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiry_at.is_some_and(|at| now >= at)
    }
}

pub struct RetainTree {
    messages: Trie<Option<RetainedMessage>>,
    default_expiry: Option<Duration>,
    retaineds: Counter,
}

impl Default for RetainTree {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RetainTree {
    /// `default_expiry` applies to publishes without a message expiry interval.
    pub fn new(default_expiry: Option<Duration>) -> Self {
        Self { messages: Trie::new(), default_expiry, retaineds: Counter::new() }
    }

    /// Stores `publish` as the retained message of its topic, or removes the
    /// current one when the payload is empty.
    ///
    /// Returns whether a message was replaced or removed.
    pub fn insert(&self, publish: Publish) -> Result<bool> {
        validate_topic_name(&publish.topic)?;
        let topic = publish.topic.clone();
        if publish.payload.is_empty() {
            let removed = self.messages.remove(&topic, |v| v.take()).flatten();
            if removed.is_some() {
                self.retaineds.dec();
            }
            return Ok(removed.is_some());
        }

        let now = timestamp_millis();
        let expiry = publish
            .properties
            .message_expiry_interval()
            .map(|secs| Duration::from_secs(secs as u64))
            .or(self.default_expiry);
        let msg = RetainedMessage {
            publish,
            stored_at: now,
            expiry_at: expiry.map(|d| now.saturating_add(d.as_millis() as i64)),
        };
        let replaced = self.messages.update(&topic, |v| v.replace(msg)).is_some();
        if !replaced {
            self.retaineds.inc();
        }
        Ok(replaced)
    }

    /// Retained messages whose topic matches `filter`.
    ///
    /// The returned publishes keep their retain flag set; the message expiry
    /// interval, when present, is reduced by the time already spent stored.
    pub fn get(&self, filter: &str) -> Result<Vec<Publish>> {
        validate_topic_filter(filter)?;
        let now = timestamp_millis();
        let mut out = Vec::new();
        let mut expired: Vec<TopicName> = Vec::new();
        self.messages.match_filter(filter, &mut |v: &Option<RetainedMessage>| {
            if let Some(msg) = v {
                if msg.is_expired(now) {
                    expired.push(msg.publish.topic.clone());
                } else {
                    out.push(Self::to_publish(msg, now));
                }
            }
        });
        for topic in expired {
            self.purge(&topic, now);
        }
        Ok(out)
    }

    fn to_publish(msg: &RetainedMessage, now: TimestampMillis) -> Publish {
        let mut publish = msg.publish.clone();
        publish.retain = true;
        publish.dup = false;
        publish.packet_id = None;
        if let Some(secs) = publish.properties.message_expiry_interval() {
            let elapsed = ((now - msg.stored_at).max(0) / 1000) as u32;
            publish.properties.remove(PropertyId::MessageExpiryInterval);
            publish.properties.push(Property::MessageExpiryInterval(secs.saturating_sub(elapsed).max(1)));
        }
        publish
    }

    fn purge(&self, topic: &str, now: TimestampMillis) {
        let removed = self
            .messages
            .remove(topic, |v| if v.as_ref().is_some_and(|m| m.is_expired(now)) { v.take() } else { None })
            .flatten();
        if removed.is_some() {
            log::debug!("retained message on {:?} expired", topic);
            self.retaineds.dec();
        }
    }

    /// Drops every expired message, returning how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = timestamp_millis();
        let mut expired: Vec<TopicName> = Vec::new();
        self.messages.for_each(&mut |v: &Option<RetainedMessage>| {
            if let Some(msg) = v.as_ref().filter(|m| m.is_expired(now)) {
                expired.push(msg.publish.topic.clone());
            }
        });
        let count = expired.len();
        for topic in expired {
            self.purge(&topic, now);
        }
        count
    }

    #[inline]
    pub fn counter(&self) -> &Counter {
        &self.retaineds
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::codec::QoS;

    fn publish(topic: &str, payload: &'static str) -> Publish {
        Publish::new(topic, Bytes::from_static(payload.as_bytes()), QoS::AtLeastOnce)
    }

    fn payloads(msgs: &[Publish]) -> Vec<String> {
        let mut v: Vec<String> = msgs.iter().map(|p| String::from_utf8_lossy(&p.payload).to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_replace_and_delete() {
        let retain = RetainTree::default();
        assert!(!retain.insert(publish("a/b", "1")).unwrap());
        assert!(retain.insert(publish("a/b", "2")).unwrap());
        assert_eq!(retain.counter().count(), 1);

        let got = retain.get("a/b").unwrap();
        assert_eq!(payloads(&got), ["2"]);
        assert!(got[0].retain);

        assert!(retain.insert(publish("a/b", "")).unwrap());
        assert!(!retain.insert(publish("a/b", "")).unwrap());
        assert!(retain.get("a/b").unwrap().is_empty());
        assert_eq!(retain.counter().count(), 0);
    }

    #[test]
    fn test_wildcard_lookup() {
        let retain = RetainTree::default();
        for (topic, payload) in [("a", "a"), ("a/b", "ab"), ("a/b/c", "abc"), ("a/x/c", "axc"), ("$SYS/up", "sys")] {
            retain.insert(publish(topic, payload)).unwrap();
        }
        assert_eq!(payloads(&retain.get("a/+/c").unwrap()), ["abc", "axc"]);
        assert_eq!(payloads(&retain.get("a/#").unwrap()), ["a", "ab", "abc", "axc"]);
        assert_eq!(payloads(&retain.get("#").unwrap()), ["a", "ab", "abc", "axc"]);
        assert_eq!(payloads(&retain.get("$SYS/#").unwrap()), ["sys"]);
        assert!(retain.get("a/#/c").is_err());
        assert!(retain.insert(publish("a/+", "x")).is_err());
    }

    #[test]
    fn test_expiry() {
        let retain = RetainTree::default();
        let mut p = publish("t/1", "soon");
        p.properties.push(Property::MessageExpiryInterval(60));
        retain.insert(p).unwrap();
        retain.insert(publish("t/2", "never")).unwrap();

        let got = retain.get("t/1").unwrap();
        assert_eq!(got[0].properties.message_expiry_interval(), Some(60));

        retain.messages.update("t/1", |v| {
            if let Some(m) = v.as_mut() {
                m.expiry_at = Some(timestamp_millis() - 1);
            }
        });
        assert_eq!(payloads(&retain.get("t/#").unwrap()), ["never"]);
        assert_eq!(retain.counter().count(), 1);
        assert_eq!(retain.remove_expired(), 0);
    }

    #[test]
    fn test_default_expiry() {
        let retain = RetainTree::new(Some(Duration::from_secs(0)));
        retain.insert(publish("t", "gone")).unwrap();
        assert!(retain.get("t").unwrap().is_empty());
        assert_eq!(retain.counter().count(), 0);
    }
}
