//! Topic names, topic filters and `$share/<group>/<filter>` parsing.
//!
//! A topic is split on `/` into [`Level`]s. Only the first level may be
//! [`Level::Metadata`] (a `$`-prefixed level such as `$SYS`); root wildcards
//! never match it.

use std::fmt::{self, Write};
use std::ops;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const SHARE_PREFIX: &str = "$share/";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic name `{0}`")]
    InvalidTopic(String),
    #[error("invalid topic filter `{0}`")]
    InvalidFilter(String),
    #[error("invalid level `{0}`")]
    InvalidLevel(String),
}

#[inline]
fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // +
    MultiWildcard,  // #
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => Err(TopicError::InvalidLevel(s.into())),
            _ if is_metadata(s) => Ok(Level::Metadata(s.into())),
            _ => Ok(Level::Normal(s.into())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    fn is_valid(&self) -> bool {
        let last = self.0.len().saturating_sub(1);
        self.0.iter().enumerate().all(|(pos, level)| match level {
            Level::MultiWildcard => pos == last,
            _ => true,
        })
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidFilter(s.into()));
        }
        let mut levels = Vec::new();
        for (pos, l) in s.split('/').enumerate() {
            let level = match Level::from_str(l)? {
                // only the root level carries metadata semantics
                Level::Metadata(v) if pos > 0 => Level::Normal(v),
                level => level,
            };
            levels.push(level);
        }
        let topic = Topic(levels);
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidFilter(s.into()))
        }
    }
}

impl ops::Deref for Topic {
    type Target = [Level];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, level) in self.0.iter().enumerate() {
            if pos > 0 {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// Checks a topic name used in PUBLISH: non-empty, no wildcards, no NUL.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(TopicError::InvalidTopic(topic.into()));
    }
    Ok(())
}

/// Checks a topic filter and returns its parsed form.
#[inline]
pub fn validate_topic_filter(filter: &str) -> Result<Topic, TopicError> {
    if filter.contains('\0') {
        return Err(TopicError::InvalidFilter(filter.into()));
    }
    Topic::from_str(filter)
}

/// Splits `$share/<group>/<filter>` into its group and filter.
///
/// Non-shared filters are returned unchanged with no group.
pub fn parse_shared(filter: &str) -> Result<(Option<&str>, &str), TopicError> {
    let rest = match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => rest,
        None => return Ok((None, filter)),
    };
    match rest.split_once('/') {
        Some((group, filter)) if !group.is_empty() && !group.contains(['+', '#']) && !filter.is_empty() => {
            Ok((Some(group), filter))
        }
        _ => Err(TopicError::InvalidFilter(filter.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("sport/tennis/player1")]
    #[test_case("sport/tennis/#")]
    #[test_case("+/tennis/#")]
    #[test_case("sport/+/player1")]
    #[test_case("#")]
    #[test_case("/finance")]
    #[test_case("$SYS/monitor/+")]
    #[test_case("sport/$SYS")]
    fn test_valid_filter(filter: &str) {
        let topic = validate_topic_filter(filter).unwrap();
        assert_eq!(topic.to_string(), filter);
    }

    #[test_case("")]
    #[test_case("sport/tennis#")]
    #[test_case("sport/tennis/#/ranking")]
    #[test_case("sport+")]
    #[test_case("a/b\0")]
    fn test_invalid_filter(filter: &str) {
        assert!(validate_topic_filter(filter).is_err());
    }

    #[test]
    fn test_topic_name() {
        assert!(validate_topic_name("sensors/room1/temp").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
    }

    #[test]
    fn test_metadata_level() {
        let t: Topic = "$SYS/broker".parse().unwrap();
        assert!(t.levels()[0].is_metadata());
        let t: Topic = "a/$b".parse().unwrap();
        assert_eq!(t.levels()[1], Level::Normal("$b".into()));
        assert_eq!(t.levels()[1].value(), Some("$b"));
    }

    #[test]
    fn test_parse_shared() {
        assert_eq!(parse_shared("$share/g1/a/+").unwrap(), (Some("g1"), "a/+"));
        assert_eq!(parse_shared("a/b").unwrap(), (None, "a/b"));
        assert!(parse_shared("$share/g1").is_err());
        assert!(parse_shared("$share//a").is_err());
        assert!(parse_shared("$share/g+/a").is_err());
    }
}
