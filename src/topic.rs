//! Topic name and filter handling.
//!
//! Matching rules:
//! - `+` matches exactly one level, an empty level included.
//! - `#` must be the last level and matches the parent level plus any number
//!   of further levels, so `a/#` matches `a`, `a/b` and `a/b/c`.
//! - A filter starting with a wildcard never matches a topic starting with `$`.
//! - A leading `/` is an empty first level: `/a` is `["", "a"]`, distinct from
//!   `a`, and is never rewritten.

use crate::packet::{MqttError, MqttResult};

/// A topic name, as carried in PUBLISH. Contains no wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName {
    name: String,
}

impl TopicName {
    /// Create a new topic name.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn new(name: impl Into<String>) -> MqttResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self { name })
    }

    /// Validate a topic name.
    pub fn validate(name: &str) -> MqttResult<()> {
        if name.is_empty() {
            return Err(MqttError::InvalidTopicName(
                "Topic name cannot be empty".to_string(),
            ));
        }

        if name.contains('\0') {
            return Err(MqttError::InvalidTopicName(
                "Topic name cannot contain null character".to_string(),
            ));
        }

        if name.contains('+') || name.contains('#') {
            return Err(MqttError::InvalidTopicName(format!(
                "Topic name cannot contain wildcards: {name}"
            )));
        }

        Ok(())
    }

    /// Get the topic name as a string.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Get the topic levels.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }

    /// Check if this topic matches a filter.
    pub fn matches(&self, filter: &TopicFilter) -> bool {
        filter.matches(self)
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// A topic filter, as carried in SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    filter: String,
    levels: Vec<FilterLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FilterLevel {
    Exact(String),
    SingleWildcard,
    MultiWildcard,
}

impl TopicFilter {
    /// Create a new topic filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic filter is invalid.
    pub fn new(filter: impl Into<String>) -> MqttResult<Self> {
        let filter = filter.into();
        Self::validate(&filter)?;

        let levels = filter
            .split('/')
            .map(|level| match level {
                "+" => FilterLevel::SingleWildcard,
                "#" => FilterLevel::MultiWildcard,
                s => FilterLevel::Exact(s.to_string()),
            })
            .collect();

        Ok(Self { filter, levels })
    }

    /// Validate a topic filter.
    pub fn validate(filter: &str) -> MqttResult<()> {
        if filter.is_empty() {
            return Err(MqttError::InvalidTopicFilter(
                "Topic filter cannot be empty".to_string(),
            ));
        }

        if filter.contains('\0') {
            return Err(MqttError::InvalidTopicFilter(
                "Topic filter cannot contain null character".to_string(),
            ));
        }

        let levels: Vec<&str> = filter.split('/').collect();

        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') {
                if *level != "#" {
                    return Err(MqttError::InvalidTopicFilter(format!(
                        "# must occupy entire level: {filter}"
                    )));
                }
                if i != levels.len() - 1 {
                    return Err(MqttError::InvalidTopicFilter(format!(
                        "# must be the last level: {filter}"
                    )));
                }
            }

            if level.contains('+') && *level != "+" {
                return Err(MqttError::InvalidTopicFilter(format!(
                    "+ must occupy entire level: {filter}"
                )));
            }
        }

        Ok(())
    }

    /// Get the topic filter as a string.
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    /// Check if this filter matches a topic name.
    pub fn matches(&self, topic: &TopicName) -> bool {
        self.matches_str(topic.as_str())
    }

    /// Check if this filter matches a raw topic string.
    pub fn matches_str(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && matches!(
                self.levels.first(),
                Some(FilterLevel::SingleWildcard | FilterLevel::MultiWildcard)
            )
        {
            return false;
        }

        let mut filter_iter = self.levels.iter();
        let mut topic_iter = topic.split('/');

        loop {
            match (filter_iter.next(), topic_iter.next()) {
                (None, None) => return true,

                // Covers the parent level too: `a/#` against `a` ends here.
                (Some(FilterLevel::MultiWildcard), _) => return true,

                (None, Some(_)) | (Some(_), None) => return false,

                (Some(FilterLevel::SingleWildcard), Some(_)) => continue,

                (Some(FilterLevel::Exact(f)), Some(t)) => {
                    if f != t {
                        return false;
                    }
                },
            }
        }
    }

    /// Check if this filter contains wildcards.
    pub fn has_wildcards(&self) -> bool {
        self.levels
            .iter()
            .any(|l| matches!(l, FilterLevel::SingleWildcard | FilterLevel::MultiWildcard))
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filter)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.filter
    }
}
