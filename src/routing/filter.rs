//! MQTT topic filters

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RoutingError {
    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: &'static str },
}

/// A validated subscription filter supporting `+` and `#` wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(filter: impl Into<String>) -> Result<Self, RoutingError> {
        let filter = filter.into();
        let invalid = |reason| RoutingError::InvalidFilter {
            filter: filter.clone(),
            reason,
        };

        if filter.is_empty() {
            return Err(invalid("filter cannot be empty"));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
                return Err(invalid("'#' must occupy the whole last level"));
            }
            if level.contains('+') && *level != "+" {
                return Err(invalid("'+' must occupy a whole level"));
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_wildcards(&self) -> bool {
        self.0.contains('+') || self.0.contains('#')
    }

    /// MQTT 3.1.1 matching rules. `a/#` also matches `a`, and wildcards in
    /// the first level never match `$`-prefixed system topics.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && (self.0.starts_with('+') || self.0.starts_with('#')) {
            return false;
        }

        let mut filter_levels = self.0.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(f), Some(t)) if f == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = RoutingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.0
    }
}
