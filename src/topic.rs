//! Topic filters registered on a session and MQTT wildcard matching.

use heapless::{String, Vec};

/// Maximum length for a single topic string.
pub const MAX_TOPIC_LEN: usize = 128;

/// An owned topic name or filter.
pub type Topic = String<MAX_TOPIC_LEN>;

/// The filters a session has subscribed to.
///
/// The registry owns copies of the filter strings, so callers can build
/// topics on the stack and drop them once `add_topic` returns.
///
/// # Example
///
/// ```ignore
/// let mut registry = TopicRegistry::<4>::new();
/// registry.add_topic("$aws/things/pump-7/shadow/update/accepted");
/// assert!(registry.matches("$aws/things/pump-7/shadow/update/accepted"));
/// ```
#[derive(Default)]
pub struct TopicRegistry<const MAX_TOPICS: usize> {
    topics: Vec<Topic, MAX_TOPICS>,
}

impl<const MAX_TOPICS: usize> TopicRegistry<MAX_TOPICS> {
    /// Create a new empty topic registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the registry by copying the string.
    ///
    /// Returns `true` if successful or already present, `false` if the
    /// registry is full or the filter is too long.
    pub fn add_topic(&mut self, filter: &str) -> bool {
        if self.topics.iter().any(|t| t.as_str() == filter) {
            return true;
        }

        let mut owned = String::new();
        if owned.push_str(filter).is_err() {
            return false;
        }

        self.topics.push(owned).is_ok()
    }

    /// Remove a filter. Returns `false` if it was not registered.
    pub fn remove_topic(&mut self, filter: &str) -> bool {
        match self.topics.iter().position(|t| t.as_str() == filter) {
            Some(index) => {
                self.topics.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether exactly `filter` is registered.
    pub fn contains(&self, filter: &str) -> bool {
        self.topics.iter().any(|t| t.as_str() == filter)
    }

    /// Whether `topic` matches any registered filter.
    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|f| topic_matches(f, topic))
    }

    /// Get an iterator over the registered filters.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|s| s.as_str())
    }

    /// Get the number of registered filters.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Clear all registered filters.
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

/// Copies `s` into an owned [`Topic`], or `None` if it is too long.
pub fn to_topic(s: &str) -> Option<Topic> {
    let mut topic = Topic::new();
    topic.push_str(s).ok()?;
    Some(topic)
}

/// MQTT topic filter matching with `+` (one level) and `#` (trailing levels).
///
/// Topics starting with `$` are only matched by filters that name the `$`
/// level explicitly, so `#` never matches `$aws/...`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
