//! Topic handler registry
//!
//! Maps exact topic names to the handlers invoked with each inbound payload.
//! Handlers on one topic run in registration order, and a handler registered
//! twice on the same topic (same `Arc`) is only stored once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Callback invoked with the payload text of a message on its topic
pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one registration, usable for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Outcome of [`HandlerRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Stored; `first_for_topic` is set when the topic had no handlers before
    Added { id: HandlerId, first_for_topic: bool },
    /// The same handler was already registered on this topic
    Duplicate(HandlerId),
}

impl Registration {
    pub fn id(self) -> HandlerId {
        match self {
            Registration::Added { id, .. } | Registration::Duplicate(id) => id,
        }
    }
}

/// A registration removed by [`HandlerRegistry::remove`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub topic: String,
    /// No handler is left on the topic
    pub topic_empty: bool,
}

struct Entry {
    id: HandlerId,
    handler: Handler,
}

/// Thread-safe topic to handler-list registry
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    topics: Arc<RwLock<HashMap<String, Vec<Entry>>>>,
    next_id: Arc<AtomicU64>,
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    // Compare data pointers only; vtable pointers are not stable across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to a topic unless that exact handler is already there
    pub fn register(&self, topic: &str, handler: Handler) -> Registration {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let entries = topics.entry(topic.to_string()).or_default();

        if let Some(existing) = entries.iter().find(|e| same_handler(&e.handler, &handler)) {
            debug!(topic, id = %existing.id, "Handler already registered");
            return Registration::Duplicate(existing.id);
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first_for_topic = entries.is_empty();
        entries.push(Entry { id, handler });
        debug!(topic, %id, first_for_topic, "Handler registered");

        Registration::Added {
            id,
            first_for_topic,
        }
    }

    /// Remove one registration by id
    pub fn remove(&self, id: HandlerId) -> Option<Removed> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);

        let topic = topics
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e.id == id))
            .map(|(topic, _)| topic.clone())?;

        let entries = topics.get_mut(&topic)?;
        entries.retain(|e| e.id != id);
        let topic_empty = entries.is_empty();
        if topic_empty {
            topics.remove(&topic);
        }

        Some(Removed { topic, topic_empty })
    }

    /// Handlers registered on an exact topic, in registration order
    ///
    /// Returned as clones so callers invoke them without holding the lock.
    pub fn handlers_for(&self, topic: &str) -> Vec<Handler> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics
            .get(topic)
            .map(|entries| entries.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one handler, sorted
    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_empty(&self) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
        let log = log.clone();
        Arc::new(move |payload: &str| log.lock().unwrap().push(format!("{name}:{payload}")))
    }

    #[test]
    fn test_first_registration_flags_topic() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = registry.register("water/level", recording(&log, "a"));
        let second = registry.register("water/level", recording(&log, "b"));

        assert!(matches!(
            first,
            Registration::Added {
                first_for_topic: true,
                ..
            }
        ));
        assert!(matches!(
            second,
            Registration::Added {
                first_for_topic: false,
                ..
            }
        ));
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.handler_count("water/level"), 2);
    }

    #[test]
    fn test_same_handler_is_deduplicated_per_topic() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recording(&log, "a");

        let first = registry.register("water/level", handler.clone());
        let again = registry.register("water/level", handler.clone());
        assert_eq!(again, Registration::Duplicate(first.id()));
        assert_eq!(registry.handler_count("water/level"), 1);

        // Same handler on another topic is a separate registration
        let other = registry.register("auto-mode", handler);
        assert!(matches!(
            other,
            Registration::Added {
                first_for_topic: true,
                ..
            }
        ));
    }

    #[test]
    fn test_handlers_keep_registration_order() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("water/control", recording(&log, "first"));
        registry.register("water/control", recording(&log, "second"));
        registry.register("water/control", recording(&log, "third"));

        for handler in registry.handlers_for("water/control") {
            handler("ON");
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:ON", "second:ON", "third:ON"]
        );
        assert!(registry.handlers_for("water/level").is_empty());
    }

    #[test]
    fn test_remove_reports_empty_topic() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = registry.register("water/level", recording(&log, "a")).id();
        let b = registry.register("water/level", recording(&log, "b")).id();

        assert_eq!(
            registry.remove(a),
            Some(Removed {
                topic: "water/level".to_string(),
                topic_empty: false
            })
        );
        assert_eq!(
            registry.remove(b),
            Some(Removed {
                topic: "water/level".to_string(),
                topic_empty: true
            })
        );
        assert_eq!(registry.remove(b), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_and_topics() {
        let registry = HandlerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("water/level", recording(&log, "a"));
        registry.register("auto-mode", recording(&log, "b"));
        assert_eq!(registry.topics(), vec!["auto-mode", "water/level"]);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.handler_count("auto-mode"), 0);
    }
}
