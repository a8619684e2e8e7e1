use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::engine::ScriptEngine;

pub type FilterId = i64;

/// A user-authored filter script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub id: FilterId,
    pub name: String,
    pub script: String,
}

impl MessageFilter {
    /// Run this filter against the message currently bound to `engine`.
    pub fn filter_message(
        &self,
        engine: &mut dyn ScriptEngine,
    ) -> Result<FilteringAction, FilteringError> {
        engine.evaluate(self)
    }
}

/// What a filter decided for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilteringAction {
    /// Keep the message, possibly mutated by the filter.
    Accept,
    /// Drop the message.
    Ignore,
}

impl FilteringAction {
    /// Script-visible value of `MSG_ACCEPT`.
    pub const ACCEPT_CODE: i64 = 1;
    /// Script-visible value of `MSG_IGNORE`.
    pub const IGNORE_CODE: i64 = 2;

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            Self::ACCEPT_CODE => Some(Self::Accept),
            Self::IGNORE_CODE => Some(Self::Ignore),
            _ => None,
        }
    }
}

impl std::fmt::Display for FilteringAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// Recoverable failure of a single filter invocation.
#[derive(Debug, Error)]
pub enum FilteringError {
    #[error("filter '{name}' does not compile: {message}")]
    Compile { name: String, message: String },

    #[error("filter '{name}' raised an error: {message}")]
    Runtime { name: String, message: String },

    #[error("filter '{name}' returned '{value}', expected MSG_ACCEPT or MSG_IGNORE")]
    InvalidResult { name: String, value: String },

    #[error("no message is bound to the script engine")]
    NoMessage,
}

/// Which attributes `msg.is_duplicate(..)` compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DuplicateCheck(u32);

impl DuplicateCheck {
    pub const SAME_TITLE: Self = Self(1);
    pub const SAME_URL: Self = Self(2);
    pub const SAME_AUTHOR: Self = Self(4);
    /// Search the whole account instead of only the message's feed.
    pub const ALL_FEEDS: Self = Self(8);

    pub fn from_bits(bits: i64) -> Self {
        Self((bits & 0xF) as u32)
    }

    pub fn bits(self) -> i64 {
        self.0 as i64
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if at least one message attribute is selected.
    pub fn has_attributes(self) -> bool {
        self.0 & 0b0111 != 0
    }
}

impl std::ops::BitOr for DuplicateCheck {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Owner of every live filter.
///
/// Feeds never hold filters directly; they hold [`FilterHandle`]s that are
/// resolved right before each use. Removing a filter here makes all its
/// handles dangle, which the filter chain tolerates.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<FilterId, Arc<MessageFilter>>>,
}

impl FilterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a filter, returning its ID.
    pub fn insert(&self, filter: MessageFilter) -> FilterId {
        let id = filter.id;
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(filter));
        id
    }

    pub fn remove(&self, id: FilterId) -> Option<Arc<MessageFilter>> {
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn get(&self, id: FilterId) -> Option<Arc<MessageFilter>> {
        self.filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<FilterId> {
        let mut ids: Vec<FilterId> = self
            .filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.filters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a handle to `id`. The filter does not need to exist yet.
    pub fn handle(self: &Arc<Self>, id: FilterId) -> FilterHandle {
        FilterHandle {
            id,
            registry: Arc::downgrade(self),
        }
    }
}

/// A possibly dangling reference to a filter in a [`FilterRegistry`].
#[derive(Debug, Clone)]
pub struct FilterHandle {
    id: FilterId,
    registry: Weak<FilterRegistry>,
}

impl FilterHandle {
    pub fn id(&self) -> FilterId {
        self.id
    }

    /// Liveness check: the filter, if it still exists.
    pub fn resolve(&self) -> Option<Arc<MessageFilter>> {
        self.registry.upgrade()?.get(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(id: FilterId) -> MessageFilter {
        MessageFilter {
            id,
            name: format!("filter-{id}"),
            script: "MSG_ACCEPT".into(),
        }
    }

    #[test]
    fn test_handle_dangles_after_remove() {
        let registry = FilterRegistry::new();
        registry.insert(filter(1));
        let handle = registry.handle(1);
        assert_eq!(handle.resolve().map(|f| f.id), Some(1));

        registry.remove(1);
        assert!(handle.resolve().is_none());
    }

    #[test]
    fn test_handle_dangles_after_registry_dropped() {
        let registry = FilterRegistry::new();
        registry.insert(filter(7));
        let handle = registry.handle(7);
        drop(registry);
        assert!(handle.resolve().is_none());
    }

    #[test]
    fn test_insert_replaces_script() {
        let registry = FilterRegistry::new();
        registry.insert(filter(3));
        registry.insert(MessageFilter {
            script: "MSG_IGNORE".into(),
            ..filter(3)
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(3).unwrap().script, "MSG_IGNORE");
    }

    #[test]
    fn test_action_codes() {
        assert_eq!(FilteringAction::from_code(1), Some(FilteringAction::Accept));
        assert_eq!(FilteringAction::from_code(2), Some(FilteringAction::Ignore));
        assert_eq!(FilteringAction::from_code(0), None);
    }

    #[test]
    fn test_duplicate_check_flags() {
        let check = DuplicateCheck::SAME_TITLE | DuplicateCheck::ALL_FEEDS;
        assert!(check.contains(DuplicateCheck::SAME_TITLE));
        assert!(!check.contains(DuplicateCheck::SAME_URL));
        assert!(check.has_attributes());
        assert!(!DuplicateCheck::ALL_FEEDS.has_attributes());
        assert_eq!(DuplicateCheck::from_bits(check.bits()), check);
    }
}
