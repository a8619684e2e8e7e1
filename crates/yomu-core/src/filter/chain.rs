use std::time::Instant;

use tracing::{debug, error, warn};

use crate::filter::engine::ScriptEngine;
use crate::filter::models::{FilterHandle, FilteringAction};
use crate::models::Message;

/// Run every message through the filter chain, keeping survivors in order.
///
/// Dangling handles are removed from `filters` as they are found, so later
/// messages of the same batch skip them.
pub fn filter_messages(
    engine: &mut dyn ScriptEngine,
    filters: &mut Vec<FilterHandle>,
    messages: Vec<Message>,
) -> Vec<Message> {
    let mut kept = Vec::with_capacity(messages.len());
    for message in messages {
        if let Some(message) = filter_message(engine, filters, message) {
            kept.push(message);
        }
    }
    kept
}

/// Evaluate the chain front-to-back for one message.
///
/// Returns `None` as soon as a filter ignores the message; remaining filters
/// are not invoked. A failing filter counts as accepting.
pub fn filter_message(
    engine: &mut dyn ScriptEngine,
    filters: &mut Vec<FilterHandle>,
    message: Message,
) -> Option<Message> {
    engine.bind_message(message);

    let mut decision = FilteringAction::Accept;
    let mut i = 0;
    while i < filters.len() {
        let Some(filter) = filters[i].resolve() else {
            warn!(
                filter_id = filters[i].id(),
                "Message filter was deleted, removing it from the chain"
            );
            filters.remove(i);
            continue;
        };
        i += 1;

        let started = Instant::now();
        match filter.filter_message(engine) {
            Ok(FilteringAction::Accept) => {}
            Ok(FilteringAction::Ignore) => {
                decision = FilteringAction::Ignore;
            }
            Err(e) => {
                error!(filter = %filter.name, error = %e, "Filter failed, accepting message");
            }
        }
        debug!(
            filter = %filter.name,
            %decision,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Ran filter script"
        );

        if decision == FilteringAction::Ignore {
            break;
        }
    }

    let message = engine.take_message();
    match decision {
        FilteringAction::Accept => message,
        FilteringAction::Ignore => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::filter::models::{FilterId, FilterRegistry, FilteringError, MessageFilter};

    /// Engine whose behaviour is picked by the script text.
    #[derive(Default)]
    struct MockEngine {
        current: Option<Message>,
        calls: HashMap<FilterId, usize>,
    }

    impl ScriptEngine for MockEngine {
        fn bind_message(&mut self, message: Message) {
            self.current = Some(message);
        }

        fn take_message(&mut self) -> Option<Message> {
            self.current.take()
        }

        fn evaluate(&mut self, filter: &MessageFilter) -> Result<FilteringAction, FilteringError> {
            *self.calls.entry(filter.id).or_default() += 1;
            let msg = self.current.as_mut().ok_or(FilteringError::NoMessage)?;
            match filter.script.as_str() {
                "accept" => Ok(FilteringAction::Accept),
                "ignore" => Ok(FilteringAction::Ignore),
                "tag" => {
                    msg.title.push_str(" [tagged]");
                    Ok(FilteringAction::Accept)
                }
                "ignore-odd" => {
                    let n: u32 = msg.title.parse().unwrap_or(0);
                    Ok(if n % 2 == 1 {
                        FilteringAction::Ignore
                    } else {
                        FilteringAction::Accept
                    })
                }
                "fail-on-2" if msg.title == "2" => Err(FilteringError::Runtime {
                    name: filter.name.clone(),
                    message: "boom".into(),
                }),
                _ => Ok(FilteringAction::Accept),
            }
        }
    }

    fn registry_with(scripts: &[&str]) -> (Arc<FilterRegistry>, Vec<FilterHandle>) {
        let registry = FilterRegistry::new();
        let handles = scripts
            .iter()
            .enumerate()
            .map(|(i, script)| {
                let id = i as FilterId + 1;
                registry.insert(MessageFilter {
                    id,
                    name: format!("{script}-{id}"),
                    script: script.to_string(),
                });
                registry.handle(id)
            })
            .collect();
        (registry, handles)
    }

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message {
                title: i.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_ignore_short_circuits_chain() {
        let (_registry, mut handles) = registry_with(&["accept", "ignore", "accept"]);
        let mut engine = MockEngine::default();

        let kept = filter_messages(&mut engine, &mut handles, messages(5));

        assert!(kept.is_empty());
        assert_eq!(engine.calls.get(&1), Some(&5));
        assert_eq!(engine.calls.get(&2), Some(&5));
        assert_eq!(engine.calls.get(&3), None);
    }

    #[test]
    fn test_failing_filter_is_isolated() {
        let (_registry, mut handles) = registry_with(&["fail-on-2", "tag"]);
        let mut engine = MockEngine::default();

        let kept = filter_messages(&mut engine, &mut handles, messages(4));

        let titles: Vec<&str> = kept.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, ["0 [tagged]", "1 [tagged]", "2 [tagged]", "3 [tagged]"]);
        assert_eq!(engine.calls.get(&2), Some(&4));
    }

    #[test]
    fn test_survivors_keep_arrival_order() {
        let (_registry, mut handles) = registry_with(&["ignore-odd", "tag"]);
        let mut engine = MockEngine::default();

        let kept = filter_messages(&mut engine, &mut handles, messages(6));

        let titles: Vec<&str> = kept.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, ["0 [tagged]", "2 [tagged]", "4 [tagged]"]);
    }

    #[test]
    fn test_deleted_filter_is_dropped_from_chain() {
        let (registry, mut handles) = registry_with(&["ignore", "tag"]);
        registry.remove(1);
        let mut engine = MockEngine::default();

        let kept = filter_messages(&mut engine, &mut handles, messages(3));

        assert_eq!(kept.len(), 3);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id(), 2);
        assert_eq!(engine.calls.get(&1), None);
    }

    #[test]
    fn test_no_filters_keeps_everything() {
        let mut engine = MockEngine::default();
        let kept = filter_messages(&mut engine, &mut Vec::new(), messages(3));
        assert_eq!(kept, messages(3));
    }
}
