//! Scripting sandbox for message filters.
//!
//! The filter chain only talks to [`ScriptEngine`], so any interpreter can be
//! plugged in through a [`ScriptEngineFactory`]. The bundled implementation
//! embeds Rhai and exposes the current message to scripts as `msg`:
//!
//! ```text
//! if msg.title.contains("sponsored") {
//!     MSG_IGNORE
//! } else {
//!     msg.is_important = msg.author == "Release Bot";
//!     MSG_ACCEPT
//! }
//! ```
//!
//! A script's final expression is its decision: `MSG_ACCEPT` / `MSG_IGNORE`,
//! or a boolean (`true` keeps the message). Scripts must not rely on any
//! state surviving between evaluations; the scope is rewound after every run.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::error::YomuError;
use crate::feed::Feed;
use crate::filter::models::{
    DuplicateCheck, FilterId, FilteringAction, FilteringError, MessageFilter,
};
use crate::models::Message;

/// Name of the message binding visible to scripts.
const MSG_BINDING: &str = "msg";

/// A sandbox holding one "current message" at a time.
pub trait ScriptEngine {
    /// Bind `message` as the current message, fully replacing the previous one.
    fn bind_message(&mut self, message: Message);

    /// Release the current message together with any mutations scripts made.
    fn take_message(&mut self) -> Option<Message>;

    /// Evaluate `filter` against the bound message.
    ///
    /// On error the bound message is left as it was before the call.
    fn evaluate(&mut self, filter: &MessageFilter) -> Result<FilteringAction, FilteringError>;
}

/// Builds one engine per feed update.
pub trait ScriptEngineFactory: Send + Sync {
    fn create(&self, feed: &dyn Feed) -> Box<dyn ScriptEngine>;
}

/// Database lookups available to filter scripts.
pub trait MessageLookup: Send + Sync {
    fn is_duplicate(
        &self,
        feed_custom_id: &str,
        account_id: i64,
        message: &Message,
        check: DuplicateCheck,
    ) -> Result<bool, YomuError>;
}

/// Script-side view of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub title: String,
    pub url: String,
    pub author: String,
    pub contents: String,
    /// Milliseconds since the Unix epoch.
    pub created: i64,
    pub is_read: bool,
    pub is_important: bool,
    pub score: f64,
}

impl From<&Message> for ScriptMessage {
    fn from(msg: &Message) -> Self {
        Self {
            title: msg.title.clone(),
            url: msg.url.clone(),
            author: msg.author.clone(),
            contents: msg.contents.clone(),
            created: msg.created.timestamp_millis(),
            is_read: msg.is_read,
            is_important: msg.is_important,
            score: msg.score,
        }
    }
}

impl ScriptMessage {
    /// Write script-visible fields back onto `msg`.
    pub fn apply_to(self, msg: &mut Message) {
        msg.title = self.title;
        msg.url = self.url;
        msg.author = self.author;
        msg.contents = self.contents;
        if self.created != msg.created.timestamp_millis() {
            if let Some(created) = DateTime::from_timestamp_millis(self.created) {
                msg.created = created;
                msg.created_from_feed = true;
            }
        }
        msg.is_read = self.is_read;
        msg.is_important = self.is_important;
        msg.score = self.score;
    }

    fn to_message(&self) -> Message {
        let mut msg = Message::default();
        self.clone().apply_to(&mut msg);
        msg
    }
}

struct CompiledFilter {
    source: String,
    ast: AST,
}

/// Rhai-backed [`ScriptEngine`].
pub struct RhaiEngine {
    engine: Engine,
    scope: Scope<'static>,
    /// Scope length holding only the constants.
    base_len: usize,
    compiled: HashMap<FilterId, CompiledFilter>,
    current: Option<Message>,
}

impl RhaiEngine {
    /// Create an engine for one feed's message batch.
    pub fn new(
        feed_custom_id: &str,
        account_id: i64,
        lookup: Option<Arc<dyn MessageLookup>>,
        limits: &FilterConfig,
    ) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        if limits.max_call_depth > 0 {
            engine.set_max_call_levels(limits.max_call_depth);
        }

        engine.on_print(|text| info!(target: "yomu::filter", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "yomu::filter", source = source.unwrap_or(""), position = %pos, "{text}")
        });

        engine
            .register_type_with_name::<ScriptMessage>("Message")
            .register_get_set(
                "title",
                |m: &mut ScriptMessage| m.title.clone(),
                |m: &mut ScriptMessage, v: String| m.title = v,
            )
            .register_get_set(
                "url",
                |m: &mut ScriptMessage| m.url.clone(),
                |m: &mut ScriptMessage, v: String| m.url = v,
            )
            .register_get_set(
                "author",
                |m: &mut ScriptMessage| m.author.clone(),
                |m: &mut ScriptMessage, v: String| m.author = v,
            )
            .register_get_set(
                "contents",
                |m: &mut ScriptMessage| m.contents.clone(),
                |m: &mut ScriptMessage, v: String| m.contents = v,
            )
            .register_get_set(
                "created",
                |m: &mut ScriptMessage| m.created,
                |m: &mut ScriptMessage, v: i64| m.created = v,
            )
            .register_get_set(
                "is_read",
                |m: &mut ScriptMessage| m.is_read,
                |m: &mut ScriptMessage, v: bool| m.is_read = v,
            )
            .register_get_set(
                "is_important",
                |m: &mut ScriptMessage| m.is_important,
                |m: &mut ScriptMessage, v: bool| m.is_important = v,
            )
            .register_get_set(
                "score",
                |m: &mut ScriptMessage| m.score,
                |m: &mut ScriptMessage, v: f64| m.score = v,
            );

        let feed_custom_id = feed_custom_id.to_string();
        engine.register_fn(
            "is_duplicate",
            move |m: &mut ScriptMessage, flags: i64| -> Result<bool, Box<EvalAltResult>> {
                let Some(lookup) = lookup.as_ref() else {
                    return Err("is_duplicate: no database available".into());
                };
                lookup
                    .is_duplicate(
                        &feed_custom_id,
                        account_id,
                        &m.to_message(),
                        DuplicateCheck::from_bits(flags),
                    )
                    .map_err(|e| format!("is_duplicate: {e}").into())
            },
        );

        let mut scope = Scope::new();
        scope.push_constant("MSG_ACCEPT", FilteringAction::ACCEPT_CODE);
        scope.push_constant("MSG_IGNORE", FilteringAction::IGNORE_CODE);
        scope.push_constant("SAME_TITLE", DuplicateCheck::SAME_TITLE.bits());
        scope.push_constant("SAME_URL", DuplicateCheck::SAME_URL.bits());
        scope.push_constant("SAME_AUTHOR", DuplicateCheck::SAME_AUTHOR.bits());
        scope.push_constant("ALL_FEEDS", DuplicateCheck::ALL_FEEDS.bits());
        let base_len = scope.len();

        Self {
            engine,
            scope,
            base_len,
            compiled: HashMap::new(),
            current: None,
        }
    }

    fn bound(&self) -> Option<ScriptMessage> {
        self.scope.get_value::<ScriptMessage>(MSG_BINDING)
    }
}

impl ScriptEngine for RhaiEngine {
    fn bind_message(&mut self, message: Message) {
        self.scope.rewind(self.base_len);
        self.scope.push(MSG_BINDING, ScriptMessage::from(&message));
        self.current = Some(message);
    }

    fn take_message(&mut self) -> Option<Message> {
        let mut message = self.current.take()?;
        if let Some(bound) = self.bound() {
            bound.apply_to(&mut message);
        }
        self.scope.rewind(self.base_len);
        Some(message)
    }

    fn evaluate(&mut self, filter: &MessageFilter) -> Result<FilteringAction, FilteringError> {
        let snapshot = self.bound().ok_or(FilteringError::NoMessage)?;

        let compiled = match self.compiled.entry(filter.id) {
            Entry::Occupied(e) if e.get().source == filter.script => e.into_mut(),
            Entry::Occupied(mut e) => {
                e.insert(compile(&self.engine, filter)?);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(compile(&self.engine, filter)?),
        };

        let outcome = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &compiled.ast);

        // Drop variables the script declared, keeping constants and `msg`.
        self.scope.rewind(self.base_len + 1);

        let decision = outcome
            .map_err(|e| FilteringError::Runtime {
                name: filter.name.clone(),
                message: e.to_string(),
            })
            .and_then(|value| decision_from(filter, value));

        let intact = self.bound().is_some();
        if decision.is_err() || !intact {
            self.scope.set_value(MSG_BINDING, snapshot);
        }
        if !intact {
            warn!(filter = %filter.name, "Script replaced the message binding");
            return Err(FilteringError::Runtime {
                name: filter.name.clone(),
                message: format!("`{MSG_BINDING}` was overwritten"),
            });
        }
        decision
    }
}

fn compile(engine: &Engine, filter: &MessageFilter) -> Result<CompiledFilter, FilteringError> {
    let ast = engine
        .compile(&filter.script)
        .map_err(|e| FilteringError::Compile {
            name: filter.name.clone(),
            message: e.to_string(),
        })?;
    Ok(CompiledFilter {
        source: filter.script.clone(),
        ast,
    })
}

fn decision_from(filter: &MessageFilter, value: Dynamic) -> Result<FilteringAction, FilteringError> {
    if let Ok(code) = value.as_int() {
        if let Some(action) = FilteringAction::from_code(code) {
            return Ok(action);
        }
    } else if let Ok(keep) = value.as_bool() {
        return Ok(if keep {
            FilteringAction::Accept
        } else {
            FilteringAction::Ignore
        });
    }
    Err(FilteringError::InvalidResult {
        name: filter.name.clone(),
        value: value.to_string(),
    })
}

/// Default factory: one [`RhaiEngine`] per feed.
#[derive(Clone, Default)]
pub struct RhaiEngineFactory {
    lookup: Option<Arc<dyn MessageLookup>>,
    limits: FilterConfig,
}

impl RhaiEngineFactory {
    pub fn new(lookup: Option<Arc<dyn MessageLookup>>, limits: FilterConfig) -> Self {
        Self { lookup, limits }
    }
}

impl ScriptEngineFactory for RhaiEngineFactory {
    fn create(&self, feed: &dyn Feed) -> Box<dyn ScriptEngine> {
        Box::new(RhaiEngine::new(
            feed.custom_id(),
            feed.account_id(),
            self.lookup.clone(),
            &self.limits,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RhaiEngine {
        RhaiEngine::new("1", 1, None, &FilterConfig::default())
    }

    fn filter(id: FilterId, script: &str) -> MessageFilter {
        MessageFilter {
            id,
            name: format!("filter-{id}"),
            script: script.into(),
        }
    }

    fn message(title: &str) -> Message {
        Message {
            title: title.into(),
            author: "Jane".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_accept_and_ignore_constants() {
        let mut engine = engine();
        engine.bind_message(message("hello"));
        assert_eq!(
            engine.evaluate(&filter(1, "MSG_ACCEPT")).unwrap(),
            FilteringAction::Accept
        );
        assert_eq!(
            engine.evaluate(&filter(2, "MSG_IGNORE")).unwrap(),
            FilteringAction::Ignore
        );
    }

    #[test]
    fn test_boolean_result() {
        let mut engine = engine();
        engine.bind_message(message("Weekly sponsored post"));
        let f = filter(1, r#"!msg.title.contains("sponsored")"#);
        assert_eq!(engine.evaluate(&f).unwrap(), FilteringAction::Ignore);
    }

    #[test]
    fn test_script_mutates_message() {
        let mut engine = engine();
        engine.bind_message(message("hello"));
        let f = filter(
            1,
            r#"
                msg.title = "[tagged] " + msg.title;
                msg.is_important = true;
                msg.score = 4.5;
                MSG_ACCEPT
            "#,
        );
        assert_eq!(engine.evaluate(&f).unwrap(), FilteringAction::Accept);

        let msg = engine.take_message().unwrap();
        assert_eq!(msg.title, "[tagged] hello");
        assert!(msg.is_important);
        assert_eq!(msg.score, 4.5);
        assert_eq!(msg.author, "Jane");
    }

    #[test]
    fn test_error_reverts_partial_mutation() {
        let mut engine = engine();
        engine.bind_message(message("original"));
        let f = filter(1, r#"msg.title = "changed"; throw "boom";"#);
        assert!(matches!(
            engine.evaluate(&f),
            Err(FilteringError::Runtime { .. })
        ));
        assert_eq!(engine.take_message().unwrap().title, "original");
    }

    #[test]
    fn test_compile_error() {
        let mut engine = engine();
        engine.bind_message(message("x"));
        assert!(matches!(
            engine.evaluate(&filter(1, "let = ;")),
            Err(FilteringError::Compile { .. })
        ));
    }

    #[test]
    fn test_invalid_result() {
        let mut engine = engine();
        engine.bind_message(message("x"));
        assert!(matches!(
            engine.evaluate(&filter(1, "42")),
            Err(FilteringError::InvalidResult { .. })
        ));
        assert!(matches!(
            engine.evaluate(&filter(2, r#""yes""#)),
            Err(FilteringError::InvalidResult { .. })
        ));
    }

    #[test]
    fn test_overwriting_binding_is_an_error() {
        let mut engine = engine();
        engine.bind_message(message("keep me"));
        assert!(engine.evaluate(&filter(1, "msg = 5; MSG_ACCEPT")).is_err());
        assert_eq!(engine.take_message().unwrap().title, "keep me");
    }

    #[test]
    fn test_no_message_bound() {
        let mut engine = engine();
        assert!(matches!(
            engine.evaluate(&filter(1, "MSG_ACCEPT")),
            Err(FilteringError::NoMessage)
        ));
    }

    #[test]
    fn test_no_state_leaks_between_evaluations() {
        let mut engine = engine();
        engine.bind_message(message("first"));
        engine
            .evaluate(&filter(1, "let seen = 1; MSG_ACCEPT"))
            .unwrap();
        engine.take_message();

        engine.bind_message(message("second"));
        assert!(engine.evaluate(&filter(2, "seen")).is_err());
        let f = filter(3, r#"if msg.title == "second" { MSG_ACCEPT } else { MSG_IGNORE }"#);
        assert_eq!(engine.evaluate(&f).unwrap(), FilteringAction::Accept);
    }

    #[test]
    fn test_recompiles_when_script_changes() {
        let mut engine = engine();
        engine.bind_message(message("x"));
        assert_eq!(
            engine.evaluate(&filter(1, "MSG_ACCEPT")).unwrap(),
            FilteringAction::Accept
        );
        assert_eq!(
            engine.evaluate(&filter(1, "MSG_IGNORE")).unwrap(),
            FilteringAction::Ignore
        );
    }

    #[test]
    fn test_operation_limit_stops_runaway_script() {
        let limits = FilterConfig {
            max_operations: 1_000,
            ..FilterConfig::default()
        };
        let mut engine = RhaiEngine::new("1", 1, None, &limits);
        engine.bind_message(message("x"));
        assert!(matches!(
            engine.evaluate(&filter(1, "loop {}")),
            Err(FilteringError::Runtime { .. })
        ));
    }

    struct TitleLookup;

    impl MessageLookup for TitleLookup {
        fn is_duplicate(
            &self,
            feed_custom_id: &str,
            account_id: i64,
            message: &Message,
            check: DuplicateCheck,
        ) -> Result<bool, YomuError> {
            assert_eq!(feed_custom_id, "42");
            assert_eq!(account_id, 3);
            assert!(check.contains(DuplicateCheck::SAME_TITLE));
            Ok(message.title == "seen before")
        }
    }

    #[test]
    fn test_is_duplicate_uses_lookup() {
        let mut engine = RhaiEngine::new("42", 3, Some(Arc::new(TitleLookup)), &FilterConfig::default());
        let f = filter(
            1,
            "if msg.is_duplicate(SAME_TITLE) { MSG_IGNORE } else { MSG_ACCEPT }",
        );

        engine.bind_message(message("seen before"));
        assert_eq!(engine.evaluate(&f).unwrap(), FilteringAction::Ignore);
        engine.take_message();

        engine.bind_message(message("brand new"));
        assert_eq!(engine.evaluate(&f).unwrap(), FilteringAction::Accept);
    }

    #[test]
    fn test_is_duplicate_without_database_fails() {
        let mut engine = engine();
        engine.bind_message(message("x"));
        let f = filter(1, "msg.is_duplicate(SAME_URL)");
        assert!(matches!(
            engine.evaluate(&f),
            Err(FilteringError::Runtime { .. })
        ));
    }
}
