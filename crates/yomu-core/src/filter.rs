pub mod chain;
pub mod engine;
pub mod models;

pub use chain::{filter_message, filter_messages};
pub use engine::{
    MessageLookup, RhaiEngine, RhaiEngineFactory, ScriptEngine, ScriptEngineFactory,
    ScriptMessage,
};
pub use models::{
    DuplicateCheck, FilterHandle, FilterId, FilterRegistry, FilteringAction, FilteringError,
    MessageFilter,
};
