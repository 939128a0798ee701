//! Error types for the strata object model.

use thiserror::Error;

/// Errors produced by the descriptor registry and the object arena.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A class name was looked up that has never been registered.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// A class was registered twice under the same name.
    #[error("class already registered: {0}")]
    DuplicateClass(String),

    /// The supertype graph of a class contains a cycle.
    #[error("cyclic hierarchy involving class: {0}")]
    CyclicHierarchy(String),

    /// An object handle does not refer to a live object in the arena.
    #[error("unknown object handle: {0}")]
    UnknownHandle(u32),

    /// A property name is not declared anywhere in the class's hierarchy.
    #[error("unknown property: class={class}, property={property}")]
    UnknownProperty { class: String, property: String },

    /// A type key loaded from storage could not be parsed back.
    #[error("malformed type key: {0}")]
    MalformedTypeKey(String),
}
