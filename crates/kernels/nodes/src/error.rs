//! Errors raised while configuring built-in nodes.

use thiserror::Error;

/// Node configuration result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid node configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// A user-data string contains something that is not a number.
    #[error("invalid user data '{input}': {reason}")]
    InvalidUserData {
        /// The offending token.
        input: String,
        /// Parser message.
        reason: String,
    },

    /// No reduction kernel has the given name.
    #[error("unknown reduction mode: {0}")]
    UnknownReduction(String),

    /// No built-in node kind has the given name.
    #[error("unknown node kind: {0}")]
    UnknownKind(String),

    /// A slider index beyond the node's output size.
    #[error("user input index {index} out of range ({count} values)")]
    InputIndexOutOfRange {
        /// Requested slider.
        index: usize,
        /// Sliders available.
        count: usize,
    },
}
