//! Error taxonomy for grammar construction, compilation and deserialization.
//!
//! Matching itself never fails with an error: the hot-path matcher calls
//! report rejection as `false`.

use thiserror::Error;

/// Errors surfaced by the public constructors of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("grammar syntax error: {0}")]
    GrammarSyntax(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid JSON schema: {0}")]
    InvalidJsonSchema(String),
    #[error("invalid structural tag: {0}")]
    InvalidStructuralTag(String),
    #[error("serialization version mismatch: {0}")]
    DeserializeVersion(String),
    #[error("malformed serialized payload: {0}")]
    DeserializeFormat(String),
    #[error("invalid tokenizer: {0}")]
    InvalidTokenizer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an internal `anyhow` failure as a grammar syntax error, keeping the
    /// whole context chain in the message. An `Error` that was merely carried
    /// through `anyhow` comes back out unchanged.
    pub(crate) fn syntax(err: anyhow::Error) -> Self {
        err.downcast::<Error>()
            .unwrap_or_else(|err| Error::GrammarSyntax(format!("{err:#}")))
    }

    pub(crate) fn schema(err: anyhow::Error) -> Self {
        err.downcast::<Error>()
            .unwrap_or_else(|err| Error::InvalidJsonSchema(format!("{err:#}")))
    }

    pub(crate) fn json(err: serde_json::Error) -> Self {
        Error::InvalidJson(err.to_string())
    }
}
