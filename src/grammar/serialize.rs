//! JSON serialization of grammars.
//!
//! Every payload carries a `"version"` field equal to
//! [`SERIALIZATION_VERSION`](crate::config::SERIALIZATION_VERSION). The
//! envelope helpers here are shared with the tokenizer and compiled-grammar
//! formats.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Expr, Grammar, Rule, RuleId};
use crate::config::SERIALIZATION_VERSION;
use crate::Error;

#[derive(Serialize, Deserialize)]
struct GrammarRepr {
    version: String,
    rules: Vec<Rule>,
    exprs: Vec<Expr>,
    root_rule: RuleId,
}

/// Parse a versioned payload: `InvalidJson` if the text is not JSON,
/// `DeserializeVersion` if the version differs, `DeserializeFormat` if the
/// structure does not match `T`.
pub(crate) fn from_versioned_json<T: DeserializeOwned>(json: &str) -> crate::Result<T> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(Error::json)?;
    match value.get("version") {
        Some(serde_json::Value::String(v)) if v == SERIALIZATION_VERSION => {}
        Some(other) => {
            return Err(Error::DeserializeVersion(format!(
                "expected {SERIALIZATION_VERSION}, found {other}"
            )));
        }
        None => return Err(Error::DeserializeFormat("missing \"version\" field".into())),
    }
    serde_json::from_value(value).map_err(|e| Error::DeserializeFormat(e.to_string()))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> String {
    // Every serialized type here is plain data with string keys.
    serde_json::to_string(value).unwrap_or_else(|e| unreachable!("serialization failed: {e}"))
}

impl Grammar {
    /// Serialize to a versioned JSON string. Lossless.
    pub fn serialize_json(&self) -> String {
        to_json(&GrammarRepr {
            version: SERIALIZATION_VERSION.to_string(),
            rules: self.rules.clone(),
            exprs: self.exprs.clone(),
            root_rule: self.root_rule,
        })
    }

    /// Inverse of [`Grammar::serialize_json`]. Dangling ids are reported as
    /// `DeserializeFormat`.
    pub fn deserialize_json(json: &str) -> crate::Result<Grammar> {
        let repr: GrammarRepr = from_versioned_json(json)?;
        let grammar = Grammar {
            rules: repr.rules,
            exprs: repr.exprs,
            root_rule: repr.root_rule,
        };
        super::builder::validate(&grammar).map_err(|e| Error::DeserializeFormat(format!("{e:#}")))?;
        Ok(grammar)
    }
}
