//! Message headers and header-exchange binding predicates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header naming the worker queue (or private reply queue) a message targets.
pub const TARGET: &str = "target";
/// Header carrying the return type of an RPC signature.
pub const RETURN_TYPE: &str = "returnType";
/// Header carrying the fully-qualified method name of an RPC signature.
pub const SIGNATURE: &str = "signature";
/// Header carrying the ordered parameter types of an RPC signature.
pub const ARGS: &str = "args";
/// Binding argument selecting `all` or `any` matching.
pub const X_MATCH: &str = "x-match";
/// Number of previous delivery attempts, set by the broker on redelivery.
pub const X_DELIVERY_COUNT: &str = "x-delivery-count";

/// A single header value as carried on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the elements of a string array, or `None` if any element is
    /// not a string.
    #[must_use]
    pub fn as_str_array(&self) -> Option<Vec<&str>> {
        match self {
            FieldValue::Array(items) => items.iter().map(FieldValue::as_str).collect(),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::Array(value.into_iter().map(FieldValue::Str).collect())
    }
}

pub type Headers = BTreeMap<String, FieldValue>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

/// Binding predicate of a headers exchange.
///
/// Keys starting with `x-` are broker arguments and never take part in
/// matching, mirroring AMQP headers-exchange semantics.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderPredicate {
    pub mode: MatchMode,
    pub fields: Headers,
}

impl HeaderPredicate {
    #[must_use]
    pub fn all(fields: Headers) -> Self {
        Self {
            mode: MatchMode::All,
            fields,
        }
    }

    #[must_use]
    pub fn any(fields: Headers) -> Self {
        Self {
            mode: MatchMode::Any,
            fields,
        }
    }

    /// Predicate selecting messages whose `target` header equals `name`.
    #[must_use]
    pub fn target(name: &str) -> Self {
        Self::all(Headers::from([(TARGET.to_owned(), name.into())]))
    }

    #[must_use]
    pub fn matches(&self, headers: &Headers) -> bool {
        let mut fields = self
            .fields
            .iter()
            .filter(|(key, _)| !key.starts_with("x-"))
            .peekable();
        if fields.peek().is_none() {
            return self.mode == MatchMode::All;
        }
        let hit = |(key, value): (&String, &FieldValue)| headers.get(key) == Some(value);
        match self.mode {
            MatchMode::All => fields.all(hit),
            MatchMode::Any => fields.any(hit),
        }
    }

    /// Renders the predicate as AMQP binding arguments.
    #[must_use]
    pub fn to_arguments(&self) -> Headers {
        let mut arguments = self.fields.clone();
        let mode = match self.mode {
            MatchMode::All => "all",
            MatchMode::Any => "any",
        };
        arguments.insert(X_MATCH.to_owned(), mode.into());
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, FieldValue)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn test_match_all() {
        let predicate = HeaderPredicate::all(headers(&[
            (RETURN_TYPE, "String".into()),
            (SIGNATURE, "Svc.Add".into()),
            (ARGS, vec!["i32".to_owned(), "i32".to_owned()].into()),
        ]));

        let mut msg = predicate.fields.clone();
        msg.insert("extra".into(), true.into());
        assert!(predicate.matches(&msg));

        msg.insert(ARGS.into(), vec!["i32".to_owned()].into());
        assert!(!predicate.matches(&msg));

        msg.remove(ARGS);
        assert!(!predicate.matches(&msg));
    }

    #[test]
    fn test_match_any_and_broker_arguments() {
        let predicate = HeaderPredicate::any(headers(&[
            (TARGET, "a".into()),
            ("x-ignored", "zzz".into()),
            ("kind", "b".into()),
        ]));
        assert!(predicate.matches(&headers(&[("kind", "b".into())])));
        assert!(!predicate.matches(&headers(&[("x-ignored", "zzz".into())])));

        assert!(HeaderPredicate::all(Headers::new()).matches(&Headers::new()));
        assert!(!HeaderPredicate::any(Headers::new()).matches(&Headers::new()));
    }

    #[test]
    fn test_target_predicate() {
        let predicate = HeaderPredicate::target("INGEST");
        assert!(predicate.matches(&headers(&[(TARGET, "INGEST".into())])));
        assert!(!predicate.matches(&headers(&[(TARGET, "ingest".into())])));

        let arguments = predicate.to_arguments();
        assert_eq!(arguments.get(X_MATCH), Some(&FieldValue::from("all")));
        assert_eq!(
            FieldValue::from(vec!["a".to_owned(), "b".to_owned()]).as_str_array(),
            Some(vec!["a", "b"])
        );
    }
}
