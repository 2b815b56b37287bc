//! Cache key construction.
//!
//! Keys are plain strings so that both the in-process store and the remote
//! store can hold them, and so that glob patterns can address whole groups.
//! Layout: `namespace:part:part[?canonical-query][@identity]`.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::store::StoreError;

/// Who is asking. Responses are never shared across identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum CallerIdentity {
    #[default]
    Anonymous,
    /// Opaque subject digest supplied by the authentication layer.
    Authenticated(String),
}

impl CallerIdentity {
    pub fn scope(&self) -> String {
        match self {
            CallerIdentity::Anonymous => "anon".to_string(),
            CallerIdentity::Authenticated(subject) => format!("user:{subject}"),
        }
    }
}

/// Builder for deterministic cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    namespace: String,
    parts: Vec<String>,
    query: Option<String>,
    identity: Option<CallerIdentity>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            parts: Vec::new(),
            query: None,
            identity: None,
        }
    }

    pub fn part(mut self, part: impl Into<String>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Fold a raw query string into the key. Empty queries are ignored.
    pub fn query(mut self, raw_query: &str) -> Self {
        let canonical = canonical_query(raw_query);
        self.query = (!canonical.is_empty()).then_some(canonical);
        self
    }

    pub fn identity(mut self, identity: &CallerIdentity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)?;
        for part in &self.parts {
            write!(f, ":{part}")?;
        }
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        if let Some(identity) = &self.identity {
            write!(f, "@{}", identity.scope())?;
        }
        Ok(())
    }
}

/// Canonicalize a query string so parameter order does not matter.
///
/// Pairs are decoded, sorted by name then value, and re-encoded.
pub fn canonical_query(raw_query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw_query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Join a prefix with an identifier.
///
/// Strings, numbers and booleans are appended as-is; structured values are
/// serialized with object keys in sorted order so equal values always map to
/// the same key.
pub fn generate_key<T>(prefix: &str, identifier: &T) -> Result<String, StoreError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(identifier)?;
    let suffix = match &value {
        Value::Null => return Ok(prefix.to_string()),
        Value::String(text) => text.clone(),
        Value::Number(_) | Value::Bool(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => canonical_json(&value),
    };
    Ok(format!("{prefix}:{suffix}"))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|left, right| left.0.cmp(right.0));
            let body = fields
                .into_iter()
                .map(|(name, value)| format!("{}:{}", Value::String(name.clone()), canonical_json(value)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        scalar => scalar.to_string(),
    }
}
