//! Store key generation for a token's quota record.

use std::borrow::Cow;

use super::dimension::Dimension;

/// The store keys that make up one token's quota record.
///
/// Keys are `quota:<dimension>:<total|current>:<token>`. Tokens are escaped so
/// that `:` never appears inside the token segment: `%` becomes `%25` and `:`
/// becomes `%3A`. Any other token is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKeys {
    /// The token as it appears inside keys
    segment: String,
}

impl QuotaKeys {
    /// Build the keys for a token.
    pub fn new(token: &str) -> Self {
        Self {
            segment: escape_token(token).into_owned(),
        }
    }

    /// Key of the provisioned total for a dimension.
    pub fn total(&self, dimension: Dimension) -> String {
        format!("{}{}", dimension.total_prefix(), self.segment)
    }

    /// Key of the running counter for a dimension.
    pub fn current(&self, dimension: Dimension) -> String {
        format!("{}{}", dimension.current_prefix(), self.segment)
    }
}

impl std::fmt::Display for QuotaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segment)
    }
}

/// Escape a token for use as the last key segment.
pub fn escape_token(token: &str) -> Cow<'_, str> {
    if !token.contains([':', '%']) {
        return Cow::Borrowed(token);
    }

    let mut escaped = String::with_capacity(token.len() + 4);
    for c in token.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}
