//! Correlation tokens.
//!
//! A token is the only thing linking a published request to the reply the
//! worker eventually sends back. Tokens are 128-bit random identifiers (UUID
//! v4), rendered in the canonical hyphenated form on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    /// Generate a fresh token from the operating system's random source.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for CorrelationToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_distinct() {
        let tokens: HashSet<_> = (0..10_000).map(|_| CorrelationToken::generate()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn display_is_fixed_width() {
        let token = CorrelationToken::generate();
        assert_eq!(token.to_string().len(), 36);
    }

    #[test]
    fn parses_canonical_form() {
        let token: CorrelationToken = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        assert_eq!(token.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
    }

    #[test]
    fn rejects_legacy_timestamp_tokens() {
        assert!("1700000000000-123456".parse::<CorrelationToken>().is_err());
    }
}
