//! Origin allow-list.
//!
//! Inbound messages are accepted only when their sender origin matches one of
//! the configured patterns. Patterns are written the way browsers report
//! origins (`scheme://host[:port]`), optionally with a leading `*.` label to
//! admit every subdomain, or the bare `*`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single allow-list entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OriginPattern {
    /// Any origin: `*`
    Any,
    /// One concrete origin: `https://console.example.com`
    Exact(String),
    /// Any subdomain of a host: `https://*.example.com`
    Subdomain {
        /// Scheme without the separator, e.g. `https`
        scheme: String,
        /// Host suffix including the leading dot and optional port
        suffix: String,
    },
}

impl OriginPattern {
    /// Parse a pattern from its string form
    pub fn parse(s: &str) -> Option<Self> {
        if s == "*" {
            return Some(Self::Any);
        }

        let (scheme, authority) = s.split_once("://")?;
        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        let authority_ok = !authority.is_empty()
            && !authority.contains('/')
            && !authority.chars().any(char::is_whitespace);
        if !scheme_ok || !authority_ok {
            return None;
        }

        let scheme = scheme.to_ascii_lowercase();
        let authority = authority.to_ascii_lowercase();

        match authority.strip_prefix("*.") {
            Some(rest) if !rest.is_empty() && !rest.contains('*') => Some(Self::Subdomain {
                scheme,
                suffix: format!(".{}", rest),
            }),
            Some(_) => None,
            None if authority.contains('*') => None,
            None => Some(Self::Exact(format!("{}://{}", scheme, authority))),
        }
    }

    /// Check if a sender origin matches this pattern
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected.eq_ignore_ascii_case(origin),
            Self::Subdomain { scheme, suffix } => {
                let origin = origin.to_ascii_lowercase();
                let Some(authority) = origin
                    .strip_prefix(scheme.as_str())
                    .and_then(|rest| rest.strip_prefix("://"))
                else {
                    return false;
                };
                match authority.strip_suffix(suffix.as_str()) {
                    Some(label) => !label.is_empty() && !label.contains('/'),
                    None => false,
                }
            }
        }
    }

    /// Convert to string representation
    pub fn to_string_repr(&self) -> String {
        match self {
            Self::Any => "*".to_string(),
            Self::Exact(origin) => origin.clone(),
            Self::Subdomain { scheme, suffix } => format!("{}://*{}", scheme, suffix),
        }
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_repr())
    }
}

impl TryFrom<String> for OriginPattern {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid origin pattern '{}'", s))
    }
}

impl From<OriginPattern> for String {
    fn from(pattern: OriginPattern) -> Self {
        pattern.to_string_repr()
    }
}

/// The set of origins trusted to talk to the panel
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    patterns: Vec<OriginPattern>,
}

impl OriginPolicy {
    /// Create a policy from parsed patterns
    pub fn new(patterns: Vec<OriginPattern>) -> Self {
        Self { patterns }
    }

    /// Check whether messages from `origin` are trusted
    pub fn allows(&self, origin: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(origin))
    }

    /// The configured patterns
    pub fn patterns(&self) -> &[OriginPattern] {
        &self.patterns
    }
}
