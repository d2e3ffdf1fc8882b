//! Identifier normalization.
//!
//! Callers hand the engine whatever they key their domain on: strings,
//! numeric ids, short tokens, composite URI-like pairs. Everything funnels
//! through [`RawId`] into one canonical UTF-8 external id before it touches
//! storage. Normalization is injective within each input kind; cross-kind
//! collisions (the string `"7"` vs. the integer `7`) are the caller's
//! responsibility.

use std::fmt;

/// A caller-supplied identifier in one of the recognized input kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum RawId {
    /// Arbitrary UTF-8 text. Empty and whitespace-only values canonicalize
    /// to the empty sentinel, which registration rejects.
    Text(String),
    /// Signed integer key, rendered in decimal.
    Int(i64),
    /// Floating-point key, rendered with shortest round-trip formatting.
    Float(f64),
    /// Short enum-like token, e.g. a role name baked into the application.
    Token(String),
    /// URI-like composite of a scheme and a path, canonicalized as
    /// `scheme:path`.
    Uri { scheme: String, path: String },
}

impl RawId {
    pub fn token(name: &str) -> Self {
        RawId::Token(name.to_string())
    }

    pub fn uri(scheme: &str, path: &str) -> Self {
        RawId::Uri {
            scheme: scheme.to_string(),
            path: path.to_string(),
        }
    }

    /// Canonical external id for this value. Blank text canonicalizes to
    /// the empty string sentinel.
    pub fn canonical(&self) -> String {
        match self {
            RawId::Text(s) => {
                if s.trim().is_empty() {
                    String::new()
                } else {
                    s.clone()
                }
            }
            RawId::Int(n) => n.to_string(),
            RawId::Float(f) => f.to_string(),
            RawId::Token(t) => t.clone(),
            RawId::Uri { scheme, path } => format!("{}:{}", scheme, path),
        }
    }
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl From<&str> for RawId {
    fn from(s: &str) -> Self {
        RawId::Text(s.to_string())
    }
}

impl From<String> for RawId {
    fn from(s: String) -> Self {
        RawId::Text(s)
    }
}

impl From<&String> for RawId {
    fn from(s: &String) -> Self {
        RawId::Text(s.clone())
    }
}

impl From<i64> for RawId {
    fn from(n: i64) -> Self {
        RawId::Int(n)
    }
}

impl From<i32> for RawId {
    fn from(n: i32) -> Self {
        RawId::Int(n as i64)
    }
}

impl From<u32> for RawId {
    fn from(n: u32) -> Self {
        RawId::Int(n as i64)
    }
}

impl From<f64> for RawId {
    fn from(f: f64) -> Self {
        RawId::Float(f)
    }
}

impl From<(&str, &str)> for RawId {
    fn from((scheme, path): (&str, &str)) -> Self {
        RawId::uri(scheme, path)
    }
}
