//! Strongly-typed namespaced identifiers for twindex entities.
//!
//! All entity ids share the lexical shape `<namespace>:<name>`:
//!
//! - **namespace**: dot-separated segments, each starting with an ASCII
//!   letter, followed by letters, digits, or underscores
//! - **name**: nonempty, at most 256 characters, no slashes, no control
//!   characters; percent-encoded bytes (`%XX`) are allowed
//!
//! Ids are strongly typed so that twin and policy ids cannot be mixed up
//! at compile time, even though they share one lexical grammar.
//!
//! # Example
//!
//! ```rust
//! use twindex_core::id::{PolicyId, TwinId};
//!
//! let twin: TwinId = "org.acme:sensor-1".parse().unwrap();
//! let policy: PolicyId = "org.acme:default-policy".parse().unwrap();
//!
//! // Ids are different types - this won't compile:
//! // let wrong: TwinId = policy;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum length of the name part of a namespaced id.
const MAX_NAME_LENGTH: usize = 256;

/// A validated namespaced identifier of the shape `<namespace>:<name>`.
///
/// This is the shared representation behind [`TwinId`] and [`PolicyId`].
/// The full string is stored once; namespace and name are produced by
/// slicing at the separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacedId {
    full: String,
    separator: usize,
}

impl NamespacedId {
    /// Parses and validates a namespaced id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] when the separator is missing, the
    /// namespace violates the segment grammar, or the name is empty, too
    /// long, or contains forbidden characters.
    pub fn parse(input: &str) -> Result<Self> {
        let separator = input
            .find(':')
            .ok_or_else(|| Error::invalid_id(format!("missing ':' separator in '{input}'")))?;

        let (namespace, rest) = input.split_at(separator);
        let name = &rest[1..];

        validate_namespace(namespace)?;
        validate_name(name)?;

        Ok(Self {
            full: input.to_string(),
            separator,
        })
    }

    /// Returns the namespace part.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.full[..self.separator]
    }

    /// Returns the name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.full[self.separator + 1..]
    }

    /// Returns the full `<namespace>:<name>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(Error::invalid_id("namespace must not be empty"));
    }
    for segment in namespace.split('.') {
        let mut chars = segment.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if !valid {
            return Err(Error::invalid_id(format!(
                "namespace segment '{segment}' must start with a letter and contain only letters, digits, and underscores"
            )));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_id("name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::invalid_id(format!(
            "name exceeds {MAX_NAME_LENGTH} characters"
        )));
    }

    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' => {
                return Err(Error::invalid_id("name must not contain '/'"));
            }
            b'%' => {
                let valid = bytes.len() >= i + 3
                    && bytes[i + 1].is_ascii_hexdigit()
                    && bytes[i + 2].is_ascii_hexdigit();
                if !valid {
                    return Err(Error::invalid_id(
                        "'%' in name must start a percent-encoded byte",
                    ));
                }
                i += 3;
                continue;
            }
            b if b.is_ascii_control() => {
                return Err(Error::invalid_id("name must not contain control characters"));
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

impl fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for NamespacedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NamespacedId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NamespacedId> for String {
    fn from(value: NamespacedId) -> Self {
        value.full
    }
}

/// A unique identifier for a twin (digital representation of a device).
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TwinId(NamespacedId);

impl TwinId {
    /// Creates a twin id from an already-validated namespaced id.
    #[must_use]
    pub const fn from_namespaced(id: NamespacedId) -> Self {
        Self(id)
    }

    /// Returns the namespace part.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.namespace()
    }

    /// Returns the name part.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Returns the full `<namespace>:<name>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TwinId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NamespacedId::parse(s).map(Self)
    }
}

/// A unique identifier for an authorization policy.
///
/// Shares the lexical shape of [`TwinId`]; many deployments use the twin
/// id verbatim as its policy id.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PolicyId(NamespacedId);

impl PolicyId {
    /// Creates a policy id from an already-validated namespaced id.
    #[must_use]
    pub const fn from_namespaced(id: NamespacedId) -> Self {
        Self(id)
    }

    /// Returns the namespace part.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.namespace()
    }

    /// Returns the name part.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Returns the full `<namespace>:<name>` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PolicyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NamespacedId::parse(s).map(Self)
    }
}
