//! JSON pointers for addressing values inside twin documents.
//!
//! Pointers are slash-separated paths (`/attributes/location/latitude`).
//! They are used by change events to address single values, by the
//! write-model differ to name `$set`/`$unset` paths, and by policies to
//! scope grants and revokes.
//!
//! Only object traversal is supported; array elements are never addressed
//! individually by the update pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed JSON pointer.
///
/// The root pointer has no segments and addresses the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JsonPointer {
    segments: Vec<String>,
}

impl JsonPointer {
    /// Returns the root pointer (no segments).
    #[must_use]
    pub const fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses a pointer from its string form.
    ///
    /// A leading slash is optional; empty segments are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPointer`] when the pointer contains empty
    /// segments.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.strip_prefix('/').unwrap_or(input);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidPointer {
                    message: format!("empty segment in pointer '{input}'"),
                });
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a pointer from owned segments.
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Returns the segments of this pointer.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if this is the root pointer.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns a new pointer with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Looks up the value this pointer addresses, if present.
    #[must_use]
    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Sets the addressed value, creating intermediate objects as needed.
    ///
    /// Intermediate non-object values are replaced by objects; setting the
    /// root pointer replaces the whole document.
    pub fn set(&self, target: &mut Value, new_value: Value) {
        set_at(target, &self.segments, new_value);
    }

    /// Removes the addressed value, returning it if it was present.
    ///
    /// Removing the root pointer is not supported and returns `None`.
    pub fn remove(&self, target: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = target;
        for segment in parents {
            current = current.as_object_mut()?.get_mut(segment)?;
        }
        current.as_object_mut()?.remove(last)
    }
}

fn set_at(target: &mut Value, segments: &[String], new_value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *target = new_value;
        return;
    };
    if !matches!(target, Value::Object(_)) {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        set_at(child, rest, new_value);
    }
}

impl fmt::Display for JsonPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for JsonPointer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JsonPointer {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<JsonPointer> for String {
    fn from(value: JsonPointer) -> Self {
        value.to_string()
    }
}
