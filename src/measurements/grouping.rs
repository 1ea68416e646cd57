//! Group keys and groups of image sets.

use crate::measurements::column::metadata_feature;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::ImageNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key/value pairs shared by every image set of a group.
///
/// The implicit single group of an ungrouped run has an empty key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(BTreeMap<String, String>);

impl GroupKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .or_else(|| self.0.get(&metadata_feature(key)))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether every pair of `filter` is present in this key.
    ///
    /// Filter keys may omit the `Metadata_` prefix.
    pub fn matches(&self, filter: &GroupKey) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Parse a `key=value[,key=value...]` group restriction.
    ///
    /// Surrounding whitespace is trimmed, then `%XX` escapes written by
    /// `Display` are decoded, so any key survives `to_string` and `parse`.
    pub fn parse(spec: &str) -> PipelineResult<Self> {
        let invalid = || PipelineError::InvalidGroupSpec(spec.to_string());
        let mut key = GroupKey::new();
        for pair in spec.split(',') {
            let (k, v) = pair.split_once('=').ok_or_else(invalid)?;
            let k = k.trim();
            if k.is_empty() {
                return Err(invalid());
            }
            let k = unescape(k).ok_or_else(invalid)?;
            let v = unescape(v.trim()).ok_or_else(invalid)?;
            key.insert(k, v);
        }
        Ok(key)
    }
}

/// Characters `parse` would split or trim on.
fn needs_escape(c: char) -> bool {
    matches!(c, '%' | ',' | '=') || c.is_whitespace()
}

fn escape(text: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut buf = [0u8; 4];
    for c in text.chars() {
        if needs_escape(c) {
            for b in c.encode_utf8(&mut buf).bytes() {
                write!(f, "%{:02X}", b)?;
            }
        } else {
            write!(f, "{}", c)?;
        }
    }
    Ok(())
}

fn unescape(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text.get(i + 1..i + 3)?;
            if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            escape(k, f)?;
            f.write_str("=")?;
            escape(v, f)?;
            first = false;
        }
        Ok(())
    }
}

/// One group of image sets, in ascending image-number order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// One-based position of the group within the run.
    pub number: u32,
    pub key: GroupKey,
    pub image_numbers: Vec<ImageNumber>,
}

impl Group {
    pub fn new(number: u32, key: GroupKey, image_numbers: Vec<ImageNumber>) -> Self {
        Self {
            number,
            key,
            image_numbers,
        }
    }
}

/// A module's partition of the run's image sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    /// Metadata features whose values define the groups.
    pub key_names: Vec<String>,
    pub groups: Vec<Group>,
}
