//! Identity types for the pipeline system.
//!
//! Both IDs are one-based newtypes over `u32`. `index()` converts them to the
//! zero-based position used for storage vectors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One-based position of a module in its pipeline.
///
/// Derived from list order and reassigned whenever the order changes, so it is
/// never an identity that survives edits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleNum(pub u32);

impl ModuleNum {
    /// Module number for a zero-based list position.
    #[inline]
    pub fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }
}

impl fmt::Debug for ModuleNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleNum({})", self.0)
    }
}

impl fmt::Display for ModuleNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-based index of an image set within a run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageNumber(pub u32);

impl ImageNumber {
    #[inline]
    pub fn index(self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }

    #[inline]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for ImageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageNumber({})", self.0)
    }
}

impl fmt::Display for ImageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ImageNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Inclusive image-number bounds; `None` leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageNumberRange {
    pub first: Option<ImageNumber>,
    pub last: Option<ImageNumber>,
}

impl ImageNumberRange {
    pub fn new(first: Option<ImageNumber>, last: Option<ImageNumber>) -> Self {
        Self { first, last }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.first.is_none() && self.last.is_none()
    }

    pub fn contains(&self, n: ImageNumber) -> bool {
        self.first.is_none_or(|first| n >= first) && self.last.is_none_or(|last| n <= last)
    }
}
