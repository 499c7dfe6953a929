//! Core identifier types shared across the broker.
//!
//! These are thin newtypes over their wire representations. They exist to
//! prevent argument mix-ups (a journal name is not an arbitrary string, a
//! revision is not an arbitrary integer) and to centralize validation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A monotonically increasing revision assigned by the coordination store
/// to every mutation. Revision 0 means "not yet observed".
pub type Revision = i64;

/// Maximum permitted length of a journal name, in bytes.
pub const MAX_JOURNAL_NAME_LEN: usize = 512;

/// A named, totally-ordered, append-only byte stream.
///
/// Journal names are path-like: one or more non-empty `/`-separated tokens
/// of letters, digits, and `-_.%`. Uses `Arc<str>` so cloning a name while
/// routing requests is O(1).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Journal(Arc<str>);

impl Default for Journal {
    fn default() -> Self {
        Journal(Arc::from(""))
    }
}

impl Journal {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Journal(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an error if the journal name is not well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::Validation("journal name is empty".to_string()));
        } else if self.0.len() > MAX_JOURNAL_NAME_LEN {
            return Err(Error::Validation(format!(
                "journal name too long ({} bytes; max {})",
                self.0.len(),
                MAX_JOURNAL_NAME_LEN
            )));
        }
        for token in self.0.split('/') {
            if token.is_empty() {
                return Err(Error::Validation(format!(
                    "journal name has empty path token ({})",
                    self.0
                )));
            }
            for c in token.chars() {
                if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '%')) {
                    return Err(Error::Validation(format!(
                        "journal name has invalid character {:?} ({})",
                        c, self.0
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Journal {
    fn from(s: &str) -> Self {
        Journal::new(s)
    }
}

impl From<String> for Journal {
    fn from(s: String) -> Self {
        Journal::new(s)
    }
}

/// Identifies a broker process: its failure zone and a unique suffix
/// within that zone.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerId {
    pub zone: String,
    pub suffix: String,
}

impl BrokerId {
    pub fn new(zone: impl Into<String>, suffix: impl Into<String>) -> Self {
        BrokerId {
            zone: zone.into(),
            suffix: suffix.into(),
        }
    }

    /// Returns an error if either component is empty or contains the
    /// key-layout separators `|` and `/`.
    pub fn validate(&self) -> Result<()> {
        for (field, v) in [("zone", &self.zone), ("suffix", &self.suffix)] {
            if v.is_empty() {
                return Err(Error::Validation(format!("BrokerId {field} is empty")));
            } else if v.contains('|') || v.contains('/') {
                return Err(Error::Validation(format!(
                    "BrokerId {field} has invalid character ({v})"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.zone, self.suffix)
    }
}
