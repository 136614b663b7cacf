//! Platform credential wrapper
//!
//! A `Credential` authenticates one external account. The raw value is only
//! reachable through `expose()`; `Debug` and `Display` print the masked
//! projection so credentials can be passed to `tracing` fields directly.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

/// Fixed-width redaction so the masked form does not leak the token length.
const REDACTION: &str = "**********";

/// Secret token for one platform account.
pub struct Credential(String);

impl Credential {
    /// Wrap a raw value as-is.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Trim and wrap a raw value. Returns `None` for empty or blank input.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// Expose the raw value (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Masked projection, safe to log.
    ///
    /// The first two dot-delimited segments stay visible when a third one
    /// exists; a two-segment value keeps only its first segment; anything else
    /// is fully redacted.
    pub fn masked(&self) -> String {
        let segments: Vec<&str> = self.0.splitn(3, '.').collect();
        match segments.as_slice() {
            [first, second, _] => format!("{first}.{second}.{REDACTION}"),
            [first, _] => format!("{first}.{REDACTION}"),
            _ => REDACTION.to_owned(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Credential {}

// Must hash exactly like `str` so `Borrow<str>` lookups work in maps.
impl Hash for Credential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_str().hash(state);
    }
}

impl Borrow<str> for Credential {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}
