//! Validated YouTube-style video identifiers.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An 11-character video identifier matching `[A-Za-z0-9_-]{11}`.
///
/// Constructed only through validation, so every `VideoId` held by the
/// system is well-formed and safe to splice into storage paths and URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn new(raw: &str) -> Result<Self> {
        if raw.len() != 11 {
            return Err(Error::Validation(format!(
                "invalid video id {raw:?}: must be exactly 11 characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Validation(format!(
                "invalid video id {raw:?}: only [A-Za-z0-9_-] allowed"
            )));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for VideoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for VideoId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}
