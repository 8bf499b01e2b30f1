//! Sheet identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a sheet.
///
/// Wraps a random UUID. The hyphenated text form names the sheet's
/// backing file and keys the persisted sheet table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetId(Uuid);

impl SheetId {
    /// Create a SheetId from a UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random SheetId.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a SheetId from its text form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// File name of the sheet's bitmap.
    pub fn file_name(&self) -> String {
        format!("{}.png", self.0)
    }
}

impl fmt::Display for SheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SheetId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
