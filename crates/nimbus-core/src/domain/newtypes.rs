//! Validated newtypes for remote identifiers and value types.
//!
//! Each wrapper enforces its format at construction time, so the rest
//! of the workspace can pass these around without re-validating.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// ItemId
// ============================================================================

/// Prefix carried by items created locally that have not yet been
/// assigned a server identifier.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of a filesystem object.
///
/// Either a server-assigned drive item id (opaque alphanumeric string)
/// or a provisional `local-<uuid>` id for items created while the
/// server has not yet acknowledged them. The provisional id is
/// rewritten in place once the first upload returns the real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Create an ItemId from a server-provided string.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidId` if the id is empty or contains
    /// characters outside the drive id alphabet.
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidId("ID cannot be empty".to_string()));
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '!' || c == '-' || c == '_' || c == '.')
        {
            return Err(DomainError::InvalidId(format!(
                "ID contains invalid characters: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Allocate a fresh provisional id for a locally created item.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Returns true if this is a provisional `local-*` id.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ItemId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

// ============================================================================
// FileName
// ============================================================================

/// Characters the remote store rejects in item names.
pub const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum name length in bytes (POSIX NAME_MAX).
const NAME_MAX: usize = 255;

/// A validated file or directory name.
///
/// Rejects the remote store's forbidden character set, empty names,
/// `.` and `..`, and names longer than NAME_MAX bytes. Two names are
/// considered to collide when equal case-insensitively; the store
/// enforces that per parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    /// Create a validated FileName.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidName` on any rejected form.
    pub fn new(name: String) -> Result<Self, DomainError> {
        if name.is_empty() {
            return Err(DomainError::InvalidName("name cannot be empty".to_string()));
        }
        if name == "." || name == ".." {
            return Err(DomainError::InvalidName(format!(
                "name '{name}' is reserved"
            )));
        }
        if name.len() > NAME_MAX {
            return Err(DomainError::InvalidName(format!(
                "name exceeds {NAME_MAX} bytes"
            )));
        }
        if let Some(bad) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
            return Err(DomainError::InvalidName(format!(
                "name contains forbidden character '{bad}': {name}"
            )));
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(DomainError::InvalidName(format!(
                "name contains control characters: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive equality, matching the remote store's
    /// collision rule.
    #[must_use]
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other) || self.0.to_lowercase() == other.to_lowercase()
    }

    /// Lowercased form used for collision keys.
    #[must_use]
    pub fn collision_key(&self) -> String {
        self.0.to_lowercase()
    }

    /// Split into (stem, extension-with-dot), for conflict-copy naming.
    ///
    /// `"report.docx"` → `("report", ".docx")`; names without a dot
    /// return an empty extension.
    #[must_use]
    pub fn split_extension(&self) -> (&str, &str) {
        match self.0.rfind('.') {
            Some(0) | None => (&self.0, ""),
            Some(pos) => (&self.0[..pos], &self.0[pos..]),
        }
    }
}

impl Display for FileName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for FileName {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<FileName> for String {
    fn from(name: FileName) -> Self {
        name.0
    }
}

// ============================================================================
// ETag
// ============================================================================

/// Opaque remote version tag used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ETag(String);

impl ETag {
    /// Create an ETag; the only validation is non-emptiness.
    pub fn new(tag: String) -> Result<Self, DomainError> {
        if tag.is_empty() {
            return Err(DomainError::InvalidEtag("etag cannot be empty".to_string()));
        }
        Ok(Self(tag))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ETag {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ETag> for String {
    fn from(tag: ETag) -> Self {
        tag.0
    }
}

// ============================================================================
// ContentHash
// ============================================================================

/// A quickXorHash in Base64 form (20 decoded bytes).
///
/// Supplied by the remote store for files; recomputed locally after
/// hydration to verify content integrity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Expected decoded length of quickXorHash (20 bytes)
    const EXPECTED_DECODED_LEN: usize = 20;

    /// Create a ContentHash from its Base64 representation.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidHash` if the string is not Base64
    /// or decodes to the wrong length.
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.is_empty() {
            return Err(DomainError::InvalidHash("hash cannot be empty".to_string()));
        }
        if !hash
            .chars()
            .all(|c| c.is_alphanumeric() || c == '+' || c == '/' || c == '=')
        {
            return Err(DomainError::InvalidHash(format!(
                "hash is not valid Base64: {hash}"
            )));
        }
        let padding = hash.chars().rev().take_while(|&c| c == '=').count();
        let decoded_len = (hash.len() * 3 / 4) - padding;
        if decoded_len != Self::EXPECTED_DECODED_LEN {
            return Err(DomainError::InvalidHash(format!(
                "hash has wrong length: expected {} bytes, got {decoded_len}",
                Self::EXPECTED_DECODED_LEN
            )));
        }
        Ok(Self(hash))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

// ============================================================================
// DeltaCursor
// ============================================================================

/// Opaque token marking a point in the remote change stream.
///
/// Returned by the delta endpoint; persisted so a restart resumes the
/// change stream instead of re-listing the drive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeltaCursor(String);

impl DeltaCursor {
    /// Create a DeltaCursor; the token is opaque, only non-emptiness
    /// is checked.
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidCursor(
                "delta cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeltaCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeltaCursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeltaCursor> for String {
    fn from(cursor: DeltaCursor) -> Self {
        cursor.0
    }
}

// ============================================================================
// Tests
// ============================================================================
