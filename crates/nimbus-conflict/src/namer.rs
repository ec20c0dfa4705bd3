//! Conflict-copy naming.
//!
//! When both sides of a conflict are kept, the local bytes move to a
//! sibling named `<stem> (conflict <timestamp>)<ext>`.

use chrono::{DateTime, Utc};

use nimbus_core::domain::newtypes::FileName;
use nimbus_core::domain::DomainError;

/// Timestamp format embedded in conflict-copy names. Colons are in
/// the forbidden character set, so the time part is compact.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H%M%S";

/// Generates names for conflict copies.
pub struct ConflictNamer;

impl ConflictNamer {
    /// Name for the conflict copy of `original` at `timestamp`.
    ///
    /// `"doc.txt"` → `"doc (conflict 2026-03-14 092653).txt"`.
    pub fn generate(original: &FileName, timestamp: DateTime<Utc>) -> Result<FileName, DomainError> {
        let (stem, ext) = original.split_extension();
        let ts = timestamp.format(TIMESTAMP_FORMAT);
        FileName::new(format!("{stem} (conflict {ts}){ext}"))
    }

    /// Like [`ConflictNamer::generate`], but steps a numeric suffix
    /// past any collision (`exists` checks case-insensitively).
    pub fn generate_unique<F>(
        original: &FileName,
        timestamp: DateTime<Utc>,
        mut exists: F,
    ) -> Result<FileName, DomainError>
    where
        F: FnMut(&FileName) -> bool,
    {
        let candidate = Self::generate(original, timestamp)?;
        if !exists(&candidate) {
            return Ok(candidate);
        }

        let (stem, ext) = candidate.split_extension();
        for n in 2..=999 {
            let numbered = FileName::new(format!("{stem} {n}{ext}"))?;
            if !exists(&numbered) {
                return Ok(numbered);
            }
        }

        Err(DomainError::InvalidName(format!(
            "could not find a free conflict-copy name for {original}"
        )))
    }
}
