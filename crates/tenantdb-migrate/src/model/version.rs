//! Schema version catalog.
//!
//! Versions are plain data rows rather than a language enum, so the catalog
//! can be validated at load time: ids must be unique and strictly
//! increasing. Each entry records whether reaching that version forces a
//! full reindex of tenant data.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// One row of the version catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Version id, strictly increasing across the catalog.
    pub vid: i32,
    /// Human-readable description of the change.
    pub description: String,
    /// Whether applying this version requires a full reindex.
    pub requires_reindex: bool,
}

impl VersionEntry {
    pub fn new(vid: i32, description: impl Into<String>, requires_reindex: bool) -> Self {
        Self {
            vid,
            description: description.into(),
            requires_reindex,
        }
    }
}

/// Ordered, validated list of version entries.
#[derive(Debug, Clone)]
pub struct VersionCatalog {
    entries: Vec<VersionEntry>,
}

impl VersionCatalog {
    /// Build a catalog, validating uniqueness and monotonicity.
    pub fn new(entries: Vec<VersionEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(MigrateError::Config(
                "version catalog must contain at least one entry".into(),
            ));
        }
        for pair in entries.windows(2) {
            if pair[1].vid <= pair[0].vid {
                return Err(MigrateError::Config(format!(
                    "version catalog is not strictly increasing: {} followed by {}",
                    pair[0].vid, pair[1].vid
                )));
            }
        }
        Ok(Self { entries })
    }

    /// The newest version id.
    pub fn latest_vid(&self) -> i32 {
        self.entries.last().map(|e| e.vid).unwrap_or(0)
    }

    pub fn entries(&self) -> &[VersionEntry] {
        &self.entries
    }

    /// Entries that lie strictly after `prior` — the deltas a migration run
    /// from `prior` will pass through.
    pub fn entries_after(&self, prior: i32) -> impl Iterator<Item = &VersionEntry> {
        self.entries.iter().filter(move |e| e.vid > prior)
    }

    /// Whether moving from `prior` to the latest version crosses any entry
    /// flagged as requiring a full reindex.
    pub fn reindex_required_since(&self, prior: i32) -> bool {
        self.entries_after(prior).any(|e| e.requires_reindex)
    }
}
