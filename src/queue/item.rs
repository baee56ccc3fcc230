//! Item descriptors and content fingerprints.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Number of characters of a source-provided hash kept as the fingerprint.
///
/// Bounds the length of storage paths while remaining unique in practice.
pub const FINGERPRINT_LEN: usize = 30;

/// Deduplication key derived from a file's source-provided identifier.
///
/// Always holds at most [`FINGERPRINT_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Builds a fingerprint from a raw identifier, truncating it to
    /// [`FINGERPRINT_LEN`] characters.
    ///
    /// Returns `None` for blank identifiers and for anything that is not a
    /// single plain file name component.
    #[must_use]
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !is_plain_component(trimmed) {
            return None;
        }
        let truncated = truncate_chars(trimmed, FINGERPRINT_LEN);
        if !is_plain_component(truncated) {
            return None;
        }
        Some(Self(truncated.to_string()))
    }

    /// Extracts the fingerprint and extension from a source file path such as
    /// `/ab/cd/abcdef0123.jpg`.
    ///
    /// The stem of the last path segment (percent-decoded) becomes the
    /// fingerprint; the extension keeps its leading dot, or is empty.
    #[must_use]
    pub fn from_source_path(path: &str) -> Option<(Self, String)> {
        let without_query = path.split(['?', '#']).next().unwrap_or(path);
        let segment = without_query.rsplit('/').next()?;
        let decoded = urlencoding::decode(segment)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| segment.to_string());
        if decoded.contains(['/', '\\', '\0']) {
            return None;
        }
        let (stem, extension) = split_extension(&decoded);
        let fingerprint = Self::new(stem)?;
        Some((fingerprint, extension.to_string()))
    }

    /// Recovers a fingerprint from a file that already sits in final storage.
    ///
    /// Names whose stem is shorter than [`FINGERPRINT_LEN`] were not produced
    /// by this pipeline and are ignored.
    #[must_use]
    pub fn from_stored_file_name(name: &str) -> Option<Self> {
        let (stem, _) = split_extension(name);
        if stem.chars().count() < FINGERPRINT_LEN {
            return None;
        }
        Self::new(stem)
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when a cached fingerprint refers to this one.
    ///
    /// Older caches recorded shorter hashes, so a cached value that is a
    /// prefix of this fingerprint also counts as a match.
    #[must_use]
    pub fn matches_cached(&self, cached: &str) -> bool {
        !cached.is_empty() && self.0.starts_with(cached)
    }

    /// Iterates over every non-empty prefix of the fingerprint, longest first.
    pub(crate) fn prefixes(&self) -> impl Iterator<Item = &str> {
        let mut ends: Vec<usize> = self
            .0
            .char_indices()
            .map(|(index, ch)| index + ch.len_utf8())
            .collect();
        ends.reverse();
        ends.into_iter().map(|end| &self.0[..end])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of the source and creator an item was discovered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId {
    /// Storage label of the service, e.g. `Patreon`; also the hash store partition.
    pub source: String,
    /// Creator identifier as reported by the source API.
    pub creator_id: String,
}

/// Immutable description of one downloadable file.
///
/// Built by the metadata fetcher, consumed by exactly one download worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Where the item was discovered.
    pub source_id: SourceId,
    /// Creator display name; also the creator directory name.
    pub display_name: String,
    /// Absolute URL of the file.
    pub url: String,
    /// Directory relative to the storage roots (`<source dir>/<creator>`).
    pub target_directory: PathBuf,
    /// Deduplication key.
    pub fingerprint: Fingerprint,
    /// File extension including the leading dot, or empty.
    pub extension: String,
}

impl ItemDescriptor {
    /// File name used in both scratch and final storage.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}", self.fingerprint, self.extension)
    }

    /// Path of the published file under the final storage root.
    #[must_use]
    pub fn final_path(&self, final_root: &Path) -> PathBuf {
        final_root
            .join(&self.target_directory)
            .join(self.file_name())
    }

    /// Path of the in-flight temp file under the scratch root.
    #[must_use]
    pub fn scratch_path(&self, scratch_root: &Path) -> PathBuf {
        scratch_root
            .join(&self.target_directory)
            .join(self.file_name())
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

fn is_plain_component(value: &str) -> bool {
    !value.contains(['/', '\\', '\0']) && value != "." && value != ".."
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(index) => (&name[..index], &name[index..]),
    }
}
