//! Content addressing for synthesized audio
//!
//! Every artifact is named after a digest of `"{language}:{text}"`, so the
//! same phrase in the same language always lands on the same file, locally
//! and in the remote tier.

use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};
use std::fmt;

/// File extension shared by every artifact, local and remote.
pub const ARTIFACT_EXT: &str = "mp3";

const HASH_HEX_LEN: usize = 32;

/// A (language, text) pair. Text is trimmed on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    pub language: String,
    pub text: String,
}

impl ContentKey {
    pub fn new(language: impl Into<String>, text: impl AsRef<str>) -> Self {
        Self {
            language: language.into().trim().to_string(),
            text: text.as_ref().trim().to_string(),
        }
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.language, &self.text)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.language, self.text)
    }
}

/// Lowercase hex MD5 of `"{language}:{text}"`. Existing caches and remote
/// folders are named this way, so the digest cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes the pair as given; callers wanting normalization go through [`ContentKey`].
    pub fn of(language: &str, text: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(language.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accepts only the canonical 32-char lowercase hex form.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == HASH_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(s.to_string()))
    }

    /// Parses `{hash}.mp3`, rejecting anything else (partial writes, manifests, stray files).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(ARTIFACT_EXT)?.strip_suffix('.')?;
        Self::parse(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.0, ARTIFACT_EXT)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
