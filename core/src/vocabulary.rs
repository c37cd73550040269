//! Vocabulary source documents
//!
//! A source is JSON: either a bare array of word entries or an object with
//! a `words` array. Only the four text fields below matter here; everything
//! else in an entry (ids, levels, themes, morphemes) is ignored.

use crate::hash::{ContentHash, ContentKey};
use crate::{CacheError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WordEntry {
    #[serde(default)]
    pub german: Option<String>,
    #[serde(default)]
    pub russian: Option<String>,
    #[serde(default)]
    pub sentence: Option<String>,
    #[serde(default)]
    pub sentence_ru: Option<String>,
}

impl WordEntry {
    /// (language, text) pairs for every present, non-blank field.
    pub fn keys(&self) -> impl Iterator<Item = ContentKey> + '_ {
        [
            ("de", &self.german),
            ("ru", &self.russian),
            ("de", &self.sentence),
            ("ru", &self.sentence_ru),
        ]
        .into_iter()
        .filter_map(|(lang, field)| {
            field
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .map(|t| ContentKey::new(lang, t))
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    List(Vec<WordEntry>),
    Object { words: Vec<WordEntry> },
}

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    pub words: Vec<WordEntry>,
}

impl Vocabulary {
    pub fn parse(content: &str) -> Result<Self> {
        let doc: Document = serde_json::from_str(content)
            .map_err(|e| CacheError::Vocabulary(format!("not a vocabulary document: {e}")))?;
        let words = match doc {
            Document::List(words) | Document::Object { words } => words,
        };
        Ok(Self { words })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
            .map_err(|e| CacheError::Vocabulary(format!("{}: {}", path.display(), e)))
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Every required key, deduplicated by hash, in hash order.
    pub fn required_keys(&self) -> BTreeMap<ContentHash, ContentKey> {
        self.words
            .iter()
            .flat_map(|w| w.keys())
            .map(|k| (k.hash(), k))
            .collect()
    }
}
