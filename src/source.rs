//! A local reference-corpus matcher using word-shingle Jaccard similarity.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::features;
use crate::models::SourceMatch;
use crate::store::SourceMatcher;

pub const SHINGLE_SIZE: usize = 3;

pub fn shingles(text: &str, size: usize) -> HashSet<String> {
    let words = features::words(text);
    if words.len() < size || size == 0 {
        return HashSet::new();
    }
    words.windows(size).map(|w| w.join(" ")).collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Clone)]
struct CorpusDocument {
    id: String,
    shingles: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct CorpusSourceMatcher {
    documents: Vec<CorpusDocument>,
    min_similarity: f64,
    /// Share of a sentence's shingles that must appear in a source for the
    /// sentence to be reported as a matched segment.
    segment_overlap: f64,
}

impl Default for CorpusSourceMatcher {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            min_similarity: 0.02,
            segment_overlap: 0.5,
        }
    }
}

impl CorpusSourceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, id: impl Into<String>, text: &str) -> Self {
        self.add_document(id, text);
        self
    }

    pub fn add_document(&mut self, id: impl Into<String>, text: &str) {
        self.documents.push(CorpusDocument {
            id: id.into(),
            shingles: shingles(text, SHINGLE_SIZE),
        });
    }

    /// Loads every `.txt` file in `dir`, keyed by file stem.
    pub fn from_dir(dir: &Path) -> Result<Self, StoreError> {
        let unavailable = |e: std::io::Error| StoreError::Unavailable {
            message: format!("{}: {e}", dir.display()),
        };
        let mut matcher = Self::new();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(unavailable)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        paths.sort();
        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(unavailable)?;
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            matcher.add_document(id, &text);
        }
        debug!(documents = matcher.documents.len(), "loaded reference corpus");
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn matches(&self, text: &str) -> Vec<SourceMatch> {
        let submitted = shingles(text, SHINGLE_SIZE);
        if submitted.is_empty() {
            return Vec::new();
        }
        let sentences: Vec<(&str, HashSet<String>)> = features::sentences(text)
            .into_iter()
            .map(|s| (s, shingles(s, SHINGLE_SIZE)))
            .filter(|(_, set)| !set.is_empty())
            .collect();

        let mut out: Vec<SourceMatch> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let similarity = jaccard(&submitted, &doc.shingles);
                if similarity < self.min_similarity {
                    return None;
                }
                let matched_segments = sentences
                    .iter()
                    .filter(|(_, set)| {
                        let shared = set.intersection(&doc.shingles).count();
                        shared as f64 / set.len() as f64 >= self.segment_overlap
                    })
                    .map(|(s, _)| s.to_string())
                    .collect();
                Some(SourceMatch {
                    source_id: doc.id.clone(),
                    similarity,
                    matched_segments,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }
}

#[async_trait]
impl SourceMatcher for CorpusSourceMatcher {
    async fn find_similar_sources(&self, text: &str) -> Result<Vec<SourceMatch>, StoreError> {
        Ok(self.matches(text))
    }
}
