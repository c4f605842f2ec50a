//! Hybrid query engine.
//!
//! Two queries over one folder's index:
//!
//! - **Chunk search** ([`QueryEngine::search_chunks`]): semantic concepts
//!   and/or exact terms. Concepts are embedded in one batch and each chunk
//!   gets its best cosine similarity over them. Chunks containing exact
//!   terms (case-sensitive substrings) are boosted:
//!
//!   ```text
//!   score = max(semantic, exact_floor) × (1 + exact_boost × matched / total)
//!   ```
//!
//!   so a literal match with no semantic signal still ranks at the floor.
//!   With exact terms only, no embedding call is made.
//!
//! - **Document discovery** ([`QueryEngine::find_documents`]): one query
//!   text scored against document-level (mean) vectors.
//!
//! Both rank every candidate in the folder, sort by score descending with
//! ties broken by chunk ordinal then path, and slice a page. The next
//! page's position travels in a [`Cursor`] token, never in engine state.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::RetrievalConfig;
use crate::cursor::{Cursor, CursorQuery};
use crate::embedding::{cosine_similarity, EmbeddingPool};
use crate::error::{IndexError, Result};
use crate::store::{ChunkRecord, VectorStore};

#[derive(Debug, Clone, Default)]
pub struct ChunkQuery {
    pub concepts: Vec<String>,
    pub terms: Vec<String>,
    pub limit: Option<usize>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub query: String,
    pub limit: Option<usize>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub path: String,
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub start: i64,
    pub end: i64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matched_terms: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentHit {
    pub path: String,
    pub document_id: String,
    pub score: f64,
    pub chunk_count: i64,
    pub modified_at: i64,
}

/// One page of ranked results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of ranked results across all pages.
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

/// The folder a query runs against: its store and the model (hence the
/// vector dimension) its index was built with.
pub struct FolderScope<'a> {
    pub folder: &'a Path,
    pub store: &'a VectorStore,
    pub model_id: &'a str,
    pub dims: usize,
}

pub struct QueryEngine {
    pool: Arc<EmbeddingPool>,
    config: RetrievalConfig,
}

impl QueryEngine {
    pub fn new(pool: Arc<EmbeddingPool>, config: RetrievalConfig) -> Self {
        Self { pool, config }
    }

    pub async fn search_chunks(
        &self,
        scope: &FolderScope<'_>,
        request: &ChunkQuery,
    ) -> Result<Page<ChunkHit>> {
        let concepts = clean(&request.concepts, true);
        let terms = clean(&request.terms, false);
        if concepts.is_empty() && terms.is_empty() {
            return Err(IndexError::InvalidQuery(
                "a query needs semantic concepts or exact terms".into(),
            ));
        }
        let limit = self.limit(request.limit)?;
        let folder_key = scope.folder.to_string_lossy().to_string();
        let cursor_query = CursorQuery::Chunks {
            concepts: concepts.clone(),
            terms: terms.clone(),
        };
        let offset = match &request.continuation {
            Some(token) => Cursor::resume(token, &folder_key, &cursor_query)?,
            None => 0,
        };

        let mut hits = if concepts.is_empty() {
            let candidates = scope.store.chunks_containing(&terms).await?;
            candidates
                .into_iter()
                .filter_map(|c| self.score_chunk(c, None, &terms))
                .collect::<Vec<_>>()
        } else {
            let concept_vectors = self
                .pool
                .embed_batch(scope.model_id, &concepts, &CancelToken::new())
                .await
                .map_err(|e| e.into_index_error(scope.model_id))?;
            let candidates = scope.store.chunk_vectors(scope.dims).await?;
            candidates
                .into_iter()
                .filter_map(|cv| {
                    let semantic = best_similarity(&cv.embedding, &concept_vectors);
                    self.score_chunk(cv.chunk, Some(semantic), &terms)
                })
                .collect::<Vec<_>>()
        };

        sort_chunk_hits(&mut hits);
        Ok(paginate(hits, offset, limit, |next| {
            Cursor::new(folder_key.clone(), cursor_query.clone(), next).encode()
        }))
    }

    pub async fn find_documents(
        &self,
        scope: &FolderScope<'_>,
        request: &DocumentQuery,
    ) -> Result<Page<DocumentHit>> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(IndexError::InvalidQuery("query text is empty".into()));
        }
        let limit = self.limit(request.limit)?;
        let folder_key = scope.folder.to_string_lossy().to_string();
        let cursor_query = CursorQuery::Documents {
            query: query.clone(),
        };
        let offset = match &request.continuation {
            Some(token) => Cursor::resume(token, &folder_key, &cursor_query)?,
            None => 0,
        };

        let query_vec = self
            .pool
            .embed_query(scope.model_id, &query, &CancelToken::new())
            .await
            .map_err(|e| e.into_index_error(scope.model_id))?;

        let mut hits: Vec<DocumentHit> = scope
            .store
            .document_vectors(scope.dims)
            .await?
            .into_iter()
            .filter_map(|dv| {
                let score = cosine_similarity(&query_vec, &dv.embedding).clamp(0.0, 1.0) as f64;
                (score >= self.config.min_semantic_score).then(|| DocumentHit {
                    path: dv.path,
                    document_id: dv.document_id,
                    score,
                    chunk_count: dv.chunk_count,
                    modified_at: dv.modified_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.path.cmp(&b.path))
        });
        Ok(paginate(hits, offset, limit, |next| {
            Cursor::new(folder_key.clone(), cursor_query.clone(), next).encode()
        }))
    }

    fn limit(&self, requested: Option<usize>) -> Result<usize> {
        let limit = requested.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(IndexError::InvalidQuery("limit must be at least 1".into()));
        }
        Ok(limit.min(self.config.max_limit))
    }

    /// Final score for one chunk, or `None` when it does not qualify.
    fn score_chunk(
        &self,
        chunk: ChunkRecord,
        semantic: Option<f64>,
        terms: &[String],
    ) -> Option<ChunkHit> {
        let matched_terms: Vec<String> = terms
            .iter()
            .filter(|t| chunk.text.contains(t.as_str()))
            .cloned()
            .collect();

        let score = combine_scores(semantic, matched_terms.len(), terms.len(), &self.config)?;
        Some(ChunkHit {
            path: chunk.path,
            document_id: chunk.document_id,
            chunk_id: chunk.chunk_id,
            chunk_index: chunk.chunk_index,
            start: chunk.start,
            end: chunk.end,
            score,
            semantic_score: semantic,
            matched_terms,
            text: chunk.text,
        })
    }
}

/// Combine a semantic score with exact-term matches.
///
/// Chunks with at least one literal match are boosted from at least the
/// floor. Without a match, only chunks with a semantic score at or above
/// `min_semantic_score` qualify.
pub fn combine_scores(
    semantic: Option<f64>,
    matched: usize,
    total_terms: usize,
    config: &RetrievalConfig,
) -> Option<f64> {
    if matched > 0 && total_terms > 0 {
        let base = semantic.unwrap_or(0.0).max(config.exact_floor);
        let fraction = matched as f64 / total_terms as f64;
        return Some(base * (1.0 + config.exact_boost * fraction));
    }
    semantic.filter(|s| *s >= config.min_semantic_score)
}

fn best_similarity(embedding: &[f32], concepts: &[Vec<f32>]) -> f64 {
    concepts
        .iter()
        .map(|c| cosine_similarity(embedding, c))
        .fold(0.0f32, f32::max)
        .clamp(0.0, 1.0) as f64
}

/// Score desc, then chunk ordinal asc, then document path asc.
pub fn sort_chunk_hits(hits: &mut [ChunkHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(a.path.cmp(&b.path))
    });
}

fn paginate<T>(
    ranked: Vec<T>,
    offset: usize,
    limit: usize,
    token_for: impl Fn(usize) -> String,
) -> Page<T> {
    let total = ranked.len();
    let end = offset.saturating_add(limit).min(total);
    let items: Vec<T> = ranked.into_iter().skip(offset).take(limit).collect();
    let continuation = (end < total).then(|| token_for(end));
    Page {
        items,
        total,
        continuation,
    }
}

/// Trim, drop empties and duplicates, keeping first-seen order. Exact terms
/// keep their case; concepts are compared case-insensitively.
fn clean(values: &[String], fold_case: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let duplicate = out.iter().any(|seen| {
            if fold_case {
                seen.eq_ignore_ascii_case(value)
            } else {
                seen == value
            }
        });
        if !duplicate {
            out.push(value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, index: i64, score: f64) -> ChunkHit {
        ChunkHit {
            path: path.into(),
            document_id: format!("doc-{}", path),
            chunk_id: format!("{}-{}", path, index),
            chunk_index: index,
            start: 0,
            end: 0,
            score,
            semantic_score: None,
            matched_terms: Vec::new(),
            text: String::new(),
        }
    }

    #[test]
    fn exact_match_beats_pure_semantic() {
        let config = RetrievalConfig::default();
        let conceptual = combine_scores(Some(0.6), 0, 1, &config).unwrap();
        let literal = combine_scores(Some(0.4), 1, 1, &config).unwrap();
        assert!(literal > conceptual);
        assert!((literal - 0.8).abs() < 1e-9);
    }

    #[test]
    fn exact_only_uses_floor() {
        let config = RetrievalConfig::default();
        let score = combine_scores(None, 1, 2, &config).unwrap();
        assert!((score - config.exact_floor * 1.5).abs() < 1e-9);
        assert!(combine_scores(None, 0, 2, &config).is_none());
    }

    #[test]
    fn min_semantic_score_filters_unmatched() {
        let config = RetrievalConfig {
            min_semantic_score: 0.5,
            ..Default::default()
        };
        assert!(combine_scores(Some(0.3), 0, 0, &config).is_none());
        assert!(combine_scores(Some(0.3), 1, 1, &config).is_some());
    }

    #[test]
    fn ties_break_by_ordinal_then_path() {
        let mut hits = vec![
            hit("b.md", 0, 0.5),
            hit("a.md", 1, 0.5),
            hit("a.md", 0, 0.5),
            hit("c.md", 3, 0.9),
        ];
        sort_chunk_hits(&mut hits);
        let order: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        assert_eq!(order, vec!["c.md-3", "a.md-0", "b.md-0", "a.md-1"]);
    }

    #[test]
    fn pages_cover_everything_once() {
        let ranked: Vec<usize> = (0..7).collect();
        let first = paginate(ranked.clone(), 0, 3, |n| n.to_string());
        assert_eq!(first.items, vec![0, 1, 2]);
        assert_eq!(first.continuation.as_deref(), Some("3"));
        let last = paginate(ranked.clone(), 6, 3, |n| n.to_string());
        assert_eq!(last.items, vec![6]);
        assert!(last.continuation.is_none());
        let past = paginate(ranked, 10, 3, |n| n.to_string());
        assert!(past.items.is_empty());
        assert_eq!(past.total, 7);
    }

    #[test]
    fn clean_drops_blanks_and_duplicates() {
        let terms = clean(
            &["useState".into(), " ".into(), "useState".into(), "usestate".into()],
            false,
        );
        assert_eq!(terms, vec!["useState", "usestate"]);
        let concepts = clean(&["State".into(), "state".into()], true);
        assert_eq!(concepts, vec!["State"]);
    }
}
