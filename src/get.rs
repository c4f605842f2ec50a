//! Full-document retrieval.
//!
//! Rebuilds a document's extracted text from its stored chunks, dropping
//! the overlap between neighbours by character offset. Used by the
//! `fidx get` command and by callers that want the whole file after a
//! chunk search hit.

use serde::Serialize;

use crate::chunk::reconstruct_text;
use crate::error::{IndexError, Result};
use crate::store::VectorStore;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentText {
    pub id: String,
    pub path: String,
    pub content_hash: String,
    pub modified_at: String, // ISO8601
    pub indexed: bool,
    pub chunks: Vec<ChunkSummary>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub index: i64,
    pub start: i64,
    pub end: i64,
    pub key_phrases: Vec<String>,
    pub readability: f32,
}

/// Look a document up by its folder-relative path.
pub async fn get_document(store: &VectorStore, path: &str) -> Result<DocumentText> {
    let doc = store
        .document_by_path(path)
        .await?
        .ok_or_else(|| IndexError::InvalidQuery(format!("document not found: {}", path)))?;
    let chunks = store.chunks_for_document(&doc.id).await?;

    Ok(DocumentText {
        text: reconstruct_text(&chunks),
        chunks: chunks
            .iter()
            .map(|c| ChunkSummary {
                index: c.chunk_index,
                start: c.start,
                end: c.end,
                key_phrases: c.key_phrases.clone(),
                readability: c.readability,
            })
            .collect(),
        id: doc.id,
        path: doc.path,
        content_hash: doc.fingerprint.content_hash,
        modified_at: format_ms_iso(doc.modified_at),
        indexed: doc.indexed,
    })
}

/// Print a document the way `fidx get` shows it.
pub fn print_document(doc: &DocumentText) {
    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("path:         {}", doc.path);
    println!("modified_at:  {}", doc.modified_at);
    println!("sha256:       {}", doc.content_hash);
    if !doc.indexed {
        println!("status:       pending re-index");
    }
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!(
            "[chunk {}] {}..{}  readability {:.0}  {}",
            chunk.index,
            chunk.start,
            chunk.end,
            chunk.readability,
            chunk.key_phrases.join(", ")
        );
    }
    println!();

    println!("--- Text ---");
    println!("{}", doc.text);
}

fn format_ms_iso(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}
