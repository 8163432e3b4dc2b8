//! Query-side search: full-text over notes and entities through
//! tantivy, vector similarity through sqlite-vec, and the combined
//! note search that appends semantic hits after keyword hits.

use std::path::Path;

use itertools::Itertools;
use rusqlite::Connection;
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::Value;
use tantivy::{Index, ReloadPolicy, TantivyDocument};
use zerocopy::IntoBytes;

use crate::embedding::{EmbedCache, Embedder};
use crate::fts::schema::{entity_schema, note_schema};

#[derive(Debug, Serialize, Clone)]
pub enum SearchHitType {
    #[serde(rename = "full_text")]
    FullText,
    #[serde(rename = "similarity")]
    Similarity,
}

#[derive(Debug, Serialize, Clone)]
pub struct SearchHit {
    pub path: String,
    pub r#type: SearchHitType,
    pub score: f32,
}

/// Keyword search over note titles and bodies. A malformed query or
/// missing index degrades to no hits rather than an error.
pub fn fulltext_search_notes(index_dir: &Path, query: &str, limit: usize) -> Vec<SearchHit> {
    let schema = note_schema();
    let Ok(mmap_dir) = tantivy::directory::MmapDirectory::open(index_dir) else {
        return Vec::new();
    };
    let Ok(idx) = Index::open(mmap_dir) else {
        return Vec::new();
    };
    let (Ok(path), Ok(title), Ok(body)) = (
        schema.get_field("path"),
        schema.get_field("title"),
        schema.get_field("body"),
    ) else {
        return Vec::new();
    };

    let Ok(reader) = idx
        .reader_builder()
        .reload_policy(ReloadPolicy::OnCommitWithDelay)
        .try_into()
    else {
        return Vec::new();
    };
    let searcher = reader.searcher();
    let query_parser = QueryParser::for_index(&idx, vec![title, body]);
    let parsed = match query_parser.parse_query(query) {
        Ok(q) => q,
        Err(err) => {
            tracing::debug!("Rejecting malformed search query {:?}: {}", query, err);
            return Vec::new();
        }
    };

    let Ok(top) = searcher.search(&parsed, &TopDocs::with_limit(limit)) else {
        return Vec::new();
    };
    top.iter()
        .filter_map(|(score, doc_addr)| {
            let doc = searcher.doc::<TantivyDocument>(*doc_addr).ok()?;
            let path_value = doc.get_first(path)?.as_str()?.to_string();
            Some(SearchHit {
                path: path_value,
                r#type: SearchHitType::FullText,
                score: *score,
            })
        })
        .collect()
}

/// Porter-stemmed lookup over entity names and aliases.
pub fn fulltext_search_entities(index_dir: &Path, query: &str, limit: usize) -> Vec<String> {
    let schema = entity_schema();
    let Ok(mmap_dir) = tantivy::directory::MmapDirectory::open(index_dir) else {
        return Vec::new();
    };
    let Ok(idx) = Index::open(mmap_dir) else {
        return Vec::new();
    };
    let (Ok(name), Ok(search_text)) = (schema.get_field("name"), schema.get_field("search_text"))
    else {
        return Vec::new();
    };

    let Ok(reader) = idx
        .reader_builder()
        .reload_policy(ReloadPolicy::OnCommitWithDelay)
        .try_into()
    else {
        return Vec::new();
    };
    let searcher = reader.searcher();
    let query_parser = QueryParser::for_index(&idx, vec![search_text]);
    let Ok(parsed) = query_parser.parse_query(query) else {
        return Vec::new();
    };
    let Ok(top) = searcher.search(&parsed, &TopDocs::with_limit(limit)) else {
        return Vec::new();
    };
    top.iter()
        .filter_map(|(_, doc_addr)| {
            let doc = searcher.doc::<TantivyDocument>(*doc_addr).ok()?;
            Some(doc.get_first(name)?.as_str()?.to_string())
        })
        .collect()
}

/// Returns note paths by ascending vector distance to the query.
/// sqlite-vec only supports ascending distance ordering.
pub fn search_similar_notes(
    db: &Connection,
    query_vector: &[f32],
    limit: usize,
) -> rusqlite::Result<Vec<SearchHit>> {
    let mut stmt = db.prepare(
        r"
          SELECT path, distance
          FROM note_vec
          WHERE embedding MATCH ?1 AND k = ?2
          ORDER BY distance
        ",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![query_vector.as_bytes(), limit as i64],
        |r| {
            Ok(SearchHit {
                path: r.get(0)?,
                r#type: SearchHitType::Similarity,
                score: r.get(1)?,
            })
        },
    )?;
    rows.collect()
}

// Performs a full-text search of all notes. If `include_similarity`,
// vector search results are appended to the end of the list so a
// keyword miss can still surface semantically similar notes.
pub fn search_notes(
    index_dir: &Path,
    db: &Connection,
    embedder: Option<&dyn Embedder>,
    embed_cache: &EmbedCache,
    include_similarity: bool,
    query: &str,
    limit: usize,
) -> Vec<SearchHit> {
    let mut hits = fulltext_search_notes(index_dir, query, limit);

    if include_similarity {
        if let Some(embedder) = embedder {
            match embed_cache.embed(embedder, query) {
                Ok(vector) => {
                    let mut similar = search_similar_notes(db, &vector, limit).unwrap_or_default();
                    hits.append(&mut similar);
                }
                Err(err) => {
                    tracing::debug!("Similarity search degraded: {}", err);
                }
            }
        }
    }

    hits.into_iter().unique_by(|h| h.path.clone()).collect()
}
