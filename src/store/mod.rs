//! Typed accessors over the derived tables in the state db. One
//! module per concern; all of them operate on a borrowed rusqlite
//! connection so callers control transaction scope.

pub mod cache;
pub mod cooccurrence;
pub mod embeddings;
pub mod entities;
pub mod events;
pub mod feedback;
pub mod links;
pub mod recency;
pub mod tags;

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// First path segment of a vault-relative path, used for folder
/// scoping everywhere (context boosts, folder feedback, folder
/// suppression).
pub fn folder_of(path: &str) -> &str {
    if path.contains('/') {
        path.split('/').next().unwrap_or("")
    } else {
        ""
    }
}
