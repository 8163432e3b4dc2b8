//! The in-memory vault graph: notes, backlinks, entity resolution,
//! and tags. Built from a full scan, cached in the state db for fast
//! restart, and replaced (never mutated in place) by the batch
//! pipeline so readers always see a consistent snapshot.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::error::{FlywheelError, Result};
use crate::scanner::{self, Outlink, ParsedNote};

/// How far the scanned file count may drift from the cached count
/// before the cache is considered unusable, as a fraction.
const CACHE_COUNT_TOLERANCE: f64 = 0.05;
/// Maximum cache age before a rebuild, seconds.
const CACHE_MAX_AGE_SECS: i64 = 24 * 60 * 60;
/// Files parsed per spawned batch during a full build.
const BUILD_BATCH_SIZE: usize = 50;

/// One note as the index sees it. The body stays on disk; everything
/// else the graph and the scoring engine need is here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub path: String,
    pub title: String,
    pub aliases: Vec<String>,
    pub frontmatter: serde_json::Value,
    pub outlinks: Vec<Outlink>,
    pub tags: BTreeSet<String>,
    pub modified: i64,
    pub created: Option<i64>,
    pub skip_wikilinks: bool,
}

impl From<ParsedNote> for Note {
    fn from(parsed: ParsedNote) -> Self {
        Note {
            path: parsed.path,
            title: parsed.title,
            aliases: parsed.aliases,
            frontmatter: parsed.frontmatter,
            outlinks: parsed.outlinks,
            tags: parsed.tags,
            modified: parsed.modified,
            created: parsed.created,
            skip_wikilinks: parsed.skip_wikilinks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backlink {
    pub source_path: String,
    pub line_number: usize,
}

/// Lowercase and strip a trailing `.md` — the resolution form used
/// by `entity_map` and the backlinks keys.
pub fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    lower.strip_suffix(".md").unwrap_or(&lower).to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultIndex {
    pub notes: HashMap<String, Note>,
    pub backlinks: HashMap<String, Vec<Backlink>>,
    /// name_lower -> backing path, for link resolution.
    pub entity_map: HashMap<String, String>,
    pub tag_map: HashMap<String, BTreeSet<String>>,
    pub built_at: i64,
}

impl VaultIndex {
    pub fn from_notes(notes: Vec<Note>) -> VaultIndex {
        let mut index = VaultIndex {
            notes: notes.into_iter().map(|n| (n.path.clone(), n)).collect(),
            built_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        index.rebuild_derived();
        index
    }

    /// Recompute entity_map, backlinks, and tag_map from `notes`.
    /// Notes are visited in path order so name collisions resolve
    /// deterministically: first writer wins, path entries override.
    pub fn rebuild_derived(&mut self) {
        self.entity_map.clear();
        self.backlinks.clear();
        self.tag_map.clear();

        let mut paths: Vec<&String> = self.notes.keys().collect();
        paths.sort();

        // Pass 1: name resolution.
        for path in &paths {
            let note = &self.notes[*path];
            let title_key = normalize_name(&note.title);
            self.entity_map.entry(title_key).or_insert_with(|| note.path.clone());
            for alias in &note.aliases {
                self.entity_map
                    .entry(normalize_name(alias))
                    .or_insert_with(|| note.path.clone());
            }
        }
        // Full-path entries always win over title/alias collisions.
        for path in &paths {
            let note = &self.notes[*path];
            self.entity_map
                .insert(normalize_name(&note.path), note.path.clone());
        }

        // Pass 2: backlinks, keyed by the resolved path when the
        // target is known, the raw normalized target otherwise.
        for path in &paths {
            let note = &self.notes[*path];
            for outlink in &note.outlinks {
                let target_lower = normalize_name(&outlink.target);
                let key = match self.entity_map.get(&target_lower) {
                    Some(resolved) => normalize_name(resolved),
                    None => target_lower,
                };
                self.backlinks.entry(key).or_default().push(Backlink {
                    source_path: note.path.clone(),
                    line_number: outlink.line_number,
                });
            }
        }

        // Pass 3: tags.
        for path in &paths {
            let note = &self.notes[*path];
            for tag in &note.tags {
                self.tag_map
                    .entry(tag.clone())
                    .or_default()
                    .insert(note.path.clone());
            }
        }
    }

    pub fn backlinks_for(&self, path: &str) -> &[Backlink] {
        self.backlinks
            .get(&normalize_name(path))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Resolve a raw link target to a note path, if known.
    pub fn resolve(&self, target: &str) -> Option<&String> {
        self.entity_map.get(&normalize_name(target))
    }

    /// backlinks + forward links of the backing note, the structural
    /// centrality signal.
    pub fn hub_score(&self, path: &str) -> u32 {
        let forward = self
            .notes
            .get(path)
            .map(|n| n.outlinks.len())
            .unwrap_or(0);
        (self.backlinks_for(path).len() + forward) as u32
    }

    pub fn to_cache_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_cache_payload(payload: &str) -> serde_json::Result<VaultIndex> {
        serde_json::from_str(payload)
    }
}

/// Whether a cached index may be reloaded instead of rebuilt: the
/// scanned file count must be within tolerance of the cached count
/// and the cache younger than a day.
pub fn cache_valid(cached_count: usize, scanned_count: usize, built_at: i64, now: i64) -> bool {
    if now - built_at >= CACHE_MAX_AGE_SECS {
        return false;
    }
    let tolerance = (cached_count as f64 * CACHE_COUNT_TOLERANCE).max(1.0);
    (scanned_count as f64 - cached_count as f64).abs() <= tolerance
}

/// Build progress shared with the status endpoint.
#[derive(Debug, Default)]
pub struct BuildProgress {
    pub parsed: AtomicUsize,
    pub total: AtomicUsize,
}

impl BuildProgress {
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.parsed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Scan the vault and build a fresh index. Files are parsed in
/// batches with per-file isolation; a single unreadable file becomes
/// a skip, never a build failure. The whole build is bounded by
/// `timeout_secs`.
pub async fn build_index(
    root: &Path,
    progress: Arc<BuildProgress>,
    timeout_secs: u64,
) -> Result<VaultIndex> {
    let build = build_index_inner(root, Arc::clone(&progress));
    match tokio::time::timeout(Duration::from_secs(timeout_secs), build).await {
        Ok(index) => index,
        Err(_) => {
            let (parsed, total) = progress.snapshot();
            Err(FlywheelError::BuildTimeout {
                seconds: timeout_secs,
                parsed,
                total,
            })
        }
    }
}

async fn build_index_inner(root: &Path, progress: Arc<BuildProgress>) -> Result<VaultIndex> {
    let files = scanner::note_files(root);
    progress.total.store(files.len(), Ordering::Relaxed);
    progress.parsed.store(0, Ordering::Relaxed);

    let mut join_set = JoinSet::new();
    for chunk in files.chunks(BUILD_BATCH_SIZE) {
        let chunk: Vec<_> = chunk.to_vec();
        let root = root.to_path_buf();
        let progress = Arc::clone(&progress);
        join_set.spawn_blocking(move || {
            let mut notes = Vec::with_capacity(chunk.len());
            for file in chunk {
                match scanner::parse_note_file(&root, &file) {
                    Ok(parsed) => notes.push(Note::from(parsed)),
                    Err(reason) => {
                        tracing::warn!("Skipping {:?} during build: {:?}", file, reason);
                    }
                }
                progress.parsed.fetch_add(1, Ordering::Relaxed);
            }
            notes
        });
    }

    let mut notes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(batch) => notes.extend(batch),
            // A panicked batch loses its files but not the build.
            Err(err) => tracing::error!("Parse batch failed: {}", err),
        }
    }

    Ok(VaultIndex::from_notes(notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::parse_note_content;

    fn note(path: &str, content: &str) -> Note {
        Note::from(parse_note_content(path, content, 0, None))
    }

    fn sample_index() -> VaultIndex {
        VaultIndex::from_notes(vec![
            note("people/Marcus Johnson.md", "Works on [[Turbopump]].\n"),
            note(
                "projects/Turbopump.md",
                "---\naliases: [The Pump]\n---\nLed by [[Marcus Johnson]] at [[Acme Corp]]. #propulsion\n",
            ),
            note("organizations/Acme Corp.md", "Customer of [[Turbopump]].\n"),
        ])
    }

    #[test]
    fn test_entity_map_resolves_titles_aliases_and_paths() {
        let index = sample_index();
        assert_eq!(
            index.resolve("Turbopump"),
            Some(&"projects/Turbopump.md".to_string())
        );
        assert_eq!(
            index.resolve("the pump"),
            Some(&"projects/Turbopump.md".to_string())
        );
        assert_eq!(
            index.resolve("projects/Turbopump.md"),
            Some(&"projects/Turbopump.md".to_string())
        );
    }

    #[test]
    fn test_backlink_outlink_symmetry() {
        let index = sample_index();
        // Every resolved outlink appears as a backlink on its target.
        for note in index.notes.values() {
            for outlink in &note.outlinks {
                if let Some(resolved) = index.resolve(&outlink.target) {
                    let resolved = resolved.clone();
                    assert!(
                        index
                            .backlinks_for(&resolved)
                            .iter()
                            .any(|b| b.source_path == note.path),
                        "missing backlink {} -> {}",
                        note.path,
                        resolved
                    );
                }
            }
        }
        assert_eq!(index.backlinks_for("projects/Turbopump.md").len(), 2);
    }

    #[test]
    fn test_hub_score_counts_both_directions() {
        let index = sample_index();
        // Turbopump: 2 backlinks + 2 outlinks.
        assert_eq!(index.hub_score("projects/Turbopump.md"), 4);
    }

    #[test]
    fn test_tag_map() {
        let index = sample_index();
        assert!(index.tag_map["propulsion"].contains("projects/Turbopump.md"));
    }

    #[test]
    fn test_title_collision_first_writer_wins_by_path_order() {
        let index = VaultIndex::from_notes(vec![
            note("b/Name.md", "second\n"),
            note("a/Name.md", "first\n"),
        ]);
        // Path order is deterministic: a/ comes first.
        assert_eq!(index.resolve("Name"), Some(&"a/Name.md".to_string()));
        // Both full paths still resolve.
        assert_eq!(index.resolve("b/Name.md"), Some(&"b/Name.md".to_string()));
    }

    #[test]
    fn test_cache_payload_roundtrip_is_value_equal() {
        let index = sample_index();
        let payload = index.to_cache_payload().unwrap();
        let restored = VaultIndex::from_cache_payload(&payload).unwrap();
        assert_eq!(index.notes.len(), restored.notes.len());
        assert_eq!(index.entity_map, restored.entity_map);
        assert_eq!(index.tag_map, restored.tag_map);
        for (key, links) in &index.backlinks {
            assert_eq!(&restored.backlinks[key], links);
        }
    }

    #[test]
    fn test_cache_validity_window() {
        let now = 1_000_000;
        assert!(cache_valid(100, 104, now - 60, now));
        assert!(!cache_valid(100, 110, now - 60, now));
        assert!(!cache_valid(100, 100, now - CACHE_MAX_AGE_SECS, now));
    }
}
