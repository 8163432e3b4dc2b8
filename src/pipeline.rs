//! The batch pipeline. Watch batches arrive as coalesced file
//! events; each batch runs the fixed step sequence that keeps every
//! derived structure consistent: the vault snapshot, the entity
//! rows, hub scores, recency, co-occurrence, link weights,
//! embeddings, the FTS indices, the task cache, the stored link
//! state, and the implicit-feedback loop. Batches are strictly
//! serial; a batch that arrives mid-flight waits its turn.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::db;
use crate::embedding::{EmbedCache, Embedder, content_hash};
use crate::entity::{self, EntityIndex};
use crate::error::IndexStatus;
use crate::fts::schema::{entity_schema, note_schema};
use crate::fts::utils as fts;
use crate::rewrite;
use crate::scanner::{self, ParsedNote};
use crate::score::SuggestIndex;
use crate::store::{self, cooccurrence, entities, events, feedback, links, recency, tags};
use crate::vault::{BuildProgress, Note, VaultIndex, cache_valid};
use crate::watch::{FileEvent, FileEventKind, WatchMessage};

/// Seconds between edge-weight recomputes.
const EDGE_WEIGHT_STALENESS_SECS: i64 = 3600;
/// Surviving this many edits earns an implicit "kept" signal.
const KEPT_EDIT_THRESHOLD: u32 = 3;
/// Delete+add pairs closer than this collapse into a rename.
const RENAME_WINDOW_SECS: i64 = 5;

/// Process-wide index state. Snapshots are replaced, never mutated,
/// so readers always observe a consistent view.
pub struct IndexState {
    pub vault: Option<Arc<VaultIndex>>,
    pub entities: Arc<EntityIndex>,
    pub suggest: Arc<SuggestIndex>,
    pub status: IndexStatus,
    /// Set while the watcher is recovering; reads still succeed but
    /// carry a staleness warning.
    pub dirty: bool,
    pub progress: Arc<BuildProgress>,
}

impl IndexState {
    pub fn new() -> IndexState {
        IndexState {
            vault: None,
            entities: Arc::new(EntityIndex::default()),
            suggest: Arc::new(SuggestIndex::default()),
            status: IndexStatus::Building { parsed: 0, total: 0 },
            dirty: false,
            progress: Arc::new(BuildProgress::default()),
        }
    }
}

impl Default for IndexState {
    fn default() -> Self {
        IndexState::new()
    }
}

pub type SharedIndex = Arc<RwLock<IndexState>>;

/// One unit of work in a batch, after rename detection.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    Upsert(String),
    Delete(String),
    Rename { from: String, to: String },
}

/// Collapse `{delete p1, add p2}` pairs with the same filename stem
/// into renames. Events inside one batch are close enough in time by
/// construction; the window guard protects rescan batches that mix
/// stale deletes with unrelated adds.
pub fn detect_renames(
    events: &[FileEvent],
    root: &std::path::Path,
    modified_within: impl Fn(&str) -> Option<i64>,
) -> Vec<BatchItem> {
    let rel = |p: &PathBuf| -> Option<String> {
        p.strip_prefix(root)
            .ok()
            .map(scanner::normalize_rel_path)
    };

    let mut deletes: Vec<String> = Vec::new();
    let mut adds: Vec<String> = Vec::new();
    let mut changes: Vec<String> = Vec::new();
    for event in events {
        let Some(path) = rel(&event.path) else { continue };
        match event.kind {
            FileEventKind::Delete => deletes.push(path),
            FileEventKind::Add => adds.push(path),
            FileEventKind::Change => changes.push(path),
        }
    }

    let stem = |p: &str| -> String {
        std::path::Path::new(p)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    };

    let mut items = Vec::new();
    let mut claimed_adds: HashSet<usize> = HashSet::new();
    for deleted in &deletes {
        let deleted_stem = stem(deleted);
        let pair = adds.iter().enumerate().find(|(i, added)| {
            !claimed_adds.contains(i) && stem(added) == deleted_stem && *added != deleted
        });
        if let Some((i, added)) = pair {
            let recent = modified_within(added)
                .map(|age| age <= RENAME_WINDOW_SECS)
                .unwrap_or(true);
            if recent {
                claimed_adds.insert(i);
                items.push(BatchItem::Rename {
                    from: deleted.clone(),
                    to: added.clone(),
                });
                continue;
            }
        }
        items.push(BatchItem::Delete(deleted.clone()));
    }
    for (i, added) in adds.iter().enumerate() {
        if !claimed_adds.contains(&i) {
            items.push(BatchItem::Upsert(added.clone()));
        }
    }
    for changed in changes {
        items.push(BatchItem::Upsert(changed));
    }
    items
}

/// Records per-step outcome into `index_events` and the log.
struct StepTracker {
    batch_id: String,
    db: tokio_rusqlite::Connection,
}

impl StepTracker {
    fn new(db: tokio_rusqlite::Connection) -> StepTracker {
        StepTracker {
            batch_id: uuid::Uuid::new_v4().to_string(),
            db,
        }
    }

    async fn record(&self, step: &str, started: Instant, outcome: &str, detail: Option<String>) {
        let record = events::StepRecord {
            batch_id: self.batch_id.clone(),
            step: step.to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
            outcome: outcome.to_string(),
            detail,
        };
        tracing::debug!(
            "step {} finished in {}ms ({})",
            record.step,
            record.duration_ms,
            record.outcome
        );
        let result = self
            .db
            .call(move |conn| {
                events::record_step(conn, &record)?;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            tracing::warn!("Failed to record step event: {}", err);
        }
    }
}

pub struct Pipeline {
    pub config: AppConfig,
    pub db: tokio_rusqlite::Connection,
    pub state: SharedIndex,
    pub embedder: Arc<dyn Embedder>,
    pub embed_cache: Arc<EmbedCache>,
}

#[derive(Debug, Default)]
struct LinkDiff {
    added: HashSet<String>,
    removed: HashSet<String>,
    survivors: HashSet<String>,
    first_run: bool,
}

impl Pipeline {
    /// Open-or-rebuild flow at startup: reload the cached vault
    /// index when it is fresh enough, otherwise scan from disk, then
    /// run a full batch so every derived table catches up.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let scanned = scanner::note_files(&self.config.vault_path).len();
        let cached = self
            .db
            .call(|conn| Ok(store::cache::load(conn)?))
            .await?;

        let now = store::now();
        let vault = match cached {
            Some(c) if cache_valid(c.note_count, scanned, c.built_at, now) => {
                match VaultIndex::from_cache_payload(&c.payload) {
                    Ok(index) => {
                        tracing::debug!("Reusing cached vault index ({} notes)", c.note_count);
                        index
                    }
                    Err(err) => {
                        tracing::warn!("Vault cache unreadable, rebuilding: {}", err);
                        self.full_build().await?
                    }
                }
            }
            _ => self.full_build().await?,
        };

        let all_paths: Vec<String> = vault.notes.keys().cloned().collect();
        {
            let mut state = self.state.write().unwrap();
            state.vault = Some(Arc::new(vault));
        }
        let items: Vec<BatchItem> = all_paths.into_iter().map(BatchItem::Upsert).collect();
        self.process_items(items, true).await?;

        {
            let mut state = self.state.write().unwrap();
            state.status = IndexStatus::Ready;
        }
        Ok(())
    }

    async fn full_build(&self) -> anyhow::Result<VaultIndex> {
        let progress = {
            let state = self.state.read().unwrap();
            Arc::clone(&state.progress)
        };
        let built = crate::vault::build_index(
            &self.config.vault_path,
            Arc::clone(&progress),
            self.config.build_timeout_secs,
        )
        .await;

        match built {
            Ok(index) => {
                let payload = index.to_cache_payload()?;
                let count = index.notes.len();
                self.db
                    .call(move |conn| {
                        store::cache::save(conn, &payload, count)?;
                        Ok(())
                    })
                    .await?;
                Ok(index)
            }
            Err(err) => {
                let (parsed, total) = progress.snapshot();
                let mut state = self.state.write().unwrap();
                state.status = IndexStatus::Error {
                    message: err.to_string(),
                };
                state.progress.parsed.store(parsed, std::sync::atomic::Ordering::Relaxed);
                state.progress.total.store(total, std::sync::atomic::Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// Consume watch messages until the channel closes. Batches run
    /// strictly in arrival order.
    pub async fn run(&self, mut rx: mpsc::Receiver<WatchMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                WatchMessage::Batch(events) => {
                    let items = detect_renames(&events, &self.config.vault_path, |path| {
                        let abs = self.config.vault_path.join(path);
                        std::fs::metadata(abs)
                            .and_then(|m| m.modified())
                            .ok()
                            .and_then(|t| t.elapsed().ok())
                            .map(|d| d.as_secs() as i64)
                    });
                    if let Err(err) = self.process_items(items, false).await {
                        tracing::error!("Batch failed: {}", err);
                    }
                }
                WatchMessage::Rescan => {
                    if let Err(err) = self.rescan().await {
                        tracing::error!("Rescan failed: {}", err);
                    } else {
                        let mut state = self.state.write().unwrap();
                        state.dirty = false;
                    }
                }
                WatchMessage::Failed(message) => {
                    tracing::error!("Watcher gave up: {}", message);
                    let mut state = self.state.write().unwrap();
                    state.dirty = true;
                    state.status = IndexStatus::Error { message };
                }
            }
        }
    }

    /// Reconcile against the filesystem after watcher recovery.
    pub async fn rescan(&self) -> anyhow::Result<()> {
        let on_disk: HashSet<String> = scanner::note_files(&self.config.vault_path)
            .iter()
            .filter_map(|p| p.strip_prefix(&self.config.vault_path).ok())
            .map(scanner::normalize_rel_path)
            .collect();
        let known: HashSet<String> = {
            let state = self.state.read().unwrap();
            state
                .vault
                .as_ref()
                .map(|v| v.notes.keys().cloned().collect())
                .unwrap_or_default()
        };

        let mut items: Vec<BatchItem> = Vec::new();
        for gone in known.difference(&on_disk) {
            items.push(BatchItem::Delete(gone.clone()));
        }
        for path in &on_disk {
            items.push(BatchItem::Upsert(path.clone()));
        }
        self.process_items(items, false).await
    }

    /// The 15-step batch body. `first_run` suppresses implicit
    /// feedback so initial indexing never counts as user edits.
    pub async fn process_items(&self, items: Vec<BatchItem>, first_run: bool) -> anyhow::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let tracker = StepTracker::new(self.db.clone());
        tracing::debug!("Processing batch of {} items", items.len());

        // Steps 1 + 2: parse changed files, apply renames, swap in
        // the new vault snapshot.
        let started = Instant::now();
        let (new_vault, parsed_notes, removed_paths, renames) = self.parse_and_upsert(&items).await?;
        let new_vault = Arc::new(new_vault);
        tracker
            .record(
                "parse_upsert",
                started,
                "ok",
                Some(format!("{} parsed, {} removed", parsed_notes.len(), removed_paths.len())),
            )
            .await;

        let started = Instant::now();
        {
            let renames = renames.clone();
            self.db
                .call(move |conn| {
                    for (from, to) in &renames {
                        links::rename_path(conn, from, to)?;
                        entities::rename_path(conn, from, to)?;
                        events::record_move(conn, from, to)?;
                    }
                    Ok(())
                })
                .await?;
        }
        tracker.record("renames", started, "ok", None).await;

        // Step 3: entity delta against the previous snapshot.
        let started = Instant::now();
        let new_entities = Arc::new(EntityIndex::build(&new_vault));
        let old_entities = {
            let state = self.state.read().unwrap();
            Arc::clone(&state.entities)
        };
        let (added_entities, removed_entities) =
            self.apply_entity_delta(&old_entities, &new_entities).await?;
        tracker
            .record(
                "entity_delta",
                started,
                "ok",
                Some(format!("+{} -{}", added_entities, removed_entities)),
            )
            .await;

        // Step 4: hub scores. The entity rows were written with the
        // fresh hub values already; this refreshes rows whose note
        // did not change but whose neighborhood did.
        let started = Instant::now();
        {
            let refresh: Vec<(String, u32)> = new_entities
                .iter()
                .map(|e| (e.name.clone(), e.hub_score))
                .collect();
            self.db
                .call(move |conn| {
                    for (name, hub) in &refresh {
                        entities::set_hub_score(conn, name, *hub)?;
                    }
                    Ok(())
                })
                .await?;
        }
        tracker.record("hub_scores", started, "ok", None).await;

        // Step 5: recency bump for entities appearing in changed
        // notes. "Changed" means the body hash moved; rescans after
        // recovery must not make every entity look fresh.
        let started = Instant::now();
        let changed_notes = self.content_changed(&parsed_notes).await;
        let mentioned = self.mentioned_entities(&changed_notes, &new_entities);
        {
            let mentioned = mentioned.clone();
            self.db
                .call(move |conn| {
                    let ts = store::now();
                    for entity in &mentioned {
                        recency::bump(conn, entity, ts)?;
                    }
                    Ok(())
                })
                .await?;
        }
        tracker
            .record("recency", started, "ok", Some(format!("{} entities", mentioned.len())))
            .await;

        // Step 6: co-occurrence, diffed per changed note against the
        // stored link set (which still holds the previous state).
        let started = Instant::now();
        {
            let per_note: Vec<(String, HashSet<String>)> = parsed_notes
                .iter()
                .map(|n| (n.path.clone(), self.note_entity_set(n, &new_entities)))
                .collect();
            self.db
                .call(move |conn| {
                    for (path, current) in &per_note {
                        let previous = links::link_set(conn, path)?;
                        cooccurrence::update_for_note(conn, &previous, current)?;
                    }
                    Ok(())
                })
                .await?;
        }
        tracker.record("cooccurrence", started, "ok", None).await;

        // Step 7: edge weights, staleness-gated.
        let started = Instant::now();
        {
            let changed_paths: Vec<String> = parsed_notes.iter().map(|n| n.path.clone()).collect();
            let refreshed = self
                .db
                .call(move |conn| {
                    let age = db::component_age_secs(conn, "edge_weights")?;
                    let stale = age.map(|a| a >= EDGE_WEIGHT_STALENESS_SECS).unwrap_or(true);
                    if !stale {
                        return Ok(false);
                    }
                    for path in &changed_paths {
                        links::sync_history_signal(conn, path)?;
                        links::recompute_weights(conn, path)?;
                    }
                    db::mark_component_built(conn, "edge_weights")?;
                    Ok(true)
                })
                .await?;
            tracker
                .record(
                    "edge_weights",
                    started,
                    if refreshed { "ok" } else { "skipped" },
                    None,
                )
                .await;
        }

        // Steps 8 + 9: note and entity embeddings, hash-gated.
        let started = Instant::now();
        let embedded_notes = self.refresh_note_embeddings(&parsed_notes).await;
        tracker
            .record(
                "note_embeddings",
                started,
                "ok",
                Some(format!("{} embedded", embedded_notes)),
            )
            .await;

        let started = Instant::now();
        let embedded_entities = self
            .refresh_entity_embeddings(&new_entities, &parsed_notes)
            .await;
        tracker
            .record(
                "entity_embeddings",
                started,
                "ok",
                Some(format!("{} embedded", embedded_entities)),
            )
            .await;

        // Step 11: task cache, atomic swap scoped to changed files.
        let started = Instant::now();
        {
            let notes: Vec<(String, Vec<scanner::TaskItem>)> = parsed_notes
                .iter()
                .map(|n| (n.path.clone(), n.tasks.clone()))
                .collect();
            let removed = removed_paths.clone();
            self.db
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    for (path, tasks) in &notes {
                        tx.execute("DELETE FROM task_cache WHERE path = ?1", rusqlite::params![path])?;
                        let mut stmt = tx.prepare(
                            "INSERT INTO task_cache (path, line, text, done) VALUES (?1, ?2, ?3, ?4)",
                        )?;
                        for task in tasks {
                            stmt.execute(rusqlite::params![
                                path,
                                task.line as i64,
                                task.text,
                                task.done as i64
                            ])?;
                        }
                    }
                    for path in &removed {
                        tx.execute("DELETE FROM task_cache WHERE path = ?1", rusqlite::params![path])?;
                    }
                    tx.execute(
                        "INSERT INTO fts_metadata (component, built_at) VALUES ('task_cache', strftime('%s','now'))
                         ON CONFLICT(component) DO UPDATE SET built_at = excluded.built_at",
                        [],
                    )?;
                    tx.commit()?;
                    Ok(())
                })
                .await?;
        }
        tracker.record("task_cache", started, "ok", None).await;

        // Step 12: forward-link diff and persistence. Survival
        // counts only move for notes whose content actually changed;
        // a rescan is not an edit.
        let started = Instant::now();
        let changed_paths: HashSet<String> =
            changed_notes.iter().map(|n| n.path.clone()).collect();
        let diffs = self
            .diff_links(&parsed_notes, &new_entities, &changed_paths)
            .await?;
        tracker
            .record("link_diff", started, "ok", Some(format!("{} notes", diffs.len())))
            .await;

        // Step 13: unlinked mentions reconciled with applications.
        let started = Instant::now();
        let delinked = self.reconcile_unlinked(&parsed_notes, &new_entities, &diffs).await?;
        tracker
            .record(
                "unlinked_scan",
                started,
                "ok",
                Some(format!("{} de-linked mentions", delinked)),
            )
            .await;

        // Step 14: implicit feedback. First runs seed silently.
        let started = Instant::now();
        if first_run {
            tracker.record("implicit_feedback", started, "seeded", None).await;
        } else {
            self.implicit_feedback(&diffs).await?;
            tracker.record("implicit_feedback", started, "ok", None).await;
        }

        // Step 15: tag deltas, same first-run pattern.
        let started = Instant::now();
        {
            let notes: Vec<(String, std::collections::BTreeSet<String>)> = parsed_notes
                .iter()
                .map(|n| (n.path.clone(), n.tags.clone()))
                .collect();
            self.db
                .call(move |conn| {
                    for (path, current) in &notes {
                        let seeded = !tags::is_first_run(conn, path)?;
                        if seeded {
                            let previous = tags::tag_set(conn, path)?;
                            if &previous != current {
                                tracing::debug!(
                                    "tags changed for {}: +{} -{}",
                                    path,
                                    current.difference(&previous).count(),
                                    previous.difference(current).count()
                                );
                            }
                        }
                        tags::replace_tag_set(conn, path, current)?;
                    }
                    Ok(())
                })
                .await?;
        }
        tracker.record("tag_scan", started, "ok", None).await;

        // Step 10 (last on purpose: it snapshots everything the
        // steps above wrote): rebuild the in-memory suggestion index
        // and publish the new snapshots together.
        let started = Instant::now();
        let suggest = {
            let entities_for_build = Arc::clone(&new_entities);
            let batch_id = tracker.batch_id.clone();
            self.db
                .call(move |conn| {
                    events::metadata_set(conn, "last_batch", &batch_id)?;
                    Ok(SuggestIndex::build(&entities_for_build, conn)?)
                })
                .await?
        };
        {
            let mut state = self.state.write().unwrap();
            state.vault = Some(Arc::clone(&new_vault));
            state.entities = Arc::clone(&new_entities);
            state.suggest = Arc::new(suggest);
        }
        tracker.record("suggest_index", started, "ok", None).await;

        Ok(())
    }

    /// Steps 1-2 worker: parse files with bounded concurrency and
    /// produce the next vault snapshot.
    async fn parse_and_upsert(
        &self,
        items: &[BatchItem],
    ) -> anyhow::Result<(VaultIndex, Vec<ParsedNote>, Vec<String>, Vec<(String, String)>)> {
        let mut to_parse: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        let mut renames: Vec<(String, String)> = Vec::new();
        for item in items {
            match item {
                BatchItem::Upsert(path) => to_parse.push(path.clone()),
                BatchItem::Delete(path) => removed.push(path.clone()),
                BatchItem::Rename { from, to } => {
                    renames.push((from.clone(), to.clone()));
                    removed.push(from.clone());
                    to_parse.push(to.clone());
                }
            }
        }

        let root = self.config.vault_path.clone();
        let mut parsed: Vec<ParsedNote> = Vec::new();
        let mut join_set = tokio::task::JoinSet::new();
        for chunk in to_parse.chunks(self.config.batch_concurrency.max(1)) {
            let chunk: Vec<String> = chunk.to_vec();
            let root = root.clone();
            join_set.spawn_blocking(move || {
                let mut out = Vec::new();
                for rel in chunk {
                    let abs = root.join(&rel);
                    match scanner::parse_note_file(&root, &abs) {
                        Ok(note) => out.push(note),
                        Err(reason) => {
                            tracing::warn!("Skipping {} in batch: {:?}", rel, reason);
                        }
                    }
                }
                out
            });
            // Keep the loop cooperative on large rescans.
            tokio::task::yield_now().await;
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(batch) => parsed.extend(batch),
                Err(err) => tracing::error!("Parse chunk failed: {}", err),
            }
        }

        let previous = {
            let state = self.state.read().unwrap();
            state.vault.clone()
        };
        let mut vault = previous
            .map(|v| (*v).clone())
            .unwrap_or_default();
        for path in &removed {
            vault.notes.remove(path);
        }
        for note in &parsed {
            vault
                .notes
                .insert(note.path.clone(), Note::from(note.clone()));
        }
        vault.built_at = store::now();
        vault.rebuild_derived();

        // Orphaned rows for deleted notes (not renames; those were
        // rewritten already).
        let deleted_only: Vec<String> = removed
            .iter()
            .filter(|p| !renames.iter().any(|(from, _)| &from == p))
            .cloned()
            .collect();
        if !deleted_only.is_empty() {
            let deleted = deleted_only.clone();
            self.db
                .call(move |conn| {
                    for path in &deleted {
                        links::remove_note(conn, path)?;
                        store::embeddings::remove_note(conn, path)?;
                    }
                    Ok(())
                })
                .await?;
        }

        // Keep the notes FTS in step with the snapshot.
        {
            let schema = note_schema();
            let dir = self.config.notes_fts_path();
            let parsed_for_fts = parsed.clone();
            let removed_for_fts = removed.clone();
            let fts_result = tokio::task::spawn_blocking(move || -> tantivy::Result<()> {
                let index = fts::open_or_create(&dir, schema.clone())?;
                let mut writer = index.writer(15_000_000)?;
                for path in &removed_for_fts {
                    fts::delete_note_doc(&mut writer, &schema, path)?;
                }
                for note in &parsed_for_fts {
                    let record = Note::from(note.clone());
                    fts::upsert_note_doc(&mut writer, &schema, &record, &note.body)?;
                }
                writer.commit()?;
                Ok(())
            })
            .await;
            match fts_result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("Notes FTS update failed: {}", err),
                Err(err) => tracing::warn!("Notes FTS task failed: {}", err),
            }
        }

        Ok((vault, parsed, removed, renames))
    }

    /// Step 3 worker: upsert added/changed entity rows, drop removed
    /// ones along with their keyed state, and mirror into the entity
    /// FTS index.
    async fn apply_entity_delta(
        &self,
        old: &EntityIndex,
        new: &EntityIndex,
    ) -> anyhow::Result<(usize, usize)> {
        let mut upserts = Vec::new();
        for entity in new.iter() {
            let changed = match old.get(&entity.name) {
                Some(previous) => previous != entity,
                None => true,
            };
            if changed {
                upserts.push(entity.clone());
            }
        }
        let removed: Vec<String> = old
            .iter()
            .filter(|e| new.get(&e.name).is_none())
            .map(|e| e.name.clone())
            .collect();

        let added = upserts.len();
        let dropped = removed.len();
        {
            let upserts = upserts.clone();
            let removed = removed.clone();
            self.db
                .call(move |conn| {
                    for entity in &upserts {
                        entities::upsert(conn, entity)?;
                    }
                    for name in &removed {
                        entities::remove(conn, name)?;
                        recency::remove(conn, name)?;
                        cooccurrence::remove_entity(conn, name)?;
                        feedback::remove_entity(conn, name)?;
                        store::embeddings::remove_entity(conn, name)?;
                    }
                    Ok(())
                })
                .await?;
        }

        let schema = entity_schema();
        let dir = self.config.entities_fts_path();
        let fts_result = tokio::task::spawn_blocking(move || -> tantivy::Result<()> {
            let index = fts::open_or_create(&dir, schema.clone())?;
            let mut writer = index.writer(15_000_000)?;
            for name in &removed {
                fts::delete_entity_doc(&mut writer, &schema, name)?;
            }
            for entity in &upserts {
                fts::upsert_entity_doc(&mut writer, &schema, entity)?;
            }
            writer.commit()?;
            Ok(())
        })
        .await;
        match fts_result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Entity FTS update failed: {}", err),
            Err(err) => tracing::warn!("Entity FTS task failed: {}", err),
        }

        Ok((added, dropped))
    }

    /// Subset of the batch whose body differs from the last stored
    /// content hash (kept by the embedding metadata).
    async fn content_changed(&self, parsed: &[ParsedNote]) -> Vec<ParsedNote> {
        let hashes: Vec<(String, String)> = parsed
            .iter()
            .map(|n| (n.path.clone(), content_hash(&n.body)))
            .collect();
        let changed: HashSet<String> = self
            .db
            .call(move |conn| {
                let mut out = HashSet::new();
                for (path, hash) in &hashes {
                    if store::embeddings::note_hash(conn, path)?.as_deref() != Some(hash.as_str()) {
                        out.insert(path.clone());
                    }
                }
                Ok(out)
            })
            .await
            .unwrap_or_else(|_| parsed.iter().map(|n| n.path.clone()).collect());
        parsed
            .iter()
            .filter(|n| changed.contains(&n.path))
            .cloned()
            .collect()
    }

    /// Entities "appearing" in a changed note: its resolved links
    /// plus plain-text mentions, plus the note's own entity.
    fn mentioned_entities(
        &self,
        parsed: &[ParsedNote],
        entities: &EntityIndex,
    ) -> HashSet<String> {
        let mut out = HashSet::new();
        for note in parsed {
            for entity in self.note_entity_set(note, entities) {
                out.insert(entity);
            }
            let mentions = rewrite::find_unlinked_mentions(&note.body, entities, &HashSet::new());
            for mention in mentions {
                out.insert(mention.entity);
            }
        }
        out
    }

    /// The resolved entity-link set of one note, plus the entity the
    /// note itself backs (a note co-occurs with what it links).
    fn note_entity_set(&self, note: &ParsedNote, entities: &EntityIndex) -> HashSet<String> {
        let mut out: HashSet<String> = note
            .outlinks
            .iter()
            .filter_map(|l| entities.resolve_surface(&l.target))
            .map(|e| e.name.clone())
            .collect();
        if let Some(own) = entities.get(&note.title) {
            if own.path == note.path {
                out.insert(own.name.clone());
            }
        }
        out
    }

    /// Step 8 worker. Returns how many notes were re-embedded.
    async fn refresh_note_embeddings(&self, parsed: &[ParsedNote]) -> usize {
        let mut embedded = 0;
        for note in parsed {
            let hash = content_hash(&note.body);
            let path = note.path.clone();
            let stale = {
                let path = path.clone();
                let hash = hash.clone();
                self.db
                    .call(move |conn| {
                        Ok(store::embeddings::note_hash(conn, &path)?.as_deref() != Some(hash.as_str()))
                    })
                    .await
                    .unwrap_or(true)
            };
            if !stale {
                continue;
            }
            match self.embed_cache.embed(self.embedder.as_ref(), &note.body) {
                Ok(vector) => {
                    let store_result = self
                        .db
                        .call(move |conn| {
                            store::embeddings::upsert_note_embedding(conn, &path, &hash, &vector)?;
                            Ok(())
                        })
                        .await;
                    match store_result {
                        Ok(()) => embedded += 1,
                        Err(err) => tracing::warn!("Storing note embedding failed: {}", err),
                    }
                }
                Err(err) => {
                    tracing::debug!("Note embedding degraded for {}: {}", note.path, err);
                }
            }
        }
        embedded
    }

    /// Step 9 worker: re-embed entities whose backing text changed.
    async fn refresh_entity_embeddings(
        &self,
        entities: &EntityIndex,
        parsed: &[ParsedNote],
    ) -> usize {
        let changed_paths: HashMap<String, &ParsedNote> =
            parsed.iter().map(|n| (n.path.clone(), n)).collect();
        let mut embedded = 0;
        for entity in entities.iter() {
            let Some(note) = changed_paths.get(&entity.path) else {
                continue;
            };
            let text = entity::embedding_text(entity, &note.body);
            let hash = content_hash(&text);
            let name = entity.name.clone();
            let stale = {
                let name = name.clone();
                let hash = hash.clone();
                self.db
                    .call(move |conn| {
                        Ok(store::embeddings::entity_hash(conn, &name)?.as_deref()
                            != Some(hash.as_str()))
                    })
                    .await
                    .unwrap_or(true)
            };
            if !stale {
                continue;
            }
            match self.embed_cache.embed(self.embedder.as_ref(), &text) {
                Ok(vector) => {
                    let store_result = self
                        .db
                        .call(move |conn| {
                            store::embeddings::upsert_entity_embedding(conn, &name, &hash, &vector)?;
                            Ok(())
                        })
                        .await;
                    match store_result {
                        Ok(()) => embedded += 1,
                        Err(err) => tracing::warn!("Storing entity embedding failed: {}", err),
                    }
                }
                Err(err) => {
                    tracing::debug!("Entity embedding degraded for {}: {}", entity.name, err);
                }
            }
        }
        embedded
    }

    /// Step 12 worker: compute the link diff per changed note and
    /// persist the new sets atomically.
    async fn diff_links(
        &self,
        parsed: &[ParsedNote],
        entities: &EntityIndex,
        changed: &HashSet<String>,
    ) -> anyhow::Result<HashMap<String, LinkDiff>> {
        let per_note: Vec<(String, HashSet<String>, bool)> = parsed
            .iter()
            .map(|n| {
                (
                    n.path.clone(),
                    self.note_entity_set(n, entities),
                    changed.contains(&n.path),
                )
            })
            .collect();

        let diffs = self
            .db
            .call(move |conn| {
                let mut out: HashMap<String, LinkDiff> = HashMap::new();
                for (path, current, edited) in per_note {
                    let seen_key = format!("links_seen:{}", path);
                    let first_run = events::metadata_get(conn, &seen_key)?.is_none();
                    let previous = links::link_set(conn, &path)?;

                    let mut diff = LinkDiff {
                        first_run,
                        ..Default::default()
                    };
                    if !first_run {
                        diff.added = current.difference(&previous).cloned().collect();
                        diff.removed = previous.difference(&current).cloned().collect();
                    }
                    diff.survivors = current.intersection(&previous).cloned().collect();

                    links::replace_link_set(conn, &path, &current)?;
                    if edited {
                        links::record_survivals(conn, &path, &diff.survivors)?;
                    }
                    events::metadata_set(conn, &seen_key, "1")?;
                    out.insert(path, diff);
                }
                Ok(out)
            })
            .await?;
        Ok(diffs)
    }

    /// Step 13 worker: survey mentions that lost their links so the
    /// unlinked-mention report stays current. Status changes and
    /// feedback stay in step 14, which still sees the applications
    /// untouched.
    async fn reconcile_unlinked(
        &self,
        parsed: &[ParsedNote],
        entities: &EntityIndex,
        diffs: &HashMap<String, LinkDiff>,
    ) -> anyhow::Result<usize> {
        let mut delinked = 0;
        for note in parsed {
            let Some(diff) = diffs.get(&note.path) else { continue };
            if diff.removed.is_empty() {
                continue;
            }
            let mentions: HashSet<String> =
                rewrite::find_unlinked_mentions(&note.body, entities, &HashSet::new())
                    .into_iter()
                    .map(|m| m.entity)
                    .collect();
            for entity in &diff.removed {
                if mentions.contains(entity) {
                    tracing::debug!("{} de-linked but still mentions {}", note.path, entity);
                    delinked += 1;
                }
            }
        }
        Ok(delinked)
    }

    /// Step 14 worker: translate link diffs into implicit feedback
    /// and refresh the suppression table. Recording failures are
    /// swallowed with a log line.
    async fn implicit_feedback(&self, diffs: &HashMap<String, LinkDiff>) -> anyhow::Result<()> {
        let diffs: Vec<(String, Vec<String>, Vec<String>, Vec<String>)> = diffs
            .iter()
            .filter(|(_, d)| !d.first_run)
            .map(|(path, d)| {
                (
                    path.clone(),
                    d.added.iter().cloned().collect(),
                    d.removed.iter().cloned().collect(),
                    d.survivors.iter().cloned().collect(),
                )
            })
            .collect();

        let result = self
            .db
            .call(move |conn| {
                for (path, added, removed, survivors) in &diffs {
                    let applied = links::applied_entities(conn, path)?;
                    for entity in removed {
                        if applied.contains(entity) {
                            feedback::record(conn, entity, "implicit:removed", path, false)?;
                            links::mark_application(conn, path, entity, "removed")?;
                        }
                    }
                    for entity in added {
                        if !applied.contains(entity) {
                            feedback::record(conn, entity, "implicit:manual_added", path, true)?;
                        }
                    }
                    for entity in survivors {
                        if links::survived_edits(conn, path, entity)? == KEPT_EDIT_THRESHOLD {
                            feedback::record(conn, entity, "implicit:kept", path, true)?;
                        }
                    }
                }
                feedback::recompute_suppressions(conn)?;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            tracing::warn!("Implicit feedback recording failed: {}", err);
        }
        Ok(())
    }
}
