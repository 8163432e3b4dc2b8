//! The suggestion scoring engine. Given content and a host note, it
//! ranks candidate entities through a stack of additive layers:
//! lexical match, co-occurrence, type, folder context, recency,
//! cross-folder, hub centrality, persistent feedback, semantic
//! similarity, and link quality. Everything here is in-memory and
//! deterministic; the pipeline rebuilds the consulted snapshot
//! (`SuggestIndex`) whenever the underlying state changes.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use rust_stemmers::{Algorithm, Stemmer};
use serde::Serialize;

use crate::embedding::{EmbedCache, Embedder, cosine_similarity};
use crate::entity::{Category, Entity, EntityIndex};
use crate::store::feedback::AccuracyStats;
use crate::store::recency::RecencyRow;
use crate::store::{cooccurrence, feedback, folder_of, links, recency};
use crate::vault::normalize_name;

const EXACT_WORD_BONUS: f64 = 10.0;
const SINGLE_WORD_ALIAS_BONUS: f64 = 8.0;
const COOCCURRENCE_STEP: f64 = 3.0;
const COOCCURRENCE_CAP: f64 = 6.0;
const CROSS_FOLDER_BONUS: f64 = 3.0;
const SEMANTIC_SCALE: f64 = 12.0;
const SEMANTIC_MIN_SIMILARITY: f32 = 0.30;
const SEMANTIC_MIN_CONTENT_LEN: usize = 20;
const MAX_NAME_LEN: usize = 25;
const MAX_NAME_WORDS: usize = 3;

/// Names too generic to ever be useful links.
const GENERIC_STOPSET: &[&str] = &[
    "message", "file", "info", "item", "list", "name", "type", "value", "result", "issue",
    "example", "option", "note", "task", "data", "page", "text", "thing", "test", "today",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Conservative,
    Balanced,
    Aggressive,
}

impl Strictness {
    pub fn parse(s: &str) -> Option<Strictness> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Some(Strictness::Conservative),
            "balanced" => Some(Strictness::Balanced),
            "aggressive" => Some(Strictness::Aggressive),
            _ => None,
        }
    }

    pub fn min_score(&self) -> f64 {
        match self {
            Strictness::Conservative => 15.0,
            Strictness::Balanced => 8.0,
            Strictness::Aggressive => 5.0,
        }
    }

    /// Minimum fraction of a multi-word name that must match. Under
    /// `conservative` this doubles as the multiple-match requirement:
    /// a two-word name with one matched word sits at 0.5 and fails.
    pub fn min_word_ratio(&self) -> f64 {
        match self {
            Strictness::Conservative => 0.6,
            Strictness::Balanced => 0.4,
            Strictness::Aggressive => 0.3,
        }
    }

    pub fn stem_bonus(&self) -> f64 {
        match self {
            Strictness::Conservative => 3.0,
            Strictness::Balanced => 5.0,
            Strictness::Aggressive => 6.0,
        }
    }

    pub fn semantic_multiplier(&self) -> f64 {
        match self {
            Strictness::Conservative => 0.6,
            Strictness::Balanced => 1.0,
            Strictness::Aggressive => 1.3,
        }
    }
}

/// Threshold scaled by content length: short snippets get a lower
/// bar, long documents a higher one.
pub fn adaptive_threshold(strictness: Strictness, content_len: usize) -> f64 {
    let base = strictness.min_score();
    if content_len < 50 {
        (base * 0.6).floor().max(5.0)
    } else if content_len <= 200 {
        base
    } else {
        (base * 1.2).floor()
    }
}

/// Everything the engine consults, snapshotted so scoring never
/// suspends. Rebuilt by the pipeline after each batch.
#[derive(Default)]
pub struct SuggestIndex {
    pub entities: Vec<Entity>,
    pub recency: HashMap<String, RecencyRow>,
    pub cooccur: HashMap<String, Vec<String>>,
    pub feedback_global: HashMap<String, AccuracyStats>,
    pub feedback_folder: HashMap<(String, String), AccuracyStats>,
    pub suppressed: HashSet<String>,
    pub folder_suppressed: HashSet<(String, String)>,
    pub edge_weights: HashMap<String, f64>,
    pub embeddings: HashMap<String, Vec<f32>>,
    pub built_at: i64,
}

impl SuggestIndex {
    pub fn build(entities: &EntityIndex, db: &Connection) -> rusqlite::Result<SuggestIndex> {
        Ok(SuggestIndex {
            entities: entities.iter().cloned().collect(),
            recency: recency::all(db)?,
            cooccur: cooccurrence::partners(db)?,
            feedback_global: feedback::global_stats(db)?,
            feedback_folder: feedback::folder_stats(db)?,
            suppressed: feedback::suppressed(db)?,
            folder_suppressed: feedback::folder_suppressed(db)?,
            edge_weights: links::average_weights(db)?,
            embeddings: crate::store::embeddings::all_entity_embeddings(db)?,
            built_at: crate::store::now(),
        })
    }

    /// Canonical names suppressed for this host note: global plus
    /// the host's folder scope. The rewriter takes the same set.
    pub fn suppressed_for(&self, host_path: &str) -> HashSet<String> {
        let folder = folder_of(host_path);
        let mut out = self.suppressed.clone();
        for (f, entity) in &self.folder_suppressed {
            if f == folder {
                out.insert(entity.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdown {
    pub content_match: f64,
    pub cooccurrence: f64,
    pub type_boost: f64,
    pub folder_context: f64,
    pub recency: f64,
    pub cross_folder: f64,
    pub hub: f64,
    pub feedback: f64,
    pub semantic: f64,
    pub edge_weight: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.content_match
            + self.cooccurrence
            + self.type_boost
            + self.folder_context
            + self.recency
            + self.cross_folder
            + self.hub
            + self.feedback
            + self.semantic
            + self.edge_weight
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub name: String,
    pub path: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub content: String,
    pub host_path: String,
    pub max_suggestions: usize,
    pub strictness: Strictness,
}

fn stemmer() -> &'static Stemmer {
    static STEMMER: OnceLock<Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| Stemmer::create(Algorithm::English))
}

fn article_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(guide to|how to|introduction to|best practices|tutorial|checklist|cheatsheet)\b",
        )
        .unwrap()
    })
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// Entities already present as `[[links]]` in the content; they
/// never re-enter scoring.
pub fn already_linked(content: &str) -> HashSet<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[\[([^\[\]\|#]+)(#[^\[\]\|]*)?(\|[^\[\]]*)?\]\]").unwrap());
    re.captures_iter(content)
        .map(|c| normalize_name(c[1].trim()))
        .collect()
}

fn type_boost(category: Category) -> f64 {
    match category {
        Category::People => 5.0,
        Category::Projects => 3.0,
        Category::Organizations => 2.0,
        Category::Locations => 1.0,
        Category::Concepts => 1.0,
        Category::Documents => 1.0,
        Category::Events => 1.0,
        _ => 0.0,
    }
}

fn folder_context_boost(host_folder: &str, category: Category) -> f64 {
    match host_folder {
        "daily-notes" | "journal" | "logs" => match category {
            Category::People => 5.0,
            Category::Projects => 2.0,
            _ => 0.0,
        },
        "projects" | "systems" => match category {
            Category::Projects => 5.0,
            Category::Technologies => 2.0,
            _ => 0.0,
        },
        "tech" | "code" | "engineering" | "docs" => match category {
            Category::Technologies => 5.0,
            Category::Acronyms => 3.0,
            _ => 0.0,
        },
        _ => 0.0,
    }
}

fn recency_boost(last_mentioned: i64, now: i64) -> f64 {
    let age = now - last_mentioned;
    if age < 3600 {
        8.0
    } else if age < 24 * 3600 {
        5.0
    } else if age < 3 * 24 * 3600 {
        3.0
    } else if age < 7 * 24 * 3600 {
        1.0
    } else {
        0.0
    }
}

fn hub_boost(hub_score: u32) -> f64 {
    if hub_score >= 100 {
        8.0
    } else if hub_score >= 50 {
        5.0
    } else if hub_score >= 20 {
        3.0
    } else if hub_score >= 5 {
        1.0
    } else {
        0.0
    }
}

fn feedback_boost(stats: AccuracyStats) -> f64 {
    if stats.total >= 20 && stats.accuracy() >= 0.95 {
        5.0
    } else if stats.total >= 5 && stats.accuracy() >= 0.80 {
        2.0
    } else if stats.total >= 5 && stats.accuracy() >= 0.60 {
        0.0
    } else if stats.total >= 5 && stats.accuracy() >= 0.40 {
        -2.0
    } else if stats.total >= 5 {
        -4.0
    } else {
        0.0
    }
}

/// Layer 1: exact whole-word matches at +10 per word, Porter-stem
/// matches at the strictness' stem bonus per word. A multi-word name
/// below the ratio gate scores zero here (other layers still apply).
fn content_match_score(
    entity: &Entity,
    strictness: Strictness,
    content_words: &HashSet<String>,
    content_stems: &HashSet<String>,
) -> f64 {
    let name_words = tokenize(&entity.name);
    if name_words.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    let mut matched = 0usize;
    let mut any_exact = false;
    for word in &name_words {
        if content_words.contains(word) {
            score += EXACT_WORD_BONUS;
            matched += 1;
            any_exact = true;
        } else if content_stems.contains(stemmer().stem(word).as_ref()) {
            score += strictness.stem_bonus();
            matched += 1;
        }
    }

    if name_words.len() > 1 {
        let ratio = matched as f64 / name_words.len() as f64;
        if ratio < strictness.min_word_ratio() {
            return 0.0;
        }
    } else if strictness == Strictness::Conservative && !any_exact {
        // Stem-only matches are forbidden for single words here.
        return 0.0;
    }

    if matched == 0 {
        return 0.0;
    }

    // A distinctive single-word alias hit counts extra.
    for alias in &entity.aliases {
        let alias_words = tokenize(alias);
        if alias_words.len() == 1
            && alias_words[0].len() >= 4
            && content_words.contains(&alias_words[0])
        {
            score += SINGLE_WORD_ALIAS_BONUS;
            break;
        }
    }

    score
}

/// Is another entity visibly present in the content, for the
/// co-occurrence layer: whole name as a substring, or any
/// distinctive (4+ char) word of it.
fn entity_present(
    name: &str,
    content_lower: &str,
    content_words: &HashSet<String>,
) -> bool {
    let name_lower = name.to_lowercase();
    if content_lower.contains(&name_lower) {
        return true;
    }
    tokenize(&name_lower)
        .iter()
        .any(|w| w.len() >= 4 && content_words.contains(w))
}

/// Rank candidate entities for the given content. Never fails:
/// semantic problems degrade to the lexical layers, and an empty
/// entity set produces an empty list.
pub fn suggest(
    index: &SuggestIndex,
    embedder: Option<&dyn Embedder>,
    embed_cache: &EmbedCache,
    request: &ScoreRequest,
) -> Vec<Suggestion> {
    let now = crate::store::now();
    let content = &request.content;
    let content_lower = content.to_lowercase();
    let content_words: HashSet<String> = tokenize(content).into_iter().collect();
    let content_stems: HashSet<String> = content_words
        .iter()
        .map(|w| stemmer().stem(w).to_string())
        .collect();
    let linked = already_linked(content);
    let host_folder = folder_of(&request.host_path).to_string();
    let suppressed = index.suppressed_for(&request.host_path);
    let k = request.max_suggestions.clamp(1, 10);
    let threshold = adaptive_threshold(request.strictness, content.chars().count());

    struct Candidate<'a> {
        entity: &'a Entity,
        breakdown: ScoreBreakdown,
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for entity in &index.entities {
        // Layer 0 gates.
        if suppressed.contains(&entity.name) {
            continue;
        }
        if entity.name.chars().count() > MAX_NAME_LEN {
            continue;
        }
        let name_word_count = tokenize(&entity.name).len();
        if name_word_count > MAX_NAME_WORDS {
            continue;
        }
        if article_title_re().is_match(&entity.name) {
            continue;
        }
        if linked.contains(&entity.name_lower) {
            continue;
        }
        if name_word_count == 1 && GENERIC_STOPSET.contains(&entity.name_lower.as_str()) {
            continue;
        }

        let mut breakdown = ScoreBreakdown {
            content_match: content_match_score(
                entity,
                request.strictness,
                &content_words,
                &content_stems,
            ),
            type_boost: type_boost(entity.category),
            folder_context: folder_context_boost(&host_folder, entity.category),
            hub: hub_boost(entity.hub_score),
            ..Default::default()
        };

        let entity_recency = index.recency.get(&entity.name);
        if let Some(row) = entity_recency {
            breakdown.recency = recency_boost(row.last_mentioned, now);
        }

        if folder_of(&entity.path) != host_folder {
            breakdown.cross_folder = CROSS_FOLDER_BONUS;
        }

        // Layer 2: co-occurring entities visible in the content,
        // only when the candidate itself shares a word with it.
        if entity_present(&entity.name, &content_lower, &content_words) {
            if let Some(partners) = index.cooccur.get(&entity.name) {
                let mut raw = 0.0;
                for partner in partners {
                    if partner != &entity.name
                        && entity_present(partner, &content_lower, &content_words)
                    {
                        raw += COOCCURRENCE_STEP;
                    }
                }
                let capped = raw.min(COOCCURRENCE_CAP);
                let factor = if entity_recency.is_some() { 1.5 } else { 0.5 };
                breakdown.cooccurrence = capped * factor;
            }
        }

        let stats = index
            .feedback_folder
            .get(&(host_folder.clone(), entity.name.clone()))
            .filter(|s| s.total >= 5)
            .copied()
            .or_else(|| index.feedback_global.get(&entity.name).copied())
            .unwrap_or_default();
        breakdown.feedback = feedback_boost(stats);

        if let Some(avg) = index.edge_weights.get(&entity.name) {
            breakdown.edge_weight = ((avg - 1.0) * 2.0).clamp(0.0, 4.0);
        }

        candidates.push(Candidate { entity, breakdown });
    }

    // Layer 9: semantic similarity, skipped for tiny content and
    // degraded silently when the model or vectors are missing.
    if content.chars().count() >= SEMANTIC_MIN_CONTENT_LEN && !index.embeddings.is_empty() {
        if let Some(embedder) = embedder {
            match embed_cache.embed(embedder, content) {
                Ok(content_vec) => {
                    let multiplier = request.strictness.semantic_multiplier();
                    // Zero-lexical candidates may enter on semantic
                    // grounds alone, capped at 3K extras, and only
                    // when a structural layer also fired.
                    let mut semantic_only_budget = 3 * k;
                    let mut order: Vec<usize> = (0..candidates.len()).collect();
                    order.sort_by(|a, b| {
                        candidates[*a]
                            .entity
                            .name_lower
                            .cmp(&candidates[*b].entity.name_lower)
                    });
                    for i in order {
                        let candidate = &mut candidates[i];
                        let Some(vector) = index.embeddings.get(&candidate.entity.name) else {
                            continue;
                        };
                        let similarity = cosine_similarity(&content_vec, vector);
                        if similarity < SEMANTIC_MIN_SIMILARITY {
                            continue;
                        }
                        if candidate.breakdown.content_match == 0.0 {
                            let structural = candidate.breakdown.type_boost
                                + candidate.breakdown.folder_context
                                + candidate.breakdown.hub;
                            if structural <= 0.0 || semantic_only_budget == 0 {
                                continue;
                            }
                            semantic_only_budget -= 1;
                        }
                        candidate.breakdown.semantic =
                            (similarity as f64 * SEMANTIC_SCALE * multiplier).min(SEMANTIC_SCALE);
                    }
                }
                Err(err) => {
                    tracing::debug!("Semantic scoring degraded: {}", err);
                }
            }
        }
    }

    // A candidate with no lexical hook only stays if the semantic
    // layer vouched for it (which already required a structural
    // signal and fit inside the 3K budget).
    candidates.retain(|c| c.breakdown.content_match > 0.0 || c.breakdown.semantic > 0.0);

    let mut scored: Vec<Suggestion> = candidates
        .into_iter()
        .map(|c| Suggestion {
            name: c.entity.name.clone(),
            path: c.entity.path.clone(),
            score: c.breakdown.total(),
            breakdown: c.breakdown,
        })
        .filter(|s| s.score >= threshold)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ra = index.recency.get(&a.name).map(|r| r.last_mentioned).unwrap_or(0);
                let rb = index.recency.get(&b.name).map(|r| r.last_mentioned).unwrap_or(0);
                rb.cmp(&ra)
            })
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    scored.truncate(k);
    scored
}
