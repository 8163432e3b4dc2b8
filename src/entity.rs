//! Linkable entities: one per note title, plus alias lookups that
//! resolve to the same canonical record.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::NON_ENTITY_DIRS;
use crate::error::{Diagnostic, FlywheelError, Result, closest_match};
use crate::store::folder_of;
use crate::vault::{VaultIndex, normalize_name};

/// The fixed category set. Canonical form is lowercase; unknown
/// strings are rejected by `parse` rather than mapped to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    People,
    Projects,
    Organizations,
    Locations,
    Technologies,
    Acronyms,
    Concepts,
    Documents,
    Events,
    Media,
    Animals,
    Vehicles,
    Food,
    Health,
    Finance,
    Hobbies,
    Other,
}

impl Category {
    pub const ALL: [Category; 17] = [
        Category::People,
        Category::Projects,
        Category::Organizations,
        Category::Locations,
        Category::Technologies,
        Category::Acronyms,
        Category::Concepts,
        Category::Documents,
        Category::Events,
        Category::Media,
        Category::Animals,
        Category::Vehicles,
        Category::Food,
        Category::Health,
        Category::Finance,
        Category::Hobbies,
        Category::Other,
    ];

    pub fn parse(s: &str) -> Option<Category> {
        match s.trim().to_lowercase().as_str() {
            "people" => Some(Category::People),
            "projects" => Some(Category::Projects),
            "organizations" => Some(Category::Organizations),
            "locations" => Some(Category::Locations),
            "technologies" => Some(Category::Technologies),
            "acronyms" => Some(Category::Acronyms),
            "concepts" => Some(Category::Concepts),
            "documents" => Some(Category::Documents),
            "events" => Some(Category::Events),
            "media" => Some(Category::Media),
            "animals" => Some(Category::Animals),
            "vehicles" => Some(Category::Vehicles),
            "food" => Some(Category::Food),
            "health" => Some(Category::Health),
            "finance" => Some(Category::Finance),
            "hobbies" => Some(Category::Hobbies),
            "other" => Some(Category::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::People => "people",
            Category::Projects => "projects",
            Category::Organizations => "organizations",
            Category::Locations => "locations",
            Category::Technologies => "technologies",
            Category::Acronyms => "acronyms",
            Category::Concepts => "concepts",
            Category::Documents => "documents",
            Category::Events => "events",
            Category::Media => "media",
            Category::Animals => "animals",
            Category::Vehicles => "vehicles",
            Category::Food => "food",
            Category::Health => "health",
            Category::Finance => "finance",
            Category::Hobbies => "hobbies",
            Category::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub name_lower: String,
    pub path: String,
    pub category: Category,
    pub aliases: Vec<String>,
    pub hub_score: u32,
}

fn folder_category(folder: &str) -> Option<Category> {
    match folder {
        "people" | "contacts" => Some(Category::People),
        "projects" | "systems" => Some(Category::Projects),
        "organizations" | "orgs" | "companies" => Some(Category::Organizations),
        "locations" | "places" => Some(Category::Locations),
        "tech" | "technologies" | "code" | "engineering" => Some(Category::Technologies),
        "acronyms" => Some(Category::Acronyms),
        "concepts" => Some(Category::Concepts),
        "docs" | "documents" => Some(Category::Documents),
        "events" | "meetings" => Some(Category::Events),
        "media" | "books" | "movies" => Some(Category::Media),
        "animals" | "pets" => Some(Category::Animals),
        "vehicles" => Some(Category::Vehicles),
        "food" | "recipes" => Some(Category::Food),
        "health" => Some(Category::Health),
        "finance" => Some(Category::Finance),
        "hobbies" => Some(Category::Hobbies),
        _ => None,
    }
}

fn acronym_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9/\.]{1,7}$").unwrap())
}

fn person_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Z][a-z]+(?:['-][A-Z][a-z]+)? [A-Z][a-z]+(?:['-][A-Z][a-z]+)?$").unwrap()
    })
}

fn org_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(Corp|Inc|LLC|Ltd|GmbH|Co|Company)\.?$").unwrap())
}

/// Validate the frontmatter `type` declaration for a note. `None`
/// when nothing is declared. An unknown value is a validation error
/// with the closest valid category attached; it never silently
/// degrades to heuristics or `other`.
pub fn declared_category(
    path: &str,
    frontmatter: &serde_json::Value,
) -> Result<Option<Category>> {
    let Some(raw) = frontmatter.get("type").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    match Category::parse(raw) {
        Some(category) => Ok(Some(category)),
        None => {
            let valid: Vec<String> = Category::ALL
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();
            let mut diagnostic = Diagnostic::new(format!(
                "Unknown category {:?} declared on {}",
                raw, path
            ));
            if let Some(close) = closest_match(raw, &valid) {
                diagnostic = diagnostic.with_suggestion(format!("Did you mean \"{}\"?", close));
            }
            diagnostic =
                diagnostic.with_suggestion(format!("Valid categories: {}", valid.join(", ")));
            Err(FlywheelError::Invalid(diagnostic))
        }
    }
}

/// Deterministic category assignment: a validated frontmatter
/// declaration always wins, then the folder the note lives in, then
/// lexical features of the title. Unknown declarations never reach
/// this point; `declared_category` rejects them first.
pub fn classify(title: &str, path: &str, declared: Option<Category>) -> Category {
    if let Some(category) = declared {
        return category;
    }

    if let Some(category) = folder_category(folder_of(path)) {
        return category;
    }

    if acronym_re().is_match(title) {
        return Category::Acronyms;
    }
    if person_re().is_match(title) {
        return Category::People;
    }
    if org_suffix_re().is_match(title) {
        return Category::Organizations;
    }
    Category::Other
}

/// The set of linkable entities, keyed for O(1) scoring lookups.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    /// canonical name_lower -> entity
    entities: HashMap<String, Entity>,
    /// any surface (name or alias, normalized) -> canonical name_lower
    lookup: HashMap<String, String>,
}

impl EntityIndex {
    /// Build from the current vault snapshot. Notes in excluded
    /// directories (daily notes, journals, inboxes, templates) never
    /// become entities.
    pub fn build(index: &VaultIndex) -> EntityIndex {
        let mut out = EntityIndex::default();

        let mut paths: Vec<&String> = index.notes.keys().collect();
        paths.sort();

        for path in paths {
            let note = &index.notes[path];
            if NON_ENTITY_DIRS.contains(&folder_of(&note.path)) {
                continue;
            }
            let name_lower = normalize_name(&note.title);
            if name_lower.is_empty() || out.entities.contains_key(&name_lower) {
                continue;
            }

            // An invalid declaration keeps the note out of the
            // entity set; the scan itself carries on per-file.
            let declared = match declared_category(&note.path, &note.frontmatter) {
                Ok(declared) => declared,
                Err(err) => {
                    tracing::warn!("{}", err);
                    continue;
                }
            };
            let entity = Entity {
                name: note.title.clone(),
                name_lower: name_lower.clone(),
                path: note.path.clone(),
                category: classify(&note.title, &note.path, declared),
                aliases: note.aliases.clone(),
                hub_score: index.hub_score(&note.path),
            };

            out.lookup.insert(name_lower.clone(), name_lower.clone());
            for alias in &entity.aliases {
                let alias_lower = normalize_name(alias);
                out.lookup.entry(alias_lower).or_insert_with(|| name_lower.clone());
            }
            out.entities.insert(name_lower, entity);
        }

        out
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Canonical entity by exact name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(&normalize_name(name))
    }

    /// Resolve any surface form (name or alias) to its entity.
    pub fn resolve_surface(&self, surface: &str) -> Option<&Entity> {
        self.lookup
            .get(&normalize_name(surface))
            .and_then(|canonical| self.entities.get(canonical))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Every matchable surface (display form) paired with its
    /// canonical entity name, for the rewriter's candidate list.
    pub fn surfaces(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for entity in self.entities.values() {
            out.push((entity.name.clone(), entity.name.clone()));
            for alias in &entity.aliases {
                out.push((alias.clone(), entity.name.clone()));
            }
        }
        out
    }
}

/// The text embedded for an entity: name (doubled for weight),
/// aliases, category, and the first 500 characters of the backing
/// note body.
pub fn embedding_text(entity: &Entity, body: &str) -> String {
    let body_head: String = body.chars().take(500).collect();
    format!(
        "{} {} {} {} {}",
        entity.name,
        entity.name,
        entity.aliases.join(" "),
        entity.category.as_str(),
        body_head
    )
}
