//! Write tools: the read-modify-write path that turns free text
//! into linked text. Writes to the same note are serialized through
//! an in-memory per-path guard; a content-hash check at commit
//! refuses to clobber concurrent edits.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::AppConfig;
use crate::embedding::{EmbedCache, Embedder, content_hash};
use crate::entity;
use crate::error::{Diagnostic, FlywheelError, Result};
use crate::pipeline::SharedIndex;
use crate::rewrite::{self, AppliedLink};
use crate::scanner::is_safe_rel_path;
use crate::score::{self, ScoreRequest, Strictness, Suggestion};
use crate::store::links;

/// Per-path async locks. Entries live for the process lifetime; a
/// vault has a bounded set of paths.
#[derive(Default)]
pub struct WriteGuards {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriteGuards {
    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(path.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct WriteContext<'a> {
    pub config: &'a AppConfig,
    pub db: &'a tokio_rusqlite::Connection,
    pub state: &'a SharedIndex,
    pub embedder: Option<&'a dyn Embedder>,
    pub embed_cache: &'a EmbedCache,
    pub guards: &'a WriteGuards,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub text: String,
    pub applied: Vec<AppliedLink>,
    pub suggestions: Vec<Suggestion>,
}

fn validate_path(path: &str) -> Result<()> {
    if !path.ends_with(".md") || !is_safe_rel_path(path) {
        return Err(FlywheelError::BadPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Refuse to commit a note whose frontmatter declares an unknown
/// category. Runs on the final text so it covers both the existing
/// file and anything the write introduces.
fn validate_frontmatter(path: &str, text: &str) -> Result<()> {
    let note = crate::scanner::parse_note_content(path, text, 0, None);
    entity::declared_category(path, &note.frontmatter)?;
    Ok(())
}

fn require_ready(state: &SharedIndex) -> Result<()> {
    let state = state.read().unwrap();
    if !state.status.is_ready() {
        return Err(FlywheelError::IndexNotReady {
            status: state.status.clone(),
        });
    }
    Ok(())
}

fn read_current(abs: &PathBuf) -> (String, Option<String>) {
    match fs::read_to_string(abs) {
        Ok(text) => {
            let hash = content_hash(&text);
            (text, Some(hash))
        }
        Err(_) => (String::new(), None),
    }
}

/// Rewrite `content` against the current entity index and rank
/// suggestions for it. Shared by both write operations.
fn link_and_suggest(
    ctx: &WriteContext<'_>,
    host_path: &str,
    content: &str,
    strictness: Strictness,
    max_suggestions: usize,
) -> (String, Vec<AppliedLink>, Vec<Suggestion>) {
    let (entities, suggest_index) = {
        let state = ctx.state.read().unwrap();
        (Arc::clone(&state.entities), Arc::clone(&state.suggest))
    };

    let suppressed = suggest_index.suppressed_for(host_path);
    let outcome = rewrite::rewrite(content, &entities, &suppressed);

    let request = ScoreRequest {
        content: content.to_string(),
        host_path: host_path.to_string(),
        max_suggestions,
        strictness,
    };
    let suggestions: Vec<Suggestion> =
        score::suggest(&suggest_index, ctx.embedder, ctx.embed_cache, &request)
            .into_iter()
            // The host note never suggests itself, and anything the
            // rewriter just linked needs no suggestion line.
            .filter(|s| s.path != host_path)
            .filter(|s| !outcome.applied.iter().any(|a| a.entity == s.name))
            .collect();

    (outcome.text, outcome.applied, suggestions)
}

fn suggestion_line(suggestions: &[Suggestion]) -> String {
    let links: Vec<String> = suggestions.iter().map(|s| format!("[[{}]]", s.name)).collect();
    format!("\n→ {}\n", links.join(", "))
}

async fn record_applications(
    ctx: &WriteContext<'_>,
    path: &str,
    applied: &[AppliedLink],
    suggested: &[Suggestion],
) {
    let path = path.to_string();
    let names: Vec<String> = applied
        .iter()
        .map(|a| a.entity.clone())
        .chain(suggested.iter().map(|s| s.name.clone()))
        .collect();
    let result = ctx
        .db
        .call(move |conn| {
            for name in &names {
                links::record_application(conn, &path, name)?;
            }
            Ok(())
        })
        .await;
    if let Err(err) = result {
        tracing::warn!("Recording applications failed: {}", err);
    }
}

/// Append content to a note, rewriting mentions into links and
/// adding up to K outgoing-link suggestions after a `→` separator.
pub async fn append_to_note(
    ctx: &WriteContext<'_>,
    path: &str,
    content: &str,
    strictness: Strictness,
    max_suggestions: usize,
) -> Result<WriteOutcome> {
    validate_path(path)?;
    require_ready(ctx.state)?;

    let _guard = ctx.guards.lock(path).await;
    let abs = ctx.config.vault_path.join(path);
    let (existing, hash_at_read) = read_current(&abs);

    let (linked, applied, suggestions) =
        link_and_suggest(ctx, path, content, strictness, max_suggestions);

    let mut out = existing.clone();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&linked);
    if !linked.ends_with('\n') {
        out.push('\n');
    }
    if !suggestions.is_empty() {
        out.push_str(&suggestion_line(&suggestions));
    }

    validate_frontmatter(path, &out)?;
    commit(ctx, path, &abs, hash_at_read, &out).await?;
    record_applications(ctx, path, &applied, &suggestions).await;

    Ok(WriteOutcome {
        path: path.to_string(),
        text: out,
        applied,
        suggestions,
    })
}

/// Heading boundaries in a body: (level, title, start_line, end_line)
/// with end exclusive, in 0-based lines.
fn sections(body: &str) -> Vec<(usize, String, usize, usize)> {
    let lines: Vec<&str> = body.lines().collect();
    let mut headings: Vec<(usize, String, usize)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_end();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            if let Some(rest) = trimmed.get(hashes..) {
                let title = rest.trim();
                if !title.is_empty() {
                    headings.push((hashes, title.to_string(), i));
                }
            }
        }
    }

    let mut out = Vec::new();
    for (idx, (level, title, start)) in headings.iter().enumerate() {
        let end = headings[idx + 1..]
            .iter()
            .find(|(next_level, _, _)| next_level <= level)
            .map(|(_, _, line)| *line)
            .unwrap_or(lines.len());
        out.push((*level, title.clone(), *start, end));
    }
    out
}

/// Replace the body of a named section, keeping its heading line.
/// A missing section returns a diagnostic carrying the closest
/// heading by edit distance and a per-line analysis of the content.
pub async fn write_section(
    ctx: &WriteContext<'_>,
    path: &str,
    heading: &str,
    content: &str,
    strictness: Strictness,
    max_suggestions: usize,
) -> Result<WriteOutcome> {
    validate_path(path)?;
    require_ready(ctx.state)?;

    let _guard = ctx.guards.lock(path).await;
    let abs = ctx.config.vault_path.join(path);
    let (existing, hash_at_read) = read_current(&abs);
    if hash_at_read.is_none() {
        return Err(FlywheelError::BadPath {
            path: path.to_string(),
        });
    }

    let all_sections = sections(&existing);
    let target = all_sections
        .iter()
        .find(|(_, title, _, _)| title.eq_ignore_ascii_case(heading.trim()));
    let Some((_, _, start, end)) = target else {
        let available: Vec<String> = all_sections.iter().map(|(_, t, _, _)| t.clone()).collect();
        let diagnostic = Diagnostic::new(format!("No section named \"{}\" in {}", heading, path))
            .with_closest_section(heading, &available)
            .with_line_analysis(content);
        return Err(FlywheelError::Invalid(diagnostic));
    };

    let (linked, applied, suggestions) =
        link_and_suggest(ctx, path, content, strictness, max_suggestions);

    let lines: Vec<&str> = existing.lines().collect();
    let mut out_lines: Vec<String> = Vec::new();
    out_lines.extend(lines[..start + 1].iter().map(|l| l.to_string()));
    out_lines.push(String::new());
    out_lines.extend(linked.lines().map(|l| l.to_string()));
    if !suggestions.is_empty() {
        for line in suggestion_line(&suggestions).lines() {
            out_lines.push(line.to_string());
        }
    }
    out_lines.push(String::new());
    out_lines.extend(lines[*end..].iter().map(|l| l.to_string()));
    let mut out = out_lines.join("\n");
    if existing.ends_with('\n') {
        out.push('\n');
    }

    validate_frontmatter(path, &out)?;
    commit(ctx, path, &abs, hash_at_read, &out).await?;
    record_applications(ctx, path, &applied, &suggestions).await;

    Ok(WriteOutcome {
        path: path.to_string(),
        text: out,
        applied,
        suggestions,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkReport {
    pub notes_changed: usize,
    pub links_added: usize,
    pub notes_skipped: usize,
}

/// Auto-link the whole vault in place: rewrite each note so known
/// entity mentions become links. Notes carrying `skipWikilinks` in
/// frontmatter are left alone; explicit per-note tool calls are not
/// bound by that flag.
pub async fn link_vault(ctx: &WriteContext<'_>) -> Result<LinkReport> {
    require_ready(ctx.state)?;
    let (vault, entities, suggest_index) = {
        let state = ctx.state.read().unwrap();
        let vault = state.vault.clone().ok_or(FlywheelError::IndexNotReady {
            status: state.status.clone(),
        })?;
        (vault, Arc::clone(&state.entities), Arc::clone(&state.suggest))
    };

    let mut report = LinkReport::default();
    let mut paths: Vec<&String> = vault.notes.keys().collect();
    paths.sort();
    for path in paths {
        let note = &vault.notes[path.as_str()];
        if note.skip_wikilinks {
            report.notes_skipped += 1;
            continue;
        }

        let _guard = ctx.guards.lock(path).await;
        let abs = ctx.config.vault_path.join(path.as_str());
        let (existing, hash_at_read) = read_current(&abs);
        if hash_at_read.is_none() {
            continue;
        }

        let suppressed = suggest_index.suppressed_for(path);
        let outcome = rewrite::rewrite(&existing, &entities, &suppressed);
        if outcome.applied.is_empty() {
            continue;
        }
        // Never link a note to itself.
        let self_linked = outcome
            .applied
            .iter()
            .any(|a| a.entity.eq_ignore_ascii_case(&note.title));
        if self_linked {
            let suppressed_self: std::collections::HashSet<String> = suppressed
                .iter()
                .cloned()
                .chain(std::iter::once(note.title.clone()))
                .collect();
            let retried = rewrite::rewrite(&existing, &entities, &suppressed_self);
            if retried.applied.is_empty() {
                continue;
            }
            commit(ctx, path, &abs, hash_at_read, &retried.text).await?;
            record_applications(ctx, path, &retried.applied, &[]).await;
            report.notes_changed += 1;
            report.links_added += retried.applied.len();
            continue;
        }

        commit(ctx, path, &abs, hash_at_read, &outcome.text).await?;
        record_applications(ctx, path, &outcome.applied, &[]).await;
        report.notes_changed += 1;
        report.links_added += outcome.applied.len();
    }
    Ok(report)
}

/// Verify the on-disk content still matches what was read, then
/// write. The guard serializes our own writers; the hash check
/// catches edits from outside the process.
async fn commit(
    _ctx: &WriteContext<'_>,
    path: &str,
    abs: &PathBuf,
    hash_at_read: Option<String>,
    text: &str,
) -> Result<()> {
    if let Some(expected) = &hash_at_read {
        let current = fs::read_to_string(abs)
            .ok()
            .map(|t| content_hash(&t));
        if current.as_deref() != Some(expected.as_str()) {
            return Err(FlywheelError::WriteConflict {
                path: path.to_string(),
            });
        }
    }
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(abs, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_nesting_and_bounds() {
        let body = "intro\n# One\na\n## Sub\nb\n# Two\nc\n";
        let found = sections(body);
        assert_eq!(found.len(), 3);
        // "# One" runs to "# Two", including its subsection.
        let one = found.iter().find(|(_, t, _, _)| t == "One").unwrap();
        assert_eq!((one.2, one.3), (1, 5));
        let sub = found.iter().find(|(_, t, _, _)| t == "Sub").unwrap();
        assert_eq!((sub.2, sub.3), (3, 5));
        let two = found.iter().find(|(_, t, _, _)| t == "Two").unwrap();
        assert_eq!((two.2, two.3), (5, 7));
    }

    #[test]
    fn test_suggestion_line_format() {
        let line = suggestion_line(&[
            Suggestion {
                name: "Turbopump".to_string(),
                path: "projects/Turbopump.md".to_string(),
                score: 20.0,
                breakdown: Default::default(),
            },
            Suggestion {
                name: "Acme Corp".to_string(),
                path: "organizations/Acme Corp.md".to_string(),
                score: 16.0,
                breakdown: Default::default(),
            },
        ]);
        assert_eq!(line, "\n→ [[Turbopump]], [[Acme Corp]]\n");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("notes/a.md").is_ok());
        assert!(validate_path("../../etc/passwd").is_err());
        assert!(validate_path("notes/a.txt").is_err());
    }
}
