//! Vault scanning and markdown note parsing.
//!
//! The scanner walks the vault for `.md` files, skips anything that
//! looks binary or oversized, and parses what remains into
//! [`ParsedNote`] values: frontmatter, outgoing wikilinks, tags,
//! aliases, and checkbox tasks. Per-file failures become skip
//! reasons; they never abort a scan.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::config::EXCLUDED_DIRS;

const MAX_NOTE_BYTES: u64 = 10 * 1024 * 1024;
const BINARY_SNIFF_BYTES: usize = 1024;

/// One outgoing `[[wikilink]]` found in a note body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlink {
    /// Raw link target, heading suffix stripped.
    pub target: String,
    /// Display alias after `|`, when present.
    pub alias: Option<String>,
    /// 1-based line the link appears on.
    pub line_number: usize,
}

/// A markdown checkbox item, cached per note for task queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub line: usize,
    pub text: String,
    pub done: bool,
}

/// A markdown file parsed into everything the indexes need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedNote {
    /// Vault-relative path, forward slashes, `.md` included.
    pub path: String,
    /// Filename without the `.md` extension.
    pub title: String,
    pub aliases: Vec<String>,
    /// Frontmatter as parsed JSON-compatible structure; empty object
    /// when the note has none.
    pub frontmatter: serde_json::Value,
    pub outlinks: Vec<Outlink>,
    pub tags: BTreeSet<String>,
    pub tasks: Vec<TaskItem>,
    /// Body text with the frontmatter block removed.
    pub body: String,
    /// Unix seconds.
    pub modified: i64,
    pub created: Option<i64>,
    /// Frontmatter `skipWikilinks: true` excludes the note from
    /// rewriting during initialization.
    pub skip_wikilinks: bool,
    /// Set when the frontmatter block failed to parse and the whole
    /// file was treated as body.
    pub frontmatter_warning: bool,
}

/// Why a file was left out of the scan.
#[derive(Debug, Clone, Serialize)]
pub enum SkipReason {
    TooLarge(u64),
    Binary,
    Unreadable(String),
}

fn wikilink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\[\]\|#]+)(#[^\[\]\|]*)?(\|([^\[\]]*))?\]\]").unwrap())
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|[^\w#])#([A-Za-z][A-Za-z0-9_/-]*)").unwrap())
}

fn task_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(.+)$").unwrap())
}

/// All `.md` files under `root`, excluding hidden directories and the
/// configured deny list.
pub fn note_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| should_descend(e, root))
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            matches!(e.path().extension().and_then(OsStr::to_str),
                Some(ext) if ext.eq_ignore_ascii_case("md"))
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn should_descend(entry: &DirEntry, root: &Path) -> bool {
    if entry.path() == root {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        if name.starts_with('.') {
            return false;
        }
        if EXCLUDED_DIRS.contains(&name.as_ref()) {
            return false;
        }
    }
    true
}

/// True when `path` resolves to a location inside the vault without
/// traversal components.
pub fn is_safe_rel_path(path: &str) -> bool {
    let p = Path::new(path);
    !p.is_absolute()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

pub fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Read and parse a single file. Stat, binary-sniff, then parse.
pub fn parse_note_file(root: &Path, abs_path: &Path) -> std::result::Result<ParsedNote, SkipReason> {
    let meta = fs::metadata(abs_path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    if meta.len() > MAX_NOTE_BYTES {
        return Err(SkipReason::TooLarge(meta.len()));
    }

    let bytes = fs::read(abs_path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    if looks_binary(&bytes) {
        return Err(SkipReason::Binary);
    }
    let content =
        String::from_utf8(bytes).map_err(|_| SkipReason::Unreadable("invalid utf-8".into()))?;

    let rel = abs_path.strip_prefix(root).unwrap_or(abs_path);
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    Ok(parse_note_content(
        &normalize_rel_path(rel),
        &content,
        modified,
        created,
    ))
}

/// Sniff the first kilobyte for a null byte or a high ratio of
/// non-printable bytes.
fn looks_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if head.is_empty() {
        return false;
    }
    if head.contains(&0) {
        return true;
    }
    let non_printable = head
        .iter()
        .filter(|b| **b < 0x20 && !matches!(**b, b'\n' | b'\r' | b'\t'))
        .count();
    non_printable * 10 > head.len()
}

/// Parse note content that is already in memory. Pure; the unit tests
/// drive this directly.
pub fn parse_note_content(
    path: &str,
    content: &str,
    modified: i64,
    created: Option<i64>,
) -> ParsedNote {
    let title = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());

    let (frontmatter, body, frontmatter_warning) = split_frontmatter(path, content);
    // Line numbers are reported against the whole file, so account
    // for the stripped frontmatter block.
    let line_offset = content.lines().count().saturating_sub(body.lines().count());

    let aliases = frontmatter_strings(&frontmatter, &["aliases", "alias"])
        .into_iter()
        .filter(|a| !a.contains("[[") && !a.contains("]]"))
        .collect();

    let mut tags: BTreeSet<String> = frontmatter_strings(&frontmatter, &["tags"])
        .into_iter()
        .map(|t| t.trim_start_matches('#').to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let skip_wikilinks = frontmatter
        .get("skipWikilinks")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let code = code_spans(&body);
    let in_code = |offset: usize| code.iter().any(|(s, e)| offset >= *s && offset < *e);

    let mut outlinks = Vec::new();
    for caps in wikilink_re().captures_iter(&body) {
        let m = caps.get(0).unwrap();
        if in_code(m.start()) {
            continue;
        }
        let target = caps[1].trim().to_string();
        if target.is_empty() {
            continue;
        }
        outlinks.push(Outlink {
            target,
            alias: caps.get(4).map(|a| a.as_str().to_string()),
            line_number: line_of(&body, m.start()) + line_offset,
        });
    }

    for caps in tag_re().captures_iter(&body) {
        let m = caps.get(2).unwrap();
        if !in_code(m.start()) {
            tags.insert(m.as_str().to_string());
        }
    }

    let mut tasks = Vec::new();
    for (i, line) in body.lines().enumerate() {
        if let Some(caps) = task_re().captures(line) {
            tasks.push(TaskItem {
                line: i + 1 + line_offset,
                text: caps[2].trim().to_string(),
                done: !caps[1].trim().is_empty(),
            });
        }
    }

    ParsedNote {
        path: path.to_string(),
        title,
        aliases,
        frontmatter,
        outlinks,
        tags,
        tasks,
        body,
        modified,
        created,
        skip_wikilinks,
        frontmatter_warning,
    }
}

/// Split a leading `---` YAML block from the body. Malformed YAML
/// demotes the whole file to body with a warning, never an error.
fn split_frontmatter(path: &str, content: &str) -> (serde_json::Value, String, bool) {
    let empty = serde_json::json!({});
    if !content.starts_with("---\n") {
        return (empty, content.to_string(), false);
    }

    let rest = &content[4..];
    let Some(end) = rest
        .lines()
        .scan(0usize, |offset, line| {
            let at = *offset;
            *offset += line.len() + 1;
            Some((at, line))
        })
        .find(|(_, line)| line.trim_end() == "---" || line.trim_end() == "...")
        .map(|(at, line)| (at, at + line.len()))
    else {
        return (empty, content.to_string(), false);
    };

    let yaml = &rest[..end.0];
    let body = rest[end.1..].trim_start_matches('\n').to_string();

    match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        Ok(value) => {
            let json = serde_json::to_value(&value).unwrap_or_else(|_| serde_json::json!({}));
            if json.is_object() {
                (json, body, false)
            } else {
                (empty, content.to_string(), true)
            }
        }
        Err(err) => {
            tracing::warn!("Malformed frontmatter in {}: {}", path, err);
            (empty, content.to_string(), true)
        }
    }
}

/// Pull a field that may be a string or a list of strings.
fn frontmatter_strings(frontmatter: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys {
        match frontmatter.get(key) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                out.push(s.trim().to_string());
            }
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        if !s.trim().is_empty() {
                            out.push(s.trim().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Byte ranges covered by fenced code blocks and inline code spans.
/// Shared with the rewriter's protected-zone scan.
pub fn code_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();

    // Fenced blocks first: toggle on ``` or ~~~ at line start.
    let mut fence_open: Option<(usize, char)> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let fence_char = match trimmed.chars().next() {
            Some(c @ ('`' | '~')) if trimmed.chars().take_while(|x| *x == c).count() >= 3 => {
                Some(c)
            }
            _ => None,
        };
        if indent <= 3 {
            if let Some(c) = fence_char {
                match fence_open {
                    Some((start, open_c)) if open_c == c => {
                        spans.push((start, offset + line.len()));
                        fence_open = None;
                    }
                    None => fence_open = Some((offset, c)),
                    Some(_) => {}
                }
            }
        }
        offset += line.len();
    }
    if let Some((start, _)) = fence_open {
        spans.push((start, text.len()));
    }

    // Inline code outside the fenced blocks.
    static INLINE: OnceLock<Regex> = OnceLock::new();
    let inline = INLINE.get_or_init(|| Regex::new(r"`[^`\n]+`").unwrap());
    for m in inline.find_iter(text) {
        let inside_fence = spans.iter().any(|(s, e)| m.start() >= *s && m.start() < *e);
        if !inside_fence {
            spans.push((m.start(), m.end()));
        }
    }

    spans.sort_unstable();
    spans
}

/// 1-based line number of a byte offset.
pub fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())]
        .bytes()
        .filter(|b| *b == b'\n')
        .count()
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_frontmatter_aliases_and_tags() {
        let content = "---\naliases: [MCP, Protocol]\ntags:\n  - tools\ntype: technologies\n---\nBody with #inline-tag here.\n";
        let note = parse_note_content("tech/MCP.md", content, 0, None);
        assert_eq!(note.title, "MCP");
        assert_eq!(note.aliases, vec!["MCP", "Protocol"]);
        assert!(note.tags.contains("tools"));
        assert!(note.tags.contains("inline-tag"));
        assert!(!note.frontmatter_warning);
        assert_eq!(note.frontmatter["type"], "technologies");
    }

    #[test]
    fn test_alias_as_plain_string() {
        let content = "---\nalias: Big Co\n---\ntext\n";
        let note = parse_note_content("orgs/Acme.md", content, 0, None);
        assert_eq!(note.aliases, vec!["Big Co"]);
    }

    #[test]
    fn test_malformed_frontmatter_becomes_body() {
        let content = "---\n: [unclosed\n---\nactual text\n";
        let note = parse_note_content("a.md", content, 0, None);
        assert!(note.frontmatter_warning);
        assert!(note.body.contains("actual text"));
        assert!(note.body.starts_with("---"));
    }

    #[test]
    fn test_extracts_wikilinks_with_lines_and_aliases() {
        let content = "First [[Turbopump]] line.\nThen [[Marcus Johnson|Marcus]] and [[Spec#Goals]].\n";
        let note = parse_note_content("daily-notes/x.md", content, 0, None);
        assert_eq!(note.outlinks.len(), 3);
        assert_eq!(note.outlinks[0].target, "Turbopump");
        assert_eq!(note.outlinks[0].line_number, 1);
        assert_eq!(note.outlinks[1].alias.as_deref(), Some("Marcus"));
        assert_eq!(note.outlinks[1].line_number, 2);
        assert_eq!(note.outlinks[2].target, "Spec");
    }

    #[test]
    fn test_links_and_tags_inside_code_are_ignored() {
        let content = "```\n[[NotALink]] #notatag\n```\nA `#inline [[Also Not]]` span, but #real and [[Real]].\n";
        let note = parse_note_content("n.md", content, 0, None);
        assert_eq!(note.outlinks.len(), 1);
        assert_eq!(note.outlinks[0].target, "Real");
        assert!(note.tags.contains("real"));
        assert!(!note.tags.contains("notatag"));
    }

    #[test]
    fn test_tasks_are_collected() {
        let content = "- [ ] call Marcus\n- [x] ship the release\nplain line\n";
        let note = parse_note_content("todo.md", content, 0, None);
        assert_eq!(note.tasks.len(), 2);
        assert!(!note.tasks[0].done);
        assert!(note.tasks[1].done);
        assert_eq!(note.tasks[1].text, "ship the release");
    }

    #[test]
    fn test_binary_sniff() {
        assert!(looks_binary(b"PK\x03\x04\x00\x00rest"));
        assert!(!looks_binary(b"# Just a heading\nwith text"));
    }

    #[test]
    fn test_path_traversal_rejected() {
        assert!(is_safe_rel_path("notes/a.md"));
        assert!(!is_safe_rel_path("../escape.md"));
        assert!(!is_safe_rel_path("/abs/path.md"));
    }

    #[test]
    fn test_unclosed_fence_protects_to_eof() {
        let spans = code_spans("text\n```\n[[x]]\nnever closed");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].1, "text\n```\n[[x]]\nnever closed".len());
    }
}
