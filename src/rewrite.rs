//! The auto-wikilink rewriter. Takes free text plus the entity index
//! and produces linked text, leaving protected zones untouched:
//! code, frontmatter, existing links, URLs, HTML, headings, and
//! footnotes. Longest entity name wins on overlap; only the first
//! occurrence of each entity is linked; anything that would produce
//! an invalid link is dropped silently.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::entity::EntityIndex;
use crate::scanner::{code_spans, line_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZoneKind {
    Code,
    Frontmatter,
    Wikilink,
    MarkdownLink,
    Url,
    Html,
    Heading,
    Footnote,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub start: usize,
    pub end: usize,
    pub kind: ZoneKind,
}

fn wikilink_zone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[[^\]]*\]\]").unwrap())
}

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(https?://|mailto:)[^\s<>\)\]]+").unwrap())
}

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?[A-Za-z][A-Za-z0-9-]*(\s[^<>]*)?/?>").unwrap())
}

fn footnote_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\^[^\]]+\]").unwrap())
}

/// Scan the original text and record every half-open byte range the
/// rewriter must never alter.
pub fn protected_zones(text: &str) -> Vec<Zone> {
    let mut zones = Vec::new();

    // Frontmatter block at the very top.
    if text.starts_with("---\n") {
        let rest = &text[4..];
        let mut offset = 4;
        for line in rest.split_inclusive('\n') {
            let trimmed = line.trim_end();
            if trimmed == "---" || trimmed == "..." {
                zones.push(Zone {
                    start: 0,
                    end: offset + line.len(),
                    kind: ZoneKind::Frontmatter,
                });
                break;
            }
            offset += line.len();
        }
    }

    for (start, end) in code_spans(text) {
        zones.push(Zone {
            start,
            end,
            kind: ZoneKind::Code,
        });
    }

    for m in wikilink_zone_re().find_iter(text) {
        zones.push(Zone {
            start: m.start(),
            end: m.end(),
            kind: ZoneKind::Wikilink,
        });
    }
    for m in markdown_link_re().find_iter(text) {
        zones.push(Zone {
            start: m.start(),
            end: m.end(),
            kind: ZoneKind::MarkdownLink,
        });
    }
    for m in url_re().find_iter(text) {
        zones.push(Zone {
            start: m.start(),
            end: m.end(),
            kind: ZoneKind::Url,
        });
    }
    for m in html_tag_re().find_iter(text) {
        zones.push(Zone {
            start: m.start(),
            end: m.end(),
            kind: ZoneKind::Html,
        });
    }
    for m in footnote_ref_re().find_iter(text) {
        zones.push(Zone {
            start: m.start(),
            end: m.end(),
            kind: ZoneKind::Footnote,
        });
    }

    // Whole-line zones: ATX and setext headings, footnote definitions.
    let mut offset = 0;
    let mut prev: Option<(usize, &str)> = None;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let is_atx = {
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            (1..=6).contains(&hashes)
                && trimmed
                    .chars()
                    .nth(hashes)
                    .map(|c| c == ' ')
                    .unwrap_or(true)
        };
        if is_atx || trimmed.starts_with("[^") && trimmed.contains("]:") {
            zones.push(Zone {
                start: offset,
                end: offset + line.len(),
                kind: if is_atx {
                    ZoneKind::Heading
                } else {
                    ZoneKind::Footnote
                },
            });
        }

        // Setext underline: a run of = or - under a non-empty text line.
        let is_underline = !trimmed.is_empty()
            && (trimmed.chars().all(|c| c == '=') || trimmed.chars().all(|c| c == '-'));
        if is_underline {
            if let Some((prev_start, prev_line)) = prev {
                if !prev_line.trim().is_empty() {
                    zones.push(Zone {
                        start: prev_start,
                        end: offset + line.len(),
                        kind: ZoneKind::Heading,
                    });
                }
            }
        }

        prev = Some((offset, line));
        offset += line.len();
    }

    zones.sort_by_key(|z| (z.start, z.end));
    zones
}

fn overlaps(start: usize, end: usize, ranges: &[(usize, usize)]) -> bool {
    ranges.iter().any(|(s, e)| start < *e && *s < end)
}

/// Word boundary check with hyphen/apostrophe handling: a match may
/// not butt against an alphanumeric, and a joining `-` or `'` with a
/// letter beyond it keeps the match inside a larger word.
fn boundary_ok(text: &str, start: usize, end: usize) -> bool {
    let mut before = text[..start].chars().rev();
    if let Some(c) = before.next() {
        if c.is_alphanumeric() || c == '_' {
            return false;
        }
        if (c == '-' || c == '\'')
            && before.next().map(|c2| c2.is_alphanumeric()).unwrap_or(false)
        {
            return false;
        }
    }
    let mut after = text[end..].chars();
    if let Some(c) = after.next() {
        if c.is_alphanumeric() || c == '_' {
            return false;
        }
        if (c == '-' || c == '\'')
            && after.next().map(|c2| c2.is_alphanumeric()).unwrap_or(false)
        {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedLink {
    pub entity: String,
    pub surface: String,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteOutcome {
    pub text: String,
    pub applied: Vec<AppliedLink>,
}

#[derive(Debug, Clone)]
struct Accepted {
    start: usize,
    end: usize,
    canonical: String,
    display: String,
}

/// Find acceptable substitutions on the original text. Candidates
/// are tried longest surface first so "Machine Learning" is never
/// eaten as "Machine"; each entity links at most once.
fn plan_substitutions(
    text: &str,
    entities: &EntityIndex,
    suppressed: &HashSet<String>,
) -> Vec<Accepted> {
    let zones = protected_zones(text);
    let zone_ranges: Vec<(usize, usize)> = zones.iter().map(|z| (z.start, z.end)).collect();

    let mut surfaces = entities.surfaces();
    surfaces.retain(|(surface, canonical)| surface.len() >= 2 && !suppressed.contains(canonical));
    surfaces.sort_by(|a, b| {
        b.0.chars()
            .count()
            .cmp(&a.0.chars().count())
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut accepted: Vec<Accepted> = Vec::new();
    let mut occupied: Vec<(usize, usize)> = Vec::new();
    let mut linked: HashSet<String> = HashSet::new();

    for (surface, canonical) in surfaces {
        if linked.contains(&canonical) {
            continue;
        }
        let Ok(pattern) = Regex::new(&format!("(?i){}", regex::escape(&surface))) else {
            continue;
        };
        for m in pattern.find_iter(text) {
            let matched = m.as_str();
            // Invalid products are dropped silently.
            if matched.contains('\n')
                || matched.contains("[[")
                || matched.contains("]]")
                || canonical.is_empty()
            {
                continue;
            }
            if !boundary_ok(text, m.start(), m.end()) {
                continue;
            }
            if overlaps(m.start(), m.end(), &zone_ranges)
                || overlaps(m.start(), m.end(), &occupied)
            {
                continue;
            }
            // First surviving occurrence of this entity only.
            accepted.push(Accepted {
                start: m.start(),
                end: m.end(),
                canonical: canonical.clone(),
                display: matched.to_string(),
            });
            occupied.push((m.start(), m.end()));
            linked.insert(canonical.clone());
            break;
        }
    }

    accepted.sort_by_key(|a| a.start);
    accepted
}

/// Rewrite `text`, linking the first occurrence of every known
/// entity outside protected zones. `suppressed` holds canonical
/// entity names (global plus host-folder suppressions merged by the
/// caller); they are never linked.
pub fn rewrite(text: &str, entities: &EntityIndex, suppressed: &HashSet<String>) -> RewriteOutcome {
    let plan = plan_substitutions(text, entities, suppressed);
    if plan.is_empty() {
        return RewriteOutcome {
            text: text.to_string(),
            applied: Vec::new(),
        };
    }

    // Substitutions apply left to right; building from original
    // offsets keeps later positions consistent as the text grows.
    let mut out = String::with_capacity(text.len() + plan.len() * 8);
    let mut cursor = 0;
    let mut applied = Vec::with_capacity(plan.len());
    for sub in &plan {
        out.push_str(&text[cursor..sub.start]);
        if sub.display == sub.canonical {
            out.push_str(&format!("[[{}]]", sub.canonical));
        } else {
            out.push_str(&format!("[[{}|{}]]", sub.canonical, sub.display));
        }
        cursor = sub.end;
        applied.push(AppliedLink {
            entity: sub.canonical.clone(),
            surface: sub.display.clone(),
            line: line_of(text, sub.start),
        });
    }
    out.push_str(&text[cursor..]);

    RewriteOutcome { text: out, applied }
}

#[derive(Debug, Clone, Serialize)]
pub struct Mention {
    pub entity: String,
    pub surface: String,
    pub line: usize,
}

/// Entity mentions that are not wikilinked yet, for the
/// unlinked-mention scan. Same zones and boundaries as the rewriter,
/// but every surviving occurrence is reported, not just the first.
pub fn find_unlinked_mentions(
    text: &str,
    entities: &EntityIndex,
    suppressed: &HashSet<String>,
) -> Vec<Mention> {
    let zones = protected_zones(text);
    let zone_ranges: Vec<(usize, usize)> = zones.iter().map(|z| (z.start, z.end)).collect();

    let mut surfaces = entities.surfaces();
    surfaces.retain(|(surface, canonical)| surface.len() >= 2 && !suppressed.contains(canonical));
    surfaces.sort_by(|a, b| {
        b.0.chars()
            .count()
            .cmp(&a.0.chars().count())
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut mentions = Vec::new();
    let mut occupied: Vec<(usize, usize)> = Vec::new();
    for (surface, canonical) in surfaces {
        let Ok(pattern) = Regex::new(&format!("(?i){}", regex::escape(&surface))) else {
            continue;
        };
        for m in pattern.find_iter(text) {
            if !boundary_ok(text, m.start(), m.end()) {
                continue;
            }
            if overlaps(m.start(), m.end(), &zone_ranges)
                || overlaps(m.start(), m.end(), &occupied)
            {
                continue;
            }
            occupied.push((m.start(), m.end()));
            mentions.push(Mention {
                entity: canonical.clone(),
                surface: m.as_str().to_string(),
                line: line_of(text, m.start()),
            });
        }
    }
    mentions.sort_by_key(|m| m.line);
    mentions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::parse_note_content;
    use crate::vault::{Note, VaultIndex};

    fn entities_from(notes: Vec<(&str, &str)>) -> EntityIndex {
        let index = VaultIndex::from_notes(
            notes
                .into_iter()
                .map(|(path, content)| Note::from(parse_note_content(path, content, 0, None)))
                .collect(),
        );
        EntityIndex::build(&index)
    }

    fn rewrite_plain(text: &str, entities: &EntityIndex) -> String {
        rewrite(text, entities, &HashSet::new()).text
    }

    #[test]
    fn test_links_first_occurrence_only() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let out = rewrite_plain("Turbopump is late. Turbopump again.", &entities);
        assert_eq!(out, "[[Turbopump]] is late. Turbopump again.");
    }

    #[test]
    fn test_backtick_protected_zone() {
        let entities = entities_from(vec![("people/Marcus Johnson.md", "x\n")]);
        let out = rewrite_plain(
            "See `Marcus Johnson` in the code. Marcus Johnson was here.",
            &entities,
        );
        assert_eq!(
            out,
            "See `Marcus Johnson` in the code. [[Marcus Johnson]] was here."
        );
    }

    #[test]
    fn test_alias_rewriting_uses_display_form() {
        let entities = entities_from(vec![(
            "tech/Model Context Protocol.md",
            "---\naliases: [MCP]\n---\nx\n",
        )]);
        let out = rewrite_plain("We use MCP daily.", &entities);
        assert_eq!(out, "We use [[Model Context Protocol|MCP]] daily.");
    }

    #[test]
    fn test_longest_match_wins() {
        let entities = entities_from(vec![
            ("concepts/Machine.md", "x\n"),
            ("concepts/Machine Learning.md", "x\n"),
        ]);
        let out = rewrite_plain("Machine Learning is great.", &entities);
        assert_eq!(out, "[[Machine Learning]] is great.");
    }

    #[test]
    fn test_case_insensitive_match_preserves_surface() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let out = rewrite_plain("the turbopump failed", &entities);
        assert_eq!(out, "the [[Turbopump|turbopump]] failed");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let entities = entities_from(vec![
            ("projects/Turbopump.md", "x\n"),
            ("people/Marcus Johnson.md", "x\n"),
        ]);
        let input = "Turbopump delayed. Marcus Johnson tracking.";
        let once = rewrite_plain(input, &entities);
        let twice = rewrite_plain(&once, &entities);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_existing_links_urls_and_headings_are_preserved() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let input = "# Turbopump status\n\nSee [[Turbopump]] and [docs](https://example.com/Turbopump).\nVisit https://turbopump.io now. Turbopump here though.\n";
        let out = rewrite_plain(input, &entities);
        assert!(out.starts_with("# Turbopump status\n"));
        assert!(out.contains("[docs](https://example.com/Turbopump)"));
        assert!(out.contains("https://turbopump.io"));
        assert!(out.contains("[[Turbopump]] here though"));
        // Exactly one new link was added.
        assert_eq!(out.matches("[[Turbopump]]").count(), 2);
    }

    #[test]
    fn test_frontmatter_and_fences_are_preserved() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let input = "---\ntitle: Turbopump\n---\n```\nTurbopump in code\n```\nTurbopump in prose\n";
        let out = rewrite_plain(input, &entities);
        assert!(out.contains("title: Turbopump\n"));
        assert!(out.contains("```\nTurbopump in code\n```"));
        assert!(out.contains("[[Turbopump]] in prose"));
    }

    #[test]
    fn test_html_and_footnotes_are_preserved() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let input = "<div data-x=\"Turbopump\">ok</div> Turbopump[^1]\n\n[^1]: Turbopump footnote\n";
        let out = rewrite_plain(input, &entities);
        assert!(out.contains("<div data-x=\"Turbopump\">"));
        assert!(out.contains("[[Turbopump]][^1]"));
        assert!(out.contains("[^1]: Turbopump footnote"));
    }

    #[test]
    fn test_word_boundaries_and_hyphenation() {
        let entities = entities_from(vec![("concepts/Machine.md", "x\n")]);
        assert_eq!(
            rewrite_plain("A machine-made part.", &entities),
            "A machine-made part."
        );
        assert_eq!(
            rewrite_plain("Submachine is not it.", &entities),
            "Submachine is not it."
        );
        assert_eq!(
            rewrite_plain("The machine works.", &entities),
            "The [[Machine|machine]] works."
        );
    }

    #[test]
    fn test_apostrophe_names_match_whole() {
        let entities = entities_from(vec![("people/O'Brien.md", "x\n")]);
        let out = rewrite_plain("Ask O'Brien about it.", &entities);
        assert_eq!(out, "Ask [[O'Brien]] about it.");
    }

    #[test]
    fn test_suppressed_entity_is_never_linked() {
        let entities = entities_from(vec![("concepts/Update.md", "x\n")]);
        let suppressed: HashSet<String> = [String::from("Update")].into_iter().collect();
        let out = rewrite("Update the plan.", &entities, &suppressed);
        assert_eq!(out.text, "Update the plan.");
        assert!(out.applied.is_empty());
    }

    #[test]
    fn test_applied_links_carry_line_numbers() {
        let entities = entities_from(vec![
            ("projects/Turbopump.md", "x\n"),
            ("people/Marcus Johnson.md", "x\n"),
        ]);
        let out = rewrite(
            "First line.\nTurbopump on line two.\nMarcus Johnson on three.\n",
            &entities,
            &HashSet::new(),
        );
        let lines: Vec<(String, usize)> = out
            .applied
            .iter()
            .map(|a| (a.entity.clone(), a.line))
            .collect();
        assert!(lines.contains(&("Turbopump".to_string(), 2)));
        assert!(lines.contains(&("Marcus Johnson".to_string(), 3)));
    }

    #[test]
    fn test_unlinked_mentions_reports_every_occurrence() {
        let entities = entities_from(vec![("projects/Turbopump.md", "x\n")]);
        let mentions = find_unlinked_mentions(
            "Turbopump once. [[Turbopump]] linked. Turbopump twice.\n",
            &entities,
            &HashSet::new(),
        );
        assert_eq!(mentions.len(), 2);
        assert!(mentions.iter().all(|m| m.entity == "Turbopump"));
    }
}
