use serde::Serialize;
use thiserror::Error;

/// Lifecycle of the in-memory vault index. Tools that need a ready
/// index check this before running and fail fast with progress
/// attached instead of blocking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexStatus {
    Building { parsed: usize, total: usize },
    Ready,
    Error { message: String },
}

impl IndexStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, IndexStatus::Ready)
    }
}

/// A single suspicious line in content that failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct LineIssue {
    pub line: usize,
    pub text: String,
    pub problem: String,
}

/// Structured validation failure returned to the caller. Carries
/// enough context to fix the request without re-reading the file:
/// the closest matching section name (by Levenshtein distance),
/// per-line analysis of the offending content, and suggested fixes.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub message: String,
    pub closest_section: Option<String>,
    pub line_issues: Vec<LineIssue>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            closest_section: None,
            line_issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Attach the section name closest to `wanted` among `available`.
    pub fn with_closest_section(mut self, wanted: &str, available: &[String]) -> Self {
        self.closest_section = closest_match(wanted, available);
        if let Some(ref close) = self.closest_section {
            self.suggestions
                .push(format!("Did you mean the section \"{}\"?", close));
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Flag lines in `content` that contain wikilink fragments or
    /// frontmatter delimiters that would corrupt the note if written
    /// verbatim.
    pub fn with_line_analysis(mut self, content: &str) -> Self {
        for (i, line) in content.lines().enumerate() {
            let unbalanced = line.matches("[[").count() != line.matches("]]").count();
            if unbalanced {
                self.line_issues.push(LineIssue {
                    line: i + 1,
                    text: line.to_string(),
                    problem: "unbalanced wikilink brackets".to_string(),
                });
            }
            if line.trim() == "---" && i > 0 {
                self.line_issues.push(LineIssue {
                    line: i + 1,
                    text: line.to_string(),
                    problem: "frontmatter delimiter inside body".to_string(),
                });
            }
        }
        self
    }
}

/// Pick the candidate with the smallest Levenshtein distance to
/// `wanted`, ignoring case. Returns None when nothing is anywhere
/// close (distance larger than half the query length).
pub fn closest_match(wanted: &str, candidates: &[String]) -> Option<String> {
    let wanted_lower = wanted.to_lowercase();
    candidates
        .iter()
        .map(|c| (strsim::levenshtein(&wanted_lower, &c.to_lowercase()), c))
        .min_by_key(|(d, _)| *d)
        .filter(|(d, _)| *d <= wanted.len().div_ceil(2))
        .map(|(_, c)| c.clone())
}

#[derive(Debug, Error)]
pub enum FlywheelError {
    /// The vault index is not ready yet. Includes build progress so
    /// callers can decide whether to wait or bail.
    #[error("vault index is not ready: {status:?}")]
    IndexNotReady { status: IndexStatus },

    /// The file changed on disk between read and commit. The caller
    /// may re-read and retry.
    #[error("write conflict on {path}: content changed since read")]
    WriteConflict { path: String },

    /// Request failed validation. The diagnostic explains what to fix.
    #[error("{}", .0.message)]
    Invalid(Diagnostic),

    /// Path escapes the vault root or is not a markdown note.
    #[error("invalid note path: {path}")]
    BadPath { path: String },

    /// Index rebuild exceeded its hard timeout.
    #[error("index build timed out after {seconds}s ({parsed}/{total} notes parsed)")]
    BuildTimeout {
        seconds: u64,
        parsed: usize,
        total: usize,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FlywheelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closest_match_prefers_small_distance() {
        let sections = vec![
            String::from("Meeting Notes"),
            String::from("Action Items"),
            String::from("References"),
        ];
        assert_eq!(
            closest_match("action itmes", &sections),
            Some(String::from("Action Items"))
        );
    }

    #[test]
    fn test_closest_match_rejects_distant_names() {
        let sections = vec![String::from("Zoology")];
        assert_eq!(closest_match("Quarterly Budget", &sections), None);
    }

    #[test]
    fn test_line_analysis_flags_unbalanced_brackets() {
        let d = Diagnostic::new("bad content").with_line_analysis("ok line\nbroken [[link\nfine");
        assert_eq!(d.line_issues.len(), 1);
        assert_eq!(d.line_issues[0].line, 2);
    }
}
