use std::env;
use std::path::{Path, PathBuf};

/// Name of the state directory the server owns inside the vault.
/// Everything else in the vault is user markdown.
pub const STATE_DIR_NAME: &str = ".flywheel";

/// Directories that are never scanned for notes.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".obsidian",
    "node_modules",
    "attachments",
    "templates",
];

/// Directories whose notes never become linkable entities (they are
/// still indexed and searchable).
pub const NON_ENTITY_DIRS: &[&str] = &[
    "daily-notes",
    "journal",
    "inbox",
    "templates",
    "attachments",
    "clippings",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Root of the markdown vault.
    pub vault_path: PathBuf,
    /// `<vault>/.flywheel` — state db and search indices live here.
    pub state_path: PathBuf,
    /// Debounce window per path, milliseconds.
    pub debounce_ms: u64,
    /// Force a batch flush even while events keep arriving, milliseconds.
    pub flush_ms: u64,
    /// Bounded concurrency for batch parsing.
    pub batch_concurrency: usize,
    /// Hard ceiling for a full index rebuild, seconds.
    pub build_timeout_secs: u64,
    /// Which embedder backend to load: "model" (fastembed) or "hash"
    /// (deterministic, offline).
    pub embedder: String,
}

impl AppConfig {
    /// Build config from the environment, discovering the vault root
    /// if `FLYWHEEL_VAULT_PATH` is not set.
    pub fn from_env() -> anyhow::Result<AppConfig> {
        let vault_path = match env::var("FLYWHEEL_VAULT_PATH") {
            Ok(p) => PathBuf::from(p),
            Err(_) => find_vault_root(&env::current_dir()?)
                .ok_or_else(|| anyhow::anyhow!("No vault found; set FLYWHEEL_VAULT_PATH"))?,
        };
        Ok(AppConfig::for_vault(vault_path))
    }

    pub fn for_vault(vault_path: PathBuf) -> AppConfig {
        let state_path = vault_path.join(STATE_DIR_NAME);
        AppConfig {
            vault_path,
            state_path,
            debounce_ms: env_u64("FLYWHEEL_DEBOUNCE_MS", 200),
            flush_ms: env_u64("FLYWHEEL_FLUSH_MS", 1000),
            batch_concurrency: env_u64("FLYWHEEL_BATCH_CONCURRENCY", 4) as usize,
            build_timeout_secs: env_u64("FLYWHEEL_BUILD_TIMEOUT_SECS", 300),
            embedder: env::var("FLYWHEEL_EMBEDDER").unwrap_or_else(|_| "model".to_string()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_path.join("state.db")
    }

    pub fn notes_fts_path(&self) -> PathBuf {
        self.state_path.join("index").join("notes")
    }

    pub fn entities_fts_path(&self) -> PathBuf {
        self.state_path.join("index").join("entities")
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Walk upward from `start` looking for a directory containing the
/// `.flywheel` marker. Falls back to the start directory if it holds
/// markdown at its top level.
pub fn find_vault_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(STATE_DIR_NAME).is_dir() {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    let has_md = std::fs::read_dir(start)
        .ok()?
        .flatten()
        .any(|e| e.path().extension().is_some_and(|ext| ext == "md"));
    has_md.then(|| start.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_vault_root_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(STATE_DIR_NAME)).unwrap();
        let nested = dir.path().join("projects/deep");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_vault_root(&nested), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_state_paths_live_under_the_vault() {
        let config = AppConfig::for_vault(PathBuf::from("/vault"));
        assert_eq!(config.db_path(), PathBuf::from("/vault/.flywheel/state.db"));
        assert!(config.notes_fts_path().starts_with("/vault/.flywheel/index"));
    }
}
