//! File watching: raw notify events are filtered, debounced per
//! path, coalesced into batches, and handed to the pipeline. Watcher
//! failures self-heal: environment errors drop straight to polling,
//! resource errors retry with exponential backoff, and recovery
//! always triggers a full rescan to reconcile missed events.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Config, PollWatcher, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    DebounceEventResult, Debouncer, RecommendedCache, new_debouncer, new_debouncer_opt,
};
use tokio::sync::mpsc;

use crate::config::{AppConfig, EXCLUDED_DIRS, STATE_DIR_NAME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

/// Messages the pipeline receives from the watch layer.
#[derive(Debug)]
pub enum WatchMessage {
    Batch(Vec<FileEvent>),
    /// Recovery finished; reconcile everything from disk.
    Rescan,
    /// Watcher gave up; the index is served stale.
    Failed(String),
}

/// Reject anything the pipeline must never process: hidden dirs, the
/// state dir, the configured deny list, and non-markdown files.
pub fn path_allowed(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return false,
    };
    for component in rel.components() {
        let Component::Normal(part) = component else {
            return false;
        };
        let part = part.to_string_lossy();
        if part.starts_with('.') || part == STATE_DIR_NAME {
            return false;
        }
        if EXCLUDED_DIRS.contains(&part.as_ref()) {
            return false;
        }
    }
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}

/// Per-path debouncer with a flush ceiling: the latest event per
/// path replaces earlier ones; a batch is ready once the stream goes
/// quiet for the debounce window, or once the oldest pending event
/// has waited out the flush timer.
pub struct EventCoalescer {
    window: Duration,
    flush: Duration,
    pending: HashMap<PathBuf, FileEvent>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl EventCoalescer {
    pub fn new(window: Duration, flush: Duration) -> EventCoalescer {
        EventCoalescer {
            window,
            flush,
            pending: HashMap::new(),
            first_at: None,
            last_at: None,
        }
    }

    pub fn push(&mut self, event: FileEvent, now: Instant) {
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.pending.insert(event.path.clone(), event);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn ready(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let quiet = self
            .last_at
            .map(|last| now.duration_since(last) >= self.window)
            .unwrap_or(false);
        let overdue = self
            .first_at
            .map(|first| now.duration_since(first) >= self.flush)
            .unwrap_or(false);
        quiet || overdue
    }

    pub fn take(&mut self) -> Vec<FileEvent> {
        self.first_at = None;
        self.last_at = None;
        let mut batch: Vec<FileEvent> = self.pending.drain().map(|(_, e)| e).collect();
        batch.sort_by(|a, b| a.path.cmp(&b.path));
        batch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The platform watcher cannot work here; fall back to polling.
    Environment,
    /// Out of handles/space/memory; worth retrying with backoff.
    Resource,
    Unknown,
}

pub fn classify_error(error: &notify::Error) -> ErrorClass {
    let message = error.to_string();
    if let notify::ErrorKind::Io(io_err) = &error.kind {
        if let Some(code) = io_err.raw_os_error() {
            // EPERM(1), EACCES(13), ENOTSUP(95)
            if [1, 13, 95].contains(&code) {
                return ErrorClass::Environment;
            }
            // EMFILE(24), ENFILE(23), ENOSPC(28), ENOMEM(12)
            if [12, 23, 24, 28].contains(&code) {
                return ErrorClass::Resource;
            }
        }
    }
    if matches!(error.kind, notify::ErrorKind::MaxFilesWatch) {
        return ErrorClass::Resource;
    }
    for marker in ["ENOTSUP", "EPERM", "EACCES"] {
        if message.contains(marker) {
            return ErrorClass::Environment;
        }
    }
    for marker in ["EMFILE", "ENFILE", "ENOSPC", "ENOMEM"] {
        if message.contains(marker) {
            return ErrorClass::Resource;
        }
    }
    ErrorClass::Unknown
}

/// Backoff ladder for watcher restarts: 1s doubling to 60s, five
/// attempts, then give up (resource errors fall back to polling,
/// unknown errors surface a failure).
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            attempts: 0,
            delay: Duration::from_secs(1),
        }
    }
}

impl RecoveryPolicy {
    pub const MAX_ATTEMPTS: u32 = 5;

    /// Next delay to wait, or None once attempts are exhausted.
    pub fn next(&mut self) -> Option<Duration> {
        if self.attempts >= Self::MAX_ATTEMPTS {
            return None;
        }
        let delay = self.delay;
        self.attempts += 1;
        self.delay = (self.delay * 2).min(Duration::from_secs(60));
        Some(delay)
    }

    pub fn reset(&mut self) {
        *self = RecoveryPolicy::default();
    }
}

enum ActiveWatcher {
    Recommended(Debouncer<RecommendedWatcher, RecommendedCache>),
    Poll(Debouncer<PollWatcher, RecommendedCache>),
}

enum RawMessage {
    Events(Vec<FileEvent>),
    Errors(Vec<notify::Error>),
}

fn map_kind(kind: &notify::EventKind) -> Option<FileEventKind> {
    match kind {
        notify::EventKind::Create(_) => Some(FileEventKind::Add),
        notify::EventKind::Modify(_) => Some(FileEventKind::Change),
        notify::EventKind::Remove(_) => Some(FileEventKind::Delete),
        _ => None,
    }
}

fn start_watcher(
    root: &Path,
    raw_tx: mpsc::UnboundedSender<RawMessage>,
    polling: bool,
) -> notify::Result<ActiveWatcher> {
    let handler_tx = raw_tx.clone();
    let handler = move |result: DebounceEventResult| match result {
        Ok(events) => {
            let mapped: Vec<FileEvent> = events
                .iter()
                .flat_map(|debounced| {
                    let kind = map_kind(&debounced.event.kind);
                    debounced.event.paths.iter().filter_map(move |p| {
                        kind.map(|kind| FileEvent {
                            kind,
                            path: p.clone(),
                        })
                    })
                })
                .collect();
            if !mapped.is_empty() {
                let _ = handler_tx.send(RawMessage::Events(mapped));
            }
        }
        Err(errors) => {
            let _ = handler_tx.send(RawMessage::Errors(errors));
        }
    };

    // The library-level debounce is kept short; the coalescer owns
    // the real windowing so the flush timer stays in our control.
    let library_window = Duration::from_millis(50);
    if polling {
        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let mut debouncer = new_debouncer_opt::<_, PollWatcher, RecommendedCache>(
            library_window,
            None,
            handler,
            RecommendedCache::new(),
            config,
        )?;
        debouncer.watch(root, RecursiveMode::Recursive)?;
        Ok(ActiveWatcher::Poll(debouncer))
    } else {
        let mut debouncer = new_debouncer(library_window, None, handler)?;
        debouncer.watch(root, RecursiveMode::Recursive)?;
        Ok(ActiveWatcher::Recommended(debouncer))
    }
}

/// Watch the vault and emit coalesced batches until the receiver is
/// dropped. Runs as its own tokio task; all watcher failures are
/// handled here, the pipeline only ever sees `WatchMessage`s.
pub async fn run_watcher(config: AppConfig, out: mpsc::Sender<WatchMessage>) {
    let root = config.vault_path.clone();
    let window = Duration::from_millis(config.debounce_ms);
    let flush = Duration::from_millis(config.flush_ms);

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let mut polling = false;
    let mut active = match start_watcher(&root, raw_tx.clone(), polling) {
        Ok(active) => Some(active),
        Err(err) => {
            tracing::error!("Watcher failed to start: {}", err);
            let _ = out.send(WatchMessage::Failed(err.to_string())).await;
            return;
        }
    };

    let mut coalescer = EventCoalescer::new(window, flush);
    let mut policy = RecoveryPolicy::default();
    let mut tick = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            message = raw_rx.recv() => {
                let Some(message) = message else { break };
                match message {
                    RawMessage::Events(events) => {
                        let now = Instant::now();
                        for event in events {
                            if path_allowed(&root, &event.path) {
                                coalescer.push(event, now);
                            }
                        }
                    }
                    RawMessage::Errors(errors) => {
                        let class = errors
                            .first()
                            .map(classify_error)
                            .unwrap_or(ErrorClass::Unknown);
                        tracing::warn!("Watcher error ({:?}): {:?}", class, errors);
                        drop(active.take());

                        match class {
                            ErrorClass::Environment => {
                                // Polling fallback is sticky.
                                polling = true;
                                match start_watcher(&root, raw_tx.clone(), polling) {
                                    Ok(watcher) => {
                                        active = Some(watcher);
                                        policy.reset();
                                        let _ = out.send(WatchMessage::Rescan).await;
                                    }
                                    Err(err) => {
                                        let _ = out
                                            .send(WatchMessage::Failed(err.to_string()))
                                            .await;
                                        break;
                                    }
                                }
                            }
                            ErrorClass::Resource | ErrorClass::Unknown => {
                                let mut recovered = false;
                                while let Some(delay) = policy.next() {
                                    tokio::time::sleep(delay).await;
                                    match start_watcher(&root, raw_tx.clone(), polling) {
                                        Ok(watcher) => {
                                            active = Some(watcher);
                                            policy.reset();
                                            let _ = out.send(WatchMessage::Rescan).await;
                                            recovered = true;
                                            break;
                                        }
                                        Err(err) => {
                                            tracing::warn!("Watcher restart failed: {}", err);
                                        }
                                    }
                                }
                                if !recovered {
                                    if class == ErrorClass::Resource {
                                        polling = true;
                                        match start_watcher(&root, raw_tx.clone(), polling) {
                                            Ok(watcher) => {
                                                active = Some(watcher);
                                                policy.reset();
                                                let _ = out.send(WatchMessage::Rescan).await;
                                            }
                                            Err(err) => {
                                                let _ = out
                                                    .send(WatchMessage::Failed(err.to_string()))
                                                    .await;
                                                break;
                                            }
                                        }
                                    } else {
                                        let _ = out
                                            .send(WatchMessage::Failed(format!("{:?}", errors)))
                                            .await;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ = tick.tick() => {
                if coalescer.ready(Instant::now()) {
                    let batch = coalescer.take();
                    if out.send(WatchMessage::Batch(batch)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    drop(active);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_filter() {
        let root = Path::new("/vault");
        assert!(path_allowed(root, Path::new("/vault/projects/x.md")));
        assert!(!path_allowed(root, Path::new("/vault/.flywheel/state.db")));
        assert!(!path_allowed(root, Path::new("/vault/.git/config")));
        assert!(!path_allowed(root, Path::new("/vault/attachments/img.md")));
        assert!(!path_allowed(root, Path::new("/vault/projects/x.pdf")));
        assert!(!path_allowed(root, Path::new("/elsewhere/x.md")));
    }

    #[test]
    fn test_coalescer_keeps_latest_event_per_path() {
        let mut c = EventCoalescer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let t0 = Instant::now();
        c.push(
            FileEvent {
                kind: FileEventKind::Add,
                path: PathBuf::from("a.md"),
            },
            t0,
        );
        c.push(
            FileEvent {
                kind: FileEventKind::Change,
                path: PathBuf::from("a.md"),
            },
            t0 + Duration::from_millis(50),
        );
        let batch = c.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, FileEventKind::Change);
    }

    #[test]
    fn test_coalescer_quiet_window_and_flush_ceiling() {
        let mut c = EventCoalescer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let t0 = Instant::now();
        c.push(
            FileEvent {
                kind: FileEventKind::Change,
                path: PathBuf::from("a.md"),
            },
            t0,
        );
        // Still inside the debounce window.
        assert!(!c.ready(t0 + Duration::from_millis(100)));
        // Quiet long enough.
        assert!(c.ready(t0 + Duration::from_millis(250)));

        // A steady stream never goes quiet, but the flush timer fires.
        let mut c = EventCoalescer::new(Duration::from_millis(200), Duration::from_millis(1000));
        let mut now = t0;
        for i in 0..20 {
            now = t0 + Duration::from_millis(i * 60);
            c.push(
                FileEvent {
                    kind: FileEventKind::Change,
                    path: PathBuf::from(format!("{}.md", i)),
                },
                now,
            );
        }
        assert!(c.ready(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn test_recovery_policy_backoff_ladder() {
        let mut policy = RecoveryPolicy::default();
        let mut delays = Vec::new();
        while let Some(delay) = policy.next() {
            delays.push(delay.as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.next(), None);
        policy.reset();
        assert_eq!(policy.next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_error_classification_by_message() {
        let env = notify::Error::generic("watch failed: ENOTSUP on filesystem");
        assert_eq!(classify_error(&env), ErrorClass::Environment);
        let resource = notify::Error::generic("too many open files (EMFILE)");
        assert_eq!(classify_error(&resource), ErrorClass::Resource);
        let unknown = notify::Error::generic("something odd");
        assert_eq!(classify_error(&unknown), ErrorClass::Unknown);
    }
}
