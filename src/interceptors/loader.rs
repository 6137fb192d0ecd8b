//! Interceptor loader and hot-reload watcher
//!
//! Scans the project's `interceptors/` directory for `*.rhai` files in
//! alphabetical order, compiles each through [`ScriptHost`], and
//! publishes the resulting list atomically. A failed file emits a
//! `load_error` event and is skipped; it never blocks other files.
//!
//! A filesystem watcher debounces change bursts (~300 ms) and triggers a
//! full reload. Readers capture the active list by reference at the start
//! of each request, so a swap mid-flight is invisible to them.

use crate::error::Result;
use crate::events::{EventLog, EventType};
use crate::interceptors::script::{Interceptor, ScriptHost};
use anyhow::Context;
use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Script file extension the loader accepts.
const SCRIPT_EXTENSION: &str = "rhai";

/// Quiet period after a filesystem event before reloading.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Load status of one interceptor (or one failed file) for
/// `listInterceptors`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorInfo {
    pub name: String,
    pub file: String,
    pub has_matcher: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the compiled interceptor list and the hot-reload watcher.
pub struct InterceptorLoader {
    dir: PathBuf,
    host: ScriptHost,
    events: Arc<EventLog>,
    active: ArcSwap<Vec<Arc<Interceptor>>>,
    infos: Mutex<Vec<InterceptorInfo>>,
    loaded_once: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watch_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl InterceptorLoader {
    pub fn new(dir: PathBuf, events: Arc<EventLog>) -> Self {
        Self {
            dir,
            host: ScriptHost::new(),
            events,
            active: ArcSwap::from_pointee(Vec::new()),
            infos: Mutex::new(Vec::new()),
            loaded_once: AtomicBool::new(false),
            watcher: Mutex::new(None),
            watch_thread: Mutex::new(None),
        }
    }

    /// The active interceptor list. Callers hold the returned reference
    /// for the duration of one request; reloads swap underneath without
    /// affecting it.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Interceptor>>> {
        self.active.load_full()
    }

    /// Per-file load status for the control plane.
    pub fn infos(&self) -> Vec<InterceptorInfo> {
        self.infos.lock().clone()
    }

    /// Scan, compile, and atomically publish the interceptor list.
    /// Idempotent; safe to call at any time.
    pub fn reload(&self) -> Result<usize> {
        let files = self.script_files()?;
        let mut interceptors: Vec<Arc<Interceptor>> = Vec::new();
        let mut infos = Vec::new();

        for path in &files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.host.compile(path) {
                Ok(entries) => {
                    for entry in entries {
                        if interceptors.iter().any(|i| i.name == entry.name) {
                            tracing::warn!(
                                name = %entry.name,
                                file = %file_name,
                                "Duplicate interceptor name; first match wins"
                            );
                        }
                        infos.push(InterceptorInfo {
                            name: entry.name.clone(),
                            file: file_name.clone(),
                            has_matcher: entry.has_matcher(),
                            error: None,
                        });
                        interceptors.push(Arc::new(entry));
                    }
                }
                Err(error) => {
                    tracing::warn!(file = %file_name, %error, "Failed to load interceptor script");
                    self.events.append(
                        EventType::LoadError,
                        file_name.clone(),
                        format!("failed to load {file_name}"),
                        None,
                        Some(error.clone()),
                    );
                    infos.push(InterceptorInfo {
                        name: path
                            .file_stem()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| file_name.clone()),
                        file: file_name,
                        has_matcher: false,
                        error: Some(error),
                    });
                }
            }
        }

        let count = interceptors.len();
        let first_load = !self.loaded_once.swap(true, Ordering::AcqRel);
        if first_load {
            for interceptor in &interceptors {
                self.events.append(
                    EventType::Loaded,
                    interceptor.name.clone(),
                    format!("loaded from {}", interceptor.source_file),
                    None,
                    None,
                );
            }
        } else {
            self.events.append(
                EventType::Reload,
                "loader",
                format!("reloaded {count} interceptor(s) from {} file(s)", files.len()),
                None,
                None,
            );
        }

        *self.infos.lock() = infos;
        self.active.store(Arc::new(interceptors));
        tracing::info!(count, "Interceptors published");
        Ok(count)
    }

    /// Start the debounced filesystem watcher. No-op when the
    /// interceptors directory does not exist.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        if !self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "No interceptors directory, not watching");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.dir.display()))?;

        *self.watcher.lock() = Some(watcher);
        let loader = Arc::clone(self);
        *self.watch_thread.lock() = Some(std::thread::spawn(move || watch_loop(loader, rx)));
        Ok(())
    }

    /// Stop the watcher and release its resources. The active list stays
    /// published.
    pub fn close(&self) {
        self.watcher.lock().take();
        if let Some(handle) = self.watch_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn script_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_script(path))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl Drop for InterceptorLoader {
    fn drop(&mut self) {
        self.watcher.lock().take();
    }
}

fn is_script(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext == SCRIPT_EXTENSION)
            .unwrap_or(false)
}

fn event_is_relevant(event: &notify::Event) -> bool {
    event.paths.is_empty()
        || event.paths.iter().any(|p| {
            p.extension()
                .map(|ext| ext == SCRIPT_EXTENSION)
                .unwrap_or(false)
        })
}

fn watch_loop(
    loader: Arc<InterceptorLoader>,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
) {
    loop {
        let event = match rx.recv() {
            Ok(Ok(event)) => event,
            Ok(Err(error)) => {
                tracing::warn!(%error, "File watcher error");
                continue;
            }
            Err(_) => return,
        };
        if !event_is_relevant(&event) {
            continue;
        }

        // Editors fire bursts of events per save; wait for quiet.
        loop {
            match rx.recv_timeout(DEBOUNCE) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        if let Err(error) = loader.reload() {
            tracing::warn!(%error, "Interceptor reload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQuery;

    fn loader_in(dir: &Path) -> Arc<InterceptorLoader> {
        Arc::new(InterceptorLoader::new(
            dir.to_path_buf(),
            Arc::new(EventLog::new(100)),
        ))
    }

    #[test]
    fn test_missing_directory_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = loader_in(&tmp.path().join("absent"));
        assert_eq!(loader.reload().unwrap(), 0);
        assert!(loader.snapshot().is_empty());
    }

    #[test]
    fn test_loads_sorted_and_skips_other_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.rhai"), "fn handler(ctx) { }").unwrap();
        std::fs::write(tmp.path().join("a.rhai"), "fn handler(ctx) { }").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not a script").unwrap();

        let loader = loader_in(tmp.path());
        assert_eq!(loader.reload().unwrap(), 2);

        let snapshot = loader.snapshot();
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");
    }

    #[test]
    fn test_broken_file_does_not_block_others() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("broken.rhai"), "fn handler(ctx) {").unwrap();
        std::fs::write(tmp.path().join("ok.rhai"), "fn handler(ctx) { }").unwrap();

        let events = Arc::new(EventLog::new(100));
        let loader = Arc::new(InterceptorLoader::new(tmp.path().to_path_buf(), events.clone()));
        assert_eq!(loader.reload().unwrap(), 1);

        let infos = loader.infos();
        assert_eq!(infos.len(), 2);
        let broken = infos.iter().find(|i| i.file == "broken.rhai").unwrap();
        assert!(broken.error.is_some());

        let load_errors = events.since(
            0,
            &EventQuery {
                event_type: Some(EventType::LoadError),
                ..Default::default()
            },
        );
        assert_eq!(load_errors.len(), 1);
        assert_eq!(load_errors[0].interceptor, "broken.rhai");
    }

    #[test]
    fn test_reload_swaps_but_old_snapshot_survives() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("one.rhai"), "fn handler(ctx) { }").unwrap();

        let loader = loader_in(tmp.path());
        loader.reload().unwrap();
        let before = loader.snapshot();
        assert_eq!(before.len(), 1);

        std::fs::write(tmp.path().join("two.rhai"), "fn handler(ctx) { }").unwrap();
        loader.reload().unwrap();

        // The captured reference is unaffected by the swap.
        assert_eq!(before.len(), 1);
        assert_eq!(loader.snapshot().len(), 2);
    }

    #[test]
    fn test_duplicate_names_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("x.rhai"),
            "export const name = \"dup\";\nfn handler(ctx) { }",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("y.rhai"),
            "export const name = \"dup\";\nfn handler(ctx) { }",
        )
        .unwrap();

        let loader = loader_in(tmp.path());
        assert_eq!(loader.reload().unwrap(), 2);
    }

    #[test]
    fn test_watcher_reloads_on_change() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("one.rhai"), "fn handler(ctx) { }").unwrap();

        let loader = loader_in(tmp.path());
        loader.reload().unwrap();
        loader.start_watching().unwrap();

        std::fs::write(tmp.path().join("two.rhai"), "fn handler(ctx) { }").unwrap();

        // Debounce plus slack for the OS watcher to deliver.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while loader.snapshot().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(loader.snapshot().len(), 2);

        loader.close();
    }
}
