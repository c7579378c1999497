//! File system watcher — glob-filtered, debounced, broadcasts reload events.
//!
//! Each `files` glob is reduced to its literal directory prefix (the *watch
//! root*) and that directory is watched recursively. Every event path is then
//! matched against the full globs, so `**/templates/**/*` watches `.` but only
//! reports files that live under some `templates/` directory.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Directories that never trigger a reload.
const IGNORE_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv"];
/// Editor and interpreter leftovers.
const IGNORE_EXTS: &[&str] = &["pyc", "pyo", "swp", "swo", "tmp"];

/// What connected browsers should do after a batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// Reload the whole page.
    Full(Vec<String>),
    /// Only stylesheets changed; swap them in place.
    Css(Vec<String>),
}

impl ReloadEvent {
    /// Changed paths, relative to the working directory with `/` separators.
    pub fn paths(&self) -> &[String] {
        match self {
            ReloadEvent::Full(paths) | ReloadEvent::Css(paths) => paths,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReloadEvent::Full(_) => "full",
            ReloadEvent::Css(_) => "css",
        }
    }
}

/// Decide how a batch of changed paths is applied in the browser.
pub fn classify(paths: Vec<String>, inject_changes: bool) -> ReloadEvent {
    let mut unique: Vec<String> = Vec::with_capacity(paths.len());
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }

    let all_css = !unique.is_empty() && unique.iter().all(|p| is_css_file(p));
    if inject_changes && all_css {
        ReloadEvent::Css(unique)
    } else {
        ReloadEvent::Full(unique)
    }
}

fn is_css_file(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".css")
}

// ───────────────────── WatchSet ─────────────────────

/// Compiled include/ignore globs plus the directories to register with the OS.
#[derive(Debug, Clone)]
pub struct WatchSet {
    cwd: PathBuf,
    include: GlobSet,
    exclude: Option<GlobSet>,
    roots: Vec<PathBuf>,
}

/// Globs are matched against paths below the working directory (or against
/// absolute paths), so a `..` component could never match anything.
pub fn check_parent_components(pattern: &str) -> Result<()> {
    anyhow::ensure!(
        !pattern.split(['/', '\\']).any(|c| c == ".."),
        "Glob '{}' leaves the working directory with '..'; use an absolute path instead",
        pattern
    );
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        check_parent_components(pattern)?;
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// Literal directory prefix of a glob: `app/static/**/*` → `app/static`.
fn glob_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    let mut has_magic = false;

    if pattern.starts_with('/') {
        root.push("/");
    }
    for component in pattern.split('/').filter(|c| !c.is_empty()) {
        if component.contains(['*', '?', '[', '{']) {
            has_magic = true;
            break;
        }
        root.push(component);
    }

    // A glob without wildcards names a single file; watch its directory so
    // save-by-rename editors are still seen.
    if !has_magic {
        root.pop();
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

fn normalize_root(root: &Path) -> PathBuf {
    root.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

impl WatchSet {
    pub fn new(cwd: &Path, files: &[String], ignore: &[String]) -> Result<WatchSet> {
        anyhow::ensure!(!files.is_empty(), "No file globs to watch");
        let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());

        let include = build_globset(files)?;
        let exclude = if ignore.is_empty() {
            None
        } else {
            Some(build_globset(ignore)?)
        };

        let mut candidates: Vec<PathBuf> = files.iter().map(|f| normalize_root(&glob_root(f))).collect();
        candidates.sort_by_key(|p| p.components().count());

        let mut roots: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            let covered = roots
                .iter()
                .any(|r| r.is_absolute() == candidate.is_absolute() && candidate.starts_with(r));
            if !covered {
                roots.push(candidate);
            }
        }

        Ok(WatchSet {
            cwd,
            include,
            exclude,
            roots,
        })
    }

    /// Directories to watch, relative to the working directory (empty = cwd).
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Path relative to the working directory, with forward slashes.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.cwd).unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    /// Whether a change to `path` should reload browsers.
    pub fn matches(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.cwd).unwrap_or(path);

        let in_ignored_dir = rel.components().any(|c| match c {
            Component::Normal(name) => IGNORE_DIRS.contains(&name.to_string_lossy().as_ref()),
            _ => false,
        });
        if in_ignored_dir {
            return false;
        }

        if let Some(ext) = rel.extension() {
            if IGNORE_EXTS.contains(&ext.to_string_lossy().as_ref()) {
                return false;
            }
        }
        if rel.to_string_lossy().ends_with('~') {
            return false;
        }

        // Relative globs match `rel`, absolute ones the full path
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let abs_str = path.to_string_lossy().replace('\\', "/");
        let is_match = |set: &GlobSet| set.is_match(&rel_str) || set.is_match(&abs_str);

        if self.exclude.as_ref().is_some_and(|set| is_match(set)) {
            return false;
        }
        is_match(&self.include)
    }
}

// ───────────────────── Watch thread ─────────────────────

fn is_relevant_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Add the matching paths of one notify result to the pending batch.
/// Returns true when anything was added.
fn collect(watch_set: &WatchSet, res: notify::Result<Event>, batch: &mut Vec<String>) -> bool {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            log::warn!("Watch error: {}", e);
            return false;
        }
    };
    if !is_relevant_event(&event.kind) {
        return false;
    }

    let mut added = false;
    for path in event.paths.iter().filter(|p| watch_set.matches(p)) {
        let rel = watch_set.relative(path);
        log::debug!("{:?} {}", event.kind, rel);
        if !batch.contains(&rel) {
            batch.push(rel);
        }
        added = true;
    }
    added
}

/// Spawn a file watcher on a background thread.
///
/// A burst of changes is coalesced: after the first matching event the thread
/// waits until `debounce` has passed without another matching event, then
/// sends one [`ReloadEvent`] for the whole batch to `reload_tx`.
pub fn spawn(
    watch_set: WatchSet,
    debounce: Duration,
    inject_changes: bool,
    reload_tx: broadcast::Sender<ReloadEvent>,
) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;

    let mut watched = 0usize;
    for root in watch_set.roots() {
        let abs = watch_set.cwd().join(root);
        if !abs.exists() {
            log::warn!("Watch path not found, skipping: {}", abs.display());
            continue;
        }
        watcher
            .watch(&abs, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", abs.display()))?;
        log::debug!("Watching {}", abs.display());
        watched += 1;
    }
    if watched == 0 {
        log::warn!("No watch paths exist; live reload will never trigger");
        return Ok(());
    }

    // Dedicated OS thread — never blocks tokio
    std::thread::Builder::new()
        .name("fs-watcher".into())
        .spawn(move || {
            let _watcher = watcher; // prevent drop

            while let Ok(first) = rx.recv() {
                let mut batch = Vec::new();
                if !collect(&watch_set, first, &mut batch) {
                    continue;
                }

                let mut deadline = Instant::now() + debounce;
                let mut disconnected = false;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(res) => {
                            if collect(&watch_set, res, &mut batch) {
                                deadline = Instant::now() + debounce;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            disconnected = true;
                            break;
                        }
                    }
                }

                let event = classify(batch, inject_changes);
                for path in event.paths() {
                    log::info!("↻ {}", path);
                }
                // Err only means no browser is connected right now
                let _ = reload_tx.send(event);

                if disconnected {
                    break;
                }
            }
        })?;

    Ok(())
}
