// Shader hot reload
//
// Watches the directories holding the SPIR-V files and reports when any of
// them was written. The parent directory is watched instead of the file so
// compilers that replace the file (rename over) are still seen.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    files: Vec<PathBuf>,
}

impl ShaderWatcher {
    pub fn new(files: &[PathBuf]) -> Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // Receiver gone means the renderer is shutting down.
            let _ = tx.send(event);
        })
        .context("Failed to create file watcher")?;

        let mut dirs: Vec<&Path> = files.iter().filter_map(|f| f.parent()).collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            events,
            files: files.to_vec(),
        })
    }

    /// Drain pending events; true if a watched file changed since the last
    /// call.
    pub fn poll_changed(&self) -> bool {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) => changed |= touches_watched_file(&event, &self.files),
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        changed
    }
}

fn touches_watched_file(event: &Event, files: &[PathBuf]) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event.paths.iter().any(|path| {
        files
            .iter()
            .any(|file| path.ends_with(file) || path.file_name() == file.file_name())
    })
}
