//! Settings file watcher.
//!
//! Watches the directory containing the settings file (editors often replace
//! the file rather than writing in place) and reports debounced change
//! notifications for that one file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};

/// Live watch on a settings file. Dropping it stops the watch.
pub struct SettingsWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<()>,
    path: PathBuf,
}

/// Start watching `path` for changes.
pub fn watch_settings(path: &Path) -> Result<SettingsWatcher> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name: OsString = path
        .file_name()
        .ok_or_else(|| SettingsError::InvalidValue(format!("not a file path: {}", path.display())))?
        .to_os_string();

    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = (event.kind.is_modify() || event.kind.is_create())
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                let _ = tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "settings watcher error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    debug!(path = %path.display(), "watching settings file");

    Ok(SettingsWatcher {
        _watcher: watcher,
        rx,
        path: path.to_path_buf(),
    })
}

impl SettingsWatcher {
    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next change, coalescing bursts within `debounce`.
    ///
    /// Returns `false` once the watcher has shut down.
    pub async fn changed(&mut self, debounce: Duration) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        loop {
            match tokio::time::timeout(debounce, self.rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }
}

impl std::fmt::Debug for SettingsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_write_to_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{}").unwrap();

        let mut watcher = watch_settings(&path).unwrap();
        std::fs::write(&path, r#"{"agent": {"pool": {"max": 2}}}"#).unwrap();

        let changed = tokio::time::timeout(
            Duration::from_secs(10),
            watcher.changed(Duration::from_millis(50)),
        )
        .await
        .expect("change should be reported");
        assert!(changed);
        assert_eq!(watcher.path(), path.as_path());
    }

    #[test]
    fn rejects_path_without_file_name() {
        assert!(watch_settings(Path::new("/")).is_err());
    }
}
