//! Settings hot reload.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use switchyard_runtime::Gateway;
use switchyard_settings::load_settings_from_path;
use switchyard_settings::watcher::watch_settings;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// Watch `path` and push every valid revision into the gateway. Invalid
/// files are logged and the running settings kept.
pub fn spawn_reload_loop(gateway: Gateway, path: PathBuf, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let mut watcher =
        watch_settings(&path).with_context(|| format!("failed to watch settings file {}", path.display()))?;
    Ok(tokio::spawn(async move {
        loop {
            let changed = tokio::select! {
                () = cancel.cancelled() => break,
                changed = watcher.changed(RELOAD_DEBOUNCE) => changed,
            };
            if !changed {
                warn!("settings watcher stopped");
                break;
            }
            match load_settings_from_path(&path) {
                Ok(settings) => {
                    info!(path = %path.display(), "settings file changed, reloading");
                    gateway.reload(settings).await;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring invalid settings file"),
            }
        }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchyard_settings::GatewaySettings;
    use switchyard_worker::testing::ScriptedSpawner;

    #[tokio::test]
    async fn file_edits_reach_the_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"agent": {"pool": {"min": 0, "max": 2}}}"#).unwrap();
        let mut settings = GatewaySettings::default();
        settings.agent.pool.min = 0;
        settings.agent.pool.max = 2;
        let gateway = Gateway::new(settings, Arc::new(ScriptedSpawner::new()));
        let cancel = CancellationToken::new();
        let task = spawn_reload_loop(gateway.clone(), path.clone(), cancel.clone()).unwrap();

        // Broken JSON is ignored
        std::fs::write(&path, "{ nope").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(gateway.pool().stats().max_capacity, 2);

        std::fs::write(&path, r#"{"agent": {"pool": {"min": 0, "max": 5}}}"#).unwrap();
        for _ in 0..200 {
            if gateway.pool().stats().max_capacity == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(gateway.pool().stats().max_capacity, 5);

        cancel.cancel();
        task.await.unwrap();
    }
}
