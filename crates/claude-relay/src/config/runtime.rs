use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};

use crate::config::{load_config, Config};
use crate::error::{Error, Result};

const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Lock-free publication point for the active configuration.
///
/// Readers take a snapshot per request and keep it for the request's
/// lifetime; writers validate first and swap in a fresh immutable value.
/// Nothing is ever mutated in place.
#[derive(Debug)]
pub struct ConfigCell {
    inner: ArcSwap<Config>,
}

impl ConfigCell {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }

    /// Re-read the file and publish the result. An invalid file is logged
    /// and discarded; the previous snapshot stays active.
    pub fn reload_from(&self, path: &Path) -> Result<Arc<Config>> {
        let config = load_config(path)?;
        self.store(config);
        Ok(self.load())
    }
}

/// Keeps the filesystem watcher alive; dropping it stops hot reload.
pub struct WatcherHandle {
    _debouncer: Debouncer<RecommendedWatcher>,
    pub path: PathBuf,
}

/// Watch the config file and reload the cell on change.
///
/// Editor save storms are collapsed by the debouncer; each surviving event
/// triggers one reload attempt. Callers may pass an `on_reload` hook to
/// rebuild derived state from the fresh snapshot.
pub fn watch_config<F>(
    cell: Arc<ConfigCell>,
    path: PathBuf,
    on_reload: F,
) -> Result<WatcherHandle>
where
    F: Fn(Arc<Config>) + Send + 'static,
{
    let watched = path.clone();
    let mut debouncer = new_debouncer(WATCH_DEBOUNCE, move |result: DebounceEventResult| {
        match result {
            Ok(events) if events.is_empty() => {}
            Ok(_) => match cell.reload_from(&watched) {
                Ok(config) => {
                    tracing::info!(path = %watched.display(), "configuration reloaded");
                    on_reload(config);
                }
                Err(err) => {
                    tracing::warn!(
                        path = %watched.display(),
                        error = %err,
                        "configuration reload rejected, keeping previous snapshot"
                    );
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "config watcher error");
            }
        }
    })
    .map_err(|e| Error::Config(format!("failed to create config watcher: {e}")))?;

    debouncer
        .watcher()
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Config(format!("failed to watch {}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), "watching configuration for changes");

    Ok(WatcherHandle {
        _debouncer: debouncer,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn config(listen: &str) -> Config {
        Config {
            server: ServerConfig {
                listen: listen.into(),
                max_body_bytes: crate::config::DEFAULT_MAX_BODY_BYTES,
            },
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_is_replaced_not_mutated() {
        let cell = ConfigCell::new(config("127.0.0.1:1"));
        let before = cell.load();
        cell.store(config("127.0.0.1:2"));
        let after = cell.load();

        // The old snapshot is still intact for in-flight readers.
        assert_eq!(before.server.listen, "127.0.0.1:1");
        assert_eq!(after.server.listen, "127.0.0.1:2");
    }

    #[test]
    fn invalid_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "server:\n  listen: not-a-listen-string\n").unwrap();

        let cell = ConfigCell::new(config("127.0.0.1:8082"));
        assert!(cell.reload_from(&path).is_err());
        assert_eq!(cell.load().server.listen, "127.0.0.1:8082");
    }

    #[test]
    fn valid_reload_publishes_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "server:\n  listen: 0.0.0.0:9000\n").unwrap();

        let cell = ConfigCell::new(config("127.0.0.1:8082"));
        cell.reload_from(&path).expect("reload");
        assert_eq!(cell.load().server.listen, "0.0.0.0:9000");
    }
}
