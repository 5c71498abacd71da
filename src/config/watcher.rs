//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch the router's TOML file and broadcast each new config that passes
//! validation. A broken edit is logged and dropped; the router keeps
//! running on what it had.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Bursts of file events inside the debounce window cause one reload
//! - Editors that save by rename are handled (the parent directory is watched)
//!
//! ## NOT Responsible For
//! - Applying the config (see `EconomicRouter::apply_config`)
//! - Initial config loading (that belongs to `loader`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::RouterConfig;

/// Quiet period after the last file event before the file is re-read.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches a config file and broadcasts validated updates.
///
/// Dropping the watcher stops file watching and ends the reload task.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<RouterConfig>,
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .finish()
    }
}

fn notify_error(path: &Path, e: notify::Error) -> ConfigError {
    ConfigError::Io {
        file: path.display().to_string(),
        source: std::io::Error::other(e.to_string()),
    }
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// The current contents are **not** broadcast; load them with
    /// [`load_from_file`] first. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` if the OS watcher cannot be created or the parent
    /// directory cannot be watched.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("router.toml"))?;
    /// tokio::spawn(async move {
    ///     while let Ok(config) = rx.recv().await {
    ///         router.apply_config(&config);
    ///     }
    /// });
    /// ```
    pub fn new(path: PathBuf) -> Result<(Self, broadcast::Receiver<RouterConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = event_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| notify_error(&path, e))?;

        let watch_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| notify_error(&watch_dir, e))?;

        tokio::spawn(reload_loop(path.clone(), event_rx, tx.clone()));
        info!(path = %path.display(), "watching config for changes");

        Ok((
            Self {
                tx,
                path,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Another receiver for reloads.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterConfig> {
        self.tx.subscribe()
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn touches(event: &notify::Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

async fn reload_loop(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<notify::Event>,
    tx: broadcast::Sender<RouterConfig>,
) {
    while let Some(event) = events.recv().await {
        if !touches(&event, &path) {
            continue;
        }
        // Swallow the rest of the burst.
        loop {
            match tokio::time::timeout(RELOAD_DEBOUNCE, events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        match load_from_file(&path) {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    router = %config.router.name,
                    "config reloaded"
                );
                if tx.send(config).is_err() {
                    debug!("config reloaded with no subscribers");
                }
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "config reload rejected, keeping current config"
                );
            }
        }
    }
    debug!(path = %path.display(), "config watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[router]
name = "watcher-test"

[budget]
daily_ceiling_usd = 10.0
"#;

    #[tokio::test]
    async fn test_config_watcher_creation_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let result = ConfigWatcher::new(path.clone());
        let (watcher, _rx) = result.expect("test: create watcher");
        assert_eq!(watcher.path(), path.as_path());
        let _rx2 = watcher.subscribe();
    }

    #[tokio::test]
    async fn test_config_watcher_detects_file_change() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let updated = VALID_TOML
            .replace("watcher-test", "updated-name")
            .replace("10.0", "4.0");
        let mut f = std::fs::File::create(&path).expect("test: open for write");
        f.write_all(updated.as_bytes()).expect("test: write");
        f.sync_all().expect("test: sync");
        drop(f);

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        let config = result.expect("test: timeout").expect("test: recv");
        assert_eq!(config.router.name, "updated-name");
        assert!((config.budget.daily_ceiling_usd - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_config_watcher_rejects_invalid_reload() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path.clone()).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, "[budget]\nalert_threshold = 7.0\n").expect("test: write invalid");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "should not broadcast invalid config");
    }

    #[tokio::test]
    async fn test_config_watcher_ignores_sibling_files() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, VALID_TOML).expect("test: write");

        let (_watcher, mut rx) = ConfigWatcher::new(path).expect("test: create watcher");
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(dir.path().join("other.toml"), VALID_TOML).expect("test: write sibling");

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(result.is_err(), "sibling edits must not trigger a reload");
    }

    #[tokio::test]
    async fn test_config_watcher_nonexistent_parent_returns_error() {
        let path = PathBuf::from("/definitely/nonexistent/dir/router.toml");
        let result = ConfigWatcher::new(path);
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
