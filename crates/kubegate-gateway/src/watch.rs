//! Credentials file watching
//!
//! On Linux, inotify events on the directories holding the credential files
//! wake the watcher; elsewhere, or when inotify cannot be set up, the files are
//! polled. Either way a wake-up only counts when a file's SHA-256 fingerprint
//! changed, so rewriting identical content is ignored. A burst of changes
//! inside one debounce window produces one callback. Callbacks run one at a
//! time on the watcher's own task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::digest::{digest, SHA256};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use kubegate_common::WatchConfig;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Callback run after the credential files change
pub type ChangeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Background watcher over a set of credential files
pub struct CredentialsWatcher {
    cancel: CancellationToken,
}

impl CredentialsWatcher {
    /// Start watching, driven by filesystem events where available; must be
    /// called within a tokio runtime
    pub fn start(paths: Vec<PathBuf>, config: &WatchConfig, on_change: ChangeCallback) -> Self {
        let trigger = Trigger::events(&paths, config.poll_interval());
        Self::spawn(paths, config, trigger, on_change)
    }

    /// Start watching by polling only, for filesystems that deliver no change
    /// events (network mounts, some container volumes)
    pub fn start_polling(paths: Vec<PathBuf>, config: &WatchConfig, on_change: ChangeCallback) -> Self {
        let trigger = Trigger::polling(config.poll_interval());
        Self::spawn(paths, config, trigger, on_change)
    }

    fn spawn(paths: Vec<PathBuf>, config: &WatchConfig, trigger: Trigger, on_change: ChangeCallback) -> Self {
        let cancel = CancellationToken::new();
        let files = paths.into_iter().map(Fingerprint::new).collect();
        tokio::spawn(run(files, trigger, config.debounce(), on_change, cancel.clone()));
        Self { cancel }
    }

    /// Stop watching; idempotent
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            debug!("credentials watcher stopped");
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CredentialsWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut files: Vec<Fingerprint>,
    mut trigger: Trigger,
    debounce: Duration,
    on_change: ChangeCallback,
    cancel: CancellationToken,
) {
    // Baseline
    changed(&mut files).await;
    debug!(files = files.len(), mode = trigger.mode(), "watching credential files");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = trigger.wait() => {}
        }
        if !changed(&mut files).await {
            continue;
        }

        // Wait for a quiet window
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            if !changed(&mut files).await {
                break;
            }
            trace!("credential files still changing");
        }

        debug!("credential files changed");
        on_change().await;
    }
}

/// What wakes the watcher to re-check fingerprints
enum Trigger {
    Events {
        stream: BoxStream<'static, std::io::Result<()>>,
        fallback: Duration,
    },
    Polling(Interval),
}

impl Trigger {
    fn polling(period: Duration) -> Self {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Polling(ticker)
    }

    #[cfg(target_os = "linux")]
    fn events(paths: &[PathBuf], fallback: Duration) -> Self {
        match inotify_events(paths) {
            Ok(stream) => Self::Events { stream, fallback },
            Err(e) => {
                warn!(error = %e, "inotify unavailable, polling credential files");
                Self::polling(fallback)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn events(_paths: &[PathBuf], fallback: Duration) -> Self {
        Self::polling(fallback)
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::Events { .. } => "events",
            Self::Polling(_) => "polling",
        }
    }

    /// Resolve at the next event or tick; a failed event stream degrades to polling
    async fn wait(&mut self) {
        loop {
            let fallback = match self {
                Self::Polling(ticker) => {
                    ticker.tick().await;
                    return;
                }
                Self::Events { stream, fallback } => match stream.next().await {
                    Some(Ok(())) => return,
                    Some(Err(e)) => {
                        warn!(error = %e, "credential file events failed, polling until restart");
                        *fallback
                    }
                    None => {
                        warn!("credential file event stream ended, polling until restart");
                        *fallback
                    }
                },
            };
            *self = Self::polling(fallback);
        }
    }
}

/// Events from the directories holding the files
///
/// Directories are watched rather than the files so that atomic replacement
/// (write to a temp file, rename over) is seen.
#[cfg(target_os = "linux")]
fn inotify_events(paths: &[PathBuf]) -> std::io::Result<BoxStream<'static, std::io::Result<()>>> {
    use inotify::{Inotify, WatchMask};
    use std::path::Path;

    let inotify = Inotify::init()?;
    let mask = WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::CLOSE_WRITE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO;

    let mut dirs: Vec<&Path> = paths
        .iter()
        .map(|p| {
            p.parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
        })
        .collect();
    dirs.sort();
    dirs.dedup();
    for dir in dirs {
        inotify.watches().add(dir, mask)?;
        trace!(dir = %dir.display(), "inotify watch added");
    }

    let stream = inotify.into_event_stream(vec![0u8; 4096])?;
    Ok(stream
        .map(|event| {
            event.map(|event| trace!(mask = ?event.mask, name = ?event.name, "inotify event"))
        })
        .boxed())
}

/// Re-hash every file; true when any differs from the last hash
async fn changed(files: &mut [Fingerprint]) -> bool {
    let mut any = false;
    for file in files.iter_mut() {
        any |= file.refresh().await;
    }
    any
}

struct Fingerprint {
    path: PathBuf,
    /// `None` while the file is missing or unread
    last: Option<Vec<u8>>,
}

impl Fingerprint {
    fn new(path: PathBuf) -> Self {
        Self { path, last: None }
    }

    async fn refresh(&mut self) -> bool {
        let current = match tokio::fs::read(&self.path).await {
            Ok(contents) => Some(digest(&SHA256, &contents).as_ref().to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read credential file");
                return false;
            }
        };
        if current == self.last {
            return false;
        }
        trace!(path = %self.path.display(), "fingerprint changed");
        self.last = current;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, ChangeCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback: ChangeCallback = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (count, callback)
    }

    fn fast() -> WatchConfig {
        WatchConfig {
            debounce_ms: 50,
            poll_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_burst_of_writes_fires_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "v1").unwrap();
        let (count, callback) = counting();
        let watcher = CredentialsWatcher::start(vec![file.path().to_path_buf()], &fast(), callback);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        std::fs::write(file.path(), "v2").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(file.path(), "v3").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        std::fs::write(file.path(), "v4").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        watcher.close();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_changes_are_seen_without_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "v1").unwrap();
        let config = WatchConfig {
            debounce_ms: 50,
            poll_interval_ms: 3_600_000,
        };
        let (count, callback) = counting();
        let _watcher = CredentialsWatcher::start(vec![path.clone()], &config, callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(&path, "v2").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_atomic_replacement_is_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "v1").unwrap();
        let config = WatchConfig {
            debounce_ms: 50,
            poll_interval_ms: 3_600_000,
        };
        let (count, callback) = counting();
        let _watcher = CredentialsWatcher::start(vec![path.clone()], &config, callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let staged = dir.path().join("config.tmp");
        std::fs::write(&staged, "v2").unwrap();
        std::fs::rename(&staged, &path).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_polling_detects_changes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "v1").unwrap();
        let (count, callback) = counting();
        let _watcher =
            CredentialsWatcher::start_polling(vec![file.path().to_path_buf()], &fast(), callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(file.path(), "v2").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rewrite_with_same_content_is_ignored() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "same").unwrap();
        let (count, callback) = counting();
        let _watcher = CredentialsWatcher::start(vec![file.path().to_path_buf()], &fast(), callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(file.path(), "same").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_callbacks() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "v1").unwrap();
        let (count, callback) = counting();
        let watcher = CredentialsWatcher::start(vec![file.path().to_path_buf()], &fast(), callback);
        tokio::time::sleep(Duration::from_millis(100)).await;

        watcher.close();
        watcher.close();
        assert!(watcher.is_closed());

        std::fs::write(file.path(), "v2").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
