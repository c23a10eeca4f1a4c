//! Change detection for local and remote sources.
//!
//! The first observation of a path records a baseline and reports no change.
//! Later observations report a change whenever size or modification time
//! differs from the baseline, then move the baseline forward. Checks against
//! the same path are serialized.

use crate::error::SourceError;
use crate::source::remote::SharedSession;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSnapshot {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Something whose size and modification time can be observed.
#[derive(Clone)]
pub enum WatchTarget {
    Local(PathBuf),
    Remote {
        session: SharedSession,
        path: String,
        label: String,
    },
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Local(path) => f.debug_tuple("Local").field(path).finish(),
            WatchTarget::Remote { label, .. } => f.debug_tuple("Remote").field(label).finish(),
        }
    }
}

impl WatchTarget {
    /// Identity used to keep one baseline per watched path.
    pub fn key(&self) -> String {
        match self {
            WatchTarget::Local(path) => path.display().to_string(),
            WatchTarget::Remote { label, .. } => label.clone(),
        }
    }

    pub fn snapshot(&self) -> Result<WatchSnapshot, SourceError> {
        match self {
            WatchTarget::Local(path) => {
                let metadata = std::fs::metadata(path)
                    .map_err(|e| SourceError::from_io(path.display().to_string(), e))?;
                Ok(WatchSnapshot {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                })
            }
            WatchTarget::Remote { session, path, .. } => Ok(session.lock().stat(path)?.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed { key: String },
    Error { key: String, message: String },
}

type Baseline = Arc<Mutex<Option<WatchSnapshot>>>;

#[derive(Debug, Default)]
pub struct ChangeWatcher {
    baselines: Mutex<HashMap<String, Baseline>>,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the target against its baseline. Never reports a change on
    /// the first call for a path.
    pub fn check_for_changes(&self, target: &WatchTarget) -> Result<bool, SourceError> {
        let slot = self.slot(&target.key());
        let mut baseline = slot.lock();
        let current = target.snapshot()?;

        match *baseline {
            None => {
                *baseline = Some(current);
                Ok(false)
            }
            Some(previous) if previous == current => Ok(false),
            Some(previous) => {
                debug!(
                    key = %target.key(),
                    old_size = previous.size,
                    new_size = current.size,
                    "change detected"
                );
                *baseline = Some(current);
                Ok(true)
            }
        }
    }

    pub fn baseline(&self, key: &str) -> Option<WatchSnapshot> {
        let slot = self.baselines.lock().get(key).cloned()?;
        let snapshot = *slot.lock();
        snapshot
    }

    /// Forget the baseline so the next check starts over.
    pub fn reset(&self, key: &str) {
        self.baselines.lock().remove(key);
    }

    fn slot(&self, key: &str) -> Baseline {
        self.baselines
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Poll `target` every `interval` on a background task and send one
    /// event per detected change. Local targets are also woken early by
    /// file system notifications. The task ends when `tx` is closed.
    pub fn spawn(
        self: Arc<Self>,
        target: WatchTarget,
        interval: Duration,
        tx: mpsc::Sender<WatchEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let key = target.key();
            let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);

            let _os_watcher = match &target {
                WatchTarget::Local(path) => start_os_watcher(path, wake_tx.clone()),
                WatchTarget::Remote { .. } => None,
            };

            loop {
                let watcher = Arc::clone(&self);
                let check_target = target.clone();
                let checked =
                    tokio::task::spawn_blocking(move || watcher.check_for_changes(&check_target))
                        .await;

                let event = match checked {
                    Ok(Ok(true)) => Some(WatchEvent::Changed { key: key.clone() }),
                    Ok(Ok(false)) => None,
                    Ok(Err(e)) => Some(WatchEvent::Error {
                        key: key.clone(),
                        message: e.to_string(),
                    }),
                    Err(e) => {
                        error!(key = %key, "change check panicked: {}", e);
                        break;
                    }
                };

                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = timeout(interval, wake_rx.recv()) => {}
                }
            }

            drop(wake_tx);
            debug!(key = %key, "change watcher stopped");
        })
    }
}

fn start_os_watcher(path: &Path, wake: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = wake.try_send(());
            }
        }
    });

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "file notifications unavailable, polling only");
            return None;
        }
    };

    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        warn!(path = %path.display(), error = %e, "cannot watch file, polling only");
        return None;
    }

    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::remote::tests::FakeSession;
    use crate::source::remote::RemoteSession;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn append(file: &mut NamedTempFile, text: &str) {
        writeln!(file, "{text}").unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_first_check_then_change_then_quiet() {
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, "first");
        let target = WatchTarget::Local(file.path().to_path_buf());
        let watcher = ChangeWatcher::new();

        assert!(!watcher.check_for_changes(&target).unwrap());
        assert!(!watcher.check_for_changes(&target).unwrap());

        append(&mut file, "second");
        assert!(watcher.check_for_changes(&target).unwrap());
        assert!(!watcher.check_for_changes(&target).unwrap());

        let baseline = watcher.baseline(&target.key()).unwrap();
        assert_eq!(baseline.size, "first\nsecond\n".len() as u64);
    }

    #[test]
    fn test_reset_restarts_baseline() {
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, "a");
        let target = WatchTarget::Local(file.path().to_path_buf());
        let watcher = ChangeWatcher::new();

        watcher.check_for_changes(&target).unwrap();
        append(&mut file, "b");
        watcher.reset(&target.key());
        assert!(watcher.baseline(&target.key()).is_none());
        assert!(!watcher.check_for_changes(&target).unwrap());
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let watcher = ChangeWatcher::new();
        let target = WatchTarget::Local(PathBuf::from("/non/existent/app.log"));
        assert!(matches!(
            watcher.check_for_changes(&target),
            Err(SourceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_checks_report_one_change() {
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, "a");
        let target = WatchTarget::Local(file.path().to_path_buf());
        let watcher = Arc::new(ChangeWatcher::new());
        watcher.check_for_changes(&target).unwrap();

        append(&mut file, "b");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let watcher = Arc::clone(&watcher);
                let target = target.clone();
                std::thread::spawn(move || watcher.check_for_changes(&target).unwrap())
            })
            .collect();
        let changed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&changed| changed)
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_remote_target_uses_stat() {
        let fake = FakeSession::with_file("/var/log/app.log", b"one\n");
        let session: Box<dyn RemoteSession> = Box::new(fake.clone());
        let target = WatchTarget::Remote {
            session: Arc::new(Mutex::new(session)),
            path: "/var/log/app.log".to_string(),
            label: "user@example.com:/var/log/app.log".to_string(),
        };
        let watcher = ChangeWatcher::new();

        assert!(!watcher.check_for_changes(&target).unwrap());
        fake.files
            .lock()
            .insert("/var/log/app.log".to_string(), b"one\ntwo\n".to_vec());
        assert!(watcher.check_for_changes(&target).unwrap());
        assert!(!watcher.check_for_changes(&target).unwrap());
    }

    #[tokio::test]
    async fn test_spawned_watcher_reports_growth() {
        let mut file = NamedTempFile::new().unwrap();
        append(&mut file, "start");
        let target = WatchTarget::Local(file.path().to_path_buf());
        let key = target.key();

        let watcher = Arc::new(ChangeWatcher::new());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::clone(&watcher).spawn(target, Duration::from_millis(50), tx);

        while watcher.baseline(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        append(&mut file, "more");

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change event")
            .unwrap();
        assert_eq!(event, WatchEvent::Changed { key });

        drop(rx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
