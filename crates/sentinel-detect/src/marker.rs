//! Marker-file completion detector.
//!
//! A task run is complete once `minimax-complete-{taskRunId}` exists in the
//! lifecycle directory. The file content is never read.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sentinel_core::layout::{marker_file_name, LifecycleLayout};
use sentinel_core::types::TaskRunId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::watch::{arrived_paths, has_file_name};

struct MarkerInner {
    marker_path: PathBuf,
    cancel: CancellationToken,
    resolved: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
    arrivals: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

/// Resolves once when the marker for one task run appears.
///
/// Cheap to clone; clones share state so one handle can `stop()` while
/// another is parked in `wait()`.
#[derive(Clone)]
pub struct MarkerDetector {
    inner: Arc<MarkerInner>,
}

impl std::fmt::Debug for MarkerDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerDetector")
            .field("marker_path", &self.inner.marker_path)
            .field("resolved", &self.is_resolved())
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl MarkerDetector {
    pub fn start(dir: impl AsRef<Path>, task_run_id: &TaskRunId) -> Result<Self, DetectError> {
        let dir = dir.as_ref().to_path_buf();
        let file_name = marker_file_name(task_run_id);
        let marker_path = dir.join(&file_name);

        // The agent may have finished before we got here.
        if marker_path.exists() {
            debug!(path = %marker_path.display(), "completion marker already present");
            return Ok(Self::already_resolved(marker_path));
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let callback_cancel = cancel.clone();
        let callback_name = file_name.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if callback_cancel.is_cancelled() {
                    return;
                }
                match res {
                    Ok(event) => {
                        if arrived_paths(&event)
                            .iter()
                            .any(|path| has_file_name(path, &callback_name))
                        {
                            let _ = tx.send(());
                        }
                    }
                    Err(err) => warn!(error = %err, "completion marker watch error"),
                }
            },
        )
        .map_err(|source| DetectError::Watch {
            path: dir.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| DetectError::Watch {
                path: dir.clone(),
                source,
            })?;

        // Marker created between the first check and the watch registration.
        if marker_path.exists() {
            drop(watcher);
            return Ok(Self::already_resolved(marker_path));
        }

        debug!(path = %marker_path.display(), "watching for completion marker");
        Ok(Self {
            inner: Arc::new(MarkerInner {
                marker_path,
                cancel,
                resolved: AtomicBool::new(false),
                watcher: Mutex::new(Some(watcher)),
                arrivals: tokio::sync::Mutex::new(Some(rx)),
            }),
        })
    }

    fn already_resolved(marker_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(MarkerInner {
                marker_path,
                cancel: CancellationToken::new(),
                resolved: AtomicBool::new(true),
                watcher: Mutex::new(None),
                arrivals: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.inner.marker_path
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::SeqCst)
    }

    /// Whether a live filesystem watch is still registered.
    pub fn is_watching(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub async fn wait(&self) -> Result<(), DetectError> {
        if self.is_resolved() {
            return Ok(());
        }
        if self.inner.cancel.is_cancelled() {
            return Err(DetectError::Stopped);
        }

        let mut arrivals = self.inner.arrivals.lock().await;
        // Another waiter may have resolved while we queued for the lock.
        if self.is_resolved() {
            return Ok(());
        }
        let Some(rx) = arrivals.as_mut() else {
            return Err(DetectError::Stopped);
        };

        let received = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            received = rx.recv() => received,
        };
        match received {
            Some(()) => {
                self.inner.resolved.store(true, Ordering::SeqCst);
                debug!(path = %self.inner.marker_path.display(), "completion marker observed");
                self.teardown();
                *arrivals = None;
                Ok(())
            }
            None => Err(DetectError::Stopped),
        }
    }

    /// Closes the watch. Safe to call any number of times.
    pub fn stop(&self) {
        self.teardown();
    }

    fn teardown(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut guard) = self.inner.watcher.lock() {
            guard.take();
        }
    }
}

/// Starts a detector for `task_run_id` under the layout's lifecycle directory
/// and waits for its marker.
pub async fn wait_for_marker(
    layout: &LifecycleLayout,
    task_run_id: &TaskRunId,
) -> Result<(), DetectError> {
    let detector = MarkerDetector::start(&layout.lifecycle_dir, task_run_id)?;
    let outcome = detector.wait().await;
    detector.stop();
    outcome
}

#[cfg(test)]
mod tests {
    use sentinel_core::layout::LifecycleLayout;
    use sentinel_core::types::TaskRunId;
    use std::fs;
    use std::time::Duration;
    use tokio::time::timeout;

    use super::{wait_for_marker, MarkerDetector};
    use crate::error::DetectError;

    const RESOLVE_WITHIN: Duration = Duration::from_secs(5);
    const QUIET_PERIOD: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn pre_existing_marker_resolves_without_watching() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("minimax-complete-abc"), b"").expect("write marker");

        let detector = MarkerDetector::start(dir.path(), &TaskRunId::new("abc")).expect("start");
        assert!(detector.is_resolved());
        assert!(!detector.is_watching());

        timeout(RESOLVE_WITHIN, detector.wait())
            .await
            .expect("resolves immediately")
            .expect("marker present");
    }

    #[tokio::test]
    async fn resolves_only_for_exact_marker_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = MarkerDetector::start(dir.path(), &TaskRunId::new("abc")).expect("start");
        assert!(detector.is_watching());

        fs::write(dir.path().join("minimax-complete-abcd"), b"").expect("write longer name");
        fs::write(dir.path().join("minimax-complete-ab"), b"").expect("write shorter name");
        assert!(
            timeout(QUIET_PERIOD, detector.wait()).await.is_err(),
            "near-miss file names must not resolve the detector"
        );
        assert!(!detector.is_resolved());

        fs::write(dir.path().join("minimax-complete-abc"), b"").expect("write marker");
        timeout(RESOLVE_WITHIN, detector.wait())
            .await
            .expect("resolves after marker")
            .expect("marker observed");
        assert!(detector.is_resolved());
        assert!(!detector.is_watching(), "watch is torn down after resolution");
    }

    #[tokio::test]
    async fn resolves_when_marker_is_renamed_into_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = MarkerDetector::start(dir.path(), &TaskRunId::new("r1")).expect("start");

        let staging = dir.path().join(".staging");
        fs::write(&staging, b"done").expect("write staging file");
        fs::rename(&staging, dir.path().join("minimax-complete-r1")).expect("rename");

        timeout(RESOLVE_WITHIN, detector.wait())
            .await
            .expect("resolves after rename")
            .expect("marker observed");
    }

    #[tokio::test]
    async fn concurrent_detectors_on_same_directory_do_not_interfere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = MarkerDetector::start(dir.path(), &TaskRunId::new("one")).expect("start one");
        let second = MarkerDetector::start(dir.path(), &TaskRunId::new("two")).expect("start two");

        fs::write(dir.path().join("minimax-complete-one"), b"").expect("write marker one");
        timeout(RESOLVE_WITHIN, first.wait())
            .await
            .expect("first resolves")
            .expect("first marker observed");
        assert!(timeout(QUIET_PERIOD, second.wait()).await.is_err());
        assert!(second.is_watching());

        second.stop();
    }

    #[tokio::test]
    async fn missing_directory_fails_to_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("not-there");
        let err = MarkerDetector::start(&missing, &TaskRunId::new("x")).expect_err("no dir");
        assert!(matches!(err, DetectError::Watch { ref path, .. } if path == &missing));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_rejects_waiters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let detector = MarkerDetector::start(dir.path(), &TaskRunId::new("s")).expect("start");

        let parked = detector.clone();
        let waiter = tokio::spawn(async move { parked.wait().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        detector.stop();
        detector.stop();
        assert!(!detector.is_watching());

        let outcome = timeout(RESOLVE_WITHIN, waiter)
            .await
            .expect("waiter wakes up")
            .expect("join waiter");
        assert!(matches!(outcome, Err(DetectError::Stopped)));

        // Late marker after stop changes nothing.
        fs::write(dir.path().join("minimax-complete-s"), b"").expect("write marker");
        assert!(matches!(detector.wait().await, Err(DetectError::Stopped)));
        assert!(!detector.is_resolved());
    }

    #[tokio::test]
    async fn wait_for_marker_uses_layout_lifecycle_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = LifecycleLayout {
            lifecycle_dir: dir.path().to_path_buf(),
            telemetry_dir: dir.path().to_path_buf(),
        };
        let marker = layout.marker_path(&TaskRunId::new("run-9"));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fs::write(marker, b"").expect("write marker");
        });

        timeout(
            RESOLVE_WITHIN,
            wait_for_marker(&layout, &TaskRunId::new("run-9")),
        )
        .await
        .expect("resolves")
        .expect("marker observed");
        writer.await.expect("join writer");
    }
}
