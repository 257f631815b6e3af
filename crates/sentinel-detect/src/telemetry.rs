//! Telemetry log detector.
//!
//! The log may not exist when the detector starts, so the containing
//! directory is watched first and a direct file watch is attached once the
//! file shows up. Every change signal reads only the bytes appended since the
//! last read and pushes them through one long-lived [`TelemetryStreamParser`].

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify, TelemetryEvent};
use crate::error::DetectError;
use crate::observer::{ObserverId, ObserverRegistry, PredicateObserver, TelemetryObserver};
use crate::parser::TelemetryStreamParser;
use crate::watch::touches_file;

struct TelemetryInner {
    path: PathBuf,
    registry: ObserverRegistry,
    cancel: CancellationToken,
    started: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl TelemetryInner {
    fn attach_file_watch(&self) -> bool {
        let Ok(mut guard) = self.watcher.lock() else {
            return false;
        };
        let Some(watcher) = guard.as_mut() else {
            return false;
        };
        match watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!(path = %self.path.display(), "attached telemetry file watch");
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to watch telemetry file");
                false
            }
        }
    }
}

/// Streams completion events out of one growing telemetry log.
///
/// Clones share the same detector.
#[derive(Clone)]
pub struct TelemetryDetector {
    inner: Arc<TelemetryInner>,
}

impl std::fmt::Debug for TelemetryDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryDetector")
            .field("path", &self.inner.path)
            .field("observers", &self.observer_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl TelemetryDetector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                path: path.into(),
                registry: ObserverRegistry::default(),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn subscribe(&self, observer: impl TelemetryObserver + 'static) -> ObserverId {
        self.inner.registry.subscribe(Box::new(observer))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Registers the directory watch and spawns the read loop on the current
    /// tokio runtime.
    pub fn start(&self) -> Result<(), DetectError> {
        if self.is_stopped() {
            return Err(DetectError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DetectError::AlreadyStarted {
                path: self.inner.path.clone(),
            });
        }

        let dir = match self.inner.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .inner
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let callback_cancel = self.inner.cancel.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if callback_cancel.is_cancelled() {
                    return;
                }
                match res {
                    Ok(event) => {
                        if touches_file(&event, &file_name) {
                            let _ = tx.send(());
                        }
                    }
                    Err(err) => {
                        // Force a re-read; the offset makes it harmless.
                        warn!(error = %err, "telemetry watch error");
                        let _ = tx.send(());
                    }
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

        if let Ok(mut guard) = self.inner.watcher.lock() {
            *guard = Some(watcher);
        }
        debug!(path = %self.inner.path.display(), "telemetry detector started");

        tokio::spawn(run_loop(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            rx,
        ));
        Ok(())
    }

    /// Resolves with the first event that satisfies `predicate`.
    ///
    /// The observer is registered before this returns, so nothing emitted
    /// after the call can be missed. It detaches when the future completes
    /// or is dropped, which makes racing it against a timer safe. If the
    /// detector stops first the future yields [`DetectError::Stopped`].
    pub fn wait_for<P>(
        &self,
        predicate: P,
    ) -> impl Future<Output = Result<TelemetryEvent, DetectError>> + Send + 'static
    where
        P: FnMut(&TelemetryEvent) -> bool + Send + 'static,
    {
        let (observer, rx) = PredicateObserver::new(predicate);
        let id = self.subscribe(observer);
        if self.is_stopped() {
            // Dropping the observer closes the channel.
            self.unsubscribe(id);
        }
        let detach = DetachOnDrop {
            inner: Arc::clone(&self.inner),
            id,
        };
        async move {
            let _detach = detach;
            rx.await.map_err(|_| DetectError::Stopped)
        }
    }

    pub fn wait_for_user_turn(
        &self,
    ) -> impl Future<Output = Result<TelemetryEvent, DetectError>> + Send + 'static {
        self.wait_for(TelemetryEvent::is_user_turn)
    }

    pub fn wait_for_agent_finish(
        &self,
    ) -> impl Future<Output = Result<TelemetryEvent, DetectError>> + Send + 'static {
        self.wait_for(TelemetryEvent::is_agent_finish)
    }

    /// Closes all watches and drops every observer. Idempotent, and safe to
    /// call from inside an observer callback.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(path = %self.inner.path.display(), "stopping telemetry detector");
        }
        self.inner.cancel.cancel();
        if let Ok(mut guard) = self.inner.watcher.lock() {
            guard.take();
        }
        self.inner.registry.clear();
    }
}

struct DetachOnDrop {
    inner: Arc<TelemetryInner>,
    id: ObserverId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.inner.registry.unsubscribe(self.id);
    }
}

async fn run_loop(
    inner: Weak<TelemetryInner>,
    cancel: CancellationToken,
    mut signals: mpsc::UnboundedReceiver<()>,
) {
    let Some(path) = inner.upgrade().map(|strong| strong.path.clone()) else {
        return;
    };
    let mut tail = TelemetryTail::new(path);

    // Content written before the watch existed.
    if !sync(&inner, &cancel, &mut tail).await {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
                // Coalesce bursts into a single read.
                while signals.try_recv().is_ok() {}
                if !sync(&inner, &cancel, &mut tail).await {
                    break;
                }
            }
        }
    }
    debug!(path = %tail.path.display(), offset = tail.offset, "telemetry loop exited");
}

/// Returns false once the detector is gone.
async fn sync(
    inner: &Weak<TelemetryInner>,
    cancel: &CancellationToken,
    tail: &mut TelemetryTail,
) -> bool {
    let Some(detector) = inner.upgrade() else {
        return false;
    };

    if !tail.path.exists() {
        // A deleted file takes its watch with it.
        tail.file_attached = false;
        return true;
    }
    if !tail.file_attached {
        tail.file_attached = detector.attach_file_watch();
    }

    let values = match tail.read_appended().await {
        Ok(values) => values,
        Err(err) => {
            warn!(error = %err, "failed to read telemetry log");
            return true;
        }
    };
    for value in values {
        if cancel.is_cancelled() {
            return false;
        }
        let event = classify(&value);
        debug!(kind = event_kind(&event), "telemetry event");
        detector.registry.dispatch(&event);
    }
    true
}

fn event_kind(event: &TelemetryEvent) -> &'static str {
    match event {
        TelemetryEvent::Completion(completion) => completion.kind(),
        TelemetryEvent::Other(_) => "other",
    }
}

/// Read position within the log plus the parser carried across reads.
#[derive(Debug)]
pub struct TelemetryTail {
    path: PathBuf,
    offset: u64,
    parser: TelemetryStreamParser,
    file_attached: bool,
}

impl TelemetryTail {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            parser: TelemetryStreamParser::new(),
            file_attached: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads bytes appended since the previous call and returns the objects
    /// they complete. A missing file yields nothing; a file shorter than the
    /// last offset is treated as truncated and re-read from the start.
    pub async fn read_appended(&mut self) -> Result<Vec<Value>, DetectError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.read_error(source)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|source| self.read_error(source))?
            .len();

        if len < self.offset {
            debug!(path = %self.path.display(), "telemetry log truncated; restarting");
            self.offset = 0;
            self.parser.reset();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|source| self.read_error(source))?;
        let mut appended = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset)
            .read_to_end(&mut appended)
            .await
            .map_err(|source| self.read_error(source))?;

        self.offset += appended.len() as u64;
        Ok(self.parser.feed(&appended))
    }

    fn read_error(&self, source: std::io::Error) -> DetectError {
        DetectError::Read {
            path: self.path.clone(),
            source,
        }
    }
}

/// Runs a detector on `path` until `predicate` matches, then tears it down.
pub async fn wait_for_event<P>(
    path: impl Into<PathBuf>,
    predicate: P,
) -> Result<TelemetryEvent, DetectError>
where
    P: FnMut(&TelemetryEvent) -> bool + Send + 'static,
{
    let detector = TelemetryDetector::new(path);
    let waiter = detector.wait_for(predicate);
    if let Err(err) = detector.start() {
        detector.stop();
        return Err(err);
    }
    let outcome = waiter.await;
    detector.stop();
    outcome
}

pub async fn wait_for_user_turn(path: impl Into<PathBuf>) -> Result<TelemetryEvent, DetectError> {
    wait_for_event(path, TelemetryEvent::is_user_turn).await
}

pub async fn wait_for_agent_finish(
    path: impl Into<PathBuf>,
) -> Result<TelemetryEvent, DetectError> {
    wait_for_event(path, TelemetryEvent::is_agent_finish).await
}
