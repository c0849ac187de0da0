use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use anyhow::{Context, Result};
use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{JoinHandle, JoinSet};
use crate::aggregate::{self, Accumulator, AggregateSnapshot, AggregateStore, SnapshotSource};
use crate::filter::{self, is_station_file};

/// State shared between the watcher handle and its event loop task.
struct WatchState {
    watch_dir: PathBuf,
    store: Arc<AggregateStore>,
    last_modified: DashMap<PathBuf, SystemTime>,
}

struct Monitor {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// Keeps the aggregate snapshot in step with the watch directory.
///
/// [`start`](Self::start) folds every existing station file into the first
/// snapshot, then follows create/modify events and folds each changed file
/// into a fresh copy of the snapshot.
pub struct DirectoryWatcher {
    state: Arc<WatchState>,
    initial_scan_timeout: Duration,
    running: AtomicBool,
    starting: AtomicBool,
    monitor: Mutex<Option<Monitor>>,
}

impl DirectoryWatcher {
    pub fn new<P: AsRef<Path>>(watch_dir: P, initial_scan_timeout: Duration) -> Self {
        Self {
            state: Arc::new(WatchState {
                watch_dir: watch_dir.as_ref().to_path_buf(),
                store: Arc::new(AggregateStore::new()),
                last_modified: DashMap::new(),
            }),
            initial_scan_timeout,
            running: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.state.watch_dir
    }

    pub fn store(&self) -> Arc<AggregateStore> {
        self.state.store.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Create the directory if needed, build the initial snapshot and start
    /// following filesystem events.
    ///
    /// Returns `Ok(false)` when the watcher was already running or another
    /// call is starting it; only one caller ever runs the initial scan.
    pub async fn start(&self) -> Result<bool> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Directory watcher is already starting");
            return Ok(false);
        }
        if self.is_running() {
            self.starting.store(false, Ordering::SeqCst);
            tracing::warn!("Directory watcher is already running");
            return Ok(false);
        }

        let started = self.start_inner().await;
        self.starting.store(false, Ordering::SeqCst);
        started.map(|()| true)
    }

    async fn start_inner(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.state.watch_dir)
            .await
            .with_context(|| {
                format!("Failed to create watch directory {}", self.state.watch_dir.display())
            })?;
        let watch_dir = tokio::fs::canonicalize(&self.state.watch_dir)
            .await
            .with_context(|| format!("Failed to resolve {}", self.state.watch_dir.display()))?;

        self.initial_scan(&watch_dir).await?;
        let monitor = self.start_event_loop(&watch_dir)?;
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Directory watcher started for: {}", watch_dir.display());
        Ok(())
    }

    /// Stop following events. The last published snapshot stays readable.
    pub fn stop(&self) {
        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(monitor) = monitor {
            monitor.task.abort();
            tracing::info!("Directory watcher stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn initial_scan(&self, watch_dir: &Path) -> Result<()> {
        let dir = watch_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || filter::list_station_files(&dir))
            .await
            .context("Directory listing task failed")??;

        if files.is_empty() {
            tracing::info!("No files found in watch directory");
            self.state.store.publish(AggregateSnapshot::default());
            return Ok(());
        }

        tracing::info!("Processing {} files for initial aggregate map", files.len());
        let accumulator = Arc::new(Accumulator::new());
        let mut folds = JoinSet::new();

        for file in files {
            let state = self.state.clone();
            let accumulator = accumulator.clone();
            folds.spawn(async move { state.fold_and_record(&file, &accumulator).await });
        }

        let barrier = async {
            while let Some(joined) = folds.join_next().await {
                if let Err(err) = joined {
                    tracing::error!("Fold task failed: {}", err);
                }
            }
        };
        if tokio::time::timeout(self.initial_scan_timeout, barrier).await.is_err() {
            tracing::warn!(
                "Initial scan did not finish within {:?}, publishing partial map",
                self.initial_scan_timeout
            );
            folds.shutdown().await;
        }

        let snapshot: AggregateSnapshot = accumulator
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        tracing::info!("Initial aggregate map created with {} letters", snapshot.len());
        self.state.store.publish(snapshot);
        Ok(())
    }

    fn start_event_loop(&self, watch_dir: &Path) -> Result<Monitor> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |result| {
            // Receiver gone means the loop was stopped
            let _ = tx.send(result);
        })
        .context("Failed to create file system watcher")?;

        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .context("Failed to start watching directory")?;

        let state = self.state.clone();
        let task = tokio::spawn(async move { state.event_loop(rx).await });

        Ok(Monitor { _watcher: watcher, task })
    }
}

impl SnapshotSource for DirectoryWatcher {
    fn aggregate_map(&self) -> AggregateSnapshot {
        self.state.store.aggregate_map()
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WatchState {
    async fn event_loop(&self, mut rx: UnboundedReceiver<notify::Result<Event>>) {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(event) => {
                    if event.need_rescan() {
                        tracing::debug!("Ignoring overflow notification for {}", self.watch_dir.display());
                        continue;
                    }
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        self.handle_change(path).await;
                    }
                }
                Err(err) => {
                    tracing::error!("File watcher error: {}", err);
                }
            }
        }
        tracing::debug!("Watch loop for {} ended", self.watch_dir.display());
    }

    async fn handle_change(&self, path: &Path) {
        if !is_station_file(path) {
            return;
        }
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return;
        };
        if !metadata.is_file() {
            return;
        }
        let Ok(modified) = metadata.modified() else {
            return;
        };

        let previous = self.last_modified.insert(path.to_path_buf(), modified);
        if previous == Some(modified) {
            return;
        }

        tracing::info!("File changed: {}", path.display());
        self.refold(path).await;
    }

    /// Fold one file into a copy of the published snapshot and publish the
    /// copy. The file's earlier contribution is not subtracted.
    async fn refold(&self, path: &Path) {
        let accumulator = self.store.snapshot().to_accumulator();
        match aggregate::fold_file(path, &accumulator).await {
            Ok(folded) => tracing::debug!("Folded {} readings from {}", folded, path.display()),
            Err(err) => tracing::error!("Error processing file {}: {:#}", path.display(), err),
        }
        self.store.publish(AggregateSnapshot::from_accumulator(accumulator));
    }

    async fn fold_and_record(&self, path: &Path, accumulator: &Accumulator) {
        tracing::info!("Processing file for aggregate map: {}", path.display());
        if let Err(err) = aggregate::fold_file(path, accumulator).await {
            tracing::error!("Error processing file {}: {:#}", path.display(), err);
        }

        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => {
                self.last_modified.insert(path.to_path_buf(), modified);
            }
            Err(err) => {
                tracing::error!("Error getting last modified time for {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use crate::aggregate::AggregateEntry;

    async fn wait_for<F: Fn(&AggregateSnapshot) -> bool>(watcher: &DirectoryWatcher, check: F) -> bool {
        for _ in 0..50 {
            if check(&watcher.aggregate_map()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_initial_scan_builds_snapshot() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "Athens;20.5\nAmsterdam;19.5\n").unwrap();
        fs::write(dir.path().join("b.csv"), "station,temp\nBerlin,10.0\nbad line\n").unwrap();
        fs::write(dir.path().join("notes.md"), "Athens;100.0\n").unwrap();

        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));
        assert!(watcher.start().await.unwrap());
        assert!(watcher.is_running());

        let snapshot = watcher.aggregate_map();
        assert_eq!(snapshot.get('A'), Some(&AggregateEntry { count: 2, sum: 40.0 }));
        assert_eq!(snapshot.get('B'), Some(&AggregateEntry { count: 1, sum: 10.0 }));
        assert_eq!(snapshot.len(), 2);

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_start_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("watch");

        let watcher = DirectoryWatcher::new(&watch_dir, Duration::from_secs(30));
        assert!(watcher.start().await.unwrap());

        assert!(watch_dir.is_dir());
        assert!(watcher.aggregate_map().is_empty());
        // Second start is a logged no-op
        assert!(!watcher.start().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_start_runs_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "Athens;20.5\n").unwrap();
        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));

        let (first, second) = tokio::join!(watcher.start(), watcher.start());
        let started = [first.unwrap(), second.unwrap()];

        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert!(watcher.is_running());
        assert_eq!(watcher.aggregate_map().get('A'), Some(&AggregateEntry { count: 1, sum: 20.5 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_file_is_folded_into_snapshot() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "Athens;20.5\n").unwrap();

        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));
        watcher.start().await.unwrap();

        // Move fully written files in so each arrives as a single event
        let staging = TempDir::new().unwrap();
        let staged = staging.path().join("z.txt");
        fs::write(&staged, "Zurich;5.0\nZagreb;7.0\n").unwrap();
        fs::rename(&staged, dir.path().join("z.txt")).unwrap();
        fs::write(dir.path().join("ignored.dat"), "Yerevan;1.0\n").unwrap();

        let found = wait_for(&watcher, |s| {
            s.get('Z') == Some(&AggregateEntry { count: 2, sum: 12.0 })
        })
        .await;
        assert!(found, "new file was not folded in: {:?}", watcher.aggregate_map());

        let snapshot = watcher.aggregate_map();
        assert_eq!(snapshot.get('A'), Some(&AggregateEntry { count: 1, sum: 20.5 }));
        assert!(snapshot.get('Y').is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_modified_file_is_counted_again() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "Athens;1.0\n").unwrap();

        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));
        watcher.start().await.unwrap();
        assert_eq!(watcher.aggregate_map().get('A'), Some(&AggregateEntry { count: 1, sum: 1.0 }));

        // Make sure the replacement gets a different mtime
        tokio::time::sleep(Duration::from_millis(50)).await;
        let staging = TempDir::new().unwrap();
        let staged = staging.path().join("a.txt");
        fs::write(&staged, "Athens;1.0\nAthens;2.0\n").unwrap();
        fs::rename(&staged, dir.path().join("a.txt")).unwrap();

        // The old contribution is not subtracted: 1 + (1 + 2)
        let found = wait_for(&watcher, |s| {
            s.get('A') == Some(&AggregateEntry { count: 3, sum: 4.0 })
        })
        .await;
        assert!(found, "modified file was not refolded: {:?}", watcher.aggregate_map());
    }

    #[tokio::test]
    async fn test_unchanged_mtime_is_not_refolded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.txt");
        fs::write(&path, "Berlin;10.0\n").unwrap();

        // Not started, so only direct calls touch the snapshot
        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));
        watcher.state.handle_change(&path).await;
        watcher.state.handle_change(&path).await;

        assert_eq!(watcher.aggregate_map().get('B'), Some(&AggregateEntry { count: 1, sum: 10.0 }));
    }

    #[tokio::test]
    async fn test_changes_to_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes.md");
        fs::write(&notes, "Athens;100.0\n").unwrap();
        let folder = dir.path().join("folder.txt");
        fs::create_dir(&folder).unwrap();

        let watcher = DirectoryWatcher::new(dir.path(), Duration::from_secs(30));
        watcher.state.handle_change(&notes).await;
        watcher.state.handle_change(&folder).await;
        watcher.state.handle_change(&dir.path().join("gone.txt")).await;

        assert!(watcher.aggregate_map().is_empty());
        assert!(watcher.state.last_modified.is_empty());
    }
}
