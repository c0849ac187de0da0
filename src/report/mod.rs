//! Rendering and CSV export of the aggregate snapshot
//!
//! The service only reads through [`SnapshotSource`], so it never holds on to
//! the watcher itself. Exports can be triggered by `EXPORTMAP` and by the
//! periodic scheduler at the same time; they are serialized by one lock.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Local;
use tokio::task::JoinHandle;
use crate::aggregate::{AggregateSnapshot, SnapshotSource};
use crate::filter::format_one_decimal;

pub const CSV_HEADER: &str = "Letter,Station count,Sum";

pub struct MapReportService {
    source: Arc<dyn SnapshotSource>,
    export_file: PathBuf,
    export_lock: tokio::sync::Mutex<()>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MapReportService {
    pub fn new<P: AsRef<Path>>(source: Arc<dyn SnapshotSource>, export_file: P) -> Self {
        Self {
            source,
            export_file: export_file.as_ref().to_path_buf(),
            export_lock: tokio::sync::Mutex::new(()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn export_file(&self) -> &Path {
        &self.export_file
    }

    /// Log the snapshot two letters per row and return the rows.
    pub fn render(&self) -> Vec<String> {
        let snapshot = self.source.aggregate_map();
        if snapshot.is_empty() {
            tracing::info!("Map is not yet available");
            return Vec::new();
        }

        let rows = render_rows(&snapshot);
        for row in &rows {
            tracing::info!("{}", row);
        }
        rows
    }

    /// Write the snapshot to the export file, replacing its contents.
    ///
    /// Returns `Ok(false)` without touching the file when there is nothing to
    /// export yet.
    pub async fn export_csv(&self) -> Result<bool> {
        let _guard = self.export_lock.lock().await;

        let snapshot = self.source.aggregate_map();
        if snapshot.is_empty() {
            tracing::info!("Map is not yet available, skipping export");
            return Ok(false);
        }

        tokio::fs::write(&self.export_file, to_csv(&snapshot))
            .await
            .with_context(|| format!("Failed to write export file {}", self.export_file.display()))?;

        tracing::info!(
            "Map exported to {} at {}",
            self.export_file.display(),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        Ok(true)
    }

    /// Export every `interval`, first one after one full interval.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_some() {
            tracing::warn!("Report scheduler is already running");
            return;
        }

        let service = Arc::clone(self);
        *scheduler = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if let Err(err) = service.export_csv().await {
                    tracing::error!("Scheduled export failed: {:#}", err);
                }
            }
        }));
        tracing::info!("Report scheduler started, exporting every {:?}", interval);
    }

    /// Stop the scheduler. An export already in progress gets up to `grace` to
    /// finish before the task is aborted.
    pub async fn stop(&self, grace: Duration) {
        let task = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return;
        };

        // Holding the export lock means no export is mid-write when we abort
        match tokio::time::timeout(grace, self.export_lock.lock()).await {
            Ok(_guard) => task.abort(),
            Err(_) => {
                tracing::warn!("Export still running after {:?}, aborting", grace);
                task.abort();
            }
        }
        tracing::info!("Report scheduler stopped");
    }
}

fn format_entry(letter: char, count: u64, sum: f64) -> String {
    format!("{}: {}, {}", letter, count, format_one_decimal(sum))
}

/// `"A: 2, 40.0\t|\tB: 1, 10.0"`, with a lone last entry on its own row.
pub fn render_rows(snapshot: &AggregateSnapshot) -> Vec<String> {
    let entries: Vec<String> = snapshot
        .iter()
        .map(|(letter, entry)| format_entry(letter, entry.count, entry.sum))
        .collect();
    entries.chunks(2).map(|pair| pair.join("\t|\t")).collect()
}

pub fn to_csv(snapshot: &AggregateSnapshot) -> String {
    let mut csv = String::new();
    csv.push_str(CSV_HEADER);
    csv.push('\n');
    for (letter, entry) in snapshot.iter() {
        let _ = writeln!(csv, "{},{},{}", letter, entry.count, format_one_decimal(entry.sum));
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateEntry, AggregateStore};
    use tempfile::TempDir;

    fn snapshot(entries: &[(char, u64, f64)]) -> AggregateSnapshot {
        entries
            .iter()
            .map(|&(letter, count, sum)| (letter, AggregateEntry { count, sum }))
            .collect()
    }

    fn service(dir: &TempDir, snap: AggregateSnapshot) -> MapReportService {
        let store = Arc::new(AggregateStore::new());
        store.publish(snap);
        MapReportService::new(store, dir.path().join("map.csv"))
    }

    #[test]
    fn test_render_pairs_letters() {
        let rows = render_rows(&snapshot(&[('A', 2, 40.0), ('B', 1, 10.0), ('C', 3, -1.24)]));
        assert_eq!(rows, vec!["A: 2, 40.0\t|\tB: 1, 10.0", "C: 3, -1.2"]);
    }

    #[test]
    fn test_render_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AggregateSnapshot::default());
        assert!(service.render().is_empty());
    }

    #[test]
    fn test_ties_round_half_up() {
        let snap = snapshot(&[('A', 2, 0.25), ('B', 1, 12.25)]);
        assert_eq!(to_csv(&snap), "Letter,Station count,Sum\nA,2,0.3\nB,1,12.3\n");
        assert_eq!(render_rows(&snap), vec!["A: 2, 0.3\t|\tB: 1, 12.3"]);
    }

    #[test]
    fn test_csv_layout() {
        let csv = to_csv(&snapshot(&[('B', 1, 10.0), ('A', 2, 40.04)]));
        assert_eq!(csv, "Letter,Station count,Sum\nA,2,40.0\nB,1,10.0\n");
    }

    #[tokio::test]
    async fn test_export_replaces_file() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, snapshot(&[('A', 2, 40.0)]));
        std::fs::write(service.export_file(), "old content that is longer than the export\n").unwrap();

        assert!(service.export_csv().await.unwrap());
        let written = std::fs::read_to_string(service.export_file()).unwrap();
        assert_eq!(written, "Letter,Station count,Sum\nA,2,40.0\n");
    }

    #[tokio::test]
    async fn test_export_skips_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AggregateSnapshot::default());

        assert!(!service.export_csv().await.unwrap());
        assert!(!service.export_file().exists());
    }

    #[tokio::test]
    async fn test_concurrent_exports_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let letters: Vec<(char, u64, f64)> = ('A'..='Z').map(|c| (c, 1, 1.0)).collect();
        let service = Arc::new(service(&dir, snapshot(&letters)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move { service.export_csv().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        let written = std::fs::read_to_string(service.export_file()).unwrap();
        assert_eq!(written, to_csv(&snapshot(&letters)));
    }

    #[tokio::test]
    async fn test_scheduler_exports_periodically() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(service(&dir, snapshot(&[('A', 1, 1.0)])));

        service.start(Duration::from_millis(50));
        let mut exported = false;
        for _ in 0..100 {
            if service.export_file().exists() {
                exported = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exported);

        service.stop(Duration::from_secs(1)).await;
    }
}
