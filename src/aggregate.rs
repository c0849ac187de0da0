//! Per-letter station aggregate and the snapshot store that publishes it.
//!
//! Readers always get a whole snapshot. The writer builds a new map off to the
//! side and swaps it in with one store, so a reader never sees a map that is
//! still being folded into.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use crate::filter::StationFileKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateEntry {
    pub count: u64,
    pub sum: f64,
}

impl AggregateEntry {
    pub fn first(temperature: f64) -> Self {
        Self { count: 1, sum: temperature }
    }

    /// A new entry with one more reading folded in.
    pub fn add(self, temperature: f64) -> Self {
        Self {
            count: self.count + 1,
            sum: self.sum + temperature,
        }
    }
}

/// Immutable letter -> entry view, ordered by letter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSnapshot {
    entries: BTreeMap<char, AggregateEntry>,
}

impl AggregateSnapshot {
    pub fn get(&self, letter: char) -> Option<&AggregateEntry> {
        self.entries.get(&letter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, &AggregateEntry)> {
        self.entries.iter().map(|(letter, entry)| (*letter, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Working copy that fold tasks can update concurrently.
    pub fn to_accumulator(&self) -> Accumulator {
        self.entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn from_accumulator(accumulator: Accumulator) -> Self {
        Self {
            entries: accumulator.into_iter().collect(),
        }
    }
}

impl FromIterator<(char, AggregateEntry)> for AggregateSnapshot {
    fn from_iter<I: IntoIterator<Item = (char, AggregateEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

pub type Accumulator = DashMap<char, AggregateEntry>;

/// Merge one reading into the accumulator atomically per letter.
pub fn merge(accumulator: &Accumulator, letter: char, temperature: f64) {
    accumulator
        .entry(letter)
        .and_modify(|entry| *entry = entry.add(temperature))
        .or_insert_with(|| AggregateEntry::first(temperature));
}

/// Fold every valid line of one station file into `accumulator`.
///
/// Bad lines are skipped. Returns the number of readings folded in; an error
/// means the file could not be opened or read and was left partly folded.
pub async fn fold_file(path: &Path, accumulator: &Accumulator) -> Result<usize> {
    let kind = StationFileKind::from_path(path)
        .with_context(|| format!("Not a station file: {}", path.display()))?;
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    if kind.has_header() {
        lines.next_line().await?;
    }

    let mut folded = 0;
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?
    {
        let Some(measurement) = kind.parse_line(&line) else {
            continue;
        };
        if let Some(letter) = measurement.initial() {
            merge(accumulator, letter, measurement.temperature);
            folded += 1;
        }
    }

    Ok(folded)
}

/// Read side of the aggregate, as consumed by reporting.
pub trait SnapshotSource: Send + Sync {
    /// A copy of the currently published snapshot.
    fn aggregate_map(&self) -> AggregateSnapshot;
}

/// Single-writer, many-reader holder of the current snapshot.
#[derive(Default)]
pub struct AggregateStore {
    current: RwLock<Arc<AggregateSnapshot>>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The published snapshot. Cheap: clones the `Arc`, not the map.
    pub fn snapshot(&self) -> Arc<AggregateSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published snapshot wholesale. No compare-and-swap: the last
    /// publisher wins.
    pub fn publish(&self, snapshot: AggregateSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl SnapshotSource for AggregateStore {
    fn aggregate_map(&self) -> AggregateSnapshot {
        self.snapshot().as_ref().clone()
    }
}
