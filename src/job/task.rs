use std::path::PathBuf;
use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use crate::command::Scan;
use crate::filter::StationFileKind;

/// Scans one station file for a job and appends the matching rows to the
/// job's output file.
pub struct FileScanTask {
    path: PathBuf,
    scan: Scan,
}

impl FileScanTask {
    pub fn new(path: PathBuf, scan: Scan) -> Self {
        Self { path, scan }
    }

    /// Returns the number of rows written.
    ///
    /// Rows are kept when the raw line starts with the job's letter (case
    /// sensitive) and the temperature is inside `[min, max]`. Lines that do not
    /// parse are skipped. Each row is one append-mode write.
    pub async fn run(self) -> Result<usize> {
        let job = self.scan.job_name();
        let kind = StationFileKind::from_path(&self.path)
            .with_context(|| format!("Not a station file: {}", self.path.display()))?;

        let input = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.scan.output_file())
            .await
            .with_context(|| format!("Failed to open output file {}", self.scan.output_file()))?;

        let mut lines = BufReader::new(input).lines();
        if kind.has_header() {
            lines.next_line().await?;
        }

        let letter = self.scan.letter();
        let mut count = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?
        {
            if !line.starts_with(letter) {
                continue;
            }
            let Some(measurement) = kind.parse_line(&line) else {
                continue;
            };
            if !self.scan.accepts(measurement.temperature) {
                continue;
            }

            output
                .write_all(measurement.to_output_line().as_bytes())
                .await
                .with_context(|| format!("Error writing to output file {}", self.scan.output_file()))?;
            count += 1;
        }
        output.flush().await?;

        tracing::info!("{} - Got {} results for file {}", job, count, self.path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filters_by_letter_and_range() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("stations.csv");
        let output = dir.path().join("out.txt");
        fs::write(
            &input,
            "station,temperature\nHamburg,42.0\nBerlin,10.0\nHalle,120.0\nhannover,5.0\nHeidelberg,0\n",
        )
        .unwrap();

        let scan = Scan::new(0.0, 100.0, 'H', output.to_string_lossy(), "j1").unwrap();
        let count = FileScanTask::new(input, scan).run().await.unwrap();

        assert_eq!(count, 2);
        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(written, "Hamburg;42.0\nHeidelberg;0.0\n");
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("s.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "Hamburg;abc\nHamburg\nHamburg;1;2\n\nHamm;3.24\n").unwrap();

        let scan = Scan::new(-10.0, 10.0, 'H', output.to_string_lossy(), "j1").unwrap();
        let count = FileScanTask::new(input, scan).run().await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(fs::read_to_string(&output).unwrap(), "Hamm;3.2\n");
    }

    #[tokio::test]
    async fn test_appends_to_existing_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("s.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "Hamburg;1.0\n").unwrap();
        fs::write(&output, "Hannover;2.0\n").unwrap();

        let scan = Scan::new(0.0, 10.0, 'H', output.to_string_lossy(), "j1").unwrap();
        FileScanTask::new(input, scan).run().await.unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "Hannover;2.0\nHamburg;1.0\n");
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.txt");
        let scan = Scan::new(0.0, 10.0, 'H', output.to_string_lossy(), "j1").unwrap();

        assert!(FileScanTask::new(dir.path().join("gone.txt"), scan).run().await.is_err());
    }
}
