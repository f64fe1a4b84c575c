//! Per-transfer throughput records and the statistics log

use anyhow::Context;
use tokio::io::AsyncWriteExt;

const LOG_HEADER: &str = "Columns: [Elapsed Time(s)] [Active Seeds] [Files Transferred]\n\n";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsRecord {
    pub elapsed_secs: f64,
    pub active_seeds: usize,
    pub transfers_completed: usize,
}

impl std::fmt::Display for MetricsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:.2}, {:2}, {:2}",
            self.elapsed_secs, self.active_seeds, self.transfers_completed
        )
    }
}

#[derive(Debug)]
pub struct MetricsRecorder {
    start_time: std::time::Instant,
    records: parking_lot::Mutex<Vec<MetricsRecord>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::starting_at(std::time::Instant::now())
    }

    pub fn starting_at(start_time: std::time::Instant) -> Self {
        Self {
            start_time,
            records: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Append a record for a completed transfer.
    pub fn record(&self, active_seeds: usize) -> MetricsRecord {
        self.record_with(|| active_seeds)
    }

    /// Like [`record`](Self::record), but obtains the seed count while holding the record lock
    /// so that counts from concurrent completions are logged in the order they were produced.
    pub fn record_with(&self, active_seeds: impl FnOnce() -> usize) -> MetricsRecord {
        let mut records = self.records.lock();
        let active_seeds = active_seeds();
        let record = MetricsRecord {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            active_seeds,
            transfers_completed: records.len() + 1,
        };
        records.push(record);
        record
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records.lock().clone()
    }

    /// Take all records collected so far, oldest first.
    pub fn drain(&self) -> Vec<MetricsRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

/// Format one run worth of records the way they are appended to the log.
pub fn format_run(
    records: &[MetricsRecord],
    timestamp: &chrono::DateTime<chrono::Local>,
    new_file: bool,
) -> String {
    let mut text = String::new();
    if new_file {
        text.push_str(LOG_HEADER);
    }
    text.push_str(&timestamp.format("%a %b %e %H:%M:%S %Y").to_string());
    text.push('\n');
    for record in records {
        text.push_str(&record.to_string());
        text.push('\n');
    }
    text.push_str("\n\n");
    text
}

/// Append records to the statistics log, writing the column header if the file is new.
pub async fn append_to_log(
    path: &std::path::Path,
    records: &[MetricsRecord],
) -> anyhow::Result<()> {
    let new_file = !tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("failed checking if {:?} exists", path))?;
    let text = format_run(records, &chrono::Local::now(), new_file);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed opening statistics log {:?}", path))?;
    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("failed writing statistics log {:?}", path))?;
    file.flush().await?;
    tracing::info!("wrote {} record(s) to {:?}", records.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn completion_count_follows_insertion_order() {
        let recorder = MetricsRecorder::new();
        recorder.record(2);
        recorder.record(3);
        let last = recorder.record(3);
        assert_eq!(last.transfers_completed, 3);
        let records = recorder.records();
        assert_eq!(
            records
                .iter()
                .map(|r| r.transfers_completed)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records.windows(2).all(|w| w[0].elapsed_secs <= w[1].elapsed_secs));
    }

    #[test]
    fn drain_empties_recorder() {
        let recorder = MetricsRecorder::new();
        recorder.record(2);
        assert_eq!(recorder.drain().len(), 1);
        assert!(recorder.is_empty());
    }

    #[test]
    fn record_line_format() {
        let record = MetricsRecord {
            elapsed_secs: 3.14159,
            active_seeds: 4,
            transfers_completed: 12,
        };
        assert_eq!(record.to_string(), "3.14,  4, 12");
    }

    #[test]
    fn header_only_for_new_file() {
        let timestamp = chrono::Local
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .single()
            .expect("unambiguous local time");
        let records = [MetricsRecord {
            elapsed_secs: 1.0,
            active_seeds: 2,
            transfers_completed: 1,
        }];
        let fresh = format_run(&records, &timestamp, true);
        assert_eq!(
            fresh,
            "Columns: [Elapsed Time(s)] [Active Seeds] [Files Transferred]\n\n\
            Tue Mar  5 14:07:09 2024\n\
            1.00,  2,  1\n\n\n"
        );
        let appended = format_run(&records, &timestamp, false);
        assert!(appended.starts_with("Tue Mar  5 14:07:09 2024\n"));
    }

    #[tokio::test]
    async fn log_is_appended_across_runs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = dir.path().join("rwave.log");
        let recorder = MetricsRecorder::new();
        recorder.record(2);
        recorder.record(3);
        append_to_log(&log, &recorder.records()).await?;
        append_to_log(&log, &recorder.records()).await?;
        let contents = tokio::fs::read_to_string(&log).await?;
        assert_eq!(contents.matches("Columns:").count(), 1);
        assert_eq!(contents.matches(",  3,  2").count(), 2);
        Ok(())
    }
}
