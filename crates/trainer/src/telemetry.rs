use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;

/// Destination for scalar training metrics.
pub trait MetricsSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits every scalar as an `info` log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        log::info!("[metric] step={} {}={:.5}", step, name, value);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Appends one JSON object per scalar to a file.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create metrics file {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps scalars in memory. Clones share the same record list.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScalarRecord {
                name: name.to_string(),
                value,
                step,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_one_line_per_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        {
            let mut sink = JsonlSink::create(&path).unwrap();
            sink.log_scalar("train_error", 4.5, 100).unwrap();
            sink.log_scalar("loss_gaze", 0.25, 100).unwrap();
            sink.flush().unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "train_error");
        assert_eq!(first["value"], 4.5);
        assert_eq!(first["step"], 100);
    }

    #[test]
    fn recording_sink_clones_share_records() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer.log_scalar("loss_gaze", 1.0, 1).unwrap();
        writer.log_scalar("train_error", 2.0, 1).unwrap();
        assert_eq!(sink.values("loss_gaze"), vec![1.0]);
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn recording_sink_survives_a_poisoned_lock() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer.log_scalar("loss_gaze", 1.0, 1).unwrap();

        let shared = sink.clone();
        let crashed = std::thread::spawn(move || {
            let _held = shared.records.lock().unwrap();
            panic!("worker died while holding the records");
        })
        .join();
        assert!(crashed.is_err());
        assert!(sink.records.is_poisoned());

        writer.log_scalar("loss_gaze", 2.0, 2).unwrap();
        assert_eq!(sink.values("loss_gaze"), vec![1.0, 2.0]);
    }
}
