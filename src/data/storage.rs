//! Data sinks for per-poll temperature samples with clean feature flag handling.
use crate::error::{AppResult, ThermoError};
use async_trait::async_trait;

/// Line-oriented sink that receives one sample per poll tick.
#[async_trait]
pub trait DataSink: Send {
    /// Prepare the sink for a new run.
    async fn open(&mut self) -> AppResult<()>;

    /// Persist one sample line (`"<elapsed seconds> <temperature>"`).
    async fn write(&mut self, line: &str) -> AppResult<()>;

    /// Flush and release the sink.
    async fn close(&mut self) -> AppResult<()>;
}

// ============================================================================
// Memory Sink
// ============================================================================

/// Sink that keeps every line in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    open: bool,
}

impl MemorySink {
    /// Empty, closed sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far. Clones share the same storage.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether `open` has been called without a matching `close`.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn open(&mut self) -> AppResult<()> {
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, line: &str) -> AppResult<()> {
        if !self.open {
            return Err(ThermoError::Sink("memory sink is not open".to_string()));
        }
        self.lines
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }
}

// ============================================================================
// CSV Sink
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::path::{Path, PathBuf};

    /// Writes `timestamp,elapsed_s,temperature` rows to `thermo_<YYYYmmdd_HHMMSS>.csv`.
    pub struct CsvDataSink {
        dir: PathBuf,
        path: Option<PathBuf>,
        writer: Option<csv::Writer<File>>,
    }

    impl CsvDataSink {
        /// Sink that creates one file per run under `dir`.
        pub fn new(dir: impl AsRef<Path>) -> Self {
            Self {
                dir: dir.as_ref().to_path_buf(),
                path: None,
                writer: None,
            }
        }

        /// File of the current (or last) run.
        pub fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }
    }

    #[async_trait]
    impl DataSink for CsvDataSink {
        async fn open(&mut self) -> AppResult<()> {
            if !self.dir.exists() {
                std::fs::create_dir_all(&self.dir)?;
            }
            let file_name = format!(
                "thermo_{}.csv",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            );
            let path = self.dir.join(file_name);

            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_path(&path)
                .map_err(|e| ThermoError::Sink(format!("failed to create {path:?}: {e}")))?;
            writer
                .write_record(["timestamp", "elapsed_s", "temperature"])
                .map_err(|e| ThermoError::Sink(format!("failed to write CSV header: {e}")))?;

            tracing::info!(path = %path.display(), "CSV sink opened");
            self.path = Some(path);
            self.writer = Some(writer);
            Ok(())
        }

        async fn write(&mut self, line: &str) -> AppResult<()> {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| ThermoError::Sink("CSV sink is not open".to_string()))?;

            let mut record = vec![chrono::Local::now().to_rfc3339()];
            record.extend(line.split_whitespace().map(str::to_string));
            writer
                .write_record(&record)
                .map_err(|e| ThermoError::Sink(format!("failed to write sample: {e}")))?;
            Ok(())
        }

        async fn close(&mut self) -> AppResult<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
                tracing::info!("CSV sink closed");
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::path::Path;

    /// Placeholder that fails every operation without the `storage_csv` feature.
    pub struct CsvDataSink;

    impl CsvDataSink {
        /// Accepts a directory for API parity only.
        pub fn new(_dir: impl AsRef<Path>) -> Self {
            Self
        }

        /// Always `None`.
        pub fn path(&self) -> Option<&Path> {
            None
        }
    }

    #[async_trait]
    impl DataSink for CsvDataSink {
        async fn open(&mut self) -> AppResult<()> {
            Err(ThermoError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn write(&mut self, _line: &str) -> AppResult<()> {
            Err(ThermoError::FeatureNotEnabled("storage_csv".to_string()))
        }

        async fn close(&mut self) -> AppResult<()> {
            Err(ThermoError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvDataSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvDataSink;
