use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::images::CutoutReport;
use crate::repository::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub cell_rows: usize,
    pub wsi_rows: usize,
    pub combined_rows: usize,
    pub files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CutoutSummary {
    pub cells_with_bbox: usize,
    pub report: CutoutReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeSummary {
    pub dataset_id: i64,
    pub img_name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheClearSummary {
    pub cache_dir: Utf8PathBuf,
    pub removed: usize,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        let elapsed_ms = event.elapsed.map(|elapsed| elapsed.as_millis() as u64);
        info!(phase = ?event.phase, elapsed_ms, "{}", event.message);
    }
}
