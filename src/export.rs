use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tempfile::Builder;
use tracing::info;

use crate::error::AnnotError;

pub trait CsvTable {
    const COLUMNS: &'static [&'static str];
}

// Goes through a temp file in the destination directory, so a failure never
// leaves a partial file. An empty table still gets its header line.
pub fn write_csv<R: Serialize + CsvTable>(path: &Utf8Path, rows: &[R]) -> Result<(), AnnotError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix("wsi-annot-export")
        .suffix(".csv")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;

    let mut writer = csv::Writer::from_writer(temp.as_file());
    if rows.is_empty() {
        writer
            .write_record(R::COLUMNS)
            .map_err(|err| AnnotError::Export(format!("{path}: {err}")))?;
    }
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| AnnotError::Export(format!("{path}: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| AnnotError::Export(format!("{path}: {err}")))?;
    drop(writer);

    temp.persist(path.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    info!(%path, rows = rows.len(), "wrote table");
    Ok(())
}
