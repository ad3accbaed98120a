use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use image::DynamicImage;
use serde::Serialize;
use tempfile::Builder;
use tracing::{info, warn};

use crate::backend::BackendTransport;
use crate::domain::{CellRecord, ImageSource};
use crate::error::AnnotError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub present: usize,
    pub without_url: usize,
    pub rejected: usize,
}

pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Utf8Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Utf8Component::Normal(_)), None)
    )
}

// Server-provided names must stay inside `dir`.
pub fn image_path(dir: &Utf8Path, name: &str) -> Result<Utf8PathBuf, AnnotError> {
    if !is_plain_file_name(name) {
        return Err(AnnotError::UnsafeImageName(name.to_string()));
    }
    Ok(dir.join(name))
}

pub fn download_missing<R, T>(
    records: &[R],
    target_dir: &Utf8Path,
    transport: &T,
) -> Result<DownloadReport, AnnotError>
where
    R: ImageSource,
    T: BackendTransport + ?Sized,
{
    let mut report = DownloadReport::default();
    fs::create_dir_all(target_dir.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    for record in records {
        let path = match image_path(target_dir, record.img_name()) {
            Ok(path) => path,
            Err(err) => {
                warn!("skipping download: {err}");
                report.rejected += 1;
                continue;
            }
        };
        if path.as_std_path().is_file() {
            report.present += 1;
            continue;
        }
        let Some(url) = record.resource_url() else {
            report.without_url += 1;
            continue;
        };
        let bytes = transport.get_bytes(url)?;
        write_atomic(&path, &bytes)?;
        info!(%path, "saved image");
        report.downloaded += 1;
    }
    Ok(report)
}

pub fn load_image(path: &Utf8Path) -> Result<DynamicImage, AnnotError> {
    image::open(path.as_std_path()).map_err(|err| AnnotError::Image {
        path: path.to_string(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CutoutReport {
    pub written: usize,
    pub present: usize,
    pub failed: usize,
}

// Per-cell failures are logged and counted, never returned.
pub fn cutout_cells(
    cells: &[CellRecord],
    cell_dir: &Utf8Path,
    wsi_paths: &BTreeMap<i64, Utf8PathBuf>,
) -> CutoutReport {
    let mut report = CutoutReport::default();
    let mut decoded: Option<(i64, DynamicImage)> = None;
    for cell in cells {
        let target = match image_path(cell_dir, &cell.img_name) {
            Ok(target) => target,
            Err(err) => {
                warn!(cell_id = cell.id, "error cutting cell: {err}");
                report.failed += 1;
                continue;
            }
        };
        if target.as_std_path().exists() {
            report.present += 1;
            continue;
        }
        match cutout_cell(cell, &target, wsi_paths, &mut decoded) {
            Ok(()) => report.written += 1,
            Err(err) => {
                warn!(cell_id = cell.id, path = %target, "error cutting cell: {err}");
                report.failed += 1;
            }
        }
    }
    report
}

fn cutout_cell(
    cell: &CellRecord,
    target: &Utf8Path,
    wsi_paths: &BTreeMap<i64, Utf8PathBuf>,
    decoded: &mut Option<(i64, DynamicImage)>,
) -> Result<(), AnnotError> {
    let bbox = cell.bounding_box()?;
    let wsi_path = wsi_paths
        .get(&cell.wsi_id)
        .filter(|path| path.as_std_path().is_file())
        .ok_or(AnnotError::MissingParentImage {
            cell_id: cell.id,
            wsi_id: cell.wsi_id,
        })?;
    // consecutive cells usually share a parent, so keep the last decoded WSI
    if decoded.as_ref().map(|(id, _)| *id) != Some(cell.wsi_id) {
        *decoded = Some((cell.wsi_id, load_image(wsi_path)?));
    }
    let Some((_, wsi)) = decoded.as_ref() else {
        return Err(AnnotError::MissingParentImage {
            cell_id: cell.id,
            wsi_id: cell.wsi_id,
        });
    };
    if bbox.col_max > wsi.width() || bbox.row_max > wsi.height() {
        return Err(AnnotError::InvalidBoundingBox {
            cell_id: cell.id,
            message: format!(
                "{bbox} exceeds parent image {}x{}",
                wsi.width(),
                wsi.height()
            ),
        });
    }
    let crop = wsi.crop_imm(bbox.col_min, bbox.row_min, bbox.width(), bbox.height());
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    }
    crop.save(target.as_std_path()).map_err(|err| AnnotError::Image {
        path: target.to_string(),
        message: err.to_string(),
    })
}

pub trait ImageRow {
    fn img_path(&self) -> &Utf8Path;
    fn set_dimensions(&mut self, width: u32, height: u32);
}

pub fn measure_images<R: ImageRow>(rows: Vec<R>) -> Vec<R> {
    rows.into_iter()
        .filter_map(|mut row| match load_image(row.img_path()) {
            Ok(img) => {
                row.set_dimensions(img.width(), img.height());
                Some(row)
            }
            Err(err) => {
                warn!("dropping row: {err}");
                None
            }
        })
        .collect()
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), AnnotError> {
    let parent = path
        .parent()
        .ok_or_else(|| AnnotError::Filesystem(format!("invalid destination path {path}")))?;
    let mut temp = Builder::new()
        .prefix("wsi-annot-image")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    Ok(())
}
