use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{CacheKey, CachePort, DEFAULT_TTL, memoize};
use crate::error::AnnotError;
use crate::export::CsvTable;
use crate::images::{self, ImageRow};
use crate::repository::DataRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLabelRow {
    pub cell_id: i64,
    pub img_path: Utf8PathBuf,
    pub label: i64,
    pub wsi_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsiLabelRow {
    pub wsi_id: i64,
    pub img_path: Utf8PathBuf,
    pub pixel_diameter_in_micrometer: Option<f64>,
    pub label: String,
    pub dataset_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlabeledCellRow {
    pub cell_id: i64,
    pub img_path: Utf8PathBuf,
    pub wsi_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BinaryXyDataset {
    pub ids: Vec<i64>,
    pub x: Vec<DynamicImage>,
    pub y: Vec<u8>,
}

impl BinaryXyDataset {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct DatasetBuilder<'a, C: CachePort> {
    repo: &'a DataRepository,
    cache: C,
    ttl: Duration,
}

impl<'a, C: CachePort> DatasetBuilder<'a, C> {
    pub fn new(repo: &'a DataRepository, cache: C) -> Self {
        Self {
            repo,
            cache,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build_cell_label_table(&self) -> Vec<CellLabelRow> {
        let mut rows = Vec::new();
        for (cell_id, selections) in self.repo.selections_by_cell() {
            let Some(cell) = self.repo.cell(cell_id) else {
                warn!(cell_id, "skipping selections of unknown cell");
                continue;
            };
            let img_path = self.repo.cell_image_path(cell);
            for selection in selections {
                let Some(labels) = self.repo.labels_for_selection(selection.id) else {
                    continue;
                };
                rows.extend(labels.iter().map(|label| CellLabelRow {
                    cell_id,
                    img_path: img_path.clone(),
                    label: *label,
                    wsi_id: cell.wsi_id,
                }));
            }
        }
        rows
    }

    pub fn build_wsi_label_table(&self) -> Result<Vec<WsiLabelRow>, AnnotError> {
        let wsis: Vec<_> = self.repo.wsis().collect();
        let key = CacheKey::new(
            "build_wsi_label_table",
            json!({"wsi_dir": self.repo.wsi_dir(), "wsis": wsis}),
        );
        memoize(&self.cache, key, self.ttl, || {
            let mut rows = Vec::new();
            for wsi in &wsis {
                let img_path = self.repo.wsi_image_path(&wsi.record);
                rows.extend(wsi.labels.iter().map(|label| WsiLabelRow {
                    wsi_id: wsi.record.id,
                    img_path: img_path.clone(),
                    pixel_diameter_in_micrometer: wsi.record.pixel_diameter_in_micrometer,
                    label: label.clone(),
                    dataset_id: wsi.record.dataset_id,
                }));
            }
            Ok(rows)
        })
    }

    pub fn build_unlabeled_cell_table(&self) -> Vec<UnlabeledCellRow> {
        self.repo
            .cells()
            .map(|cell| UnlabeledCellRow {
                cell_id: cell.id,
                img_path: self.repo.cell_image_path(cell),
                wsi_id: cell.wsi_id,
            })
            .collect()
    }

    // Each cell is judged by its first labeled selection in the target's label
    // group. Unreadable images are deleted so the next load downloads them again.
    pub fn build_binary_xy(&self, target_label_id: i64) -> Result<BinaryXyDataset, AnnotError> {
        let target = self
            .repo
            .label(target_label_id)
            .ok_or(AnnotError::UnknownLabel(target_label_id))?;

        let mut dataset = BinaryXyDataset::default();
        for (cell_id, selections) in self.repo.selections_by_cell() {
            let qualifying = selections.iter().find_map(|selection| {
                if selection.label_group != target.label_group {
                    return None;
                }
                self.repo
                    .labels_for_selection(selection.id)
                    .filter(|labels| !labels.is_empty())
            });
            let Some(labels) = qualifying else {
                continue;
            };
            let Some(cell) = self.repo.cell(cell_id) else {
                continue;
            };
            let img_path = self.repo.cell_image_path(cell);
            match images::load_image(&img_path) {
                Ok(img) => {
                    dataset.ids.push(cell_id);
                    dataset.x.push(img);
                    dataset.y.push(u8::from(labels.contains(&target_label_id)));
                }
                Err(err) => {
                    warn!(cell_id, "image corrupted: {err}");
                    remove_corrupt_image(&img_path);
                }
            }
        }
        info!(
            target_label_id,
            samples = dataset.len(),
            positives = dataset.y.iter().filter(|y| **y == 1).count(),
            "built binary dataset"
        );
        Ok(dataset)
    }
}

fn remove_corrupt_image(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%path, "failed to delete corrupted image: {err}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryCellRow {
    pub cell_id: i64,
    pub img_path: Utf8PathBuf,
    pub wsi_id: i64,
    pub y: u8,
    pub img_width: Option<u32>,
    pub img_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinaryWsiRow {
    pub wsi_id: i64,
    pub img_path: Utf8PathBuf,
    pub pixel_diameter_in_micrometer: Option<f64>,
    pub dataset_id: i64,
    pub y: u8,
    pub img_width: Option<u32>,
    pub img_height: Option<u32>,
}

impl ImageRow for BinaryCellRow {
    fn img_path(&self) -> &Utf8Path {
        &self.img_path
    }

    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.img_width = Some(width);
        self.img_height = Some(height);
    }
}

impl ImageRow for BinaryWsiRow {
    fn img_path(&self) -> &Utf8Path {
        &self.img_path
    }

    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.img_width = Some(width);
        self.img_height = Some(height);
    }
}

pub fn binarize_cell_labels(rows: &[CellLabelRow], positive_label: i64) -> Vec<BinaryCellRow> {
    let mut by_cell: BTreeMap<i64, BinaryCellRow> = BTreeMap::new();
    for row in rows {
        let y = u8::from(row.label == positive_label);
        by_cell
            .entry(row.cell_id)
            .and_modify(|existing| existing.y = existing.y.max(y))
            .or_insert_with(|| BinaryCellRow {
                cell_id: row.cell_id,
                img_path: row.img_path.clone(),
                wsi_id: row.wsi_id,
                y,
                img_width: None,
                img_height: None,
            });
    }
    by_cell.into_values().collect()
}

pub fn binarize_wsi_labels(rows: &[WsiLabelRow], positive_label: &str) -> Vec<BinaryWsiRow> {
    let mut by_wsi: BTreeMap<i64, BinaryWsiRow> = BTreeMap::new();
    for row in rows {
        let y = u8::from(row.label == positive_label);
        by_wsi
            .entry(row.wsi_id)
            .and_modify(|existing| existing.y = existing.y.max(y))
            .or_insert_with(|| BinaryWsiRow {
                wsi_id: row.wsi_id,
                img_path: row.img_path.clone(),
                pixel_diameter_in_micrometer: row.pixel_diameter_in_micrometer,
                dataset_id: row.dataset_id,
                y,
                img_width: None,
                img_height: None,
            });
    }
    by_wsi.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRow {
    pub cell_id: i64,
    pub img_path_cell: Utf8PathBuf,
    pub wsi_id: i64,
    pub y_cell: u8,
    pub img_width_cell: Option<u32>,
    pub img_height_cell: Option<u32>,
    pub img_path_wsi: Option<Utf8PathBuf>,
    pub pixel_diameter_in_micrometer: Option<f64>,
    pub dataset_id: Option<i64>,
    pub y_wsi: Option<u8>,
    pub img_width_wsi: Option<u32>,
    pub img_height_wsi: Option<u32>,
}

impl CsvTable for CellLabelRow {
    const COLUMNS: &'static [&'static str] = &["cell_id", "img_path", "label", "wsi_id"];
}

impl CsvTable for WsiLabelRow {
    const COLUMNS: &'static [&'static str] = &[
        "wsi_id",
        "img_path",
        "pixel_diameter_in_micrometer",
        "label",
        "dataset_id",
    ];
}

impl CsvTable for UnlabeledCellRow {
    const COLUMNS: &'static [&'static str] = &["cell_id", "img_path", "wsi_id"];
}

impl CsvTable for BinaryCellRow {
    const COLUMNS: &'static [&'static str] =
        &["cell_id", "img_path", "wsi_id", "y", "img_width", "img_height"];
}

impl CsvTable for BinaryWsiRow {
    const COLUMNS: &'static [&'static str] = &[
        "wsi_id",
        "img_path",
        "pixel_diameter_in_micrometer",
        "dataset_id",
        "y",
        "img_width",
        "img_height",
    ];
}

impl CsvTable for CombinedRow {
    const COLUMNS: &'static [&'static str] = &[
        "cell_id",
        "img_path_cell",
        "wsi_id",
        "y_cell",
        "img_width_cell",
        "img_height_cell",
        "img_path_wsi",
        "pixel_diameter_in_micrometer",
        "dataset_id",
        "y_wsi",
        "img_width_wsi",
        "img_height_wsi",
    ];
}

pub fn join_cells_with_wsi(cells: &[BinaryCellRow], wsis: &[BinaryWsiRow]) -> Vec<CombinedRow> {
    let wsi_by_id: BTreeMap<i64, &BinaryWsiRow> = wsis.iter().map(|wsi| (wsi.wsi_id, wsi)).collect();
    cells
        .iter()
        .map(|cell| {
            let wsi = wsi_by_id.get(&cell.wsi_id);
            CombinedRow {
                cell_id: cell.cell_id,
                img_path_cell: cell.img_path.clone(),
                wsi_id: cell.wsi_id,
                y_cell: cell.y,
                img_width_cell: cell.img_width,
                img_height_cell: cell.img_height,
                img_path_wsi: wsi.map(|wsi| wsi.img_path.clone()),
                pixel_diameter_in_micrometer: wsi.and_then(|wsi| wsi.pixel_diameter_in_micrometer),
                dataset_id: wsi.map(|wsi| wsi.dataset_id),
                y_wsi: wsi.map(|wsi| wsi.y),
                img_width_wsi: wsi.and_then(|wsi| wsi.img_width),
                img_height_wsi: wsi.and_then(|wsi| wsi.img_height),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_row(cell_id: i64, label: i64) -> CellLabelRow {
        CellLabelRow {
            cell_id,
            img_path: Utf8PathBuf::from(format!("/cells/{cell_id}.png")),
            label,
            wsi_id: 1,
        }
    }

    #[test]
    fn binarize_keeps_positive_label_per_cell() {
        let rows = vec![cell_row(2, 4), cell_row(1, 1), cell_row(2, 1), cell_row(3, 7)];
        let binary = binarize_cell_labels(&rows, 1);
        let summary: Vec<_> = binary.iter().map(|row| (row.cell_id, row.y)).collect();
        assert_eq!(summary, [(1, 1), (2, 1), (3, 0)]);
    }

    #[test]
    fn binarize_wsi_on_string_label() {
        let row = |label: &str| WsiLabelRow {
            wsi_id: 5,
            img_path: Utf8PathBuf::from("/wsi/5.png"),
            pixel_diameter_in_micrometer: Some(0.25),
            label: label.to_string(),
            dataset_id: 1,
        };
        let binary = binarize_wsi_labels(&[row("aml"), row("m3")], "m3");
        assert_eq!(binary.len(), 1);
        assert_eq!(binary[0].y, 1);
        assert_eq!(binarize_wsi_labels(&[row("aml")], "m3")[0].y, 0);
    }

    #[test]
    fn join_is_left_join() {
        let cells = binarize_cell_labels(&[cell_row(1, 1)], 1);
        let mut orphan = cells[0].clone();
        orphan.cell_id = 2;
        orphan.wsi_id = 9;
        let wsis = vec![BinaryWsiRow {
            wsi_id: 1,
            img_path: Utf8PathBuf::from("/wsi/1.png"),
            pixel_diameter_in_micrometer: None,
            dataset_id: 3,
            y: 0,
            img_width: Some(10),
            img_height: Some(20),
        }];

        let joined = join_cells_with_wsi(&[cells[0].clone(), orphan], &wsis);
        assert_eq!(joined[0].dataset_id, Some(3));
        assert_eq!(joined[0].img_height_wsi, Some(20));
        assert_eq!(joined[1].dataset_id, None);
    }
}
