use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::warn;

use crate::backend::{BackendTransport, RemoteDataClient};
use crate::cache::CachePort;
use crate::domain::{
    CellRecord, LabelDefinition, LabelInSelection, LabeledWsi, Selection, WsiRecord,
};
use crate::error::AnnotError;
use crate::images;
use crate::labels::normalize_wsi_labels;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryConfig {
    pub backend_url: String,
    pub dataset_ids: Vec<i64>,
    pub segmentation_set_ids: Vec<i64>,
    pub annotator_ids: Vec<i64>,
    pub cell_dir: Utf8PathBuf,
    pub wsi_dir: Utf8PathBuf,
    pub skip_image_download: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadPhase {
    FetchWsi,
    FetchCells,
    DownloadImages,
    FetchSelections,
    FetchLabelLinks,
    FetchLabels,
    Index,
    Ready,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: LoadPhase,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

// Only obtainable in the ready state: `load` either finishes all steps or
// returns an error.
#[derive(Debug, Clone)]
pub struct DataRepository {
    config: RepositoryConfig,
    wsi_by_id: BTreeMap<i64, LabeledWsi>,
    cell_by_id: BTreeMap<i64, CellRecord>,
    selections_by_cell: BTreeMap<i64, Vec<Selection>>,
    labels_by_selection: BTreeMap<i64, Vec<i64>>,
    label_by_id: BTreeMap<i64, LabelDefinition>,
}

impl DataRepository {
    pub fn load<T, C>(
        config: RepositoryConfig,
        client: &RemoteDataClient<T, C>,
        sink: &dyn ProgressSink,
    ) -> Result<Self, AnnotError>
    where
        T: BackendTransport,
        C: CachePort,
    {
        let started = std::time::Instant::now();
        let report = |phase: LoadPhase, message: String| {
            sink.event(ProgressEvent {
                phase,
                message,
                elapsed: Some(started.elapsed()),
            })
        };

        report(
            LoadPhase::FetchWsi,
            format!("datasets {:?}", config.dataset_ids),
        );
        let mut wsis = Vec::new();
        for dataset_id in &config.dataset_ids {
            for record in client.fetch_wsi(*dataset_id)? {
                let labels = normalize_wsi_labels(&record)?;
                wsis.push(LabeledWsi { record, labels });
            }
        }

        report(
            LoadPhase::FetchCells,
            format!(
                "{} WSIs x segmentation sets {:?}",
                wsis.len(),
                config.segmentation_set_ids
            ),
        );
        let mut cells = Vec::new();
        for wsi in &wsis {
            for segmentation_set_id in &config.segmentation_set_ids {
                cells.extend(client.fetch_cells(wsi.record.id, *segmentation_set_id)?);
            }
        }

        if config.skip_image_download {
            report(LoadPhase::DownloadImages, "skipped".to_string());
        } else {
            let wsi_report =
                images::download_missing(&wsis, &config.wsi_dir, client.transport())?;
            let cell_report =
                images::download_missing(&cells, &config.cell_dir, client.transport())?;
            report(
                LoadPhase::DownloadImages,
                format!(
                    "downloaded {} WSI and {} cell images",
                    wsi_report.downloaded, cell_report.downloaded
                ),
            );
        }

        let valid_cell_ids: BTreeSet<i64> = cells.iter().map(|cell| cell.id).collect();
        report(
            LoadPhase::FetchSelections,
            format!(
                "annotators {:?} on {} cells",
                config.annotator_ids,
                valid_cell_ids.len()
            ),
        );
        let mut selections = Vec::new();
        for annotator_id in &config.annotator_ids {
            selections.extend(client.fetch_selections(*annotator_id, &valid_cell_ids)?);
        }

        let valid_selection_ids: BTreeSet<i64> =
            selections.iter().map(|selection| selection.id).collect();
        report(
            LoadPhase::FetchLabelLinks,
            format!("{} selections", valid_selection_ids.len()),
        );
        let links = client.fetch_labels_in_selections(&valid_selection_ids)?;

        report(LoadPhase::FetchLabels, String::new());
        let labels = client.fetch_label_definitions()?;

        report(
            LoadPhase::Index,
            format!("{} label links, {} labels", links.len(), labels.len()),
        );
        let repo = Self::from_parts(config, wsis, cells, selections, links, labels);

        report(
            LoadPhase::Ready,
            format!(
                "{} WSIs, {} cells, {} labeled cells",
                repo.wsi_by_id.len(),
                repo.cell_by_id.len(),
                repo.selections_by_cell.len()
            ),
        );
        Ok(repo)
    }

    pub fn from_parts(
        config: RepositoryConfig,
        wsis: Vec<LabeledWsi>,
        cells: Vec<CellRecord>,
        selections: Vec<Selection>,
        links: Vec<LabelInSelection>,
        labels: Vec<LabelDefinition>,
    ) -> Self {
        let wsis = wsis
            .into_iter()
            .filter(|wsi| plain_image_name("WSI", wsi.record.id, &wsi.record.img_name));
        let cells = cells
            .into_iter()
            .filter(|cell| plain_image_name("cell", cell.id, &cell.img_name));
        let wsi_by_id = index_by_id(wsis, "WSI", |wsi| wsi.record.id);
        let cell_by_id = index_by_id(cells, "cell", |cell| cell.id);
        let label_by_id = index_by_id(labels, "label", |label| label.id);

        let mut selections_by_cell: BTreeMap<i64, Vec<Selection>> = BTreeMap::new();
        let mut known_selections = BTreeSet::new();
        for selection in selections {
            if !cell_by_id.contains_key(&selection.cell_id) {
                warn!(
                    selection_id = selection.id,
                    cell_id = selection.cell_id,
                    "skipping selection of unknown cell"
                );
                continue;
            }
            if !known_selections.insert(selection.id) {
                warn!(selection_id = selection.id, "skipping duplicate selection");
                continue;
            }
            selections_by_cell
                .entry(selection.cell_id)
                .or_default()
                .push(selection);
        }

        let mut labels_by_selection: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for link in links {
            if !known_selections.contains(&link.selection_id) {
                warn!(
                    selection_id = link.selection_id,
                    label_id = link.label_id,
                    "skipping label of unknown selection"
                );
                continue;
            }
            labels_by_selection
                .entry(link.selection_id)
                .or_default()
                .push(link.label_id);
        }

        Self {
            config,
            wsi_by_id,
            cell_by_id,
            selections_by_cell,
            labels_by_selection,
            label_by_id,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn cell_dir(&self) -> &Utf8Path {
        &self.config.cell_dir
    }

    pub fn wsi_dir(&self) -> &Utf8Path {
        &self.config.wsi_dir
    }

    pub fn wsi(&self, id: i64) -> Option<&LabeledWsi> {
        self.wsi_by_id.get(&id)
    }

    pub fn wsis(&self) -> impl Iterator<Item = &LabeledWsi> {
        self.wsi_by_id.values()
    }

    pub fn wsi_records(&self) -> impl Iterator<Item = &WsiRecord> {
        self.wsi_by_id.values().map(|wsi| &wsi.record)
    }

    pub fn cell(&self, id: i64) -> Option<&CellRecord> {
        self.cell_by_id.get(&id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellRecord> {
        self.cell_by_id.values()
    }

    pub fn selections_by_cell(&self) -> impl Iterator<Item = (i64, &[Selection])> {
        self.selections_by_cell
            .iter()
            .map(|(cell_id, selections)| (*cell_id, selections.as_slice()))
    }

    pub fn selections_for_cell(&self, cell_id: i64) -> &[Selection] {
        self.selections_by_cell
            .get(&cell_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn labels_for_selection(&self, selection_id: i64) -> Option<&[i64]> {
        self.labels_by_selection
            .get(&selection_id)
            .map(Vec::as_slice)
    }

    pub fn label(&self, id: i64) -> Option<&LabelDefinition> {
        self.label_by_id.get(&id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &LabelDefinition> {
        self.label_by_id.values()
    }

    pub fn cell_image_path(&self, cell: &CellRecord) -> Utf8PathBuf {
        self.config.cell_dir.join(&cell.img_name)
    }

    pub fn wsi_image_path(&self, wsi: &WsiRecord) -> Utf8PathBuf {
        self.config.wsi_dir.join(&wsi.img_name)
    }

    pub fn wsi_image_paths(&self) -> BTreeMap<i64, Utf8PathBuf> {
        self.wsi_records()
            .map(|wsi| (wsi.id, self.wsi_image_path(wsi)))
            .collect()
    }
}

fn plain_image_name(kind: &str, id: i64, img_name: &str) -> bool {
    let plain = images::is_plain_file_name(img_name);
    if !plain {
        warn!(id, img_name, "skipping {kind} with unsafe image name");
    }
    plain
}

fn index_by_id<R>(
    records: impl IntoIterator<Item = R>,
    kind: &str,
    id_of: impl Fn(&R) -> i64,
) -> BTreeMap<i64, R> {
    let mut index = BTreeMap::new();
    for record in records {
        match index.entry(id_of(&record)) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(slot) => {
                warn!(id = *slot.key(), "skipping duplicate {kind}");
            }
        }
    }
    index
}
