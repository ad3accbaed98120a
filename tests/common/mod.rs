#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use wsi_annotations::backend::BackendTransport;
use wsi_annotations::error::AnnotError;
use wsi_annotations::repository::{ProgressEvent, ProgressSink, RepositoryConfig};

pub const BACKEND: &str = "http://annotations.test";
pub const AML_PIXEL_SIZE: f64 = 0.47960756426982587;

#[derive(Default)]
pub struct MockBackend {
    json: BTreeMap<String, Value>,
    bytes: BTreeMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn with_json(mut self, path: &str, body: Value) -> Self {
        self.json.insert(format!("{BACKEND}{path}"), body);
        self
    }

    pub fn with_bytes(mut self, url: &str, body: &[u8]) -> Self {
        self.bytes.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl BackendTransport for MockBackend {
    fn get_json(&self, url: &str) -> Result<Value, AnnotError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.json
            .get(url)
            .cloned()
            .ok_or_else(|| AnnotError::BackendStatus {
                status: 404,
                message: url.to_string(),
            })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, AnnotError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.bytes
            .get(url)
            .cloned()
            .ok_or_else(|| AnnotError::BackendHttp(format!("connection refused: {url}")))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Two WSIs (healthy and AML), three cells, annotator 15 of interest.
pub fn project_backend() -> MockBackend {
    MockBackend::default()
        .with_json(
            "/api/wsi/",
            json!([
                {"id": 1, "imgName": "x.png", "datasetId": 3, "pixelDiameterInMicrometer": 0.1, "ressourceUrl": null},
                {"id": 2, "imgName": "pat1-slide2-m4", "datasetId": 2, "pixelDiameterInMicrometer": 0.47960756426982587, "ressourceUrl": null},
                {"id": 3, "imgName": "unparseable.png", "datasetId": 1, "ressourceUrl": null},
            ]),
        )
        .with_json(
            "/api/wsi_cells/1/3",
            json!([
                {"id": 10, "wsi": 1, "imgName": "10.png", "ressourceUrl": null, "bbox": [0, 0, 4, 4]},
                {"id": 11, "wsi": 1, "imgName": "11.png", "ressourceUrl": null, "bbox": null},
            ]),
        )
        .with_json(
            "/api/wsi_cells/2/3",
            json!([{"id": 20, "wsi": 2, "imgName": "20.png", "ressourceUrl": null}]),
        )
        .with_json(
            "/api/cell_label_selections/",
            json!([
                {"id": 100, "cell": 10, "annotator": 15, "labelGroup": 1},
                {"id": 101, "cell": 10, "annotator": 15, "labelGroup": 1},
                {"id": 102, "cell": 11, "annotator": 12, "labelGroup": 1},
                {"id": 103, "cell": 20, "annotator": "15", "labelGroup": 1},
                {"id": 104, "cell": 999, "annotator": 15, "labelGroup": 1},
            ]),
        )
        .with_json(
            "/api/labels_in_selections/",
            json!([
                {"id": 1, "annotatorCellLabelSelection": 100, "label": 1},
                {"id": 2, "annotatorCellLabelSelection": 103, "label": 2},
                {"id": 3, "annotatorCellLabelSelection": 103, "label": 3},
                {"id": 4, "annotatorCellLabelSelection": 102, "label": 1},
            ]),
        )
        .with_json(
            "/api/labels/",
            json!([
                {"id": 1, "labelGroup": 1, "name": "Promyelocyte"},
                {"id": 2, "labelGroup": 1, "name": "Myeloblast"},
                {"id": 3, "labelGroup": 1, "name": "Lymphocyte"},
                {"id": 4, "labelGroup": 2, "name": "Auer rods"},
            ]),
        )
}

pub fn session(root: &Utf8PathBuf, dataset_ids: Vec<i64>) -> RepositoryConfig {
    RepositoryConfig {
        backend_url: BACKEND.to_string(),
        dataset_ids,
        segmentation_set_ids: vec![3],
        annotator_ids: vec![15],
        cell_dir: root.join("cells"),
        wsi_dir: root.join("wsi"),
        skip_image_download: true,
    }
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}
