use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::cache::{CacheKey, CachePort, DEFAULT_TTL, memoize};
use crate::domain::{CellRecord, LabelDefinition, LabelInSelection, Selection, WsiRecord};
use crate::error::AnnotError;

// Implementations issue exactly one request per call.
pub trait BackendTransport: Send + Sync {
    fn get_json(&self, url: &str) -> Result<Value, AnnotError>;
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, AnnotError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(accept_invalid_certs: bool) -> Result<Self, AnnotError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wsi-annot/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AnnotError::BackendHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|err| AnnotError::BackendHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn send(&self, url: &str) -> Result<Response, AnnotError> {
        debug!(url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AnnotError::BackendHttp(err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "backend request failed".to_string());
        Err(AnnotError::BackendStatus { status, message })
    }
}

impl BackendTransport for HttpTransport {
    fn get_json(&self, url: &str) -> Result<Value, AnnotError> {
        self.send(url)?.json().map_err(|err| AnnotError::BackendParse {
            endpoint: url.to_string(),
            message: err.to_string(),
        })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, AnnotError> {
        let bytes = self
            .send(url)?
            .bytes()
            .map_err(|err| AnnotError::BackendHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

pub struct RemoteDataClient<T: BackendTransport, C: CachePort> {
    base_url: String,
    transport: T,
    cache: C,
    ttl: Duration,
}

impl<T: BackendTransport, C: CachePort> RemoteDataClient<T, C> {
    pub fn new(base_url: impl Into<String>, transport: T, cache: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            cache,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn fetch_wsi(&self, dataset_id: i64) -> Result<Vec<WsiRecord>, AnnotError> {
        let key = CacheKey::new(
            "fetch_wsi",
            json!({"backend": self.base_url, "dataset_id": dataset_id}),
        );
        memoize(&self.cache, key, self.ttl, || {
            let records: Vec<WsiRecord> = self.get_records("/api/wsi/")?;
            Ok(records
                .into_iter()
                .filter(|wsi| wsi.dataset_id == dataset_id)
                .collect())
        })
    }

    pub fn fetch_cells(
        &self,
        wsi_id: i64,
        segmentation_set_id: i64,
    ) -> Result<Vec<CellRecord>, AnnotError> {
        let key = CacheKey::new(
            "fetch_cells",
            json!({
                "backend": self.base_url,
                "wsi_id": wsi_id,
                "segmentation_set_id": segmentation_set_id,
            }),
        );
        memoize(&self.cache, key, self.ttl, || {
            self.get_records(&format!("/api/wsi_cells/{wsi_id}/{segmentation_set_id}"))
        })
    }

    pub fn fetch_selections(
        &self,
        annotator_id: i64,
        valid_cell_ids: &BTreeSet<i64>,
    ) -> Result<Vec<Selection>, AnnotError> {
        let key = CacheKey::new(
            "fetch_selections",
            json!({
                "backend": self.base_url,
                "annotator_id": annotator_id,
                "valid_cell_ids": valid_cell_ids,
            }),
        );
        memoize(&self.cache, key, self.ttl, || {
            let records: Vec<Selection> = self.get_records("/api/cell_label_selections/")?;
            Ok(records
                .into_iter()
                .filter(|selection| {
                    selection.annotator_id == annotator_id
                        && valid_cell_ids.contains(&selection.cell_id)
                })
                .collect())
        })
    }

    pub fn fetch_labels_in_selections(
        &self,
        valid_selection_ids: &BTreeSet<i64>,
    ) -> Result<Vec<LabelInSelection>, AnnotError> {
        let key = CacheKey::new(
            "fetch_labels_in_selections",
            json!({"backend": self.base_url, "valid_selection_ids": valid_selection_ids}),
        );
        memoize(&self.cache, key, self.ttl, || {
            let records: Vec<LabelInSelection> = self.get_records("/api/labels_in_selections/")?;
            Ok(records
                .into_iter()
                .filter(|link| valid_selection_ids.contains(&link.selection_id))
                .collect())
        })
    }

    pub fn fetch_label_definitions(&self) -> Result<Vec<LabelDefinition>, AnnotError> {
        let key = CacheKey::new("fetch_label_definitions", json!({"backend": self.base_url}));
        memoize(&self.cache, key, self.ttl, || self.get_records("/api/labels/"))
    }

    fn get_records<R: DeserializeOwned>(&self, path: &str) -> Result<Vec<R>, AnnotError> {
        let url = format!("{}{path}", self.base_url);
        let value = self.transport.get_json(&url)?;
        serde_json::from_value(value).map_err(|err| AnnotError::BackendParse {
            endpoint: url,
            message: err.to_string(),
        })
    }
}
