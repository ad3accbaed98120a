use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AnnotError {
    #[error("invalid WSI name: {img_name}, dataset: {dataset_id}")]
    #[diagnostic(help("the filename matches none of the naming conventions known for this dataset"))]
    InvalidWsiName { dataset_id: i64, img_name: String },

    #[error("missing config file wsi-annot.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend request failed: {0}")]
    BackendHttp(String),

    #[error("backend returned status {status}: {message}")]
    BackendStatus { status: u16, message: String },

    #[error("failed to parse response from {endpoint}: {message}")]
    BackendParse { endpoint: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("image name {0:?} is not a plain file name")]
    UnsafeImageName(String),

    #[error("image error at {path}: {message}")]
    Image { path: String, message: String },

    #[error("invalid bounding box for cell {cell_id}: {message}")]
    InvalidBoundingBox { cell_id: i64, message: String },

    #[error("no local image for WSI {wsi_id} (parent of cell {cell_id})")]
    MissingParentImage { cell_id: i64, wsi_id: i64 },

    #[error("unknown label id: {0}")]
    UnknownLabel(i64),

    #[error("export failed: {0}")]
    Export(String),
}
