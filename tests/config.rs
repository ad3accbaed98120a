use std::fs;

use assert_matches::assert_matches;

use wsi_annotations::config::ConfigLoader;
use wsi_annotations::error::AnnotError;

#[test]
fn resolve_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("wsi-annot.json");
    fs::write(
        &path,
        r#"{
            "backend_url": "https://172.26.62.216:8000",
            "dataset_ids": [1, 2, 3],
            "segmentation_set_ids": [3],
            "annotator_ids": [15],
            "data_dir": "/srv/data",
            "wsi_dir": "/srv/slides",
            "skip_image_download": true,
            "accept_invalid_certs": true,
            "cache_dir": "/srv/cache",
            "cache_ttl_days": 30
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.repository.annotator_ids, [15]);
    assert_eq!(resolved.repository.cell_dir.as_str(), "/srv/data/cell_images");
    assert_eq!(resolved.repository.wsi_dir.as_str(), "/srv/slides");
    assert!(resolved.repository.skip_image_download);
    assert!(resolved.accept_invalid_certs);
    assert_eq!(resolved.cache_dir.as_str(), "/srv/cache");
    assert_eq!(resolved.cache_ttl.as_secs(), 30 * 24 * 60 * 60);
}

#[test]
fn malformed_config_is_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, "{\"annotator_ids\": \"fifteen\"}").unwrap();

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(AnnotError::ConfigParse(_))
    );
}

#[test]
fn missing_explicit_config_is_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(AnnotError::ConfigRead(_))
    );
}
