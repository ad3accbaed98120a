use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_TTL, FileCache};
use crate::error::AnnotError;
use crate::repository::RepositoryConfig;

pub const DEFAULT_CONFIG_FILE: &str = "wsi-annot.json";
pub const DATA_DIR_ENV: &str = "IO_DATA_DIR";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub dataset_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub segmentation_set_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub annotator_ids: Vec<i64>,
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub cell_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub wsi_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub skip_image_download: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub cache_ttl_days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub repository: RepositoryConfig,
    pub data_dir: Utf8PathBuf,
    pub accept_invalid_certs: bool,
    pub cache_dir: Utf8PathBuf,
    pub cache_ttl: Duration,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AnnotError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(AnnotError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AnnotError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AnnotError::ConfigParse(err.to_string()))?;

        let env_data_dir = std::env::var(DATA_DIR_ENV).ok().map(Utf8PathBuf::from);
        Self::resolve_config(config, env_data_dir)
    }

    pub fn resolve_config(
        config: Config,
        env_data_dir: Option<Utf8PathBuf>,
    ) -> Result<ResolvedConfig, AnnotError> {
        let backend_url = config
            .backend_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AnnotError::InvalidConfig("backend_url is required".to_string()))?;

        let dataset_ids = non_empty("dataset_ids", config.dataset_ids.unwrap_or_else(default_dataset_ids))?;
        let segmentation_set_ids = non_empty(
            "segmentation_set_ids",
            config
                .segmentation_set_ids
                .unwrap_or_else(default_segmentation_set_ids),
        )?;
        let annotator_ids = non_empty("annotator_ids", config.annotator_ids)?;

        let data_dir = config
            .data_dir
            .or(env_data_dir)
            .ok_or_else(|| {
                AnnotError::InvalidConfig(format!("data_dir is required (or set {DATA_DIR_ENV})"))
            })
            .and_then(absolute)?;
        let cell_dir = absolute(config.cell_dir.unwrap_or_else(|| data_dir.join("cell_images")))?;
        let wsi_dir = absolute(config.wsi_dir.unwrap_or_else(|| data_dir.join("wsi_images")))?;
        let cache_dir = match config.cache_dir {
            Some(dir) => absolute(dir)?,
            None => FileCache::default_root()?,
        };
        let cache_ttl = config
            .cache_ttl_days
            .map(|days| Duration::from_secs(days * 24 * 60 * 60))
            .unwrap_or(DEFAULT_TTL);

        Ok(ResolvedConfig {
            repository: RepositoryConfig {
                backend_url,
                dataset_ids,
                segmentation_set_ids,
                annotator_ids,
                cell_dir,
                wsi_dir,
                skip_image_download: config.skip_image_download,
            },
            data_dir,
            accept_invalid_certs: config.accept_invalid_certs,
            cache_dir,
            cache_ttl,
        })
    }
}

pub fn default_dataset_ids() -> Vec<i64> {
    vec![1, 2, 3]
}

pub fn default_segmentation_set_ids() -> Vec<i64> {
    vec![3]
}

fn non_empty(name: &str, ids: Vec<i64>) -> Result<Vec<i64>, AnnotError> {
    if ids.is_empty() {
        return Err(AnnotError::InvalidConfig(format!("{name} must not be empty")));
    }
    Ok(ids)
}

fn absolute(path: Utf8PathBuf) -> Result<Utf8PathBuf, AnnotError> {
    let absolute = std::path::absolute(path.as_std_path())
        .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|path| AnnotError::Filesystem(format!("non UTF-8 path {}", path.display())))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn minimal() -> Config {
        Config {
            backend_url: Some("https://annotations.local:8000/".to_string()),
            annotator_ids: vec![15],
            data_dir: Some(Utf8PathBuf::from("/data")),
            cache_dir: Some(Utf8PathBuf::from("/tmp/wsi-cache")),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_fill_in() {
        let resolved = ConfigLoader::resolve_config(minimal(), None).unwrap();
        let repo = &resolved.repository;
        assert_eq!(repo.backend_url, "https://annotations.local:8000");
        assert_eq!(repo.dataset_ids, default_dataset_ids());
        assert_eq!(repo.segmentation_set_ids, [3]);
        assert_eq!(repo.cell_dir, Utf8PathBuf::from("/data/cell_images"));
        assert_eq!(repo.wsi_dir, Utf8PathBuf::from("/data/wsi_images"));
        assert_eq!(resolved.cache_ttl, DEFAULT_TTL);
        assert!(!repo.skip_image_download);
    }

    #[test]
    fn data_dir_from_environment() {
        let config = Config {
            data_dir: None,
            ..minimal()
        };
        let resolved =
            ConfigLoader::resolve_config(config, Some(Utf8PathBuf::from("/env-data"))).unwrap();
        assert_eq!(resolved.data_dir, Utf8PathBuf::from("/env-data"));

        let config = Config {
            data_dir: None,
            ..minimal()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config, None),
            Err(AnnotError::InvalidConfig(_))
        );
    }

    #[test]
    fn empty_annotators_rejected() {
        let config = Config {
            annotator_ids: Vec::new(),
            ..minimal()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config, None),
            Err(AnnotError::InvalidConfig(message)) if message.contains("annotator_ids")
        );
    }
}
