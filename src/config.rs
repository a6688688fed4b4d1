use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::Band;
use crate::error::CutoutError;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::DEFAULT_FILENAME_TEMPLATE;

pub const DEFAULT_CONFIG_FILE: &str = "cutout-batch.json";
pub const DEFAULT_SERVICE_URL: &str = "https://hsc-release.mtk.nao.ac.jp/das_cutout/pdr2/cgi-bin/cutout";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub cutout: CutoutSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub keep_archives: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogSection {
    pub path: Option<String>,
    pub delimiter: Option<char>,
    pub has_header: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ServiceSection {
    pub url: Option<String>,
    pub rerun: Option<String>,
    pub filter_prefix: Option<String>,
    pub max_list_size: Option<usize>,
    pub header_lines: Option<usize>,
    pub expected_archive_bytes: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CutoutSection {
    pub width_px: Option<u32>,
    pub arcsec_per_pixel: Option<f64>,
    pub bands: Option<Vec<String>>,
    pub filename_template: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BatchSection {
    pub rows_per_unit: Option<usize>,
    pub download_workers: Option<usize>,
    pub extract_workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetrySection {
    pub strategy: Option<BackoffStrategy>,
    pub backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub stuck_after: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PathsSection {
    pub work_dir: Option<String>,
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub path: Utf8PathBuf,
    pub delimiter: char,
    pub has_header: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub url: String,
    pub rerun: String,
    pub filter_prefix: String,
    pub max_list_size: usize,
    pub header_lines: usize,
    pub expected_archive_bytes: u64,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CutoutSettings {
    pub width_px: u32,
    pub arcsec_per_pixel: f64,
    pub bands: Vec<Band>,
    pub filename_template: String,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub rows_per_unit: Option<usize>,
    pub download_workers: usize,
    /// `None` uses every available core.
    pub extract_workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub catalog: CatalogSettings,
    pub service: ServiceSettings,
    pub cutout: CutoutSettings,
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    pub work_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub keep_archives: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the raw config. Without an explicit path a missing default file
    /// means "all defaults".
    pub fn load(path: Option<&str>) -> Result<Config, CutoutError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CutoutError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| CutoutError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CutoutError> {
        Self::resolve_config(Self::load(path)?)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CutoutError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(CutoutError::ConfigInvalid(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let catalog = CatalogSettings {
            path: config
                .catalog
                .path
                .map(Utf8PathBuf::from)
                .ok_or(CutoutError::MissingCatalog)?,
            delimiter: config.catalog.delimiter.unwrap_or(','),
            has_header: config.catalog.has_header.unwrap_or(true),
        };

        let service = ServiceSettings {
            url: config
                .service
                .url
                .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
            rerun: config
                .service
                .rerun
                .unwrap_or_else(|| "pdr2_wide".to_string()),
            filter_prefix: config
                .service
                .filter_prefix
                .unwrap_or_else(|| "HSC-".to_string()),
            max_list_size: config.service.max_list_size.unwrap_or(1000),
            header_lines: config.service.header_lines.unwrap_or(1),
            expected_archive_bytes: config
                .service
                .expected_archive_bytes
                .unwrap_or(1_121_597_440),
            timeout: config.service.timeout_secs.map(Duration::from_secs),
        };
        if service.max_list_size == 0 {
            return Err(CutoutError::ConfigInvalid(
                "service.max_list_size must be positive".to_string(),
            ));
        }

        let bands = config
            .cutout
            .bands
            .unwrap_or_else(default_bands)
            .iter()
            .map(|band| band.parse::<Band>())
            .collect::<Result<Vec<_>, CutoutError>>()?;
        let cutout = CutoutSettings {
            width_px: config.cutout.width_px.unwrap_or(525),
            arcsec_per_pixel: config.cutout.arcsec_per_pixel.unwrap_or(0.168),
            bands,
            filename_template: config
                .cutout
                .filename_template
                .unwrap_or_else(|| DEFAULT_FILENAME_TEMPLATE.to_string()),
        };
        if cutout.width_px == 0 || !(cutout.arcsec_per_pixel > 0.0) {
            return Err(CutoutError::ConfigInvalid(
                "cutout width and pixel scale must be positive".to_string(),
            ));
        }
        if !cutout.filename_template.contains("{object_id}")
            || !cutout.filename_template.contains("{band}")
        {
            return Err(CutoutError::ConfigInvalid(
                "cutout.filename_template must contain {object_id} and {band}".to_string(),
            ));
        }

        let batch = BatchSettings {
            rows_per_unit: config.batch.rows_per_unit,
            download_workers: config.batch.download_workers.unwrap_or(2),
            extract_workers: config.batch.extract_workers,
        };
        if batch.download_workers == 0 || batch.extract_workers == Some(0) {
            return Err(CutoutError::ConfigInvalid(
                "worker counts must be at least 1".to_string(),
            ));
        }

        let backoff_secs = config.retry.backoff_secs.unwrap_or(30);
        let backoff = match config.retry.strategy.unwrap_or(BackoffStrategy::Fixed) {
            BackoffStrategy::Fixed => Backoff::Fixed(Duration::from_secs(backoff_secs)),
            BackoffStrategy::Exponential => Backoff::Exponential {
                initial: Duration::from_secs(backoff_secs),
                max: Duration::from_secs(config.retry.max_backoff_secs.unwrap_or(600)),
            },
        };
        let retry = RetryPolicy {
            backoff,
            max_attempts: config.retry.max_attempts,
            stuck_after: Some(config.retry.stuck_after.unwrap_or(10)),
        };

        Ok(ResolvedConfig {
            schema_version,
            catalog,
            service,
            cutout,
            batch,
            retry,
            work_dir: Utf8PathBuf::from(
                config
                    .paths
                    .work_dir
                    .unwrap_or_else(|| ".cutout-batch".to_string()),
            ),
            output_dir: Utf8PathBuf::from(
                config
                    .paths
                    .output_dir
                    .unwrap_or_else(|| "images".to_string()),
            ),
            keep_archives: config.keep_archives.unwrap_or(false),
        })
    }
}

pub fn default_bands() -> Vec<String> {
    ["G", "R", "I", "Z", "Y"]
        .iter()
        .map(|band| band.to_string())
        .collect()
}
