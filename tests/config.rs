use std::time::Duration;

use assert_matches::assert_matches;

use cutout_batch::config::{BackoffStrategy, Config, ConfigLoader, DEFAULT_SERVICE_URL};
use cutout_batch::error::CutoutError;
use cutout_batch::retry::Backoff;

#[test]
fn parse_full_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("cutout-batch.json");
    std::fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "catalog": { "path": "sample.tsv", "delimiter": "\t", "has_header": false },
            "service": { "rerun": "pdr2_dud", "max_list_size": 500, "timeout_secs": 600 },
            "cutout": { "width_px": 256, "bands": ["G", "I"] },
            "batch": { "download_workers": 4, "extract_workers": 3 },
            "retry": { "strategy": "exponential", "backoff_secs": 5, "max_backoff_secs": 60, "max_attempts": 8 },
            "paths": { "work_dir": "/scratch/work", "output_dir": "/scratch/images" },
            "keep_archives": true
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.catalog.path, "sample.tsv");
    assert_eq!(resolved.catalog.delimiter, '\t');
    assert!(!resolved.catalog.has_header);
    assert_eq!(resolved.service.url, DEFAULT_SERVICE_URL);
    assert_eq!(resolved.service.rerun, "pdr2_dud");
    assert_eq!(resolved.service.max_list_size, 500);
    assert_eq!(resolved.service.timeout, Some(Duration::from_secs(600)));
    assert_eq!(resolved.cutout.width_px, 256);
    assert_eq!(resolved.cutout.bands.len(), 2);
    assert_eq!(resolved.batch.download_workers, 4);
    assert_eq!(resolved.batch.extract_workers, Some(3));
    assert_eq!(
        resolved.retry.backoff,
        Backoff::Exponential {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    );
    assert_eq!(resolved.retry.max_attempts, Some(8));
    assert_eq!(resolved.work_dir, "/scratch/work");
    assert!(resolved.keep_archives);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let err = ConfigLoader::load(Some("/nonexistent/cutout-batch.json")).unwrap_err();
    assert_matches!(err, CutoutError::ConfigRead(_));
}

#[test]
fn invalid_json_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    std::fs::write(&path, "{ \"catalog\": ").unwrap();
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, CutoutError::ConfigParse(_));
}

#[test]
fn reject_invalid_settings() {
    let base = || {
        let mut config = Config::default();
        config.catalog.path = Some("catalog.csv".to_string());
        config
    };

    let mut config = base();
    config.batch.download_workers = Some(0);
    assert_matches!(
        ConfigLoader::resolve_config(config).unwrap_err(),
        CutoutError::ConfigInvalid(_)
    );

    let mut config = base();
    config.cutout.bands = Some(vec!["G".to_string(), "HSC-R".to_string()]);
    assert_matches!(
        ConfigLoader::resolve_config(config).unwrap_err(),
        CutoutError::InvalidBand(_)
    );

    let mut config = base();
    config.cutout.filename_template = Some("{object_id}.fits".to_string());
    assert_matches!(
        ConfigLoader::resolve_config(config).unwrap_err(),
        CutoutError::ConfigInvalid(_)
    );

    let mut config = base();
    config.schema_version = Some(2);
    assert_matches!(
        ConfigLoader::resolve_config(config).unwrap_err(),
        CutoutError::ConfigInvalid(_)
    );
}

#[test]
fn fixed_backoff_is_default_strategy() {
    let mut config = Config::default();
    config.catalog.path = Some("catalog.csv".to_string());
    config.retry.strategy = Some(BackoffStrategy::Fixed);
    config.retry.backoff_secs = Some(12);
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.retry.backoff, Backoff::Fixed(Duration::from_secs(12)));
    assert_eq!(resolved.retry.stuck_after, Some(10));
}
