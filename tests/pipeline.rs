use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use cutout_batch::chunk::Chunker;
use cutout_batch::client::{CutoutClient, DownloadInfo, Transfer};
use cutout_batch::config::{Config, ConfigLoader, ResolvedConfig};
use cutout_batch::domain::{Band, Catalog, ObjectId};
use cutout_batch::error::CutoutError;
use cutout_batch::output::JsonOutput;
use cutout_batch::pipeline::{PlannedAction, Pipeline, RunOptions, RunReport, UnitRange};
use cutout_batch::retry::CancelToken;
use cutout_batch::state::{FailureCause, StateStore, SubmissionState};
use cutout_batch::store::Store;
use cutout_batch::submission::{RequestDocument, SubmissionEncoder};

const CATALOG: &str = "\
object_id,redshift,ra,dec
100,0.10,150.10,2.20
101,0.20,150.20,2.30
102,0.30,150.30,2.40
";

#[derive(Default)]
struct StubService {
    calls: Mutex<Vec<usize>>,
    broken: HashSet<usize>,
    rejected: HashSet<usize>,
    missing: Vec<(usize, usize)>,
    transient_failures: Mutex<u32>,
    cancel_on_submit: Option<CancelToken>,
}

impl StubService {
    fn calls(&self) -> Vec<usize> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort_unstable();
        calls
    }
}

impl CutoutClient for StubService {
    fn submit(
        &self,
        unit: usize,
        document: &str,
        destination: &Path,
        progress: &mut dyn FnMut(Transfer),
    ) -> Result<DownloadInfo, CutoutError> {
        self.calls.lock().unwrap().push(unit);
        if let Some(cancel) = &self.cancel_on_submit {
            fs::write(destination, b"half an archive").unwrap();
            cancel.cancel();
            return Err(CutoutError::ServiceHttp("connection reset".to_string()));
        }
        {
            let mut remaining = self.transient_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CutoutError::ServiceStatus {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
        }
        if self.rejected.contains(&unit) {
            return Err(CutoutError::ServiceStatus {
                status: 400,
                message: "bad list".to_string(),
            });
        }
        if self.broken.contains(&unit) {
            fs::write(destination, b"<html>internal error</html>").unwrap();
            return Ok(DownloadInfo { bytes: 27 });
        }

        let document = RequestDocument::parse(document, "HSC-").unwrap();
        let skip = self
            .missing
            .iter()
            .filter(|(missing_unit, _)| *missing_unit == unit)
            .map(|(_, line)| *line)
            .collect::<Vec<_>>();
        let bytes = write_archive(destination, unit, &document, &skip);
        progress(Transfer {
            bytes,
            expected: bytes,
        });
        Ok(DownloadInfo { bytes })
    }
}

/// Lays out an archive the way the service does: one oddly named directory,
/// files named by their position in the submitted list.
fn write_archive(destination: &Path, unit: usize, document: &RequestDocument, skip: &[usize]) -> u64 {
    let file = File::create(destination).unwrap();
    let mut builder = tar::Builder::new(file);
    for line in document.lines() {
        if skip.contains(&line.line_index) {
            continue;
        }
        let data = format!("{} {}", line.object_id, line.band);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let name = format!(
            "arch-{unit}-7f3a/{}-cutout-HSC-{}-9813-pdr2_wide.fits",
            line.line_index + 1,
            line.band
        );
        builder
            .append_data(&mut header, name, data.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap();
    fs::metadata(destination).unwrap().len()
}

struct Workspace {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    catalog: Catalog,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self {
            _temp: temp,
            root,
            catalog: Catalog::parse(CATALOG, ',', true).unwrap(),
        }
    }

    fn config(&self) -> ResolvedConfig {
        let mut config = Config::default();
        config.catalog.path = Some(self.root.join("catalog.csv").to_string());
        config.cutout.bands = Some(vec!["G".to_string(), "R".to_string()]);
        config.cutout.width_px = Some(64);
        config.batch.rows_per_unit = Some(2);
        config.batch.download_workers = Some(2);
        config.batch.extract_workers = Some(2);
        config.retry.backoff_secs = Some(0);
        config.paths.work_dir = Some(self.work().to_string());
        config.paths.output_dir = Some(self.images().to_string());
        ConfigLoader::resolve_config(config).unwrap()
    }

    fn work(&self) -> Utf8PathBuf {
        self.root.join("work")
    }

    fn images(&self) -> Utf8PathBuf {
        self.root.join("images")
    }

    fn store(&self) -> Store {
        Store::new_with_paths(self.work(), self.images())
    }

    fn run(&self, service: &Arc<StubService>, options: &RunOptions) -> RunReport {
        self.run_until(service, options, &CancelToken::new())
    }

    fn run_until(
        &self,
        service: &Arc<StubService>,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> RunReport {
        let pipeline = Pipeline::new(self.store(), Arc::clone(service), &self.config()).unwrap();
        pipeline
            .run(&self.catalog, options, &JsonOutput, cancel)
            .unwrap()
    }
}

fn band(value: &str) -> Band {
    value.parse().unwrap()
}

fn read(path: &Utf8Path) -> String {
    fs::read_to_string(path.as_std_path()).unwrap()
}

#[test]
fn broken_archive_fails_only_its_unit() {
    let workspace = Workspace::new();
    let service = Arc::new(StubService {
        broken: HashSet::from([1]),
        ..StubService::default()
    });

    let report = workspace.run(&service, &RunOptions::default());

    assert_eq!(report.downloads, 2);
    assert_eq!(report.reconciled.len(), 4);
    assert_eq!(report.failures.len(), 2);
    for failure in &report.failures {
        assert_eq!(failure.object_id, ObjectId::new(102));
        assert_eq!(failure.cause, FailureCause::ExtractionError);
    }
    assert_eq!(report.units[0].state, SubmissionState::Done);
    assert_eq!(
        report.units[1].state,
        SubmissionState::Failed(FailureCause::ExtractionError)
    );

    let images = workspace.images();
    assert_eq!(read(&images.join("100_Cutout-64x64_G.fits")), "100 G");
    assert_eq!(read(&images.join("101_Cutout-64x64_R.fits")), "101 R");
    assert!(!images.join("102_Cutout-64x64_G.fits").as_std_path().exists());

    let store = workspace.store();
    assert!(!store.archive_path(1).as_std_path().exists());
    assert!(!store.scratch_dir(0).as_std_path().exists());
    assert!(!store.submission_path(0).as_std_path().exists());
    assert!(store.unit_report_path(0).as_std_path().exists());

    let written: serde_json::Value =
        serde_json::from_str(&read(&store.run_report_path())).unwrap();
    assert_eq!(written["failures"].as_array().unwrap().len(), 2);
    let expected = images.join("100_Cutout-64x64_G.fits");
    assert!(
        written["reconciled"]
            .as_array()
            .unwrap()
            .iter()
            .any(|file| file["canonical_path"] == expected.as_str())
    );
}

#[test]
fn rerun_only_touches_unfinished_units() {
    let workspace = Workspace::new();
    let broken = Arc::new(StubService {
        broken: HashSet::from([1]),
        ..StubService::default()
    });
    workspace.run(&broken, &RunOptions::default());

    let healthy = Arc::new(StubService::default());
    let second = workspace.run(&healthy, &RunOptions::default());
    assert_eq!(healthy.calls(), vec![1]);
    assert_eq!(second.downloads, 1);
    assert!(second.failures.is_empty());
    assert_eq!(second.reconciled.len(), 2);

    let idle = Arc::new(StubService::default());
    let third = workspace.run(&idle, &RunOptions::default());
    assert!(idle.calls().is_empty());
    assert_eq!(third.downloads, 0);
    assert!(third.units.iter().all(|unit| unit.action == PlannedAction::Skip));
    assert!(
        workspace
            .images()
            .join("102_Cutout-64x64_R.fits")
            .as_std_path()
            .exists()
    );
}

#[test]
fn missing_line_is_reported_against_its_object() {
    let workspace = Workspace::new();
    let service = Arc::new(StubService {
        missing: vec![(0, 2)],
        ..StubService::default()
    });

    let report = workspace.run(&service, &RunOptions::default());
    assert_eq!(report.reconciled.len(), 5);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].object_id, ObjectId::new(100));
    assert_eq!(report.failures[0].band, band("R"));
    assert_eq!(report.failures[0].cause, FailureCause::MissingOutput);
    assert_eq!(report.units[0].state, SubmissionState::Done);

    let again = workspace.run(&Arc::new(StubService::default()), &RunOptions::default());
    assert_eq!(again.downloads, 0);
    assert_eq!(again.failures, report.failures);
}

#[test]
fn rejected_unit_waits_for_retry_failed() {
    let workspace = Workspace::new();
    let rejecting = Arc::new(StubService {
        rejected: HashSet::from([0]),
        ..StubService::default()
    });
    let report = workspace.run(&rejecting, &RunOptions::default());
    assert_eq!(rejecting.calls(), vec![0, 1]);
    assert_eq!(
        report.units[0].state,
        SubmissionState::Failed(FailureCause::SubmissionRejected)
    );
    assert_eq!(report.units[0].attempts, 1);
    assert_eq!(report.failures.len(), 4);

    let plain = Arc::new(StubService::default());
    let skipped = workspace.run(&plain, &RunOptions::default());
    assert!(plain.calls().is_empty());
    assert_eq!(skipped.failures.len(), 4);

    let retrying = Arc::new(StubService::default());
    let options = RunOptions {
        retry_failed: true,
        ..RunOptions::default()
    };
    let retried = workspace.run(&retrying, &options);
    assert_eq!(retrying.calls(), vec![0]);
    assert!(retried.failures.is_empty());
    assert_eq!(retried.units[0].state, SubmissionState::Done);
    assert_eq!(retried.units[0].attempts, 2);
}

#[test]
fn transient_errors_are_retried() {
    let workspace = Workspace::new();
    let service = Arc::new(StubService {
        transient_failures: Mutex::new(2),
        ..StubService::default()
    });
    let options = RunOptions {
        units: Some(UnitRange { start: 0, end: 1 }),
        ..RunOptions::default()
    };

    let report = workspace.run(&service, &options);
    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].attempts, 3);
    assert_eq!(report.units[0].state, SubmissionState::Done);
    assert_eq!(service.calls(), vec![0, 0, 0]);
}

#[test]
fn dry_run_writes_nothing() {
    let workspace = Workspace::new();
    let service = Arc::new(StubService::default());
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    let report = workspace.run(&service, &options);
    assert!(report.dry_run);
    assert_eq!(report.units.len(), 2);
    assert!(
        report
            .units
            .iter()
            .all(|unit| unit.action == PlannedAction::Download)
    );
    assert!(service.calls().is_empty());
    assert!(!workspace.work().as_std_path().exists());
    assert!(!workspace.images().as_std_path().exists());
}

#[test]
fn unit_range_limits_processing() {
    let workspace = Workspace::new();
    let service = Arc::new(StubService::default());
    let options = RunOptions {
        units: Some("1..".parse().unwrap()),
        ..RunOptions::default()
    };

    let report = workspace.run(&service, &options);
    assert_eq!(service.calls(), vec![1]);
    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].index, 1);

    let pipeline = Pipeline::new(workspace.store(), service, &workspace.config()).unwrap();
    let records = pipeline.status().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].index, 1);
    assert_eq!(records[0].state, SubmissionState::Done);
}

#[test]
fn downloaded_unit_resumes_at_extraction() {
    let workspace = Workspace::new();
    prepare_downloaded_unit(&workspace, true);

    let service = Arc::new(StubService::default());
    let options = RunOptions {
        units: Some(UnitRange { start: 0, end: 1 }),
        ..RunOptions::default()
    };
    let report = workspace.run(&service, &options);

    assert!(service.calls().is_empty());
    assert_eq!(report.units[0].action, PlannedAction::Extract);
    assert_eq!(report.reconciled.len(), 4);
    let states = StateStore::new(&workspace.store());
    assert_matches!(states.load(0, 2).unwrap().state, SubmissionState::Done);
}

fn prepare_downloaded_unit(workspace: &Workspace, retain_document: bool) {
    let store = workspace.store();
    store.ensure_layout().unwrap();

    let units = Chunker::new(2, vec![band("G"), band("R")], 1000)
        .unwrap()
        .chunk(&workspace.catalog);
    let document = SubmissionEncoder::new("pdr2_wide", "HSC-", 64, 0.168).encode(&units[0]);
    if retain_document {
        Store::write_bytes_atomic(&store.submission_path(0), document.render().as_bytes())
            .unwrap();
    }
    write_archive(store.archive_path(0).as_std_path(), 0, &document, &[]);

    let states = StateStore::new(&store);
    let mut record = states.load(0, 2).unwrap();
    states
        .commit_transition(&mut record, SubmissionState::Downloading)
        .unwrap();
    states
        .commit_transition(&mut record, SubmissionState::Downloaded)
        .unwrap();
}

#[test]
fn vanished_request_list_sends_unit_back_to_download() {
    let workspace = Workspace::new();
    prepare_downloaded_unit(&workspace, false);
    let options = RunOptions {
        units: Some(UnitRange { start: 0, end: 1 }),
        ..RunOptions::default()
    };

    let service = Arc::new(StubService::default());
    let report = workspace.run(&service, &options);
    assert!(service.calls().is_empty());
    assert_eq!(
        report.units[0].state,
        SubmissionState::Failed(FailureCause::ExtractionError)
    );
    assert!(report.reconciled.is_empty());
    assert_eq!(report.failures.len(), 4);
    assert!(!workspace.store().archive_path(0).as_std_path().exists());

    let again = workspace.run(&service, &options);
    assert_eq!(service.calls(), vec![0]);
    assert_eq!(again.units[0].state, SubmissionState::Done);
    assert_eq!(again.reconciled.len(), 4);
}

#[test]
fn unreadable_state_record_does_not_stop_the_run() {
    let workspace = Workspace::new();
    let store = workspace.store();
    store.ensure_layout().unwrap();
    fs::write(store.state_dir().join("unit-1.json").as_std_path(), b"{garbage").unwrap();

    let service = Arc::new(StubService::default());
    let report = workspace.run(&service, &RunOptions::default());
    assert_eq!(service.calls(), vec![0, 1]);
    assert!(
        report
            .units
            .iter()
            .all(|unit| unit.state == SubmissionState::Done)
    );
    assert_eq!(report.reconciled.len(), 6);
}

#[test]
fn cancellation_during_backoff_leaves_unit_resumable() {
    let workspace = Workspace::new();
    let cancel = CancelToken::new();
    let service = Arc::new(StubService {
        cancel_on_submit: Some(cancel.clone()),
        ..StubService::default()
    });
    let options = RunOptions {
        units: Some(UnitRange { start: 0, end: 1 }),
        ..RunOptions::default()
    };

    let report = workspace.run_until(&service, &options, &cancel);
    assert_eq!(service.calls(), vec![0]);
    assert_eq!(
        report.units[0].state,
        SubmissionState::Failed(FailureCause::DownloadIncomplete)
    );
    assert_eq!(report.units[0].attempts, 1);
    assert_eq!(report.failures.len(), 4);

    let archive = workspace.store().archive_path(0);
    assert!(!archive.as_std_path().exists());
    assert!(!archive.with_extension("part").as_std_path().exists());

    let states = StateStore::new(&workspace.store());
    assert_eq!(states.load(0, 2).unwrap().attempts, 1);

    let healthy = Arc::new(StubService::default());
    let resumed = workspace.run(&healthy, &options);
    assert_eq!(healthy.calls(), vec![0]);
    assert_eq!(resumed.units[0].state, SubmissionState::Done);
    assert_eq!(resumed.units[0].attempts, 2);
}
