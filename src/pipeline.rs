use std::str::FromStr;
use std::sync::mpsc;
use std::thread;

use rayon::prelude::*;
use serde::Serialize;

use crate::chunk::{Chunker, SubmissionUnit};
use crate::client::{CutoutClient, Transfer};
use crate::config::ResolvedConfig;
use crate::domain::Catalog;
use crate::download::Downloader;
use crate::error::CutoutError;
use crate::extract::Extractor;
use crate::reconcile::{ReconciledFile, Reconciler};
use crate::retry::CancelToken;
use crate::state::{
    FailureCause, FailureRecord, StateStore, SubmissionState, UnitRecord, iso_timestamp,
};
use crate::store::{OutputLayout, Store};
use crate::submission::{RequestDocument, SubmissionEncoder};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub unit: Option<usize>,
    pub message: String,
    pub transfer: Option<Transfer>,
}

impl ProgressEvent {
    pub fn run(message: impl Into<String>) -> Self {
        Self {
            unit: None,
            message: message.into(),
            transfer: None,
        }
    }

    pub fn unit(unit: usize, message: impl Into<String>) -> Self {
        Self {
            unit: Some(unit),
            message: message.into(),
            transfer: None,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Half-open range of unit indices, written `start..end`, `start..` or `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRange {
    pub start: usize,
    pub end: usize,
}

impl UnitRange {
    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }
}

impl FromStr for UnitRange {
    type Err = CutoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || CutoutError::ConfigInvalid(format!("invalid unit range: {value}"));
        let trimmed = value.trim();
        let parse = |part: &str| part.trim().parse::<usize>().map_err(|_| invalid());
        let range = match trimmed.split_once("..") {
            Some((start, "")) => Self {
                start: parse(start)?,
                end: usize::MAX,
            },
            Some((start, end)) => Self {
                start: parse(start)?,
                end: parse(end)?,
            },
            None => {
                let index = parse(trimmed)?;
                Self {
                    start: index,
                    end: index.checked_add(1).ok_or_else(invalid)?,
                }
            }
        };
        if range.start >= range.end {
            return Err(invalid());
        }
        Ok(range)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub units: Option<UnitRange>,
    pub dry_run: bool,
    pub retry_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Skip,
    Finalize,
    Extract,
    Download,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub index: usize,
    pub rows: usize,
    pub action: PlannedAction,
    pub state: SubmissionState,
    pub attempts: u32,
    pub reconciled: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub dry_run: bool,
    pub downloads: usize,
    pub units: Vec<UnitSummary>,
    pub reconciled: Vec<ReconciledFile>,
    pub failures: Vec<FailureRecord>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct UnitReport<'a> {
    unit: usize,
    reconciled: usize,
    failures: &'a [FailureRecord],
    recorded_at: String,
}

struct Job {
    unit: SubmissionUnit,
    record: UnitRecord,
    action: PlannedAction,
    document: Option<RequestDocument>,
    downloaded: bool,
}

struct UnitOutcome {
    action: PlannedAction,
    record: UnitRecord,
    downloaded: bool,
    reconciled: Vec<ReconciledFile>,
}

impl UnitOutcome {
    fn from_job(job: Job, reconciled: Vec<ReconciledFile>) -> Self {
        Self {
            action: job.action,
            record: job.record,
            downloaded: job.downloaded,
            reconciled,
        }
    }

    fn summary(&self) -> UnitSummary {
        UnitSummary {
            index: self.record.index,
            rows: self.record.rows,
            action: self.action,
            state: self.record.state,
            attempts: self.record.attempts,
            reconciled: self.record.reconciled,
            failures: self.record.failures.len(),
        }
    }
}

pub struct Pipeline<C: CutoutClient> {
    store: Store,
    states: StateStore,
    downloader: Downloader<C>,
    chunker: Chunker,
    encoder: SubmissionEncoder,
    extractor: Extractor,
    reconciler: Reconciler,
    download_workers: usize,
    extract_workers: Option<usize>,
    keep_archives: bool,
}

impl<C: CutoutClient> Pipeline<C> {
    pub fn new(store: Store, client: C, config: &ResolvedConfig) -> Result<Self, CutoutError> {
        let bands = config.cutout.bands.clone();
        let max_list_size = config.service.max_list_size;
        let chunker = match config.batch.rows_per_unit {
            Some(rows) => Chunker::new(rows, bands, max_list_size)?,
            None => Chunker::for_list_size(bands, max_list_size)?,
        };
        let encoder = SubmissionEncoder::new(
            config.service.rerun.clone(),
            config.service.filter_prefix.clone(),
            config.cutout.width_px,
            config.cutout.arcsec_per_pixel,
        );
        let extractor = Extractor::new(&config.service.filter_prefix, config.service.header_lines)?;
        let reconciler = Reconciler::new(OutputLayout::new(
            store.output_root().to_path_buf(),
            config.cutout.filename_template.clone(),
            config.cutout.width_px,
        ));

        Ok(Self {
            states: StateStore::new(&store),
            store,
            downloader: Downloader::new(client, config.retry),
            chunker,
            encoder,
            extractor,
            reconciler,
            download_workers: config.batch.download_workers,
            extract_workers: config.batch.extract_workers,
            keep_archives: config.keep_archives,
        })
    }

    pub fn status(&self) -> Result<Vec<UnitRecord>, CutoutError> {
        self.states.list()
    }

    pub fn run(
        &self,
        catalog: &Catalog,
        options: &RunOptions,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunReport, CutoutError> {
        let started_at = iso_timestamp();
        let units = self.chunker.chunk(catalog);
        sink.event(ProgressEvent::run(format!(
            "phase=Chunk; {} rows into {} units of up to {} rows",
            catalog.len(),
            units.len(),
            self.chunker.rows_per_unit()
        )));

        let mut jobs = Vec::new();
        for unit in units {
            if let Some(range) = options.units {
                if !range.contains(unit.index) {
                    continue;
                }
            }
            let mut record = self.load_record(&unit);
            let action = self.plan(&mut record, options);
            jobs.push(Job {
                unit,
                record,
                action,
                document: None,
                downloaded: false,
            });
        }

        let count = |action: PlannedAction| jobs.iter().filter(|job| job.action == action).count();
        sink.event(ProgressEvent::run(format!(
            "phase=Plan; download={} extract={} finalize={} skip={}",
            count(PlannedAction::Download),
            count(PlannedAction::Extract),
            count(PlannedAction::Finalize),
            count(PlannedAction::Skip)
        )));

        if options.dry_run {
            let outcomes = jobs
                .into_iter()
                .map(|job| UnitOutcome::from_job(job, Vec::new()))
                .collect();
            return Ok(build_report(started_at, true, outcomes));
        }

        self.store.ensure_layout()?;
        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut downloads = Vec::new();
        let mut ready = Vec::new();
        for mut job in jobs {
            match job.action {
                PlannedAction::Skip => outcomes.push(UnitOutcome::from_job(job, Vec::new())),
                PlannedAction::Finalize => {
                    self.finalize(&mut job, sink);
                    outcomes.push(UnitOutcome::from_job(job, Vec::new()));
                }
                PlannedAction::Extract => ready.push(job),
                PlannedAction::Download => downloads.push(job),
            }
        }

        outcomes.extend(self.run_phases(downloads, ready, sink, cancel)?);
        outcomes.sort_by_key(|outcome| outcome.record.index);

        let report = build_report(started_at, false, outcomes);
        Store::write_json(&self.store.run_report_path(), &report)?;
        if cancel.is_cancelled() {
            tracing::warn!("run cancelled; unfinished units resume on the next run");
        }
        tracing::info!(
            downloads = report.downloads,
            reconciled = report.reconciled.len(),
            failures = report.failures.len(),
            "run complete"
        );
        Ok(report)
    }

    /// An unreadable record only costs its own unit a fresh start.
    fn load_record(&self, unit: &SubmissionUnit) -> UnitRecord {
        match self.states.load(unit.index, unit.rows.len()) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(unit = unit.index, error = %err, "discarding unreadable unit state");
                UnitRecord::pending(unit.index, unit.rows.len())
            }
        }
    }

    fn plan(&self, record: &mut UnitRecord, options: &RunOptions) -> PlannedAction {
        // Rewinding an in-progress marker never claims more than is on disk.
        match record.state {
            SubmissionState::Done => PlannedAction::Skip,
            SubmissionState::Reconciled => PlannedAction::Finalize,
            SubmissionState::Downloaded | SubmissionState::Extracting => {
                let archive = self.store.archive_path(record.index);
                if archive.as_std_path().exists() {
                    record.state = SubmissionState::Downloaded;
                    PlannedAction::Extract
                } else {
                    tracing::warn!(unit = record.index, "archive missing; downloading again");
                    record.state = SubmissionState::Pending;
                    PlannedAction::Download
                }
            }
            SubmissionState::Pending | SubmissionState::Downloading => {
                record.state = SubmissionState::Pending;
                PlannedAction::Download
            }
            SubmissionState::Failed(FailureCause::SubmissionRejected) if !options.retry_failed => {
                PlannedAction::Skip
            }
            SubmissionState::Failed(_) => PlannedAction::Download,
        }
    }

    fn run_phases(
        &self,
        downloads: Vec<Job>,
        ready: Vec<Job>,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<UnitOutcome>, CutoutError> {
        let download_pool = build_pool("download", Some(self.download_workers))?;
        let extract_pool = build_pool("extract", self.extract_workers)?;
        let (tx, rx) = mpsc::channel::<Job>();
        for job in ready {
            tx.send(job)
                .map_err(|_| CutoutError::Worker("extract queue closed".to_string()))?;
        }

        thread::scope(|scope| {
            let download_phase = scope.spawn(move || {
                download_pool.install(|| {
                    downloads
                        .into_par_iter()
                        .map_with(tx, |tx, job| self.download_job(job, tx, sink, cancel))
                        .collect::<Vec<_>>()
                })
            });

            let mut outcomes = extract_pool.install(|| {
                rx.into_iter()
                    .par_bridge()
                    .map(|job| self.extract_job(job, sink, cancel))
                    .collect::<Vec<_>>()
            });

            let unfinished = download_phase
                .join()
                .map_err(|_| CutoutError::Worker("download worker panicked".to_string()))?;
            outcomes.extend(unfinished.into_iter().flatten());
            Ok(outcomes)
        })
    }

    /// Returns an outcome only when the unit does not continue to extraction.
    fn download_job(
        &self,
        mut job: Job,
        tx: &mut mpsc::Sender<Job>,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Option<UnitOutcome> {
        if cancel.is_cancelled() {
            return Some(UnitOutcome::from_job(job, Vec::new()));
        }
        match self.download_unit(&mut job, sink, cancel) {
            Ok(()) => match tx.send(job) {
                Ok(()) => None,
                Err(mpsc::SendError(job)) => Some(UnitOutcome::from_job(job, Vec::new())),
            },
            Err(err) => {
                let cause = if err.is_rejection() {
                    FailureCause::SubmissionRejected
                } else {
                    FailureCause::DownloadIncomplete
                };
                tracing::error!(unit = job.unit.index, error = %err, %cause, "download failed");
                Some(self.fail_unit(job, cause))
            }
        }
    }

    fn download_unit(
        &self,
        job: &mut Job,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), CutoutError> {
        let index = job.unit.index;
        let document = self.encoder.encode(&job.unit);
        let text = document.render();
        Store::write_bytes_atomic(&self.store.submission_path(index), text.as_bytes())?;

        if matches!(job.record.state, SubmissionState::Failed(_)) {
            job.record.transition(SubmissionState::Pending)?;
        }
        job.record.failures.clear();
        job.record.reconciled = 0;
        self.states
            .commit_transition(&mut job.record, SubmissionState::Downloading)?;

        let bytes = self.downloader.fetch(
            index,
            &text,
            &self.store.archive_path(index),
            sink,
            cancel,
            &mut job.record.attempts,
        )?;
        sink.event(ProgressEvent::unit(
            index,
            format!("phase=Download; {bytes} bytes received"),
        ));
        job.downloaded = true;
        job.document = Some(document);
        self.states
            .commit_transition(&mut job.record, SubmissionState::Downloaded)
    }

    fn extract_job(&self, mut job: Job, sink: &dyn ProgressSink, cancel: &CancelToken) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::from_job(job, Vec::new());
        }
        match self.extract_unit(&mut job, sink) {
            Ok(reconciled) => {
                self.finalize(&mut job, sink);
                UnitOutcome::from_job(job, reconciled)
            }
            Err(err) => {
                let index = job.unit.index;
                tracing::error!(unit = index, error = %err, "extraction failed; archive discarded");
                for result in [
                    Store::remove_dir_if_exists(&self.store.scratch_dir(index)),
                    Store::remove_file_if_exists(&self.store.archive_path(index)),
                ] {
                    if let Err(err) = result {
                        tracing::warn!(unit = index, error = %err, "cleanup after failed extraction");
                    }
                }
                self.fail_unit(job, FailureCause::ExtractionError)
            }
        }
    }

    fn extract_unit(
        &self,
        job: &mut Job,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ReconciledFile>, CutoutError> {
        let index = job.unit.index;
        let document = match job.document.take() {
            Some(document) => document,
            None => self.retained_document(&job.unit)?,
        };
        self.states
            .commit_transition(&mut job.record, SubmissionState::Extracting)?;

        sink.event(ProgressEvent::unit(index, "phase=Extract; unpacking archive"));
        let scratch = self.store.scratch_dir(index);
        Store::remove_dir_if_exists(&scratch)?;
        let extraction = self
            .extractor
            .extract(&self.store.archive_path(index), &scratch)?;
        if !extraction.ignored.is_empty() {
            tracing::debug!(unit = index, ignored = extraction.ignored.len(), "skipped archive members");
        }

        sink.event(ProgressEvent::unit(
            index,
            format!(
                "phase=Reconcile; {} files for {} request lines",
                extraction.files.len(),
                document.len()
            ),
        ));
        let reconciliation = self.reconciler.reconcile(&document, extraction.files)?;
        if !reconciliation.unmatched.is_empty() {
            tracing::warn!(
                unit = index,
                unmatched = reconciliation.unmatched.len(),
                "output files could not be mapped to request lines"
            );
        }
        if !reconciliation.failures.is_empty() {
            tracing::warn!(
                unit = index,
                missing = reconciliation.failures.len(),
                "request lines produced no output"
            );
        }

        job.record.failures = reconciliation.failures;
        job.record.reconciled = reconciliation.reconciled.len();
        self.states
            .commit_transition(&mut job.record, SubmissionState::Reconciled)?;
        Ok(reconciliation.reconciled)
    }

    /// The list that was actually submitted. Without it the archive cannot be
    /// mapped, and failing here sends the unit back to download.
    fn retained_document(&self, unit: &SubmissionUnit) -> Result<RequestDocument, CutoutError> {
        let path = self.store.submission_path(unit.index);
        let Some(text) = Store::read_to_string(&path)? else {
            return Err(CutoutError::Extraction(format!(
                "retained request list {path} is missing"
            )));
        };
        let document = RequestDocument::parse(&text, self.encoder.filter_prefix())?;
        if document.len() != unit.request_count() {
            return Err(CutoutError::MalformedDocument(format!(
                "{path} holds {} lines, unit needs {}",
                document.len(),
                unit.request_count()
            )));
        }
        Ok(document)
    }

    /// Errors leave the unit at `reconciled` for the next run.
    fn finalize(&self, job: &mut Job, sink: &dyn ProgressSink) {
        let index = job.unit.index;
        match self.release_unit(job) {
            Ok(()) => sink.event(ProgressEvent::unit(
                index,
                format!(
                    "phase=Done; reconciled={} missing={}",
                    job.record.reconciled,
                    job.record.failures.len()
                ),
            )),
            Err(err) => {
                tracing::error!(unit = index, error = %err, "failed to finalize unit");
            }
        }
    }

    /// Records the unit report, releases per-unit scratch state and marks the unit done.
    fn release_unit(&self, job: &mut Job) -> Result<(), CutoutError> {
        let index = job.unit.index;
        let report = UnitReport {
            unit: index,
            reconciled: job.record.reconciled,
            failures: &job.record.failures,
            recorded_at: iso_timestamp(),
        };
        Store::write_json(&self.store.unit_report_path(index), &report)?;
        Store::remove_dir_if_exists(&self.store.scratch_dir(index))?;
        Store::remove_file_if_exists(&self.store.submission_path(index))?;
        if !self.keep_archives {
            Store::remove_file_if_exists(&self.store.archive_path(index))?;
        }
        self.states
            .commit_transition(&mut job.record, SubmissionState::Done)
    }

    fn fail_unit(&self, mut job: Job, cause: FailureCause) -> UnitOutcome {
        job.record.failures = unit_failures(&job.unit, cause);
        job.record.reconciled = 0;
        if let Err(err) = self
            .states
            .commit_transition(&mut job.record, SubmissionState::Failed(cause))
        {
            tracing::error!(unit = job.unit.index, error = %err, "failed to persist unit state");
        }
        UnitOutcome::from_job(job, Vec::new())
    }
}

fn unit_failures(unit: &SubmissionUnit, cause: FailureCause) -> Vec<FailureRecord> {
    unit.rows
        .iter()
        .flat_map(|row| {
            unit.bands.iter().map(move |band| FailureRecord {
                object_id: row.object_id,
                band: band.clone(),
                cause,
            })
        })
        .collect()
}

fn build_pool(name: &'static str, workers: Option<usize>) -> Result<rayon::ThreadPool, CutoutError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.unwrap_or(0))
        .thread_name(move |index| format!("{name}-{index}"))
        .build()
        .map_err(|err| CutoutError::Worker(err.to_string()))
}

fn build_report(started_at: String, dry_run: bool, outcomes: Vec<UnitOutcome>) -> RunReport {
    let units = outcomes.iter().map(UnitOutcome::summary).collect();
    let downloads = outcomes.iter().filter(|outcome| outcome.downloaded).count();
    let failures = outcomes
        .iter()
        .flat_map(|outcome| outcome.record.failures.iter().cloned())
        .collect();
    let reconciled = outcomes
        .into_iter()
        .flat_map(|outcome| outcome.reconciled)
        .collect();
    RunReport {
        started_at,
        finished_at: iso_timestamp(),
        dry_run,
        downloads,
        units,
        reconciled,
        failures,
    }
}
