use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Band, ObjectId};
use crate::error::CutoutError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    MissingOutput,
    ExtractionError,
    SubmissionRejected,
    /// Retries exhausted, cancelled, or the archive could not be written.
    DownloadIncomplete,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureCause::MissingOutput => "missing_output",
            FailureCause::ExtractionError => "extraction_error",
            FailureCause::SubmissionRejected => "submission_rejected",
            FailureCause::DownloadIncomplete => "download_incomplete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub object_id: ObjectId,
    pub band: Band,
    pub cause: FailureCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cause", rename_all = "snake_case")]
pub enum SubmissionState {
    Pending,
    Downloading,
    Downloaded,
    Extracting,
    Reconciled,
    Done,
    Failed(FailureCause),
}

impl SubmissionState {
    pub fn can_transition(self, to: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, to),
            (Pending, Downloading)
                | (Downloading, Downloaded)
                | (Downloaded, Extracting)
                | (Extracting, Reconciled)
                | (Extracting, Downloaded)
                | (Reconciled, Done)
                | (Failed(_), Pending)
                | (_, Failed(_))
        )
    }

    pub fn label(self) -> String {
        match self {
            SubmissionState::Pending => "pending".to_string(),
            SubmissionState::Downloading => "downloading".to_string(),
            SubmissionState::Downloaded => "downloaded".to_string(),
            SubmissionState::Extracting => "extracting".to_string(),
            SubmissionState::Reconciled => "reconciled".to_string(),
            SubmissionState::Done => "done".to_string(),
            SubmissionState::Failed(cause) => format!("failed({cause})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub index: usize,
    pub rows: usize,
    pub state: SubmissionState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub reconciled: usize,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    pub updated_at: String,
}

impl UnitRecord {
    pub fn pending(index: usize, rows: usize) -> Self {
        Self {
            index,
            rows,
            state: SubmissionState::Pending,
            attempts: 0,
            reconciled: 0,
            failures: Vec::new(),
            updated_at: iso_timestamp(),
        }
    }

    pub fn transition(&mut self, to: SubmissionState) -> Result<(), CutoutError> {
        if !self.state.can_transition(to) {
            return Err(CutoutError::InvalidTransition {
                unit: self.index,
                from: self.state.label(),
                to: to.label(),
            });
        }
        self.state = to;
        self.updated_at = iso_timestamp();
        Ok(())
    }
}

/// One JSON record per unit. Each unit is owned by a single worker at a time,
/// so writes to distinct files need no locking.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: Utf8PathBuf,
}

impl StateStore {
    pub fn new(store: &Store) -> Self {
        Self {
            root: store.state_dir(),
        }
    }

    fn record_path(&self, index: usize) -> Utf8PathBuf {
        self.root.join(format!("unit-{index}.json"))
    }

    pub fn load(&self, index: usize, rows: usize) -> Result<UnitRecord, CutoutError> {
        let path = self.record_path(index);
        let Some(content) = Store::read_to_string(&path)? else {
            return Ok(UnitRecord::pending(index, rows));
        };
        let record: UnitRecord =
            serde_json::from_str(&content).map_err(|err| CutoutError::StateParse {
                path: path.clone().into_std_path_buf(),
                message: err.to_string(),
            })?;
        if record.rows != rows {
            tracing::warn!(
                unit = index,
                recorded = record.rows,
                current = rows,
                "catalog changed since unit was recorded; starting unit over"
            );
            return Ok(UnitRecord::pending(index, rows));
        }
        Ok(record)
    }

    pub fn commit(&self, record: &UnitRecord) -> Result<(), CutoutError> {
        Store::write_json(&self.record_path(record.index), record)
    }

    pub fn commit_transition(
        &self,
        record: &mut UnitRecord,
        to: SubmissionState,
    ) -> Result<(), CutoutError> {
        record.transition(to)?;
        self.commit(record)
    }

    pub fn list(&self) -> Result<Vec<UnitRecord>, CutoutError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries = self
            .root
            .read_dir_utf8()
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CutoutError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let is_record = path.extension() == Some("json")
                && path
                    .file_name()
                    .map(|name| name.starts_with("unit-"))
                    .unwrap_or(false);
            if !is_record {
                continue;
            }
            let Some(content) = Store::read_to_string(path)? else {
                continue;
            };
            let record: UnitRecord =
                serde_json::from_str(&content).map_err(|err| CutoutError::StateParse {
                    path: path.as_std_path().to_path_buf(),
                    message: err.to_string(),
                })?;
            records.push(record);
        }
        records.sort_by_key(|record| record.index);
        Ok(records)
    }
}

pub fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
