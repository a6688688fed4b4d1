use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{Band, ObjectId};
use crate::error::CutoutError;

pub const DEFAULT_FILENAME_TEMPLATE: &str = "{object_id}_Cutout-{width}x{width}_{band}.fits";

/// Work area for one catalog run: retained request lists, archives, scratch
/// space and resume state.
#[derive(Debug, Clone)]
pub struct Store {
    work_root: Utf8PathBuf,
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new_with_paths(work_root: Utf8PathBuf, output_root: Utf8PathBuf) -> Self {
        Self {
            work_root,
            output_root,
        }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn submission_path(&self, unit: usize) -> Utf8PathBuf {
        self.work_root
            .join("submissions")
            .join(format!("submit-{unit}.txt"))
    }

    pub fn archive_path(&self, unit: usize) -> Utf8PathBuf {
        self.work_root
            .join("archives")
            .join(format!("submit-{unit}.tar"))
    }

    pub fn scratch_dir(&self, unit: usize) -> Utf8PathBuf {
        self.work_root.join("scratch").join(format!("unit-{unit}"))
    }

    pub fn state_dir(&self) -> Utf8PathBuf {
        self.work_root.join("state")
    }

    pub fn unit_report_path(&self, unit: usize) -> Utf8PathBuf {
        self.work_root
            .join("reports")
            .join(format!("unit-{unit}.json"))
    }

    pub fn run_report_path(&self) -> Utf8PathBuf {
        self.work_root.join("report.json")
    }

    pub fn ensure_layout(&self) -> Result<(), CutoutError> {
        for dir in [
            self.work_root.join("submissions"),
            self.work_root.join("archives"),
            self.work_root.join("scratch"),
            self.work_root.join("reports"),
            self.state_dir(),
            self.output_root.clone(),
        ] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| CutoutError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), CutoutError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CutoutError> {
        let parent = path
            .parent()
            .ok_or_else(|| CutoutError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".cutout-batch")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        io::Write::write_all(&mut temp, content)
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_to_string(path: &Utf8Path) -> Result<Option<String>, CutoutError> {
        match fs::read_to_string(path.as_std_path()) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CutoutError::Filesystem(format!("read {path}: {err}"))),
        }
    }

    /// Rename, falling back to copy + remove across filesystems. Replaces `dest`.
    pub fn move_file(source: &Utf8Path, dest: &Utf8Path) -> Result<(), CutoutError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        if fs::rename(source.as_std_path(), dest.as_std_path()).is_ok() {
            return Ok(());
        }
        Self::copy_file_atomic(source, dest)?;
        fs::remove_file(source.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), CutoutError> {
        let parent = dest
            .parent()
            .ok_or_else(|| CutoutError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".cutout-batch-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| CutoutError::Filesystem(format!("copy {source}: {err}")))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn remove_file_if_exists(path: &Utf8Path) -> Result<(), CutoutError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CutoutError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), CutoutError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CutoutError::Filesystem(format!("remove {path}: {err}"))),
        }
    }
}

/// Canonical per-object, per-band naming consumed by downstream tools.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: Utf8PathBuf,
    template: String,
    width_px: u32,
}

impl OutputLayout {
    pub fn new(root: Utf8PathBuf, template: impl Into<String>, width_px: u32) -> Self {
        Self {
            root,
            template: template.into(),
            width_px,
        }
    }

    pub fn file_name(&self, object_id: ObjectId, band: &Band) -> String {
        self.template
            .replace("{object_id}", &object_id.to_string())
            .replace("{width}", &self.width_px.to_string())
            .replace("{band}", band.as_str())
    }

    pub fn path_for(&self, object_id: ObjectId, band: &Band) -> Utf8PathBuf {
        self.root.join(self.file_name(object_id, band))
    }
}
