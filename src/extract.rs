use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::domain::Band;
use crate::error::CutoutError;
use crate::fs_util;

/// One unpacked service output, still under its anonymous name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile {
    pub line_index: usize,
    pub band: Option<Band>,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub files: Vec<RetrievedFile>,
    pub ignored: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    pattern: Regex,
    header_lines: usize,
}

impl Extractor {
    pub fn new(filter_prefix: &str, header_lines: usize) -> Result<Self, CutoutError> {
        let pattern = format!(
            r"^(?P<position>\d+)-(?:.*?{}(?P<band>[A-Za-z0-9]+))?",
            regex::escape(filter_prefix)
        );
        let pattern = Regex::new(&pattern)
            .map_err(|err| CutoutError::ConfigInvalid(format!("filter prefix: {err}")))?;
        Ok(Self {
            pattern,
            header_lines,
        })
    }

    /// Maps a service file name to its body line index and band.
    pub fn parse_name(&self, name: &str) -> Option<(usize, Option<Band>)> {
        let captures = self.pattern.captures(name)?;
        let position = captures.name("position")?.as_str().parse::<usize>().ok()?;
        let line_index = position
            .checked_sub(self.header_lines)
            .filter(|index| *index > 0)?;
        let band = captures
            .name("band")
            .and_then(|band| band.as_str().parse::<Band>().ok());
        Some((line_index, band))
    }

    pub fn extract(
        &self,
        archive: &Utf8Path,
        scratch: &Utf8Path,
    ) -> Result<Extraction, CutoutError> {
        fs::create_dir_all(scratch.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        fs_util::unpack_archive(archive.as_std_path(), scratch.as_std_path())?;

        let output_dir = discover_output_dir(scratch)?;
        let mut extraction = Extraction::default();
        for path in sorted_files(&output_dir)? {
            let parsed = path.file_name().and_then(|name| self.parse_name(name));
            match parsed {
                Some((line_index, band)) => extraction.files.push(RetrievedFile {
                    line_index,
                    band,
                    path,
                }),
                None => {
                    tracing::debug!(path = %path, "ignoring unrecognised archive member");
                    extraction.ignored.push(path);
                }
            }
        }

        if extraction.files.is_empty() {
            return Err(CutoutError::Extraction(format!(
                "archive {archive} contains no cutout files"
            )));
        }
        Ok(extraction)
    }
}

/// The service nests output under one arbitrarily named directory.
pub fn discover_output_dir(scratch: &Utf8Path) -> Result<Utf8PathBuf, CutoutError> {
    let mut dirs = Vec::new();
    let mut has_files = false;
    for entry in read_dir(scratch)? {
        if entry.is_dir() {
            dirs.push(entry);
        } else {
            has_files = true;
        }
    }

    match (dirs.len(), has_files) {
        (0, _) => Ok(scratch.to_path_buf()),
        (1, false) => Ok(dirs.remove(0)),
        (1, true) => Err(CutoutError::Extraction(
            "archive mixes loose files with an output directory".to_string(),
        )),
        (count, _) => Err(CutoutError::Extraction(format!(
            "expected one output directory, found {count}"
        ))),
    }
}

fn sorted_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CutoutError> {
    let mut files = read_dir(dir)?
        .into_iter()
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn read_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CutoutError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| CutoutError::Filesystem(format!("read {dir}: {err}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        paths.push(entry.into_path());
    }
    Ok(paths)
}
