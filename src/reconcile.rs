use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::{Band, ObjectId};
use crate::error::CutoutError;
use crate::extract::RetrievedFile;
use crate::state::{FailureCause, FailureRecord};
use crate::store::{OutputLayout, Store};
use crate::submission::RequestDocument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledFile {
    pub object_id: ObjectId,
    pub band: Band,
    pub canonical_path: Utf8PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub reconciled: Vec<ReconciledFile>,
    pub failures: Vec<FailureRecord>,
    pub unmatched: Vec<Utf8PathBuf>,
}

/// Maps positional service output back to catalog identity. Holds no
/// per-unit state; everything it needs arrives with each call.
#[derive(Debug, Clone)]
pub struct Reconciler {
    layout: OutputLayout,
}

impl Reconciler {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn reconcile(
        &self,
        document: &RequestDocument,
        mut files: Vec<RetrievedFile>,
    ) -> Result<Reconciliation, CutoutError> {
        files.sort_by(|a, b| a.line_index.cmp(&b.line_index).then(a.path.cmp(&b.path)));

        let mut claimed = vec![false; document.len()];
        let mut result = Reconciliation::default();

        for file in files {
            let Some(line) = document.line(file.line_index) else {
                tracing::warn!(
                    path = %file.path,
                    line_index = file.line_index,
                    "output file refers to a line outside the request list"
                );
                result.unmatched.push(file.path);
                continue;
            };
            if let Some(band) = &file.band {
                if band != &line.band {
                    tracing::warn!(
                        path = %file.path,
                        line_index = file.line_index,
                        expected = %line.band,
                        found = %band,
                        "output file band disagrees with its request line"
                    );
                    result.unmatched.push(file.path);
                    continue;
                }
            }
            let slot = &mut claimed[file.line_index - 1];
            if *slot {
                tracing::warn!(path = %file.path, line_index = file.line_index, "duplicate output for line");
                result.unmatched.push(file.path);
                continue;
            }

            let target = self.layout.path_for(line.object_id, &line.band);
            Store::move_file(&file.path, &target)?;
            *slot = true;
            result.reconciled.push(ReconciledFile {
                object_id: line.object_id,
                band: line.band.clone(),
                canonical_path: target,
            });
        }

        for (line, found) in document.lines().iter().zip(claimed) {
            if !found {
                result.failures.push(FailureRecord {
                    object_id: line.object_id,
                    band: line.band.clone(),
                    cause: FailureCause::MissingOutput,
                });
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::SubmissionUnit;
    use crate::domain::CatalogRow;
    use crate::store::DEFAULT_FILENAME_TEMPLATE;
    use crate::submission::SubmissionEncoder;

    struct Fixture {
        _temp: tempfile::TempDir,
        scratch: Utf8PathBuf,
        output: Utf8PathBuf,
        document: RequestDocument,
    }

    fn fixture(rows: i64) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let scratch = root.join("scratch");
        std::fs::create_dir_all(scratch.as_std_path()).unwrap();
        let unit = SubmissionUnit {
            index: 0,
            rows: (0..rows)
                .map(|id| CatalogRow {
                    object_id: ObjectId::new(100 + id),
                    ra: 30.0,
                    dec: -4.0,
                    redshift: 0.1,
                })
                .collect(),
            bands: vec!["G".parse().unwrap(), "I".parse().unwrap()],
        };
        let document = SubmissionEncoder::new("pdr2_wide", "HSC-", 525, 0.168).encode(&unit);
        Fixture {
            _temp: temp,
            scratch,
            output: root.join("images"),
            document,
        }
    }

    fn retrieved(fixture: &Fixture, line_index: usize) -> RetrievedFile {
        let band = fixture.document.line(line_index).unwrap().band.clone();
        let path = fixture
            .scratch
            .join(format!("{}-cutout-HSC-{band}-9813.fits", line_index + 1));
        std::fs::write(path.as_std_path(), format!("line {line_index}")).unwrap();
        RetrievedFile {
            line_index,
            band: Some(band),
            path,
        }
    }

    fn reconciler(fixture: &Fixture) -> Reconciler {
        Reconciler::new(OutputLayout::new(
            fixture.output.clone(),
            DEFAULT_FILENAME_TEMPLATE,
            525,
        ))
    }

    #[test]
    fn complete_archive_reconciles_every_line() {
        let fixture = fixture(3);
        let files = (1..=6).map(|index| retrieved(&fixture, index)).collect();
        let result = reconciler(&fixture)
            .reconcile(&fixture.document, files)
            .unwrap();

        assert!(result.failures.is_empty());
        assert_eq!(result.reconciled.len(), 6);
        let path = fixture.output.join("101_Cutout-525x525_I.fits");
        assert_eq!(std::fs::read_to_string(path.as_std_path()).unwrap(), "line 4");
    }

    #[test]
    fn missing_line_becomes_failure() {
        let fixture = fixture(5);
        let files = (1..=10)
            .filter(|index| *index != 5)
            .map(|index| retrieved(&fixture, index))
            .collect();
        let result = reconciler(&fixture)
            .reconcile(&fixture.document, files)
            .unwrap();

        assert_eq!(result.reconciled.len(), 9);
        assert_eq!(
            result.failures,
            vec![FailureRecord {
                object_id: ObjectId::new(102),
                band: "G".parse().unwrap(),
                cause: FailureCause::MissingOutput,
            }]
        );
    }

    #[test]
    fn band_mismatch_is_unmatched() {
        let fixture = fixture(1);
        let mut file = retrieved(&fixture, 1);
        file.band = Some("Y".parse().unwrap());
        let result = reconciler(&fixture)
            .reconcile(&fixture.document, vec![file, retrieved(&fixture, 2)])
            .unwrap();

        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.reconciled.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].band.as_str(), "G");
    }

    #[test]
    fn out_of_range_index_is_unmatched() {
        let fixture = fixture(1);
        let mut stray = retrieved(&fixture, 2);
        stray.line_index = 9;
        stray.band = None;
        let result = reconciler(&fixture)
            .reconcile(&fixture.document, vec![retrieved(&fixture, 1), stray])
            .unwrap();

        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.failures.len(), 1);
    }
}
