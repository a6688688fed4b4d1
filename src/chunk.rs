use std::collections::HashSet;

use serde::Serialize;

use crate::domain::{Band, Catalog, CatalogRow};
use crate::error::CutoutError;

/// One request list worth of catalog rows. `rows` and `bands` order is the
/// only link between the service's positional output names and identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionUnit {
    pub index: usize,
    pub rows: Vec<CatalogRow>,
    pub bands: Vec<Band>,
}

impl SubmissionUnit {
    pub fn request_count(&self) -> usize {
        self.rows.len() * self.bands.len()
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    rows_per_unit: usize,
    bands: Vec<Band>,
}

impl Chunker {
    pub fn new(
        rows_per_unit: usize,
        bands: Vec<Band>,
        max_list_size: usize,
    ) -> Result<Self, CutoutError> {
        if rows_per_unit == 0 {
            return Err(CutoutError::ConfigInvalid(
                "rows_per_unit must be at least 1".to_string(),
            ));
        }
        validate_bands(&bands)?;
        let requests = rows_per_unit.saturating_mul(bands.len());
        if requests > max_list_size {
            return Err(CutoutError::ConfigInvalid(format!(
                "{rows_per_unit} rows x {} bands = {requests} requests exceeds the service limit of {max_list_size}",
                bands.len()
            )));
        }
        Ok(Self {
            rows_per_unit,
            bands,
        })
    }

    /// Largest unit the service accepts for this band set.
    pub fn for_list_size(bands: Vec<Band>, max_list_size: usize) -> Result<Self, CutoutError> {
        validate_bands(&bands)?;
        let rows_per_unit = max_list_size / bands.len();
        Self::new(rows_per_unit, bands, max_list_size)
    }

    pub fn rows_per_unit(&self) -> usize {
        self.rows_per_unit
    }

    pub fn chunk(&self, catalog: &Catalog) -> Vec<SubmissionUnit> {
        catalog
            .rows()
            .chunks(self.rows_per_unit)
            .enumerate()
            .map(|(index, rows)| SubmissionUnit {
                index,
                rows: rows.to_vec(),
                bands: self.bands.clone(),
            })
            .collect()
    }
}

fn validate_bands(bands: &[Band]) -> Result<(), CutoutError> {
    if bands.is_empty() {
        return Err(CutoutError::ConfigInvalid(
            "at least one band is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for band in bands {
        if !seen.insert(band) {
            return Err(CutoutError::ConfigInvalid(format!("band {band} listed twice")));
        }
    }
    Ok(())
}
