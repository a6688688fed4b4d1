use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CutoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(i64);

impl ObjectId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = CutoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| CutoutError::InvalidObjectId(value.to_string()))
    }
}

/// Short filter token as it appears in canonical file names (`G`, `R`, `NB0921`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Band(String);

impl Band {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Band {
    type Err = CutoutError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid =
            !normalized.is_empty() && normalized.chars().all(|ch| ch.is_ascii_alphanumeric());
        if !is_valid {
            return Err(CutoutError::InvalidBand(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for Band {
    type Error = CutoutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Band> for String {
    fn from(value: Band) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub object_id: ObjectId,
    pub ra: f64,
    pub dec: f64,
    pub redshift: f64,
}

/// Read-only catalog store. Row order is the load order and never changes.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    rows: Vec<CatalogRow>,
    by_id: HashMap<ObjectId, usize>,
}

impl Catalog {
    pub fn from_rows(rows: Vec<CatalogRow>) -> Result<Self, CutoutError> {
        let mut by_id = HashMap::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            if by_id.insert(row.object_id, position).is_some() {
                return Err(CutoutError::DuplicateObject(row.object_id.get()));
            }
        }
        Ok(Self { rows, by_id })
    }

    pub fn load(path: &Path, delimiter: char, has_header: bool) -> Result<Self, CutoutError> {
        let content =
            fs::read_to_string(path).map_err(|_| CutoutError::CatalogRead(path.to_path_buf()))?;
        Self::parse(&content, delimiter, has_header)
    }

    pub fn parse(content: &str, delimiter: char, has_header: bool) -> Result<Self, CutoutError> {
        let mut rows = Vec::new();
        let mut header_pending = has_header;
        for (number, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // The header may itself be `#`-prefixed, so it is consumed before comments.
            if header_pending {
                header_pending = false;
                continue;
            }
            if trimmed.starts_with('#') {
                continue;
            }
            rows.push(parse_row(trimmed, delimiter, number + 1)?);
        }
        Self::from_rows(rows)
    }

    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&CatalogRow> {
        self.by_id.get(&id).map(|position| &self.rows[*position])
    }
}

fn parse_row(line: &str, delimiter: char, number: usize) -> Result<CatalogRow, CutoutError> {
    let fields = line.split(delimiter).map(str::trim).collect::<Vec<_>>();
    if fields.len() < 4 {
        return Err(CutoutError::CatalogParse {
            line: number,
            message: format!("expected at least 4 columns, found {}", fields.len()),
        });
    }

    let object_id = fields[0]
        .parse::<ObjectId>()
        .map_err(|err| CutoutError::CatalogParse {
            line: number,
            message: err.to_string(),
        })?;
    let redshift = parse_float(fields[1], "redshift", number)?;
    let ra = parse_float(fields[2], "ra", number)?;
    let dec = parse_float(fields[3], "dec", number)?;

    if !(0.0..360.0).contains(&ra) {
        return Err(CutoutError::CatalogParse {
            line: number,
            message: format!("ra {ra} outside [0, 360)"),
        });
    }
    if !(-90.0..=90.0).contains(&dec) {
        return Err(CutoutError::CatalogParse {
            line: number,
            message: format!("dec {dec} outside [-90, 90]"),
        });
    }

    Ok(CatalogRow {
        object_id,
        ra,
        dec,
        redshift,
    })
}

fn parse_float(value: &str, column: &str, number: usize) -> Result<f64, CutoutError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| CutoutError::CatalogParse {
            line: number,
            message: format!("invalid {column} value: {value}"),
        })
}
