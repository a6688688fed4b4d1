use serde::Serialize;

use crate::chunk::SubmissionUnit;
use crate::domain::{Band, ObjectId};
use crate::error::CutoutError;

pub const DOCUMENT_HEADER: &str = "#? rerun filter ra dec sw sh # column descriptor";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestLine {
    /// 1-based position among the body lines.
    pub line_index: usize,
    pub object_id: ObjectId,
    pub band: Band,
    pub rerun: String,
    pub filter: String,
    pub ra: f64,
    pub dec: f64,
    pub half_width_arcsec: f64,
}

impl RequestLine {
    fn render(&self) -> String {
        format!(
            " {} {} {} {} {}asec {}asec # {}",
            self.rerun,
            self.filter,
            self.ra,
            self.dec,
            self.half_width_arcsec,
            self.half_width_arcsec,
            self.object_id
        )
    }
}

/// The literal request list submitted for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDocument {
    lines: Vec<RequestLine>,
}

impl RequestDocument {
    pub fn lines(&self) -> &[RequestLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, line_index: usize) -> Option<&RequestLine> {
        line_index
            .checked_sub(1)
            .and_then(|position| self.lines.get(position))
    }

    pub fn render(&self) -> String {
        let body = self
            .lines
            .iter()
            .map(RequestLine::render)
            .collect::<Vec<_>>()
            .join("\n");
        format!("{DOCUMENT_HEADER}\n{body}")
    }

    pub fn parse(text: &str, filter_prefix: &str) -> Result<Self, CutoutError> {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with("#?") {
                continue;
            }
            let line_index = lines.len() + 1;
            lines.push(parse_line(trimmed, filter_prefix, line_index)?);
        }
        Ok(Self { lines })
    }
}

fn parse_line(
    line: &str,
    filter_prefix: &str,
    line_index: usize,
) -> Result<RequestLine, CutoutError> {
    let malformed = |message: &str| {
        CutoutError::MalformedDocument(format!("line {line_index}: {message}: {line}"))
    };

    let (fields, comment) = line
        .split_once('#')
        .ok_or_else(|| malformed("missing object id comment"))?;
    let object_id = comment
        .parse::<ObjectId>()
        .map_err(|_| malformed("invalid object id"))?;

    let fields = fields.split_whitespace().collect::<Vec<_>>();
    let [rerun, filter, ra, dec, width, _height] = fields.as_slice() else {
        return Err(malformed("expected 6 columns"));
    };

    let band = filter
        .strip_prefix(filter_prefix)
        .ok_or_else(|| malformed("filter without expected prefix"))?
        .parse::<Band>()
        .map_err(|_| malformed("invalid band"))?;
    let ra = ra.parse::<f64>().map_err(|_| malformed("invalid ra"))?;
    let dec = dec.parse::<f64>().map_err(|_| malformed("invalid dec"))?;
    let half_width_arcsec = width
        .strip_suffix("asec")
        .and_then(|value| value.parse::<f64>().ok())
        .ok_or_else(|| malformed("invalid cutout width"))?;

    Ok(RequestLine {
        line_index,
        object_id,
        band,
        rerun: rerun.to_string(),
        filter: filter.to_string(),
        ra,
        dec,
        half_width_arcsec,
    })
}

#[derive(Debug, Clone)]
pub struct SubmissionEncoder {
    rerun: String,
    filter_prefix: String,
    half_width_arcsec: f64,
}

impl SubmissionEncoder {
    pub fn new(
        rerun: impl Into<String>,
        filter_prefix: impl Into<String>,
        width_px: u32,
        arcsec_per_pixel: f64,
    ) -> Self {
        Self {
            rerun: rerun.into(),
            filter_prefix: filter_prefix.into(),
            half_width_arcsec: f64::from(width_px) / 2.0 * arcsec_per_pixel,
        }
    }

    pub fn filter_prefix(&self) -> &str {
        &self.filter_prefix
    }

    /// Rows outer, bands inner: the order the service walks the list.
    pub fn encode(&self, unit: &SubmissionUnit) -> RequestDocument {
        let mut lines = Vec::with_capacity(unit.request_count());
        for row in &unit.rows {
            for band in &unit.bands {
                lines.push(RequestLine {
                    line_index: lines.len() + 1,
                    object_id: row.object_id,
                    band: band.clone(),
                    rerun: self.rerun.clone(),
                    filter: format!("{}{}", self.filter_prefix, band),
                    ra: row.ra,
                    dec: row.dec,
                    half_width_arcsec: self.half_width_arcsec,
                });
            }
        }
        RequestDocument { lines }
    }
}
