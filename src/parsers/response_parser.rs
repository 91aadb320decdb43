use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use log::{info, warn};
use serde::Serialize;

use crate::utils::config::{ResponseColumns, ResponseMetric};
use crate::utils::error::{PipelineError, Result};
use crate::utils::identifiers::{normalize_tissue, tissue_from_cell_line};

/// One drug-response measurement for one cell line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub sample_id: String,
    pub cell_line: String,
    pub tissue: Option<String>,
    pub potency: f64,
    pub auc: f64,
    pub marker_expression: Option<f64>,
}

impl ResponseRecord {
    pub fn new(cell_line: &str, tissue: Option<String>, potency: f64, auc: f64) -> Self {
        Self {
            sample_id: cell_line.trim().to_string(),
            cell_line: cell_line.trim().to_string(),
            tissue: tissue.or_else(|| tissue_from_cell_line(cell_line)),
            potency,
            auc,
            marker_expression: None,
        }
    }

    pub fn metric(&self, metric: ResponseMetric) -> f64 {
        match metric {
            ResponseMetric::Potency => self.potency,
            ResponseMetric::Auc => self.auc,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseReadReport {
    pub rows_read: usize,
    pub other_compound: usize,
    pub missing_metric: usize,
}

fn column_index(headers: &StringRecord, name: &str, file: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| PipelineError::MissingColumn {
            column: name.to_string(),
            file: file.display().to_string(),
        })
}

fn parse_metric(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("NA"))
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Reads the pharmacology table and keeps rows for `drug`.
///
/// Rows for other compounds or with a missing/unparsable metric are dropped
/// and counted in the returned report.
pub fn read_response_table(
    path: impl AsRef<Path>,
    columns: &ResponseColumns,
    drug: &str,
) -> Result<(Vec<ResponseRecord>, ResponseReadReport)> {
    let path = path.as_ref();
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("txt") => b'\t',
        _ => b',',
    };
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let cell_line_col = column_index(&headers, &columns.cell_line, path)?;
    let compound_col = column_index(&headers, &columns.compound, path)?;
    let potency_col = column_index(&headers, &columns.potency, path)?;
    let auc_col = column_index(&headers, &columns.auc, path)?;
    let tissue_col = columns
        .tissue
        .as_deref()
        .map(|name| column_index(&headers, name, path))
        .transpose()?;

    let mut report = ResponseReadReport::default();
    let mut records = Vec::new();

    for record in reader.records() {
        let record = record?;
        report.rows_read += 1;

        let compound = record.get(compound_col).unwrap_or("").trim();
        if !compound.eq_ignore_ascii_case(drug.trim()) {
            report.other_compound += 1;
            continue;
        }
        let cell_line = record.get(cell_line_col).unwrap_or("").trim();
        let (Some(potency), Some(auc)) = (
            parse_metric(record.get(potency_col)),
            parse_metric(record.get(auc_col)),
        ) else {
            report.missing_metric += 1;
            continue;
        };
        if cell_line.is_empty() {
            report.missing_metric += 1;
            continue;
        }

        let tissue = tissue_col
            .and_then(|col| record.get(col))
            .map(normalize_tissue)
            .filter(|t| !t.is_empty());

        records.push(ResponseRecord::new(cell_line, tissue, potency, auc));
    }

    if report.missing_metric > 0 {
        warn!(
            "{} {} rows dropped for missing response values",
            report.missing_metric, drug
        );
    }
    info!(
        "Read {} {} response records from {} ({} rows for other compounds)",
        records.len(),
        drug,
        path.display(),
        report.other_compound
    );

    Ok((records, report))
}
