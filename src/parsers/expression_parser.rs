use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use log::{info, warn};
use ndarray::{Array2, ArrayView1, Axis};
use rustc_hash::FxHashSet;

use crate::parsers::annotation_parser::GeneAnnotation;
use crate::utils::error::{PipelineError, Result};
use crate::utils::identifiers::strip_gene_version;

const SYMBOL_HEADERS: [&str; 4] = ["description", "symbol", "gene_symbol", "gene_name"];

/// Genes by samples expression values with the identifiers of both axes.
#[derive(Debug, Clone)]
pub struct ExpressionMatrix {
    pub gene_ids: Vec<String>,
    pub gene_symbols: Option<Vec<String>>,
    pub sample_ids: Vec<String>,
    pub values: Array2<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExpressionReadReport {
    pub genes_read: usize,
    pub duplicate_genes: usize,
}

impl ExpressionMatrix {
    pub fn new(
        gene_ids: Vec<String>,
        gene_symbols: Option<Vec<String>>,
        sample_ids: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self> {
        if values.nrows() != gene_ids.len() || values.ncols() != sample_ids.len() {
            return Err(PipelineError::parse(
                "expression matrix",
                format!(
                    "{} x {} values for {} genes and {} samples",
                    values.nrows(),
                    values.ncols(),
                    gene_ids.len(),
                    sample_ids.len()
                ),
            ));
        }
        if let Some(symbols) = &gene_symbols {
            if symbols.len() != gene_ids.len() {
                return Err(PipelineError::parse(
                    "expression matrix",
                    format!("{} symbols for {} genes", symbols.len(), gene_ids.len()),
                ));
            }
        }
        Ok(Self {
            gene_ids,
            gene_symbols,
            sample_ids,
            values,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn gene_row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Same genes with a replacement value matrix, used by normalization.
    pub fn with_values(&self, values: Array2<f64>) -> Result<Self> {
        Self::new(
            self.gene_ids.clone(),
            self.gene_symbols.clone(),
            self.sample_ids.clone(),
            values,
        )
    }

    /// Columns at `indices`, relabelled with `new_ids`.
    pub fn select_columns(&self, indices: &[usize], new_ids: Vec<String>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.n_samples()) {
            return Err(PipelineError::parse(
                "expression matrix",
                format!("column {} out of range for {} samples", bad, self.n_samples()),
            ));
        }
        let values = self.values.select(Axis(1), indices);
        Self::new(self.gene_ids.clone(), self.gene_symbols.clone(), new_ids, values)
    }

    /// Row of a gene given by stable id (version-insensitive) or symbol.
    pub fn find_gene(&self, query: &str, annotation: &GeneAnnotation) -> Option<usize> {
        let stripped = strip_gene_version(query);
        if let Some(i) = self
            .gene_ids
            .iter()
            .position(|id| strip_gene_version(id).eq_ignore_ascii_case(stripped))
        {
            return Some(i);
        }
        if let Some(symbols) = &self.gene_symbols {
            if let Some(i) = symbols.iter().position(|s| s.eq_ignore_ascii_case(query)) {
                return Some(i);
            }
        }
        let annotated: FxHashSet<String> = annotation
            .genes_with_symbol(query)
            .into_iter()
            .map(str::to_string)
            .collect();
        if annotated.is_empty() {
            return None;
        }
        self.gene_ids
            .iter()
            .position(|id| annotated.contains(strip_gene_version(id)))
    }
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

fn is_gct_preamble(record: &StringRecord) -> bool {
    record.get(0).map_or(false, |f| f.trim_start().starts_with("#1."))
}

/// Reads a delimited expression table (plain TSV/CSV or GCT 1.2).
///
/// The first column holds gene ids. A second column headed `Description`,
/// `symbol`, `gene_symbol` or `gene_name` is kept as gene symbols. Sample
/// headers are returned as written; the cohort builder normalizes them.
/// Duplicate gene ids keep their first row.
pub fn read_expression_matrix(
    path: impl AsRef<Path>,
) -> Result<(ExpressionMatrix, ExpressionReadReport)> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(false)
        .flexible(true)
        .from_reader(BufReader::with_capacity(128 * 1024, file));

    let mut records = reader.records();

    let mut header = None;
    let mut skipped_preamble = 0;
    for record in records.by_ref() {
        let record = record?;
        if skipped_preamble < 2 && (is_gct_preamble(&record) || skipped_preamble == 1) {
            skipped_preamble += 1;
            continue;
        }
        header = Some(record);
        break;
    }
    let header = header.ok_or_else(|| {
        PipelineError::parse(path.display().to_string(), "empty expression file")
    })?;

    let has_symbols = header
        .get(1)
        .map_or(false, |h| SYMBOL_HEADERS.contains(&h.trim().to_ascii_lowercase().as_str()));
    let first_sample = if has_symbols { 2 } else { 1 };
    let sample_ids: Vec<String> = header
        .iter()
        .skip(first_sample)
        .map(|h| h.trim().to_string())
        .collect();
    if sample_ids.is_empty() {
        return Err(PipelineError::parse(
            path.display().to_string(),
            "no sample columns in header",
        ));
    }

    let mut report = ExpressionReadReport::default();
    let mut seen_genes: FxHashSet<String> = FxHashSet::default();
    let mut gene_ids = Vec::new();
    let mut symbols = Vec::new();
    let mut flat_values = Vec::new();

    for (line, record) in records.enumerate() {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if record.len() != sample_ids.len() + first_sample {
            return Err(PipelineError::parse(
                path.display().to_string(),
                format!(
                    "data row {} has {} fields, expected {}",
                    line + 1,
                    record.len(),
                    sample_ids.len() + first_sample
                ),
            ));
        }
        report.genes_read += 1;

        let gene_id = record[0].trim().to_string();
        if !seen_genes.insert(gene_id.clone()) {
            report.duplicate_genes += 1;
            continue;
        }

        for field in record.iter().skip(first_sample) {
            let value = field.trim().parse::<f64>().map_err(|_| {
                PipelineError::parse(
                    path.display().to_string(),
                    format!("non-numeric value '{}' for gene {}", field, gene_id),
                )
            })?;
            flat_values.push(value);
        }
        if has_symbols {
            symbols.push(record[1].trim().to_string());
        }
        gene_ids.push(gene_id);
    }

    if report.duplicate_genes > 0 {
        warn!(
            "{} duplicate gene rows in {} kept their first occurrence",
            report.duplicate_genes,
            path.display()
        );
    }

    let values = Array2::from_shape_vec((gene_ids.len(), sample_ids.len()), flat_values)
        .map_err(|e| PipelineError::parse(path.display().to_string(), e.to_string()))?;

    info!(
        "Read expression for {} genes across {} samples from {}",
        gene_ids.len(),
        sample_ids.len(),
        path.display()
    );

    let matrix = ExpressionMatrix::new(
        gene_ids,
        has_symbols.then_some(symbols),
        sample_ids,
        values,
    )?;
    Ok((matrix, report))
}
