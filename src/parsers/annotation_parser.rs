use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use csv::ReaderBuilder;
use log::{info, warn};
use rustc_hash::FxHashMap;

use crate::utils::error::{PipelineError, Result};
use crate::utils::identifiers::strip_gene_version;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneInfo {
    pub symbol: String,
    pub length: Option<f64>,
    pub external_id: Option<String>,
}

/// Per-gene symbols, transcript lengths and pathway-database identifiers,
/// keyed by version-stripped gene id.
#[derive(Debug, Clone, Default)]
pub struct GeneAnnotation {
    genes: FxHashMap<String, GeneInfo>,
    has_external_ids: bool,
}

impl GeneAnnotation {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, GeneInfo)>) -> Self {
        let mut genes = FxHashMap::default();
        for (gene_id, info) in entries {
            genes
                .entry(strip_gene_version(&gene_id).to_string())
                .or_insert(info);
        }
        let has_external_ids = genes.values().any(|info| info.external_id.is_some());
        Self {
            genes,
            has_external_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn get(&self, gene_id: &str) -> Option<&GeneInfo> {
        self.genes.get(strip_gene_version(gene_id))
    }

    pub fn symbol(&self, gene_id: &str) -> Option<&str> {
        self.get(gene_id).map(|info| info.symbol.as_str())
    }

    pub fn length(&self, gene_id: &str) -> Option<f64> {
        self.get(gene_id).and_then(|info| info.length)
    }

    /// Identifier under which a gene appears in the pathway database.
    ///
    /// With an external-id column present, genes lacking one are unresolved.
    /// Without it, the version-stripped gene id is used directly.
    pub fn pathway_key(&self, gene_id: &str) -> Option<String> {
        if self.has_external_ids {
            self.get(gene_id).and_then(|info| info.external_id.clone())
        } else {
            Some(strip_gene_version(gene_id).to_string())
        }
    }

    /// Adds symbol-only entries for genes not yet annotated; returns how many
    /// were added.
    pub fn fill_missing_symbols<'a>(
        &mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> usize {
        let mut added = 0;
        for (gene_id, symbol) in pairs {
            let key = strip_gene_version(gene_id);
            if symbol.trim().is_empty() || self.genes.contains_key(key) {
                continue;
            }
            self.genes.insert(
                key.to_string(),
                GeneInfo {
                    symbol: symbol.trim().to_string(),
                    length: None,
                    external_id: None,
                },
            );
            added += 1;
        }
        added
    }

    pub fn genes_with_symbol(&self, symbol: &str) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .genes
            .iter()
            .filter(|(_, info)| info.symbol.eq_ignore_ascii_case(symbol))
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn optional_field(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("NA"))
}

/// Reads a `gene_id, symbol, length[, external_id]` table with a header row.
pub fn read_gene_annotation(path: impl AsRef<Path>) -> Result<GeneAnnotation> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    if headers.len() < 3 {
        return Err(PipelineError::MissingColumn {
            column: "length".to_string(),
            file: path.display().to_string(),
        });
    }

    let mut entries = Vec::new();
    let mut bad_lengths = 0usize;
    for record in reader.records() {
        let record = record?;
        let Some(gene_id) = optional_field(record.get(0)) else {
            continue;
        };
        let symbol = optional_field(record.get(1)).unwrap_or(gene_id).to_string();
        let length = match optional_field(record.get(2)) {
            Some(raw) => match raw.parse::<f64>() {
                Ok(len) if len > 0.0 => Some(len),
                _ => {
                    bad_lengths += 1;
                    None
                }
            },
            None => None,
        };
        let external_id = optional_field(record.get(3)).map(str::to_string);

        entries.push((
            gene_id.to_string(),
            GeneInfo {
                symbol,
                length,
                external_id,
            },
        ));
    }

    if bad_lengths > 0 {
        warn!("{} annotation rows carry an unusable gene length", bad_lengths);
    }
    let annotation = GeneAnnotation::from_entries(entries);
    info!("Read annotation for {} genes from {}", annotation.len(), path.display());
    Ok(annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_pathway_keys_through_external_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotation.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "gene_id\tsymbol\tlength\texternal_id").unwrap();
        writeln!(file, "ENSG00000097007.17\tABL1\t5578\t25").unwrap();
        writeln!(file, "ENSG00000197122.12\tSRC\tNA\t").unwrap();
        drop(file);

        let annotation = read_gene_annotation(&path).unwrap();
        assert_eq!(annotation.len(), 2);
        assert_eq!(annotation.symbol("ENSG00000097007"), Some("ABL1"));
        assert_eq!(annotation.length("ENSG00000097007.3"), Some(5578.0));
        assert_eq!(annotation.pathway_key("ENSG00000097007.17").as_deref(), Some("25"));
        assert_eq!(annotation.pathway_key("ENSG00000197122"), None);
        assert_eq!(annotation.length("ENSG00000197122"), None);
    }

    #[test]
    fn falls_back_to_stripped_ids_without_external_column() {
        let annotation = GeneAnnotation::from_entries(vec![(
            "ENSG00000000003.14".to_string(),
            GeneInfo {
                symbol: "TSPAN6".to_string(),
                length: Some(4535.0),
                external_id: None,
            },
        )]);

        assert_eq!(
            annotation.pathway_key("ENSG00000000003.14").as_deref(),
            Some("ENSG00000000003")
        );
        assert_eq!(annotation.pathway_key("ENSG99").as_deref(), Some("ENSG99"));
        assert_eq!(annotation.genes_with_symbol("tspan6"), vec!["ENSG00000000003"]);
    }

    #[test]
    fn fills_symbols_only_for_unknown_genes() {
        let mut annotation = GeneAnnotation::from_entries(vec![(
            "ENSG1".to_string(),
            GeneInfo {
                symbol: "KEEP".to_string(),
                length: Some(10.0),
                external_id: None,
            },
        )]);
        let added = annotation.fill_missing_symbols([
            ("ENSG1.2", "OTHER"),
            ("ENSG2.1", "NEW"),
            ("ENSG3", " "),
        ]);
        assert_eq!(added, 1);
        assert_eq!(annotation.symbol("ENSG1"), Some("KEEP"));
        assert_eq!(annotation.symbol("ENSG2"), Some("NEW"));
        assert_eq!(annotation.length("ENSG2"), None);
    }
}
