use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use compact_str::CompactString;
use log::{info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::utils::error::Result;
use crate::utils::identifiers::strip_gene_version;

pub type GeneKey = CompactString;

#[derive(Debug, Clone, PartialEq)]
pub struct Pathway {
    pub id: String,
    pub name: String,
    pub genes: FxHashSet<GeneKey>,
}

impl Pathway {
    pub fn new<I, S>(id: &str, name: &str, genes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            genes: genes
                .into_iter()
                .map(|g| GeneKey::new(strip_gene_version(g.as_ref())))
                .collect(),
        }
    }
}

/// Read-only gene set lookup used by both enrichment engines.
pub trait PathwayDatabase: Sync {
    fn pathway(&self, id: &str) -> Option<&Pathway>;
    fn pathways_for_gene(&self, gene: &str) -> Vec<&Pathway>;
    /// All pathways of the configured organism, ordered by id.
    fn organism_pathways(&self) -> Vec<&Pathway>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPathwayDb {
    pathways: Vec<Pathway>,
    by_id: FxHashMap<String, usize>,
    by_gene: FxHashMap<GeneKey, Vec<usize>>,
}

#[derive(Debug, Clone, Default)]
pub struct PathwayReadReport {
    pub lines_read: usize,
    pub other_organism: usize,
    pub malformed: usize,
}

impl InMemoryPathwayDb {
    /// Builds the index; pathways sharing an id are merged.
    pub fn from_pathways(pathways: Vec<Pathway>) -> Self {
        let mut merged: Vec<Pathway> = Vec::with_capacity(pathways.len());
        let mut by_id: FxHashMap<String, usize> = FxHashMap::default();
        for pathway in pathways {
            match by_id.get(&pathway.id) {
                Some(&i) => merged[i].genes.extend(pathway.genes),
                None => {
                    by_id.insert(pathway.id.clone(), merged.len());
                    merged.push(pathway);
                }
            }
        }
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        let by_id: FxHashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        let mut by_gene: FxHashMap<GeneKey, Vec<usize>> = FxHashMap::default();
        for (i, pathway) in merged.iter().enumerate() {
            for gene in &pathway.genes {
                by_gene.entry(gene.clone()).or_default().push(i);
            }
        }

        Self {
            pathways: merged,
            by_id,
            by_gene,
        }
    }

    pub fn len(&self) -> usize {
        self.pathways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pathways.is_empty()
    }

    /// Reads a Reactome `*2Reactome` mapping
    /// (`gene, pathway id, url, pathway name, evidence, species`) and keeps
    /// the rows of `organism`.
    pub fn read_reactome_mapping(
        path: impl AsRef<Path>,
        organism: &str,
    ) -> Result<(Self, PathwayReadReport)> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(128 * 1024, file);

        let mut report = PathwayReadReport::default();
        let mut names: FxHashMap<String, String> = FxHashMap::default();
        let mut members: FxHashMap<String, FxHashSet<GeneKey>> = FxHashMap::default();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            report.lines_read += 1;

            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 6 || parts[0].trim().is_empty() || parts[1].trim().is_empty() {
                report.malformed += 1;
                continue;
            }
            if !parts[5].trim().eq_ignore_ascii_case(organism) {
                report.other_organism += 1;
                continue;
            }

            let pathway_id = parts[1].trim();
            names
                .entry(pathway_id.to_string())
                .or_insert_with(|| parts[3].trim().to_string());
            members
                .entry(pathway_id.to_string())
                .or_default()
                .insert(GeneKey::new(strip_gene_version(parts[0])));
        }

        if report.malformed > 0 {
            warn!("{} malformed pathway lines skipped in {}", report.malformed, path.display());
        }

        let pathways = members
            .into_iter()
            .map(|(id, genes)| {
                let name = names.remove(&id).unwrap_or_else(|| id.clone());
                Pathway { id, name, genes }
            })
            .collect();
        let db = Self::from_pathways(pathways);

        info!(
            "Loaded {} {} pathways from {}",
            db.len(),
            organism,
            path.display()
        );
        Ok((db, report))
    }
}

impl PathwayDatabase for InMemoryPathwayDb {
    fn pathway(&self, id: &str) -> Option<&Pathway> {
        self.by_id.get(id).map(|&i| &self.pathways[i])
    }

    fn pathways_for_gene(&self, gene: &str) -> Vec<&Pathway> {
        self.by_gene
            .get(strip_gene_version(gene))
            .map(|indices| indices.iter().map(|&i| &self.pathways[i]).collect())
            .unwrap_or_default()
    }

    fn organism_pathways(&self) -> Vec<&Pathway> {
        self.pathways.iter().collect()
    }
}
