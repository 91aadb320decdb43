use log::debug;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::hash::Hash;

use crate::analysis::gene_set_enrichment::RankEnrichmentResult;

#[derive(Debug, Clone, Serialize)]
pub struct CollapsedPathway {
    pub pathway_id: String,
    pub name: String,
    pub overlap: f64,
}

/// A representative pathway and the redundant ones folded into it.
#[derive(Debug, Clone, Serialize)]
pub struct MainPathway {
    pub result: RankEnrichmentResult,
    pub collapsed: Vec<CollapsedPathway>,
}

pub fn jaccard_index<T: Eq + Hash>(a: &FxHashSet<T>, b: &FxHashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn leading_edge_keys(result: &RankEnrichmentResult) -> FxHashSet<&str> {
    result.leading_edge.iter().map(|g| g.key.as_str()).collect()
}

/// Greedy collapse of significant pathways by leading-edge overlap.
///
/// Candidates are visited by decreasing |NES|. A candidate joins the
/// selected main pathway of the same sign it overlaps most, when that
/// overlap exceeds `threshold`; otherwise it becomes a main pathway itself.
pub fn collapse_pathways(
    results: &[RankEnrichmentResult],
    alpha: f64,
    threshold: f64,
) -> Vec<MainPathway> {
    let mut candidates: Vec<(&RankEnrichmentResult, f64)> = results
        .iter()
        .filter(|r| r.tested && r.adjusted_p_value < alpha)
        .filter_map(|r| r.normalized_enrichment_score.map(|nes| (r, nes)))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.abs()
            .total_cmp(&a.1.abs())
            .then_with(|| a.0.pathway_id.cmp(&b.0.pathway_id))
    });

    let mut mains: Vec<(MainPathway, FxHashSet<&str>, f64)> = Vec::new();
    for (candidate, nes) in candidates {
        let edge = leading_edge_keys(candidate);
        let best = mains
            .iter()
            .enumerate()
            .filter(|(_, (_, _, main_nes))| main_nes.signum() == nes.signum())
            .map(|(i, (_, main_edge, _))| (i, jaccard_index(&edge, main_edge)))
            .filter(|&(_, overlap)| overlap > threshold)
            .fold(None, |best: Option<(usize, f64)>, (i, overlap)| match best {
                Some((_, top)) if top >= overlap => best,
                _ => Some((i, overlap)),
            });

        match best {
            Some((i, overlap)) => mains[i].0.collapsed.push(CollapsedPathway {
                pathway_id: candidate.pathway_id.clone(),
                name: candidate.name.clone(),
                overlap,
            }),
            None => mains.push((
                MainPathway {
                    result: candidate.clone(),
                    collapsed: Vec::new(),
                },
                edge,
                nes,
            )),
        }
    }

    let mut output: Vec<MainPathway> = mains.into_iter().map(|(main, _, _)| main).collect();
    output.sort_by(|a, b| {
        let nes = |m: &MainPathway| m.result.normalized_enrichment_score.unwrap_or(0.0);
        nes(b)
            .total_cmp(&nes(a))
            .then_with(|| a.result.pathway_id.cmp(&b.result.pathway_id))
    });
    debug!("Collapsed significant pathways into {} main pathways", output.len());
    output
}
