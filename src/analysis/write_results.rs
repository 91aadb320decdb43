use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, create_dir_all, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::analysis::differential_expression::GeneStatisticTable;
use crate::analysis::enrichment_analysis::{join_symbols, OverrepresentationResult};
use crate::analysis::gene_set_enrichment::RankEnrichmentResult;
use crate::analysis::rank_aggregation::{CombinedGeneTable, MetricStatistic};
use crate::analysis::redundancy::MainPathway;
use crate::parsers::annotation_parser::GeneAnnotation;
use crate::parsers::pathway_parser::PathwayDatabase;
use crate::utils::error::Result;
use crate::utils::identifiers::strip_gene_version;

const BUFFER_SIZE: usize = 8192 * 32;

pub const COMBINED_TABLE_FILE: &str = "combined_gene_table.tsv";
pub const ORA_FILE: &str = "ora_results.tsv";
pub const GSEA_FILE: &str = "gsea_results.tsv";
pub const GSEA_MAIN_FILE: &str = "gsea_main_pathways.tsv";
pub const PATHWAY_GENES_FILE: &str = "pathway_genes.json";
pub const CONCORDANCE_FILE: &str = "concordance.json";
pub const COHORT_REPORT_FILE: &str = "cohort_report.json";
pub const RUN_CONFIG_FILE: &str = "run_config.json";

const ARTIFACTS: [&str; 8] = [
    COMBINED_TABLE_FILE,
    ORA_FILE,
    GSEA_FILE,
    GSEA_MAIN_FILE,
    PATHWAY_GENES_FILE,
    CONCORDANCE_FILE,
    COHORT_REPORT_FILE,
    RUN_CONFIG_FILE,
];

fn is_artifact(name: &str) -> bool {
    ARTIFACTS.contains(&name) || (name.starts_with("de_") && name.ends_with(".tsv"))
}

/// Removes artifacts of a previous run; other files are left alone.
pub fn clean_directory(dir_path: &Path) -> io::Result<()> {
    if dir_path.exists() {
        for entry in fs::read_dir(dir_path)? {
            let path = entry?.path();
            let stale = path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_artifact);
            if stale {
                fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}

pub fn prepare_output_dir(dir_path: &Path) -> Result<()> {
    clean_directory(dir_path)?;
    create_dir_all(dir_path)?;
    Ok(())
}

fn writer(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::with_capacity(BUFFER_SIZE, File::create(path)?))
}

fn na(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.6e}", v),
        _ => "NA".to_string(),
    }
}

fn symbol_for<'a>(annotation: &'a GeneAnnotation, gene_id: &'a str) -> &'a str {
    annotation
        .symbol(gene_id)
        .unwrap_or_else(|| strip_gene_version(gene_id))
}

pub fn write_gene_statistics(
    table: &GeneStatisticTable,
    annotation: &GeneAnnotation,
    path: &Path,
) -> Result<()> {
    let mut writer = writer(path)?;
    writer.write_all(
        b"gene_id\tsymbol\teffect_size\taverage_expression\t\
t_statistic\tp_value\tadjusted_p_value\n",
    )?;

    for row in table.ranked() {
        writeln!(
            writer,
            "{}\t{}\t{:.5}\t{:.5}\t{}\t{}\t{}",
            row.gene_id,
            symbol_for(annotation, &row.gene_id),
            row.effect_size,
            row.average_expression,
            na(Some(row.t_statistic)),
            na(Some(row.p_value)),
            na(Some(row.adjusted_p_value)),
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn metric_columns(stat: Option<&MetricStatistic>) -> String {
    match stat {
        Some(s) => format!(
            "{:.5}\t{}\t{}\t{}\t{}",
            s.effect_size,
            na(Some(s.t_statistic)),
            na(Some(s.p_value)),
            na(Some(s.adjusted_p_value)),
            s.rank
        ),
        None => ["NA"; 5].join("\t"),
    }
}

pub fn write_combined_table(
    combined: &CombinedGeneTable,
    annotation: &GeneAnnotation,
    min_abs_effect: f64,
    max_adjusted_p: Option<f64>,
    path: &Path,
) -> Result<()> {
    let mut writer = writer(path)?;
    writer.write_all(
        b"gene_id\tsymbol\taverage_expression\t\
potency_effect\tpotency_t\tpotency_p_value\tpotency_adjusted_p_value\tpotency_rank\t\
auc_effect\tauc_t\tauc_p_value\tauc_adjusted_p_value\tauc_rank\t\
direction_sign\taverage_rank\tcombined_rank\tsignificant\n",
    )?;

    for gene in &combined.genes {
        let direction = gene
            .direction_sign
            .map_or_else(|| "NA".to_string(), |s| s.to_string());
        writeln!(
            writer,
            "{}\t{}\t{:.5}\t{}\t{}\t{}\t{}\t{}\t{}",
            gene.gene_id,
            symbol_for(annotation, &gene.gene_id),
            gene.average_expression,
            metric_columns(gene.potency.as_ref()),
            metric_columns(gene.auc.as_ref()),
            direction,
            gene.average_rank,
            gene.combined_rank,
            gene.is_significant(min_abs_effect, max_adjusted_p),
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_overrepresentation(results: &[OverrepresentationResult], path: &Path) -> Result<()> {
    let mut writer = writer(path)?;
    writer.write_all(
        b"pathway_id\tname\tn_de_in_category\tn_in_category\texpected\tlog_odds_ratio\t\
p_value\tadjusted_p_value\ttested\tde_genes\tcategory_genes\n",
    )?;

    for r in results {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{}\t{}\t{}\t{}\t{}",
            r.pathway_id,
            r.name,
            r.n_de_in_category,
            r.n_in_category,
            r.expected,
            r.log_odds_ratio,
            na(Some(r.p_value)),
            na(Some(r.adjusted_p_value)),
            r.tested,
            join_symbols(&r.de_genes),
            join_symbols(&r.category_genes),
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_rank_enrichment(results: &[RankEnrichmentResult], path: &Path) -> Result<()> {
    let mut writer = writer(path)?;
    writer.write_all(
        b"pathway_id\tname\tsize\tes\tnes\tp_value\tadjusted_p_value\ttested\tleading_edge\n",
    )?;

    for r in results {
        writeln!(
            writer,
            "{}\t{}\t{}\t{:.5}\t{}\t{}\t{}\t{}\t{}",
            r.pathway_id,
            r.name,
            r.size,
            r.enrichment_score,
            r.normalized_enrichment_score
                .map_or_else(|| "NA".to_string(), |nes| format!("{:.5}", nes)),
            na(Some(r.p_value)),
            na(Some(r.adjusted_p_value)),
            r.tested,
            join_symbols(&r.leading_edge),
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_main_pathways(mains: &[MainPathway], path: &Path) -> Result<()> {
    let mut writer = writer(path)?;
    writer.write_all(
        b"pathway_id\tname\tsize\tnes\tadjusted_p_value\tleading_edge\tcollapsed_pathways\n",
    )?;

    for main in mains {
        let r = &main.result;
        let collapsed: Vec<String> = main
            .collapsed
            .iter()
            .map(|c| format!("{} ({:.2})", c.pathway_id, c.overlap))
            .collect();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.pathway_id,
            r.name,
            r.size,
            r.normalized_enrichment_score
                .map_or_else(|| "NA".to_string(), |nes| format!("{:.5}", nes)),
            na(Some(r.adjusted_p_value)),
            join_symbols(&r.leading_edge),
            collapsed.join(", "),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Pathway name to sorted member gene ids for every listed pathway id.
///
/// A name already taken by another id is keyed as `name (id)`.
pub fn pathway_gene_map<'a>(
    pathway_ids: impl IntoIterator<Item = &'a str>,
    pathways: &dyn PathwayDatabase,
) -> BTreeMap<String, Vec<String>> {
    let ids: BTreeSet<&str> = pathway_ids.into_iter().collect();
    let mut map = BTreeMap::new();
    for id in ids {
        let Some(pathway) = pathways.pathway(id) else {
            continue;
        };
        let mut genes: Vec<String> = pathway.genes.iter().map(|g| g.to_string()).collect();
        genes.sort_unstable();
        let key = if map.contains_key(&pathway.name) {
            warn!(
                "Pathway name '{}' is shared by several ids; keying {} by name and id",
                pathway.name, id
            );
            format!("{} ({})", pathway.name, id)
        } else {
            pathway.name.clone()
        };
        map.insert(key, genes);
    }
    map
}

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let mut writer = writer(path)?;
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
