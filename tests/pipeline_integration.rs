use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use DasaPath::analysis::pipeline::{run_pipeline, write_outputs};
use DasaPath::parsers::annotation_parser::read_gene_annotation;
use DasaPath::parsers::expression_parser::read_expression_matrix;
use DasaPath::parsers::pathway_parser::InMemoryPathwayDb;
use DasaPath::parsers::response_parser::read_response_table;
use DasaPath::utils::config::PipelineConfig;
use DasaPath::PipelineError;

const N_LINES: usize = 30;
const N_GENES: usize = 120;
const N_UP: usize = 15;

fn jitter(gene: usize, line: usize) -> f64 {
    0.8 + 0.4 * ((gene * 7919 + line * 104_729) % 97) as f64 / 96.0
}

fn write_fixture(dir: &Path) {
    let mut expression = File::create(dir.join("expression.tsv")).unwrap();
    let header: Vec<String> = (0..N_LINES).map(|i| format!("cl{:02}-lung", i)).collect();
    writeln!(expression, "gene_id\tDescription\t{}", header.join("\t")).unwrap();
    for g in 0..N_GENES {
        let base = 200.0 + (g % 13) as f64 * 60.0;
        let counts: Vec<String> = (0..N_LINES)
            .map(|i| {
                let fold = if g < N_UP && i < 10 { 8.0 } else { 1.0 };
                format!("{}", (base * fold * jitter(g, i)).round())
            })
            .collect();
        writeln!(expression, "G{:03}.1\tSYM{}\t{}", g, g, counts.join("\t")).unwrap();
    }

    let mut response = File::create(dir.join("response.csv")).unwrap();
    writeln!(response, "CCLE Cell Line Name,Compound,IC50 (uM),ActArea").unwrap();
    for i in 0..N_LINES {
        let auc = i as f64 * 0.1;
        writeln!(response, "CL{:02}_LUNG,Dasatinib,{:.3},{:.3}", i, 8.0 - 2.0 * auc, auc).unwrap();
        writeln!(response, "CL{:02}_LUNG,Erlotinib,1.0,1.0", i).unwrap();
    }
    writeln!(response, "ORPHAN_LUNG,Dasatinib,NA,1.0").unwrap();

    let mut annotation = File::create(dir.join("annotation.tsv")).unwrap();
    writeln!(annotation, "gene_id\tsymbol\tlength").unwrap();
    for g in 0..N_GENES {
        writeln!(annotation, "G{:03}\tSYM{}\t{}", g, g, 1000 + (g * 37 % 500) * 10).unwrap();
    }

    let mut pathways = File::create(dir.join("pathways.txt")).unwrap();
    let sets: [(&str, &str, Vec<usize>); 4] = [
        ("R-HSA-1", "Resistance up", (0..N_UP).chain(100..105).collect()),
        ("R-HSA-2", "Background A", (40..60).collect()),
        ("R-HSA-3", "Background B", (60..80).collect()),
        ("R-HSA-4", "Tiny", vec![80, 81]),
    ];
    for (id, name, genes) in &sets {
        for g in genes {
            writeln!(
                pathways,
                "G{:03}\t{}\thttps://reactome.org/{}\t{}\tTAS\tHomo sapiens",
                g, id, id, name
            )
            .unwrap();
        }
    }
    writeln!(
        pathways,
        "G000\tR-MMU-1\thttps://reactome.org/R-MMU-1\tMouse\tIEA\tMus musculus"
    )
    .unwrap();
}

fn config() -> PipelineConfig {
    PipelineConfig {
        tissues: vec!["LUNG".to_string()],
        pwf_bin_size: 20,
        ora_sampling_repeats: 200,
        gsea_permutations: 500,
        gsea_min_size: 5,
        gsea_max_size: 200,
        ..PipelineConfig::default()
    }
}

fn run_into(dir: &Path, out: &Path, config: &PipelineConfig) -> DasaPath::Result<()> {
    let (expression, _) = read_expression_matrix(dir.join("expression.tsv"))?;
    let (responses, report) =
        read_response_table(dir.join("response.csv"), &config.columns, &config.drug)?;
    assert_eq!(report.other_compound, N_LINES);
    assert_eq!(report.missing_metric, 1);
    let annotation = read_gene_annotation(dir.join("annotation.tsv"))?;
    let (pathways, _) =
        InMemoryPathwayDb::read_reactome_mapping(dir.join("pathways.txt"), &config.organism)?;

    let outputs = run_pipeline(&expression, &responses, &annotation, &pathways, config)?;

    assert_eq!(outputs.cohort_report.joined, N_LINES);
    assert_eq!(outputs.cohort_report.final_size, 20);
    assert_eq!(outputs.significant_genes.len(), N_UP);
    assert!(outputs.significant_genes.iter().all(|g| g[1..4].parse::<usize>().unwrap() < N_UP));

    let top_ora = &outputs.overrepresentation.results[0];
    assert_eq!(top_ora.pathway_id, "R-HSA-1");
    assert!(top_ora.adjusted_p_value < 0.05);
    assert_eq!(top_ora.n_de_in_category, N_UP);

    let gsea = &outputs.rank_enrichment.results;
    let up = gsea.iter().find(|r| r.pathway_id == "R-HSA-1").unwrap();
    assert!(up.enrichment_score > 0.5);
    assert!(up.adjusted_p_value < 0.05);
    assert!(up.leading_edge.len() >= N_UP);
    let tiny = gsea.iter().find(|r| r.pathway_id == "R-HSA-4").unwrap();
    assert!(!tiny.tested);

    assert!(outputs.concordance.shared_pathways.contains(&"R-HSA-1".to_string()));

    write_outputs(&outputs, &pathways, config, out)
}

#[test]
fn full_run_is_reproducible_and_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let config = config();

    run_into(dir.path(), &first, &config).unwrap();
    run_into(dir.path(), &second, &config).unwrap();

    for name in [
        "combined_gene_table.tsv",
        "de_potency.tsv",
        "de_auc.tsv",
        "ora_results.tsv",
        "gsea_results.tsv",
        "gsea_main_pathways.tsv",
        "pathway_genes.json",
        "concordance.json",
        "cohort_report.json",
        "run_config.json",
    ] {
        let a = fs::read_to_string(first.join(name)).unwrap();
        let b = fs::read_to_string(second.join(name)).unwrap();
        assert!(!a.is_empty(), "{} is empty", name);
        assert_eq!(a, b, "{} differs between runs", name);
    }

    let pathway_genes_text = fs::read_to_string(first.join("pathway_genes.json")).unwrap();
    let pathway_genes: serde_json::Value = serde_json::from_str(&pathway_genes_text).unwrap();
    assert_eq!(pathway_genes["Resistance up"].as_array().unwrap().len(), N_UP + 5);

    let ora = fs::read_to_string(first.join("ora_results.tsv")).unwrap();
    let top_row: Vec<&str> = ora.lines().nth(1).unwrap().split('\t').collect();
    assert_eq!(top_row[0], "R-HSA-1");
    let de_genes: Vec<&str> = top_row[9].split(", ").collect();
    assert_eq!(de_genes.len(), N_UP);
    assert!(de_genes.contains(&"SYM0"));
}

#[test]
fn rerun_replaces_previous_results() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("de_obsolete.tsv"), "stale").unwrap();

    run_into(dir.path(), &out, &config()).unwrap();
    assert!(!out.join("de_obsolete.tsv").exists());
    assert!(out.join("de_auc.tsv").exists());
}

#[test]
fn tissue_without_samples_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let config = PipelineConfig {
        tissues: vec!["BREAST".to_string()],
        ..config()
    };

    let (expression, _) = read_expression_matrix(dir.path().join("expression.tsv")).unwrap();
    let response_path = dir.path().join("response.csv");
    let (responses, _) =
        read_response_table(response_path, &config.columns, &config.drug).unwrap();
    let annotation = read_gene_annotation(dir.path().join("annotation.tsv")).unwrap();
    let pathway_path = dir.path().join("pathways.txt");
    let (pathways, _) =
        InMemoryPathwayDb::read_reactome_mapping(pathway_path, &config.organism).unwrap();

    let result = run_pipeline(&expression, &responses, &annotation, &pathways, &config);
    assert!(matches!(result, Err(PipelineError::EmptyJoin { stage: "tissue filter" })));
}
