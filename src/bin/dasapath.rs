#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;

use DasaPath::analysis::{
    enrichment_analysis::OverrepresentationTest,
    length_bias::BiasCovariate,
    multiple_testing_correction::AdjustmentMethod,
    pipeline::{run_pipeline, write_outputs},
};
use DasaPath::parsers::{
    annotation_parser::{read_gene_annotation, GeneAnnotation},
    expression_parser::{read_expression_matrix, ExpressionMatrix},
    pathway_parser::InMemoryPathwayDb,
    response_parser::{read_response_table, ResponseRecord},
};
use DasaPath::utils::config::{
    PipelineConfig, ResistanceDirection, ResponseColumns, ResponseMetric,
};

#[derive(Parser, Debug)]
#[command(name = "dasapath", about, version)]
struct CliArgs {
    #[arg(
        short = 'e',
        long = "expression",
        value_name = "FILE",
        help = "Gene by sample expression matrix (tab separated, or comma separated as .csv).",
        required = true
    )]
    expression: PathBuf,

    #[arg(
        short = 'r',
        long = "response",
        value_name = "FILE",
        help = "Drug response table with one row per compound and cell line.",
        required = true
    )]
    response: PathBuf,

    #[arg(
        short = 'p',
        long = "pathways",
        value_name = "FILE",
        help = "Reactome style gene to pathway mapping.",
        required = true
    )]
    pathways: PathBuf,

    #[arg(
        short = 'a',
        long = "annotation",
        value_name = "FILE",
        help = "Gene annotation with symbol, length and optional pathway identifier columns."
    )]
    annotation: Option<PathBuf>,

    #[arg(
        short = 'o',
        long = "out",
        value_name = "DIRECTORY",
        help = "Directory to write results to. Results of a previous run are replaced.",
        required = true
    )]
    output_dir: PathBuf,

    #[arg(long = "drug", help = "Compound to analyze.", default_value = "Dasatinib")]
    drug: String,

    #[arg(
        long = "tissues",
        value_name = "TISSUE",
        value_delimiter = ',',
        help = "Comma separated tissue types kept in the cohort.",
        default_values_t = ["HAEMATOPOIETIC_AND_LYMPHOID_TISSUE".to_string(), "LUNG".to_string()]
    )]
    tissues: Vec<String>,

    #[arg(
        long = "exclude",
        value_name = "SAMPLE",
        value_delimiter = ',',
        help = "Comma separated sample identifiers removed from the cohort."
    )]
    excluded_samples: Vec<String>,

    #[arg(
        long = "marker-gene",
        value_name = "SYMBOL",
        help = "Marker gene whose expression is recorded per sample. Empty to disable.",
        default_value = "ABL1"
    )]
    marker_gene: String,

    #[arg(
        long = "adjust-for-marker",
        help = "Add the marker gene expression as a model covariate."
    )]
    adjust_for_marker: bool,

    #[arg(long = "lower-percentile", value_name = "PROB", default_value_t = 0.33)]
    lower_percentile: f64,

    #[arg(long = "upper-percentile", value_name = "PROB", default_value_t = 0.66)]
    upper_percentile: f64,

    #[arg(
        long = "normalized-input",
        help = "Expression values are already normalized log2 intensities."
    )]
    normalized_input: bool,

    #[arg(long = "cell-line-column", default_value = "CCLE Cell Line Name")]
    cell_line_column: String,

    #[arg(long = "compound-column", default_value = "Compound")]
    compound_column: String,

    #[arg(long = "potency-column", default_value = "IC50 (uM)")]
    potency_column: String,

    #[arg(long = "auc-column", default_value = "ActArea")]
    auc_column: String,

    #[arg(
        long = "tissue-column",
        help = "Tissue column; derived from the cell line name when absent."
    )]
    tissue_column: Option<String>,

    #[arg(
        long = "potency-direction",
        value_enum,
        default_value_t = ResistanceDirection::HighIsResistant
    )]
    potency_direction: ResistanceDirection,

    #[arg(
        long = "auc-direction",
        value_enum,
        default_value_t = ResistanceDirection::LowIsResistant
    )]
    auc_direction: ResistanceDirection,

    #[arg(
        long = "alpha",
        value_name = "ALPHA",
        help = "Significance threshold for adjusted p-values.",
        default_value_t = 0.05
    )]
    alpha: f64,

    #[arg(
        long = "min-effect",
        value_name = "LOG2FC",
        help = "Minimum absolute effect under both metrics for a significant gene.",
        default_value_t = 1.0
    )]
    min_abs_effect: f64,

    #[arg(
        long = "max-padj",
        value_name = "PADJ",
        help = "Optional adjusted p-value ceiling for significant genes."
    )]
    significant_max_padj: Option<f64>,

    #[arg(
        short = 'c',
        long = "correction",
        value_enum,
        help = "Multiple testing correction.",
        default_value_t = AdjustmentMethod::BenjaminiHochberg
    )]
    adjustment_method: AdjustmentMethod,

    #[arg(
        short = 't',
        long = "ora-test",
        value_enum,
        help = "Overrepresentation test.",
        default_value_t = OverrepresentationTest::Noncentral
    )]
    ora_test: OverrepresentationTest,

    #[arg(long = "bias-covariate", value_enum, default_value_t = BiasCovariate::GeneLength)]
    bias_covariate: BiasCovariate,

    #[arg(long = "bin-size", value_name = "GENES", default_value_t = 200)]
    pwf_bin_size: usize,

    #[arg(long = "sampling-repeats", value_name = "COUNT", default_value_t = 2000)]
    ora_sampling_repeats: usize,

    #[arg(long = "gsea-metric", value_enum, default_value_t = ResponseMetric::Auc)]
    gsea_metric: ResponseMetric,

    #[arg(long = "permutations", value_name = "COUNT", default_value_t = 1000)]
    gsea_permutations: usize,

    #[arg(long = "min-size", value_name = "GENES", default_value_t = 15)]
    gsea_min_size: usize,

    #[arg(long = "max-size", value_name = "GENES", default_value_t = 500)]
    gsea_max_size: usize,

    #[arg(long = "gsea-weight", value_name = "P", default_value_t = 1.0)]
    gsea_weight: f64,

    #[arg(
        long = "collapse-threshold",
        value_name = "JACCARD",
        help = "Leading-edge overlap above which a pathway is folded into a main pathway.",
        default_value_t = 0.5
    )]
    collapse_threshold: f64,

    #[arg(
        short = 'k',
        long = "top-k",
        value_name = "K",
        help = "Number of top pathways per method compared for concordance.",
        default_value_t = 100
    )]
    top_k: usize,

    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,

    #[arg(long = "organism", default_value = "Homo sapiens")]
    organism: String,

    #[arg(
        long = "cores",
        value_name = "NUMBER",
        help = "Number of cores to use for the analysis.",
        default_value_t = num_cpus::get()
    )]
    num_cores: usize,
}

impl CliArgs {
    fn to_config(&self) -> PipelineConfig {
        let marker = self.marker_gene.trim();
        PipelineConfig {
            drug: self.drug.clone(),
            columns: ResponseColumns {
                cell_line: self.cell_line_column.clone(),
                compound: self.compound_column.clone(),
                potency: self.potency_column.clone(),
                auc: self.auc_column.clone(),
                tissue: self.tissue_column.clone(),
            },
            potency_direction: self.potency_direction,
            auc_direction: self.auc_direction,
            tissues: self.tissues.clone(),
            excluded_samples: self.excluded_samples.clone(),
            marker_gene: (!marker.is_empty()).then(|| marker.to_string()),
            adjust_for_marker: self.adjust_for_marker,
            lower_percentile: self.lower_percentile,
            upper_percentile: self.upper_percentile,
            normalized_input: self.normalized_input,
            alpha: self.alpha,
            min_abs_effect: self.min_abs_effect,
            significant_max_padj: self.significant_max_padj,
            adjustment_method: self.adjustment_method,
            ora_test: self.ora_test,
            bias_covariate: self.bias_covariate,
            pwf_bin_size: self.pwf_bin_size,
            ora_sampling_repeats: self.ora_sampling_repeats,
            gsea_metric: self.gsea_metric,
            gsea_permutations: self.gsea_permutations,
            gsea_min_size: self.gsea_min_size,
            gsea_max_size: self.gsea_max_size,
            gsea_weight: self.gsea_weight,
            collapse_threshold: self.collapse_threshold,
            top_k: self.top_k,
            seed: self.seed,
            organism: self.organism.clone(),
        }
    }
}

struct Inputs {
    expression: ExpressionMatrix,
    responses: Vec<ResponseRecord>,
    annotation: GeneAnnotation,
    pathways: InMemoryPathwayDb,
}

fn load_inputs(cli_args: &CliArgs, config: &PipelineConfig) -> anyhow::Result<Inputs> {
    let (expression, expression_report) = read_expression_matrix(&cli_args.expression)
        .with_context(|| format!("reading expression matrix '{}'", cli_args.expression.display()))?;
    info!(
        "Expression: {} genes x {} samples ({} duplicate gene rows dropped)",
        expression.n_genes(),
        expression.n_samples(),
        expression_report.duplicate_genes
    );

    let (responses, response_report) =
        read_response_table(&cli_args.response, &config.columns, &config.drug).with_context(
            || format!("reading drug response table '{}'", cli_args.response.display()),
        )?;
    info!(
        "Response: {} {} records ({} rows for other compounds, {} with missing metrics)",
        responses.len(),
        config.drug,
        response_report.other_compound,
        response_report.missing_metric
    );

    let annotation = match &cli_args.annotation {
        Some(path) => read_gene_annotation(path)
            .with_context(|| format!("reading gene annotation '{}'", path.display()))?,
        None => GeneAnnotation::default(),
    };

    let (pathways, pathway_report) =
        InMemoryPathwayDb::read_reactome_mapping(&cli_args.pathways, &config.organism)
            .with_context(|| format!("reading pathway mapping '{}'", cli_args.pathways.display()))?;
    info!(
        "Pathways: {} lines read, {} for other organisms",
        pathway_report.lines_read, pathway_report.other_organism
    );

    Ok(Inputs {
        expression,
        responses,
        annotation,
        pathways,
    })
}

fn run(inputs: &Inputs, config: &PipelineConfig, output_dir: &Path) -> anyhow::Result<()> {
    let outputs = run_pipeline(
        &inputs.expression,
        &inputs.responses,
        &inputs.annotation,
        &inputs.pathways,
        config,
    )
    .context("running the analysis")?;
    write_outputs(&outputs, &inputs.pathways, config, output_dir)
        .with_context(|| format!("writing results to '{}'", output_dir.display()))?;
    Ok(())
}

fn main() -> ExitCode {
    let cli_args: CliArgs = CliArgs::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = cli_args.to_config();
    if let Err(e) = config.validate() {
        eprintln!("\nInvalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Analysis will be performed with {} core(s)", cli_args.num_cores);
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(cli_args.num_cores)
        .build_global()
    {
        eprintln!("Failed to initialize Rayon global thread pool: {:?}", e);
    }

    let inputs = match load_inputs(&cli_args, &config) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("\nError loading inputs: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&inputs, &config, &cli_args.output_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\nError: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
