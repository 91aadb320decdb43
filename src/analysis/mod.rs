pub mod cohort;
pub mod concordance;
pub mod differential_expression;
pub mod enrichment_analysis;
pub mod gene_set_enrichment;
pub mod length_bias;
pub mod moderation;
pub mod multiple_testing_correction;
pub mod normalization;
pub mod pipeline;
pub mod rank_aggregation;
pub mod redundancy;
pub mod write_results;
