use adjustp::{adjust, Procedure};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMethod {
    None,
    Bonferroni,
    BenjaminiHochberg,
    BenjaminiYekutieli,
}

impl AdjustmentMethod {
    fn to_procedure(self) -> Option<Procedure> {
        match self {
            AdjustmentMethod::None => None,
            AdjustmentMethod::Bonferroni => Some(Procedure::Bonferroni),
            AdjustmentMethod::BenjaminiHochberg => Some(Procedure::BenjaminiHochberg),
            AdjustmentMethod::BenjaminiYekutieli => Some(Procedure::BenjaminiYekutieli),
        }
    }
}

pub trait PValueAdjustable: Sized {
    fn extract_p_value(&self) -> f64;

    /// Untested entries keep p = 1 and stay out of the correction family.
    fn is_tested(&self) -> bool {
        true
    }

    fn with_adjusted_p_value(&self, adjusted: f64) -> Self;
}

/// Adjusted p-values in input order, clamped to [0, 1].
pub fn adjust_values(p_values: &[f64], method: AdjustmentMethod) -> Vec<f64> {
    if p_values.is_empty() {
        return Vec::new();
    }
    let cleaned: Vec<f64> = p_values
        .iter()
        .map(|&p| if p.is_finite() { p.clamp(0.0, 1.0) } else { 1.0 })
        .collect();

    let adjusted = match method.to_procedure() {
        Some(procedure) => adjust(&cleaned, procedure),
        None => cleaned.clone(),
    };
    adjusted
        .into_iter()
        .zip(&cleaned)
        .map(|(adj, &raw)| adj.max(raw).clamp(0.0, 1.0))
        .collect()
}

/// Corrects the tested entries as one family; untested ones get 1.
pub fn adjust_p_values<T: PValueAdjustable>(results: &[T], method: AdjustmentMethod) -> Vec<T> {
    let tested: Vec<usize> = (0..results.len()).filter(|&i| results[i].is_tested()).collect();
    let raw: Vec<f64> = tested.iter().map(|&i| results[i].extract_p_value()).collect();
    let adjusted = adjust_values(&raw, method);

    let mut output: Vec<Option<f64>> = vec![None; results.len()];
    for (&i, &adj) in tested.iter().zip(&adjusted) {
        output[i] = Some(adj);
    }

    results
        .iter()
        .zip(output)
        .map(|(result, adj)| result.with_adjusted_p_value(adj.unwrap_or(1.0)))
        .collect()
}
