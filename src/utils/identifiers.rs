use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ESCAPED_DIGIT_REGEX: Regex = Regex::new(r"^X(\d)").unwrap();
    static ref NON_ALPHANUMERIC_REGEX: Regex = Regex::new(r"[^A-Z0-9]").unwrap();
}

/// Canonical form of a cell line identifier.
///
/// Uppercases, drops the `X` that R prepends to column names starting with a
/// digit, and removes every non-alphanumeric character, so `X22RV1_PROSTATE`,
/// `22Rv1-prostate` and `22RV1 PROSTATE` all map to `22RV1PROSTATE`.
/// Applying it twice is a no-op.
pub fn normalize_sample_id(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    let compact = NON_ALPHANUMERIC_REGEX.replace_all(&upper, "");
    ESCAPED_DIGIT_REGEX.replace(&compact, "${1}").into_owned()
}

/// Drops a trailing `.N` version from stable gene ids (`ENSG00000000419.12`).
pub fn strip_gene_version(gene_id: &str) -> &str {
    let trimmed = gene_id.trim();
    match trimmed.rsplit_once('.') {
        Some((base, version))
            if !base.is_empty()
                && !version.is_empty()
                && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => trimmed,
    }
}

/// Tissue label encoded in a CCLE style name (`K562_HAEMATOPOIETIC_AND_LYMPHOID_TISSUE`).
pub fn tissue_from_cell_line(cell_line: &str) -> Option<String> {
    cell_line
        .trim()
        .split_once('_')
        .map(|(_, tissue)| normalize_tissue(tissue))
        .filter(|tissue| !tissue.is_empty())
}

pub fn normalize_tissue(tissue: &str) -> String {
    tissue.trim().to_ascii_uppercase().replace([' ', '-'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_r_escaped_and_punctuated_ids() {
        assert_eq!(normalize_sample_id("X22RV1_PROSTATE"), "22RV1PROSTATE");
        assert_eq!(normalize_sample_id("22Rv1-prostate"), "22RV1PROSTATE");
        assert_eq!(normalize_sample_id(" 22RV1 PROSTATE "), "22RV1PROSTATE");
        assert_eq!(normalize_sample_id("K-562_HAEMATOPOIETIC"), "K562HAEMATOPOIETIC");
    }

    #[test]
    fn keeps_leading_x_before_letters() {
        assert_eq!(normalize_sample_id("XLA4_BONE"), "XLA4BONE");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["X22RV1_PROSTATE", "hcc-827_lung", "X-5637_URINARY_TRACT", "A549"] {
            let once = normalize_sample_id(raw);
            assert_eq!(normalize_sample_id(&once), once);
        }
    }

    #[test]
    fn strips_numeric_versions_only() {
        assert_eq!(strip_gene_version("ENSG00000000419.12"), "ENSG00000000419");
        assert_eq!(strip_gene_version("ENSG00000000419"), "ENSG00000000419");
        assert_eq!(strip_gene_version("NKX2.1a"), "NKX2.1a");
        assert_eq!(strip_gene_version(".5"), ".5");
    }

    #[test]
    fn derives_tissue_from_name_suffix() {
        assert_eq!(
            tissue_from_cell_line("K562_HAEMATOPOIETIC_AND_LYMPHOID_TISSUE").as_deref(),
            Some("HAEMATOPOIETIC_AND_LYMPHOID_TISSUE")
        );
        assert_eq!(tissue_from_cell_line("A549"), None);
        assert_eq!(normalize_tissue("small intestine"), "SMALL_INTESTINE");
    }
}
