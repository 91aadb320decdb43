pub mod annotation_parser;
pub mod expression_parser;
pub mod pathway_parser;
pub mod response_parser;
