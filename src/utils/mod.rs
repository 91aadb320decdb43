pub mod config;
pub mod error;
pub mod identifiers;
pub mod statistics;
