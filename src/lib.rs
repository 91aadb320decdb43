pub mod analysis;
pub mod parsers;
pub mod utils;

pub use utils::error::{PipelineError, Result};
