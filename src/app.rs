use std::path::PathBuf;

use crate::verbose::VerboseTags;

/// Paths and process-wide-ish settings threaded explicitly through the
/// pipeline instead of living in statics.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config_path: PathBuf,
    pub verbose: VerboseTags,
    pub defines: Vec<String>,
}

impl AppContext {
    pub fn new(config_path: PathBuf, verbose: VerboseTags, defines: Vec<String>) -> Self {
        Self {
            config_path,
            verbose,
            defines,
        }
    }
}
