use ingest_engine::config::{ConfigParser, IngestConfig};
use ingest_engine::error::EngineError;

/// Loads `.hcl` configuration files.
pub struct HclParser;

impl ConfigParser for HclParser {
    fn extensions(&self) -> &[&str] {
        &["hcl"]
    }

    fn parse(&self, content: &str) -> Result<IngestConfig, EngineError> {
        hcl::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }
}
