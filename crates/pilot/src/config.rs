//! Boot configuration: the database URL, the optional declarative schema
//! file, and the initial bypass set, resolved from flags and the recognized
//! environment variables.
use std::path::PathBuf;

use catalog::{
    BootstrapMode,
    DeclarativeSchema,
};
use errors::ErrorMetadata;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub schema_file: Option<PathBuf>,
}

impl Config {
    pub fn bootstrap_mode(&self) -> anyhow::Result<BootstrapMode> {
        let Some(path) = &self.schema_file else {
            return Ok(BootstrapMode::Introspect);
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::malformed_schema(format!(
                "cannot read schema file {}",
                path.display()
            )))
        })?;
        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::malformed_schema(
                "schema file is not valid JSON",
            ))
        })?;
        Ok(BootstrapMode::Declarative(DeclarativeSchema::from_json(
            &value,
        )?))
    }
}
