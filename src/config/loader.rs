//! Assemble one model document from several JSON sources. Reading them is the caller's job;
//! a source is a label (usually a file name) and its text.

use crate::config::ModelDocument;
use crate::error::ConfigError;

/// Parse and merge `(label, json)` sources in label order. Parse errors name the label.
pub fn load_sources<L, T>(sources: impl IntoIterator<Item = (L, T)>) -> Result<ModelDocument, ConfigError>
where
    L: AsRef<str>,
    T: AsRef<str>,
{
    let mut sources: Vec<(L, T)> = sources.into_iter().collect();
    sources.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let mut merged = ModelDocument::default();
    for (label, text) in &sources {
        let label = label.as_ref();
        let doc = ModelDocument::from_json_str(text.as_ref()).map_err(|e| match e {
            ConfigError::Load(msg) => ConfigError::Load(format!("{}: {}", label, msg)),
            other => other,
        })?;
        tracing::debug!(source = %label, entities = doc.entities.len(), "model source loaded");
        merged.merge(doc);
    }
    Ok(merged)
}

impl ModelDocument {
    /// Append another document's definitions. Duplicates are left for the validator to report.
    pub fn merge(&mut self, other: ModelDocument) {
        self.entities.extend(other.entities);
        self.enums.extend(other.enums);
    }
}
