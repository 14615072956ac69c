//! Output-schema catalogue.
//!
//! JSON Schemas keyed by name, compiled once at load into
//! `jsonschema::Validator`s so the per-request check is cheap.

use crate::types::ValidationError;
use std::collections::HashMap;
use std::path::PathBuf;

pub struct SchemaCatalogue {
    validators: HashMap<String, jsonschema::Validator>,
}

impl SchemaCatalogue {
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Compile a catalogue from in-memory schema documents.
    pub fn from_sources(
        sources: HashMap<String, serde_json::Value>,
    ) -> Result<Self, ValidationError> {
        let mut validators = HashMap::with_capacity(sources.len());
        for (name, schema) in sources {
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                ValidationError::SchemaCompile {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            validators.insert(name, validator);
        }
        Ok(Self { validators })
    }

    /// Load and compile schema files keyed by name.
    pub fn load_from_files(paths: HashMap<String, PathBuf>) -> Result<Self, ValidationError> {
        let mut sources = HashMap::with_capacity(paths.len());
        for (name, path) in paths {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                ValidationError::SchemaCompile {
                    name: name.clone(),
                    reason: format!("cannot read {}: {}", path.display(), e),
                }
            })?;
            let schema: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                ValidationError::SchemaCompile {
                    name: name.clone(),
                    reason: format!("invalid JSON in {}: {}", path.display(), e),
                }
            })?;
            sources.insert(name, schema);
        }
        Self::from_sources(sources)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Validate `value` against the named schema. `Ok(issues)` is empty on
    /// a pass; an unknown schema name is an error.
    pub fn check(
        &self,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<String>, ValidationError> {
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ValidationError::UnknownSchema(name.to_string()))?;
        let issues = validator
            .iter_errors(value)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("at '{}': {}", path, e)
                }
            })
            .collect();
        Ok(issues)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}
