//! Keyword catalog.
//!
//! Supplies per-keyword metadata (type, initial value, units, owning
//! dispatcher, enumerators, period) to dispatchers. The fabric only consumes
//! the [`KeywordCatalog`] trait; [`MemoryCatalog`] is a YAML-backed
//! implementation:
//!
//! ```yaml
//! testsvc:
//!   - name: CENTROID
//!     type: enumerated
//!     dispatcher: camera
//!     initial: COG
//!     enumerators: {0: COG, 1: QUAD, 2: BINQUAD}
//!   - name: TEMP
//!     type: double
//!     units: degC
//!     period: 5.0
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::keyword::{Enumerators, KeywordError, KeywordType};
use crate::protocol::{canonical_keyword, canonical_service};

/// Catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {0}: {1}")]
    FileRead(String, String),

    #[error("Failed to parse catalog: {0}")]
    Parse(String),
}

/// Metadata for one keyword.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KeywordSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub initial: Option<String>,
    pub units: Option<String>,
    /// Expected owning dispatcher.
    pub dispatcher: Option<String>,
    pub enumerators: Option<BTreeMap<i64, String>>,
    /// Seconds between periodic updates.
    pub period: Option<f64>,
    pub read_only: bool,
    pub write_only: bool,
}

impl KeywordSpec {
    pub fn new(name: &str, type_tag: &str) -> Self {
        Self {
            name: canonical_keyword(name),
            type_tag: type_tag.to_string(),
            ..Self::default()
        }
    }

    /// Resolved type, with the enumerator table applied.
    pub fn keyword_type(&self) -> Result<KeywordType, KeywordError> {
        match &self.enumerators {
            Some(table) => Ok(KeywordType::Enumerated(Enumerators::new(
                table.iter().map(|(k, v)| (*k, v.clone())),
            )?)),
            None if self.type_tag.is_empty() => Ok(KeywordType::Basic),
            None => KeywordType::from_tag(&self.type_tag),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
            .filter(|p| p.is_finite() && *p > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Source of keyword metadata.
pub trait KeywordCatalog: Send + Sync {
    /// Metadata for one keyword, if catalogued.
    fn lookup(&self, service: &str, keyword: &str) -> Option<KeywordSpec>;

    /// Every catalogued keyword of `service`.
    fn keywords(&self, service: &str) -> Vec<KeywordSpec>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    services: HashMap<String, BTreeMap<String, KeywordSpec>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        let raw: HashMap<String, Vec<KeywordSpec>> =
            serde_yaml::from_str(yaml).map_err(|e| CatalogError::Parse(e.to_string()))?;

        let mut catalog = Self::new();
        for (service, specs) in raw {
            for spec in specs {
                catalog.insert(&service, spec);
            }
        }
        Ok(catalog)
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::FileRead(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn insert(&mut self, service: &str, mut spec: KeywordSpec) {
        spec.name = canonical_keyword(&spec.name);
        self.services
            .entry(canonical_service(service))
            .or_default()
            .insert(spec.name.clone(), spec);
    }
}

impl KeywordCatalog for MemoryCatalog {
    fn lookup(&self, service: &str, keyword: &str) -> Option<KeywordSpec> {
        self.services
            .get(&canonical_service(service))?
            .get(&canonical_keyword(keyword))
            .cloned()
    }

    fn keywords(&self, service: &str) -> Vec<KeywordSpec> {
        self.services
            .get(&canonical_service(service))
            .map(|specs| specs.values().cloned().collect())
            .unwrap_or_default()
    }
}
