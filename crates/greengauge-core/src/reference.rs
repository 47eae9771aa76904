//! Reference data: per-country grid emission factors and the device
//! manufacturing catalogue.
//!
//! Both are lookups the pipeline consumes but does not own. They sit behind
//! small traits so a deployment can back them with whatever table it has;
//! [`ReferenceData`] is the bundled JSON-file implementation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::emissions::EmissionFactor;
use crate::error::{PipelineError, Result, StoreError};

/// Country → grid carbon intensity.
pub trait EmissionFactorTable: Send + Sync {
    fn factor_for(&self, country: &str) -> Option<EmissionFactor>;
}

/// Device kind/manufacturer/model → lifetime and embodied GWP.
pub trait DeviceCatalog: Send + Sync {
    fn lookup(&self, kind: &str, manufacturer: &str, model: &str) -> Option<CatalogEntry>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: String,
    pub manufacturer: String,
    pub model: String,
    pub lifetime_years: f64,
    pub gwp_total: f64,
}

/// In-memory reference tables, usually loaded from a JSON file:
///
/// ```json
/// {
///   "emission_factors": { "IE": 0.296, "FR": 0.056 },
///   "catalog": [
///     { "kind": "laptop", "manufacturer": "Dell", "model": "Latitude 5520",
///       "lifetime_years": 4.0, "gwp_total": 319.0 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub emission_factors: BTreeMap<String, f64>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

impl ReferenceData {
    pub fn load(path: &Path) -> std::result::Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        let data: Self = serde_json::from_str(&text)?;
        log::debug!(
            "loaded reference data from {}: {} factors, {} catalogue entries",
            path.display(),
            data.emission_factors.len(),
            data.catalog.len()
        );
        Ok(data)
    }

    /// Resolve a country or fail with a validation error naming it.
    pub fn require_factor(&self, country: &str) -> Result<EmissionFactor> {
        self.factor_for(country).ok_or_else(|| {
            PipelineError::validation("country", format!("no emission factor for '{country}'"))
        })
    }

    /// Resolve a catalogue entry or fail with a validation error.
    pub fn require_entry(&self, kind: &str, manufacturer: &str, model: &str) -> Result<CatalogEntry> {
        self.lookup(kind, manufacturer, model).ok_or_else(|| {
            PipelineError::validation(
                "model",
                format!("no catalogue entry for {kind} {manufacturer} {}", model.trim()),
            )
        })
    }
}

impl EmissionFactorTable for ReferenceData {
    fn factor_for(&self, country: &str) -> Option<EmissionFactor> {
        self.emission_factors
            .get(country.trim())
            .and_then(|v| EmissionFactor::new(*v).ok())
    }
}

impl DeviceCatalog for ReferenceData {
    fn lookup(&self, kind: &str, manufacturer: &str, model: &str) -> Option<CatalogEntry> {
        let model = model.trim();
        self.catalog
            .iter()
            .find(|e| e.kind == kind && e.manufacturer == manufacturer && e.model.trim() == model)
            .cloned()
    }
}
