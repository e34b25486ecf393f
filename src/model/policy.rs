//! Policy Variant and the startup catalog that seeds the Bandit / Deploy Gate
//! (spec.md §3 "Policy Variant", §6 "Policy catalog").

use serde::{Deserialize, Serialize};

/// Prompt/policy-shaping parameters bundled under one variant id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyParameters {
    pub greeting: String,
    pub tone: String,
    pub length: String,
    pub inquiry_mode: String,
    pub barge_in_sensitivity: f32,
}

/// A selectable policy variant (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVariant {
    pub id: String,
    pub parameters: PolicyParameters,
    /// Never blacklisted fallback. Exactly one variant has this set.
    pub is_base: bool,
    /// Recently added, insufficient evidence.
    pub is_new: bool,
    /// Observed but not yet within the confidence threshold.
    pub is_uncertain: bool,
}

/// The on-disk catalog document read at startup (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyCatalogDocument {
    pub variants: Vec<CatalogEntry>,
}

/// One entry in the catalog document: just id + parameters. Bandit/Deploy
/// bookkeeping (`is_base`/`is_new`/`is_uncertain`, α/β) is derived at load
/// time, not stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub parameters: PolicyParameters,
    /// Marks the single never-blacklisted fallback variant.
    #[serde(default)]
    pub is_base: bool,
}

impl PolicyCatalogDocument {
    /// Parse a catalog document from its JSON text form.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Validation`] on malformed JSON or
    /// if the document does not carry exactly one base variant.
    pub fn parse(json: &str) -> crate::error::Result<Self> {
        let doc: Self = serde_json::from_str(json)
            .map_err(|e| crate::error::CoreError::Validation(format!("catalog: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Validate structural invariants: non-empty, unique ids, exactly one base.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;
        if self.variants.is_empty() {
            return Err(CoreError::Validation(
                "policy catalog must not be empty".to_owned(),
            ));
        }
        let base_count = self.variants.iter().filter(|v| v.is_base).count();
        if base_count != 1 {
            return Err(CoreError::Validation(format!(
                "policy catalog must have exactly one base variant, found {base_count}"
            )));
        }
        let mut ids = self.variants.iter().map(|v| v.id.as_str()).collect::<Vec<_>>();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(CoreError::Validation(
                "policy catalog has duplicate variant ids".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, is_base: bool) -> CatalogEntry {
        CatalogEntry {
            id: id.to_owned(),
            parameters: PolicyParameters {
                greeting: "hi".into(),
                tone: "neutral".into(),
                length: "short".into(),
                inquiry_mode: "direct".into(),
                barge_in_sensitivity: 0.5,
            },
            is_base,
        }
    }

    #[test]
    fn exactly_one_base_variant_required() {
        let doc = PolicyCatalogDocument {
            variants: vec![entry("v0", true), entry("v1", false)],
        };
        assert!(doc.validate().is_ok());

        let no_base = PolicyCatalogDocument {
            variants: vec![entry("v0", false)],
        };
        assert!(no_base.validate().is_err());

        let two_base = PolicyCatalogDocument {
            variants: vec![entry("v0", true), entry("v1", true)],
        };
        assert!(two_base.validate().is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let doc = PolicyCatalogDocument {
            variants: vec![entry("v0", true), entry("v0", false)],
        };
        assert!(doc.validate().is_err());
    }

    #[test]
    fn parse_roundtrips_through_json() {
        let doc = PolicyCatalogDocument {
            variants: vec![entry("v0", true), entry("v1", false)],
        };
        let json = serde_json::to_string(&doc).expect("serialize");
        let parsed = PolicyCatalogDocument::parse(&json).expect("parse");
        assert_eq!(parsed.variants.len(), 2);
    }
}
