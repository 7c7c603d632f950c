//! Knowledge contracts: structural validation and version compatibility.
//!
//! A knowledge document carries five required sections, each with three
//! required subsections. Validation is purely structural: every required path
//! must be present as a mapping, its content is never inspected. Version
//! compatibility between a knowledge version and an agent version is answered
//! only by [`KnowledgeContract::is_compatible`], which fails closed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::{Identity, IdentityKind, Version};

/// Required top-level sections and their required subsections.
pub const REQUIRED_SECTIONS: [(&str, [&str; 3]); 5] = [
    ("core_knowledge", ["concepts", "terminology", "principles"]),
    ("rules", ["constraints", "requirements", "guidelines"]),
    ("best_practices", ["recommended", "optional", "discouraged"]),
    ("validation", ["input", "process", "output"]),
    ("integration", ["apis", "services", "data_sources"]),
];

/// Named entries inside one category.
pub type Entries = BTreeMap<String, Value>;

/// Category name → named entries.
pub type Section = BTreeMap<String, Entries>;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to access knowledge document {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid knowledge JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("knowledge document has no usable identity: {}", .0.join("; "))]
    MissingIdentity(Vec<String>),
}

/// Outcome of a structural validation: one entry per missing or mistyped path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn missing(&mut self, path: impl Into<String>) {
        self.errors.push(format!("{}: missing", path.into()));
    }

    fn mistyped(&mut self, path: impl Into<String>, expected: &str) {
        self.errors
            .push(format!("{}: expected {}", path.into(), expected));
    }
}

/// Structural validator for raw knowledge documents.
pub struct KnowledgeValidator;

impl KnowledgeValidator {
    pub fn validate(document: &Value) -> ValidationResult {
        let mut result = ValidationResult::default();

        let Some(root) = document.as_object() else {
            result.mistyped("<root>", "mapping");
            return result;
        };

        match root.get("knowledge_id") {
            None => result.missing("knowledge_id"),
            Some(Value::String(id)) => match Identity::parse(id) {
                Some(identity) if identity.kind == IdentityKind::Knowledge => {}
                _ => result
                    .errors
                    .push(format!("knowledge_id: malformed identity '{}'", id)),
            },
            Some(_) => result.mistyped("knowledge_id", "string"),
        }

        match root.get("domain") {
            None => result.missing("domain"),
            Some(Value::String(_)) => {}
            Some(_) => result.mistyped("domain", "string"),
        }

        match root.get("version") {
            None => result.missing("version"),
            Some(raw) => {
                if serde_json::from_value::<Version>(raw.clone()).is_err() {
                    result.mistyped("version", "<major>[.<minor>]");
                }
            }
        }

        for (section, subsections) in REQUIRED_SECTIONS {
            match root.get(section) {
                None => result.missing(section),
                Some(Value::Object(body)) => {
                    for sub in subsections {
                        let path = format!("{}.{}", section, sub);
                        match body.get(sub) {
                            None => result.missing(path),
                            Some(Value::Object(_)) => {}
                            Some(_) => result.mistyped(path, "mapping"),
                        }
                    }
                }
                Some(_) => result.mistyped(section, "mapping"),
            }
        }

        if let Some(metadata) = root.get("metadata") {
            Self::validate_metadata(metadata, &mut result);
        }

        result
    }

    fn validate_metadata(metadata: &Value, result: &mut ValidationResult) {
        let Some(metadata) = metadata.as_object() else {
            result.mistyped("metadata", "mapping");
            return;
        };
        let Some(history) = metadata.get("version_history") else {
            return;
        };
        let Some(history) = history.as_object() else {
            result.mistyped("metadata.version_history", "mapping");
            return;
        };

        for (version, record) in history {
            let path = format!("metadata.version_history.{}", version);
            if version.parse::<Version>().is_err() {
                result
                    .errors
                    .push(format!("{}: invalid version key", path));
            }
            match record.get("compatible_agent_versions") {
                None | Some(Value::Array(_)) => {}
                Some(_) => result.mistyped(format!("{}.compatible_agent_versions", path), "list"),
            }
            if !record.is_object() {
                result.mistyped(path, "mapping");
            }
        }
    }
}

/// Release metadata for one knowledge version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub compatible_agent_versions: BTreeSet<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub version_history: BTreeMap<Version, VersionRecord>,
}

/// A versioned knowledge document attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeContract {
    pub knowledge_id: String,
    pub domain: String,
    pub version: Version,
    pub core_knowledge: Section,
    pub rules: Section,
    pub best_practices: Section,
    pub validation: Section,
    pub integration: Section,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<KnowledgeMetadata>,
}

impl KnowledgeContract {
    /// Empty but well-formed contract with a canonical identity.
    pub fn new(namespace: &str, domain: &str, version: Version) -> Self {
        let empty = |name: &str| -> Section {
            REQUIRED_SECTIONS
                .iter()
                .find(|(section, _)| *section == name)
                .map(|(_, subs)| subs.iter().map(|s| (s.to_string(), Entries::new())).collect())
                .unwrap_or_default()
        };

        Self {
            knowledge_id: Identity::knowledge(namespace, domain, version),
            domain: domain.to_string(),
            version,
            core_knowledge: empty("core_knowledge"),
            rules: empty("rules"),
            best_practices: empty("best_practices"),
            validation: empty("validation"),
            integration: empty("integration"),
            metadata: None,
        }
    }

    /// Build a contract from a raw document.
    ///
    /// Only the identity fields are mandatory here; missing sections default to
    /// empty and are reported by [`KnowledgeContract::validate`], so a
    /// malformed contract can still be registered and later vetoed by
    /// governance.
    pub fn from_value(document: Value) -> Result<Self, KnowledgeError> {
        let report = KnowledgeValidator::validate(&document);
        let root = document.as_object().cloned().unwrap_or_default();

        let identity_errors: Vec<String> = report
            .errors
            .iter()
            .filter(|e| {
                e.starts_with("<root>")
                    || e.starts_with("knowledge_id")
                    || e.starts_with("domain")
                    || e.starts_with("version")
            })
            .cloned()
            .collect();
        if !identity_errors.is_empty() {
            return Err(KnowledgeError::MissingIdentity(identity_errors));
        }
        if !report.is_valid() {
            warn!(errors = ?report.errors, "Knowledge document is not well-formed");
        }

        let text = |key: &str| {
            root.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let version = serde_json::from_value(root.get("version").cloned().unwrap_or(Value::Null))?;
        let metadata = match root.get("metadata") {
            Some(raw) if raw.is_object() => Some(serde_json::from_value(raw.clone())?),
            _ => None,
        };

        Ok(Self {
            knowledge_id: text("knowledge_id"),
            domain: text("domain"),
            version,
            core_knowledge: extract_section(&root, "core_knowledge"),
            rules: extract_section(&root, "rules"),
            best_practices: extract_section(&root, "best_practices"),
            validation: extract_section(&root, "validation"),
            integration: extract_section(&root, "integration"),
            metadata,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, KnowledgeError> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let contract = Self::from_json_str(&raw)?;
        debug!(knowledge_id = %contract.knowledge_id, ?path, "Loaded knowledge contract");
        Ok(contract)
    }

    /// Write the contract as pretty-printed JSON, creating parent directories.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), KnowledgeError> {
        let path = path.as_ref();
        let io_err = |source| KnowledgeError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(io_err)?;
        info!(knowledge_id = %self.knowledge_id, ?path, "Knowledge contract saved");
        Ok(())
    }

    /// Structural check of the in-memory contract.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        match Identity::parse(&self.knowledge_id) {
            Some(identity) if identity.kind == IdentityKind::Knowledge => {}
            _ => result.errors.push(format!(
                "knowledge_id: malformed identity '{}'",
                self.knowledge_id
            )),
        }
        if self.domain.is_empty() {
            result.missing("domain");
        }

        for (name, required) in REQUIRED_SECTIONS {
            let Some(section) = self.section(name) else {
                continue;
            };
            for sub in required {
                if !section.contains_key(sub) {
                    result.missing(format!("{}.{}", name, sub));
                }
            }
        }

        result
    }

    pub fn is_well_formed(&self) -> bool {
        self.validate().is_valid()
    }

    /// Declared compatibility of `agent_version` with `knowledge_version`.
    ///
    /// `None` when `knowledge_version` has no history entry.
    pub fn compatibility_claim(
        &self,
        knowledge_version: &Version,
        agent_version: &Version,
    ) -> Option<bool> {
        self.metadata
            .as_ref()
            .and_then(|m| m.version_history.get(knowledge_version))
            .map(|record| record.compatible_agent_versions.contains(agent_version))
    }

    /// Fail-closed compatibility: unknown pairs are incompatible.
    pub fn is_compatible(&self, knowledge_version: &Version, agent_version: &Version) -> bool {
        self.compatibility_claim(knowledge_version, agent_version)
            .unwrap_or(false)
    }

    /// Declare `agent_versions` compatible with `knowledge_version`.
    pub fn declare_compatible(
        mut self,
        knowledge_version: Version,
        agent_versions: impl IntoIterator<Item = Version>,
    ) -> Self {
        let metadata = self.metadata.get_or_insert_with(KnowledgeMetadata::default);
        metadata
            .version_history
            .entry(knowledge_version)
            .or_default()
            .compatible_agent_versions
            .extend(agent_versions);
        self
    }

    /// Insert one named entry, creating the category when needed.
    pub fn with_entry(mut self, section: &str, category: &str, name: &str, value: Value) -> Self {
        if let Some(target) = self.section_mut(section) {
            target
                .entry(category.to_string())
                .or_default()
                .insert(name.to_string(), value);
        } else {
            warn!(section, "Ignoring entry for unknown knowledge section");
        }
        self
    }

    pub fn sections(&self) -> [(&'static str, &Section); 5] {
        [
            ("core_knowledge", &self.core_knowledge),
            ("rules", &self.rules),
            ("best_practices", &self.best_practices),
            ("validation", &self.validation),
            ("integration", &self.integration),
        ]
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections()
            .into_iter()
            .find(|(section, _)| *section == name)
            .map(|(_, body)| body)
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        match name {
            "core_knowledge" => Some(&mut self.core_knowledge),
            "rules" => Some(&mut self.rules),
            "best_practices" => Some(&mut self.best_practices),
            "validation" => Some(&mut self.validation),
            "integration" => Some(&mut self.integration),
            _ => None,
        }
    }
}

fn extract_section(root: &Map<String, Value>, name: &str) -> Section {
    let Some(Value::Object(body)) = root.get(name) else {
        return Section::new();
    };
    body.iter()
        .filter_map(|(category, entries)| {
            let entries = entries.as_object()?;
            Some((
                category.clone(),
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Entries>(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn full_document() -> Value {
        json!({
            "knowledge_id": "Elementum-DSA-FINANCE-KNOWLEDGE-V1.0",
            "domain": "finance",
            "version": 1.0,
            "core_knowledge": {
                "concepts": {"budget": "A plan for spending"},
                "terminology": {"apr": "Annual percentage rate"},
                "principles": {}
            },
            "rules": {"constraints": {}, "requirements": {}, "guidelines": {}},
            "best_practices": {"recommended": {}, "optional": {}, "discouraged": {}},
            "validation": {"input": {}, "process": {}, "output": {}},
            "integration": {"apis": {}, "services": {}, "data_sources": {}},
            "metadata": {
                "author": "analyst",
                "version_history": {
                    "1.0": {"released": "2024-01-01", "compatible_agent_versions": ["1.0", 1.1]}
                }
            }
        })
    }

    #[test]
    fn test_complete_document_is_valid() {
        let result = KnowledgeValidator::validate(&full_document());
        assert!(result.is_valid(), "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_paths_are_reported() {
        let mut doc = full_document();
        let root = doc.as_object_mut().unwrap();
        root.remove("integration");
        root["rules"].as_object_mut().unwrap().remove("guidelines");
        root["validation"]["input"] = json!("not a mapping");

        let result = KnowledgeValidator::validate(&doc);
        assert_eq!(
            result.errors,
            vec![
                "rules.guidelines: missing".to_string(),
                "validation.input: expected mapping".to_string(),
                "integration: missing".to_string(),
            ]
        );
    }

    #[test]
    fn test_non_mapping_root_is_rejected() {
        let result = KnowledgeValidator::validate(&json!([1, 2, 3]));
        assert_eq!(result.errors, vec!["<root>: expected mapping".to_string()]);
    }

    #[test]
    fn test_from_value_keeps_malformed_sections_for_governance() {
        let mut doc = full_document();
        doc.as_object_mut().unwrap().remove("best_practices");

        let contract = KnowledgeContract::from_value(doc).unwrap();
        assert!(!contract.is_well_formed());
        assert!(contract
            .validate()
            .errors
            .contains(&"best_practices.recommended: missing".to_string()));
    }

    #[test]
    fn test_from_value_requires_identity() {
        let mut doc = full_document();
        doc.as_object_mut().unwrap().remove("knowledge_id");
        assert!(matches!(
            KnowledgeContract::from_value(doc),
            Err(KnowledgeError::MissingIdentity(_))
        ));
    }

    #[test]
    fn test_compatibility_is_exact_and_fail_closed() {
        let contract = KnowledgeContract::from_value(full_document()).unwrap();
        let v1 = Version::new(1, 0);

        assert!(contract.is_compatible(&v1, &Version::new(1, 0)));
        assert!(contract.is_compatible(&v1, &Version::new(1, 1)));
        assert!(!contract.is_compatible(&v1, &Version::new(2, 0)));
        assert_eq!(contract.compatibility_claim(&v1, &Version::new(2, 0)), Some(false));

        // No history entry for 2.0 at all.
        assert_eq!(contract.compatibility_claim(&Version::new(2, 0), &v1), None);
        assert!(!contract.is_compatible(&Version::new(2, 0), &v1));
    }

    #[test]
    fn test_new_contract_is_well_formed_without_history() {
        let contract = KnowledgeContract::new("Acme", "legal", Version::new(3, 1));
        assert_eq!(contract.knowledge_id, "Acme-LEGAL-KNOWLEDGE-V3.1");
        assert!(contract.is_well_formed());
        assert!(!contract.is_compatible(&Version::new(3, 1), &Version::new(3, 1)));

        let declared = contract.declare_compatible(Version::new(3, 1), [Version::new(3, 1)]);
        assert!(declared.is_compatible(&Version::new(3, 1), &Version::new(3, 1)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("finance.json");

        let contract = KnowledgeContract::from_value(full_document())
            .unwrap()
            .with_entry("rules", "constraints", "max_leverage", json!(3));
        contract.save_to_path(&path).unwrap();

        let reloaded = KnowledgeContract::from_path(&path).unwrap();
        assert_eq!(reloaded, contract);
        assert_eq!(
            reloaded.section("rules").unwrap()["constraints"]["max_leverage"],
            json!(3)
        );
    }

    fn version() -> impl Strategy<Value = Version> {
        (0..4u32, 0..4u32).prop_map(|(major, minor)| Version::new(major, minor))
    }

    proptest! {
        #[test]
        fn prop_undeclared_pairs_are_incompatible(knowledge in version(), agent in version()) {
            let contract = KnowledgeContract::new("Acme", "finance", Version::new(1, 0));
            prop_assert_eq!(contract.compatibility_claim(&knowledge, &agent), None);
            prop_assert!(!contract.is_compatible(&knowledge, &agent));
        }

        #[test]
        fn prop_only_declared_pair_is_compatible(
            knowledge in version(),
            agent in version(),
            other_knowledge in version(),
            other_agent in version(),
        ) {
            let contract = KnowledgeContract::new("Acme", "finance", Version::new(1, 0))
                .declare_compatible(knowledge, [agent]);
            prop_assert!(contract.is_compatible(&knowledge, &agent));

            let same_pair = other_knowledge == knowledge && other_agent == agent;
            prop_assert_eq!(contract.is_compatible(&other_knowledge, &other_agent), same_pair);
            if other_knowledge != knowledge {
                prop_assert_eq!(contract.compatibility_claim(&other_knowledge, &other_agent), None);
            }
        }
    }
}
