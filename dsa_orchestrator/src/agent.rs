//! Agent capability interface, descriptors and built-in agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::identity::{domain_tag, Identity, IdentityKind, Version};
use crate::knowledge::KnowledgeContract;

/// Free-form request context handed to every agent call.
pub type Context = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Ok,
    Error,
}

/// Result mapping plus status returned by [`Agent::handle`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub status: AgentStatus,
    pub result: Map<String, Value>,
}

impl AgentReply {
    pub fn ok(result: Map<String, Value>) -> Self {
        Self {
            status: AgentStatus::Ok,
            result,
        }
    }

    /// Successful reply from any JSON value; non-objects land under `result`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::ok(map),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                Self::ok(map)
            }
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut result = Map::new();
        result.insert("error".to_string(), Value::String(message.into()));
        Self {
            status: AgentStatus::Error,
            result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AgentStatus::Ok
    }

    /// Human-readable failure reason of an error reply.
    pub fn error_message(&self) -> String {
        match self.result.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => "agent reported an error".to_string(),
        }
    }
}

/// The single capability every agent exposes, regardless of domain.
///
/// Implementations may do arbitrary work, including blocking I/O; long
/// blocking sections should be moved onto `tokio::task::spawn_blocking`.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle(&self, query: &str, context: &Context) -> AgentReply;
}

/// Adapter turning a plain closure into an [`Agent`].
pub struct FnAgent<F> {
    f: F,
}

impl<F> FnAgent<F>
where
    F: Fn(&str, &Context) -> AgentReply + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Agent for FnAgent<F>
where
    F: Fn(&str, &Context) -> AgentReply + Send + Sync,
{
    async fn handle(&self, query: &str, context: &Context) -> AgentReply {
        (self.f)(query, context)
    }
}

/// Registration-time description of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub version: Version,
    pub capabilities: BTreeSet<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip)]
    pub knowledge: Option<Arc<KnowledgeContract>>,
}

impl AgentDescriptor {
    /// Descriptor with the canonical `<Namespace>-<DOMAIN>-AGENT-V<version>` identity.
    pub fn new<I, S>(namespace: &str, domain: &str, version: Version, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_id(
            Identity::agent(namespace, domain, version),
            domain,
            version,
            capabilities,
        )
    }

    pub fn with_id<I, S>(id: impl Into<String>, domain: &str, version: Version, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            domain: domain.to_string(),
            aliases: Vec::new(),
            version,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            dependencies: Vec::new(),
            knowledge: None,
        }
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn knowledge(mut self, contract: Arc<KnowledgeContract>) -> Self {
        self.knowledge = Some(contract);
        self
    }

    /// Check the descriptor invariants that do not depend on registry state.
    pub fn validate(&self) -> Result<(), String> {
        let identity = match Identity::parse(&self.id) {
            Some(identity) if identity.kind == IdentityKind::Agent => identity,
            _ => {
                return Err(format!(
                    "identity '{}' does not match <Namespace>-<DOMAIN>-AGENT-V<major>[.<minor>]",
                    self.id
                ))
            }
        };
        if self.domain.trim().is_empty() {
            return Err(format!("agent '{}' has an empty domain", self.id));
        }
        if identity.domain_tag != domain_tag(&self.domain) {
            return Err(format!(
                "identity '{}' names domain {} but the descriptor declares '{}'",
                self.id, identity.domain_tag, self.domain
            ));
        }
        if identity.version != self.version {
            return Err(format!(
                "identity '{}' names version {} but the descriptor declares {}",
                self.id, identity.version, self.version
            ));
        }
        if self.capabilities.is_empty() {
            return Err(format!("agent '{}' declares no capabilities", self.id));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(format!("agent '{}' cannot depend on itself", self.id));
        }
        Ok(())
    }

    /// Whether this agent may answer for `domain`, directly or by alias.
    pub fn serves_domain(&self, domain: &str) -> bool {
        self.domain == domain || self.aliases.iter().any(|a| a == domain)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            domain: self.domain.clone(),
            version: self.version,
            capabilities: self.capabilities.iter().cloned().collect(),
            dependencies: self.dependencies.clone(),
            knowledge_id: self.knowledge.as_ref().map(|k| k.knowledge_id.clone()),
            knowledge_well_formed: self.knowledge.as_ref().map(|k| k.is_well_formed()),
        }
    }
}

/// Public listing entry for a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub domain: String,
    pub version: Version,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_well_formed: Option<bool>,
}

// --- Built-in Agents ---

/// Diagnostic agent that reflects the query and context keys back.
#[derive(Default)]
pub struct EchoAgent {
    request_count: AtomicU64,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn handle(&self, query: &str, context: &Context) -> AgentReply {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        AgentReply::from_value(json!({
            "echo": query,
            "context_keys": context.keys().collect::<Vec<_>>(),
        }))
    }
}

/// Generic domain agent answering from its knowledge contract.
///
/// Query terms are matched against the `core_knowledge.terminology` and
/// `core_knowledge.concepts` categories; matching `rules.guidelines` are
/// attached as advice.
pub struct KnowledgeAgent {
    contract: Arc<KnowledgeContract>,
}

impl KnowledgeAgent {
    pub fn new(contract: Arc<KnowledgeContract>) -> Self {
        Self { contract }
    }

    fn parse_terms(query: &str) -> BTreeSet<String> {
        query
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 2)
            .map(str::to_lowercase)
            .collect()
    }

    fn lookup(&self, category: &str, terms: &BTreeSet<String>) -> BTreeMap<String, Value> {
        let Some(entries) = self.contract.core_knowledge.get(category) else {
            return BTreeMap::new();
        };
        entries
            .iter()
            .filter(|(name, _)| {
                let name = name.to_lowercase();
                terms.contains(&name) || name.split('_').any(|part| terms.contains(part))
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl Agent for KnowledgeAgent {
    async fn handle(&self, query: &str, _context: &Context) -> AgentReply {
        let terms = Self::parse_terms(query);
        let terminology = self.lookup("terminology", &terms);
        let concepts = self.lookup("concepts", &terms);
        let guidelines = self
            .contract
            .rules
            .get("guidelines")
            .cloned()
            .unwrap_or_default();

        debug!(
            knowledge_id = %self.contract.knowledge_id,
            matched = terminology.len() + concepts.len(),
            "Knowledge lookup completed"
        );

        AgentReply::from_value(json!({
            "domain": self.contract.domain,
            "knowledge_id": self.contract.knowledge_id,
            "answered": !(terminology.is_empty() && concepts.is_empty()),
            "terminology": terminology,
            "concepts": concepts,
            "guidelines": guidelines,
        }))
    }
}
