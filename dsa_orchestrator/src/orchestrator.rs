//! Orchestration facade: router → governance → dispatcher → monitoring.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn, Span};
use uuid::Uuid;

use crate::agent::{Agent, AgentDescriptor, AgentSummary, Context, EchoAgent, KnowledgeAgent};
use crate::error::{ErrorBody, OrchestrationError};
use crate::governance::{GovernanceEngine, GovernanceRule, RuleResult};
use crate::identity::Version;
use crate::knowledge::KnowledgeContract;
use crate::monitoring::{AggregateMetrics, MetricsScope, MonitoringCollector, RecordKind, Stopwatch};
use crate::protocol::{
    AppendSupporting, Deadline, DispatchConfig, DispatchOutcome, DispatchRequest, Dispatcher,
    FailedParticipant, MergeStrategy, Protocol,
};
use crate::registry::AgentRegistry;
use crate::router::{CapabilityKeywordClassifier, DomainClassifier, Router};
use crate::settings::{AgentSpec, Settings};

/// A single-agent request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Target a specific agent (direct protocol) instead of routing.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    /// Strict governance: non-compliant results become errors.
    #[serde(default)]
    pub supervised: bool,
    #[serde(default)]
    pub context: Context,
    /// Overrides the configured request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaborationRequest {
    pub query: String,
    pub primary_id: String,
    #[serde(default)]
    pub support_ids: Vec<String>,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    NonCompliant,
    /// Vetoed by governance.
    Blocked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RuleResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supporting_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_participants: Vec<FailedParticipant>,
    pub performance: Performance,
}

impl OrchestrationResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub overall: AggregateMetrics,
    pub agents: Vec<AggregateMetrics>,
}

/// Builder for an [`Orchestrator`] with replaceable strategies.
pub struct OrchestratorBuilder {
    settings: Settings,
    classifier: Arc<dyn DomainClassifier>,
    merge: Option<Arc<dyn MergeStrategy>>,
    extra_rules: Vec<Arc<dyn GovernanceRule>>,
}

impl OrchestratorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            classifier: Arc::new(CapabilityKeywordClassifier),
            merge: None,
            extra_rules: Vec::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DomainClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Appended after the built-in rules.
    pub fn with_rule(mut self, rule: Arc<dyn GovernanceRule>) -> Self {
        self.extra_rules.push(rule);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        let mut governance = GovernanceEngine::with_default_rules(&settings.governance)
            .context("failed to compile governance rules")?;
        for rule in self.extra_rules {
            governance = governance.with_rule(rule);
        }

        let registry = Arc::new(AgentRegistry::new());
        let monitor = Arc::new(MonitoringCollector::new(&settings.monitoring));
        let merge = self.merge.unwrap_or_else(|| {
            Arc::new(AppendSupporting::new(settings.orchestrator.supporting_key.clone()))
        });
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(governance),
            monitor.clone(),
            DispatchConfig {
                partial_results: settings.orchestrator.partial_results,
                concurrent_support: settings.orchestrator.concurrent_support,
                merge,
            },
        );
        let router = Router::new(
            registry.clone(),
            self.classifier,
            settings.orchestrator.min_classifier_score,
        );

        let orchestrator = Orchestrator {
            registry,
            router,
            dispatcher,
            monitor,
            request_timeout: settings.request_timeout(),
            default_window: settings.default_window(),
        };
        for spec in &settings.agents {
            orchestrator.register_from_spec(spec)?;
        }
        info!(agents = orchestrator.registry.len(), "Orchestrator ready");
        Ok(orchestrator)
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    router: Router,
    dispatcher: Dispatcher,
    monitor: Arc<MonitoringCollector>,
    request_timeout: Option<Duration>,
    default_window: Option<Duration>,
}

impl Orchestrator {
    #[instrument(skip(settings))]
    pub fn new(settings: &Settings) -> Result<Self> {
        OrchestratorBuilder::new(settings.clone()).build()
    }

    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<MonitoringCollector> {
        &self.monitor
    }

    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        handler: Arc<dyn Agent>,
    ) -> Result<AgentSummary, OrchestrationError> {
        self.registry
            .register(descriptor, handler)
            .map(|d| d.summary())
    }

    pub fn deregister_agent(&self, id: &str) -> Result<AgentSummary, OrchestrationError> {
        self.registry.deregister(id).map(|d| d.summary())
    }

    /// Register the diagnostic echo agent as `Builtin-DIAGNOSTICS-AGENT-V1.0`.
    pub fn register_builtin_agents(&self) -> Result<(), OrchestrationError> {
        let echo = AgentDescriptor::new("Builtin", "diagnostics", Version::new(1, 0), ["echo", "diagnostics"]);
        self.register_agent(echo, Arc::new(EchoAgent::new()))?;
        Ok(())
    }

    /// Load a knowledge file and register a [`KnowledgeAgent`] answering from it.
    pub fn register_from_spec(&self, spec: &AgentSpec) -> Result<AgentSummary> {
        let contract = Arc::new(
            KnowledgeContract::from_path(&spec.knowledge)
                .with_context(|| format!("failed to load knowledge for '{}'", spec.domain))?,
        );
        let report = contract.validate();
        if !report.is_valid() {
            warn!(
                knowledge_id = %contract.knowledge_id,
                errors = ?report.errors,
                "Knowledge contract is malformed; governance will block its agent"
            );
        }
        let descriptor = AgentDescriptor::new(
            &spec.namespace,
            &spec.domain,
            spec.version,
            spec.capabilities.iter().cloned(),
        )
        .aliases(spec.aliases.iter().cloned())
        .depends_on(spec.dependencies.iter().cloned())
        .knowledge(contract.clone());

        Ok(self.register_agent(descriptor, Arc::new(KnowledgeAgent::new(contract)))?)
    }

    /// Registered agents in registration order.
    pub fn get_available_agents(&self) -> Vec<AgentSummary> {
        self.registry.summaries()
    }

    /// Route `query` to the best agent, optionally within `domain`.
    pub async fn process_query(&self, query: &str, domain: Option<&str>) -> OrchestrationResponse {
        self.dispatch(QueryRequest {
            domain: domain.map(str::to_string),
            ..QueryRequest::new(query)
        })
        .await
    }

    #[instrument(skip_all, fields(request_id = tracing::field::Empty, protocol = tracing::field::Empty))]
    pub async fn dispatch(&self, request: QueryRequest) -> OrchestrationResponse {
        let stopwatch = Stopwatch::start();
        let request_id = Uuid::new_v4().to_string();
        let protocol = match (&request.agent_id, request.supervised) {
            (_, true) => Protocol::Supervised,
            (Some(_), false) => Protocol::Direct,
            (None, false) => Protocol::Mediated,
        };
        Span::current().record("request_id", request_id.as_str());
        Span::current().record("protocol", tracing::field::display(protocol));

        let req = DispatchRequest {
            request_id: &request_id,
            query: &request.query,
            context: &request.context,
            requested_domain: request.domain.as_deref(),
            deadline: self.deadline(request.timeout_ms),
        };
        let result = self.run_single(protocol, &req, request.agent_id.as_deref()).await;

        let (agent_id, domain) = match &result {
            Ok((outcome, domain)) => (Some(outcome.primary.clone()), Some(domain.clone())),
            Err(_) => (request.agent_id.clone(), request.domain.clone()),
        };
        self.finish(
            &request_id,
            &stopwatch,
            protocol,
            &request.query,
            agent_id,
            domain,
            result.map(|(outcome, _)| outcome),
        )
    }

    async fn run_single(
        &self,
        protocol: Protocol,
        req: &DispatchRequest<'_>,
        agent_id: Option<&str>,
    ) -> Result<(DispatchOutcome, String), OrchestrationError> {
        if let Some(id) = agent_id {
            let agent = self
                .registry
                .get(id)
                .ok_or_else(|| OrchestrationError::UnknownAgent(id.to_string()))?;
            let outcome = match protocol {
                Protocol::Supervised => self.dispatcher.supervised(req, &agent).await?,
                _ => self.dispatcher.direct(req, &agent).await?,
            };
            return Ok((outcome, agent.domain.clone()));
        }

        let resolution = self.router.resolve(req.query, req.requested_domain)?;
        let outcome = match protocol {
            Protocol::Supervised => {
                let agent = resolution
                    .primary()
                    .ok_or_else(|| OrchestrationError::NoAgentForDomain(resolution.domain.clone()))?;
                let req = DispatchRequest {
                    requested_domain: Some(resolution.domain.as_str()),
                    ..*req
                };
                self.dispatcher.supervised(&req, agent).await?
            }
            _ => self.dispatcher.mediated(req, &resolution).await?,
        };
        Ok((outcome, resolution.domain))
    }

    /// Primary agent answers first, supporting agents contribute in order.
    pub async fn collaborate(
        &self,
        query: &str,
        primary_id: &str,
        support_ids: &[String],
    ) -> OrchestrationResponse {
        self.collaborate_with(CollaborationRequest {
            query: query.to_string(),
            primary_id: primary_id.to_string(),
            support_ids: support_ids.to_vec(),
            ..CollaborationRequest::default()
        })
        .await
    }

    #[instrument(skip_all, fields(request_id = tracing::field::Empty, agent_id = %request.primary_id, protocol = "collaborative"))]
    pub async fn collaborate_with(&self, request: CollaborationRequest) -> OrchestrationResponse {
        let stopwatch = Stopwatch::start();
        let request_id = Uuid::new_v4().to_string();
        Span::current().record("request_id", request_id.as_str());

        let req = DispatchRequest {
            request_id: &request_id,
            query: &request.query,
            context: &request.context,
            requested_domain: None,
            deadline: self.deadline(request.timeout_ms),
        };

        let lookup = |id: &String| {
            self.registry
                .get(id)
                .ok_or_else(|| OrchestrationError::UnknownAgent(id.clone()))
        };
        let participants = lookup(&request.primary_id).and_then(|primary| {
            let supporting = request
                .support_ids
                .iter()
                .map(lookup)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((primary, supporting))
        });

        let (domain, result) = match participants {
            Ok((primary, supporting)) => (
                Some(primary.domain.clone()),
                self.dispatcher.collaborative(&req, &primary, &supporting).await,
            ),
            Err(err) => (None, Err(err)),
        };

        let mut response = self.finish(
            &request_id,
            &stopwatch,
            Protocol::Collaborative,
            &request.query,
            Some(request.primary_id.clone()),
            domain,
            result,
        );
        if response.supporting_agents.is_empty() {
            response.supporting_agents = request.support_ids;
        }
        response
    }

    /// Build the response and write the request-level record.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request_id: &str,
        stopwatch: &Stopwatch,
        protocol: Protocol,
        query: &str,
        agent_id: Option<String>,
        domain: Option<String>,
        result: Result<DispatchOutcome, OrchestrationError>,
    ) -> OrchestrationResponse {
        let record = stopwatch
            .finish(request_id, RecordKind::Request, Some(protocol))
            .domain(domain.as_deref());

        let response = match result {
            Ok(outcome) => {
                self.monitor.record(
                    record
                        .agents(outcome.participants())
                        .non_compliant(&outcome.violations),
                );
                let status = if outcome.is_compliant() {
                    ResponseStatus::Success
                } else {
                    ResponseStatus::NonCompliant
                };
                OrchestrationResponse {
                    request_id: request_id.to_string(),
                    protocol: Some(protocol),
                    agent_id: Some(outcome.primary),
                    domain,
                    query: query.to_string(),
                    response: Some(Value::Object(outcome.result)),
                    error: None,
                    status,
                    violations: outcome.violations,
                    supporting_agents: outcome.supporting,
                    failed_participants: outcome.failed_participants,
                    performance: Performance {
                        response_time_ms: stopwatch.elapsed_ms(),
                    },
                }
            }
            Err(err) => {
                warn!(request_id, error = %err, "Request failed");
                self.monitor.record(
                    record
                        .agents(agent_id.iter())
                        .failed(err.kind(), err.violations()),
                );
                let status = match err {
                    OrchestrationError::GovernanceViolation { .. } => ResponseStatus::Blocked,
                    _ => ResponseStatus::Error,
                };
                OrchestrationResponse {
                    request_id: request_id.to_string(),
                    protocol: Some(protocol),
                    agent_id,
                    domain,
                    query: query.to_string(),
                    response: None,
                    error: Some(ErrorBody::from(&err)),
                    status,
                    violations: err.violations().to_vec(),
                    supporting_agents: Vec::new(),
                    failed_participants: Vec::new(),
                    performance: Performance {
                        response_time_ms: stopwatch.elapsed_ms(),
                    },
                }
            }
        };
        info!(
            request_id,
            status = ?response.status,
            response_time_ms = response.performance.response_time_ms,
            "Request completed"
        );
        response
    }

    fn deadline(&self, override_ms: Option<u64>) -> Option<Deadline> {
        let budget = match override_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.request_timeout,
        };
        budget.map(Deadline::after)
    }

    /// Aggregates for `scope` (all requests when `None`) over the default window.
    pub fn get_performance_metrics(&self, scope: Option<&MetricsScope>) -> AggregateMetrics {
        self.metrics_over(scope.unwrap_or(&MetricsScope::All), self.default_window)
    }

    pub fn metrics_over(&self, scope: &MetricsScope, window: Option<Duration>) -> AggregateMetrics {
        self.monitor.aggregate(scope, window)
    }

    pub fn performance_report(&self) -> PerformanceReport {
        PerformanceReport {
            overall: self.get_performance_metrics(None),
            agents: self.monitor.per_agent(self.default_window),
        }
    }

    /// Score a response for `agent_id` and keep it for its aggregates.
    pub fn submit_feedback(
        &self,
        agent_id: &str,
        response: &Value,
        expected: Option<&Value>,
    ) -> Result<f64, OrchestrationError> {
        if self.registry.get(agent_id).is_none() {
            return Err(OrchestrationError::UnknownAgent(agent_id.to_string()));
        }
        Ok(self.monitor.record_feedback(agent_id, response, expected))
    }
}
