//! Interaction protocols and the dispatcher executing them.
//!
//! Every agent call runs on its own task so a request deadline can stop
//! waiting on it; a call that misses the deadline is aborted and its late
//! result is dropped with the task.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentDescriptor, Context};
use crate::error::{ErrorBody, OrchestrationError, Result};
use crate::governance::{DispatchContext, GovernanceEngine, GovernanceMode, RuleResult, Stage, Verdict};
use crate::monitoring::{MonitoringCollector, RecordKind, Stopwatch};
use crate::registry::AgentRegistry;
use crate::router::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Direct,
    Mediated,
    Collaborative,
    Supervised,
}

impl Protocol {
    pub fn governance_mode(self) -> GovernanceMode {
        match self {
            Protocol::Supervised => GovernanceMode::Strict,
            _ => GovernanceMode::Advisory,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Direct => "direct",
            Protocol::Mediated => "mediated",
            Protocol::Collaborative => "collaborative",
            Protocol::Supervised => "supervised",
        })
    }
}

/// What happens when a supporting agent fails during collaboration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResultPolicy {
    /// Keep the accumulated result and list the failed participants.
    #[default]
    ReturnPartial,
    /// Any participant failure aborts the collaboration.
    Abort,
}

/// One supporting agent's result.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub agent_id: String,
    pub result: Map<String, Value>,
}

/// Combines the primary result with supporting contributions.
///
/// Must be a pure function of its inputs and never drop a primary field.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, primary: &Map<String, Value>, contributions: &[Contribution]) -> Map<String, Value>;
}

/// First key among `base`, `base_2`, `base_3`, ... not present in `primary`.
fn free_key(primary: &Map<String, Value>, base: &str) -> String {
    if !primary.contains_key(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|k| !primary.contains_key(k))
        .unwrap_or_else(|| base.to_string())
}

/// `{..primary, supporting: [contribution, ...]}` in declared order.
#[derive(Debug, Clone)]
pub struct AppendSupporting {
    key: String,
}

impl AppendSupporting {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for AppendSupporting {
    fn default() -> Self {
        Self::new("supporting")
    }
}

impl MergeStrategy for AppendSupporting {
    fn merge(&self, primary: &Map<String, Value>, contributions: &[Contribution]) -> Map<String, Value> {
        let mut merged = primary.clone();
        if contributions.is_empty() {
            return merged;
        }
        let key = free_key(primary, &self.key);
        let items = contributions
            .iter()
            .map(|c| Value::Object(c.result.clone()))
            .collect();
        merged.insert(key, Value::Array(items));
        merged
    }
}

/// `{..primary, contributions: {agent_id: result, ...}}`.
#[derive(Debug, Clone)]
pub struct KeyedByAgent {
    key: String,
}

impl KeyedByAgent {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl MergeStrategy for KeyedByAgent {
    fn merge(&self, primary: &Map<String, Value>, contributions: &[Contribution]) -> Map<String, Value> {
        let mut merged = primary.clone();
        if contributions.is_empty() {
            return merged;
        }
        let key = free_key(primary, &self.key);
        let by_agent = contributions
            .iter()
            .map(|c| (c.agent_id.clone(), Value::Object(c.result.clone())))
            .collect();
        merged.insert(key, Value::Object(by_agent));
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }
}

/// Request-scoped inputs shared by every participant call.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub request_id: &'a str,
    pub query: &'a str,
    pub context: &'a Context,
    pub requested_domain: Option<&'a str>,
    pub deadline: Option<Deadline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedParticipant {
    pub agent_id: String,
    pub error: ErrorBody,
}

/// Successful protocol execution, possibly non-compliant or partial.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub protocol: Protocol,
    pub primary: String,
    pub supporting: Vec<String>,
    pub result: Map<String, Value>,
    pub violations: Vec<RuleResult>,
    pub failed_participants: Vec<FailedParticipant>,
}

impl DispatchOutcome {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }

    /// Identities of every participant, primary first.
    pub fn participants(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.supporting.iter().cloned())
            .collect()
    }
}

/// Deadline expiry and governance vetoes keep their own kind; any other
/// participant failure aborts the collaboration.
fn abort_collaboration(agent_id: &str, role: &str, err: OrchestrationError) -> OrchestrationError {
    match err {
        OrchestrationError::Timeout { .. } | OrchestrationError::GovernanceViolation { .. } => err,
        other => OrchestrationError::CollaborationAborted {
            failed: vec![agent_id.to_string()],
            reason: format!("{} agent failed: {}", role, other),
        },
    }
}

#[derive(Clone)]
pub struct DispatchConfig {
    pub partial_results: PartialResultPolicy,
    pub concurrent_support: bool,
    pub merge: Arc<dyn MergeStrategy>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            partial_results: PartialResultPolicy::default(),
            concurrent_support: false,
            merge: Arc::new(AppendSupporting::default()),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    governance: Arc<GovernanceEngine>,
    monitor: Arc<MonitoringCollector>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        governance: Arc<GovernanceEngine>,
        monitor: Arc<MonitoringCollector>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            governance,
            monitor,
            config,
        }
    }

    /// Single call to a caller-chosen agent.
    #[instrument(skip_all, fields(request_id = req.request_id, agent_id = %agent.id, protocol = "direct"))]
    pub async fn direct(&self, req: &DispatchRequest<'_>, agent: &Arc<AgentDescriptor>) -> Result<DispatchOutcome> {
        self.single(Protocol::Direct, req, agent).await
    }

    /// Single call to the router's best candidate.
    #[instrument(skip_all, fields(request_id = req.request_id, domain = %resolution.domain, protocol = "mediated"))]
    pub async fn mediated(&self, req: &DispatchRequest<'_>, resolution: &Resolution) -> Result<DispatchOutcome> {
        let agent = resolution
            .primary()
            .ok_or_else(|| OrchestrationError::NoAgentForDomain(resolution.domain.clone()))?;
        let req = DispatchRequest {
            requested_domain: req.requested_domain.or(Some(resolution.domain.as_str())),
            ..*req
        };
        self.single(Protocol::Mediated, &req, agent).await
    }

    /// Direct call shape under strict governance.
    #[instrument(skip_all, fields(request_id = req.request_id, agent_id = %agent.id, protocol = "supervised"))]
    pub async fn supervised(&self, req: &DispatchRequest<'_>, agent: &Arc<AgentDescriptor>) -> Result<DispatchOutcome> {
        self.single(Protocol::Supervised, req, agent).await
    }

    async fn single(
        &self,
        protocol: Protocol,
        req: &DispatchRequest<'_>,
        agent: &Arc<AgentDescriptor>,
    ) -> Result<DispatchOutcome> {
        self.precheck(protocol, req, agent, req.requested_domain)?;
        let (result, violations) = self
            .participate(protocol, req, agent, req.context.clone())
            .await?;
        Ok(DispatchOutcome {
            protocol,
            primary: agent.id.clone(),
            supporting: Vec::new(),
            result,
            violations,
            failed_participants: Vec::new(),
        })
    }

    /// Primary first, then each supporting agent, merged in declared order.
    #[instrument(skip_all, fields(request_id = req.request_id, agent_id = %primary.id, protocol = "collaborative"))]
    pub async fn collaborative(
        &self,
        req: &DispatchRequest<'_>,
        primary: &Arc<AgentDescriptor>,
        supporting: &[Arc<AgentDescriptor>],
    ) -> Result<DispatchOutcome> {
        let protocol = Protocol::Collaborative;

        // Every participant is cleared before anyone is called.
        self.precheck(protocol, req, primary, req.requested_domain)?;
        for agent in supporting {
            self.precheck(protocol, req, agent, None)?;
        }

        let (primary_result, mut violations) = self
            .participate(protocol, req, primary, req.context.clone())
            .await
            .map_err(|err| abort_collaboration(&primary.id, "primary", err))?;

        let mut contributions: Vec<Contribution> = Vec::new();
        let mut failed: Vec<FailedParticipant> = Vec::new();

        let outcomes = if self.config.concurrent_support {
            let context = self.collaboration_context(req, &primary_result);
            join_all(
                supporting
                    .iter()
                    .map(|agent| self.participate(protocol, req, agent, context.clone())),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(supporting.len());
            let mut so_far: Vec<Contribution> = Vec::new();
            for agent in supporting {
                let accumulated = self.config.merge.merge(&primary_result, &so_far);
                let context = self.collaboration_context(req, &accumulated);
                let outcome = self.participate(protocol, req, agent, context).await;
                let failed = outcome.is_err();
                if let Ok((result, _)) = &outcome {
                    so_far.push(Contribution {
                        agent_id: agent.id.clone(),
                        result: result.clone(),
                    });
                }
                outcomes.push(outcome);
                if failed && self.config.partial_results == PartialResultPolicy::Abort {
                    break;
                }
            }
            outcomes
        };

        for (agent, outcome) in supporting.iter().zip(outcomes) {
            match outcome {
                Ok((result, mut flagged)) => {
                    violations.append(&mut flagged);
                    contributions.push(Contribution {
                        agent_id: agent.id.clone(),
                        result,
                    });
                }
                Err(err) => {
                    warn!(agent_id = %agent.id, error = %err, "Supporting agent failed");
                    if self.config.partial_results == PartialResultPolicy::Abort {
                        return Err(abort_collaboration(&agent.id, "supporting", err));
                    }
                    failed.push(FailedParticipant {
                        agent_id: agent.id.clone(),
                        error: ErrorBody::from(&err),
                    });
                }
            }
        }

        info!(
            contributions = contributions.len(),
            failed = failed.len(),
            "Collaboration completed"
        );
        Ok(DispatchOutcome {
            protocol,
            primary: primary.id.clone(),
            supporting: supporting.iter().map(|a| a.id.clone()).collect(),
            result: self.config.merge.merge(&primary_result, &contributions),
            violations,
            failed_participants: failed,
        })
    }

    fn collaboration_context(&self, req: &DispatchRequest<'_>, accumulated: &Map<String, Value>) -> Context {
        let mut context = Context::new();
        context.insert("original_query".to_string(), Value::String(req.query.to_string()));
        context.insert("original_context".to_string(), Value::Object(req.context.clone()));
        context.insert("accumulated_result".to_string(), Value::Object(accumulated.clone()));
        context
    }

    fn precheck(
        &self,
        protocol: Protocol,
        req: &DispatchRequest<'_>,
        agent: &AgentDescriptor,
        requested_domain: Option<&str>,
    ) -> Result<()> {
        let ctx = DispatchContext {
            request_id: req.request_id,
            protocol,
            requested_domain,
            agent,
            query: req.query,
            result: None,
        };
        match self
            .governance
            .evaluate(Stage::PreDispatch, &ctx, protocol.governance_mode())
        {
            Verdict::Compliant => Ok(()),
            Verdict::NonCompliant(violations) | Verdict::Veto(violations) => {
                Err(OrchestrationError::GovernanceViolation {
                    stage: Stage::PreDispatch,
                    violations,
                })
            }
        }
    }

    /// Call one agent, post-check its result and write its participant record.
    async fn participate(
        &self,
        protocol: Protocol,
        req: &DispatchRequest<'_>,
        agent: &Arc<AgentDescriptor>,
        context: Context,
    ) -> Result<(Map<String, Value>, Vec<RuleResult>)> {
        let stopwatch = Stopwatch::start();
        let record = |sw: &Stopwatch| {
            sw.finish(req.request_id, RecordKind::Participant, Some(protocol))
                .agents([agent.id.as_str()])
                .domain(Some(agent.domain.as_str()))
        };

        let result = match self.call(req, agent, context).await {
            Ok(result) => result,
            Err(err) => {
                self.monitor.record(record(&stopwatch).failed(err.kind(), &[]));
                return Err(err);
            }
        };

        let ctx = DispatchContext {
            request_id: req.request_id,
            protocol,
            requested_domain: req.requested_domain,
            agent,
            query: req.query,
            result: Some(&result),
        };
        match self
            .governance
            .evaluate(Stage::PostDispatch, &ctx, protocol.governance_mode())
        {
            Verdict::Compliant => {
                self.monitor.record(record(&stopwatch));
                Ok((result, Vec::new()))
            }
            Verdict::NonCompliant(violations) => {
                self.monitor.record(record(&stopwatch).non_compliant(&violations));
                Ok((result, violations))
            }
            Verdict::Veto(violations) => {
                let err = OrchestrationError::GovernanceViolation {
                    stage: Stage::PostDispatch,
                    violations,
                };
                self.monitor
                    .record(record(&stopwatch).failed(err.kind(), err.violations()));
                Err(err)
            }
        }
    }

    /// Run the agent on its own task, bounded by the request deadline.
    async fn call(
        &self,
        req: &DispatchRequest<'_>,
        agent: &AgentDescriptor,
        context: Context,
    ) -> Result<Map<String, Value>> {
        let handler = self.registry.handler(&agent.id)?;
        let query = req.query.to_string();
        let mut task = tokio::spawn(async move { handler.handle(&query, &context).await });

        let joined = match req.deadline {
            Some(deadline) => match timeout_at(deadline.at, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!(agent_id = %agent.id, budget = ?deadline.budget, "Agent call timed out");
                    return Err(OrchestrationError::Timeout {
                        agent: agent.id.clone(),
                        after: deadline.budget,
                    });
                }
            },
            None => task.await,
        };

        let reply = joined.map_err(|err| OrchestrationError::AgentFailure {
            agent: agent.id.clone(),
            message: format!("agent task did not complete: {}", err),
        })?;
        if !reply.is_ok() {
            return Err(OrchestrationError::AgentFailure {
                agent: agent.id.clone(),
                message: reply.error_message(),
            });
        }
        debug!(agent_id = %agent.id, keys = reply.result.len(), "Agent replied");
        Ok(reply.result)
    }
}
