//! Governance rules evaluated around every agent call.
//!
//! Pre-dispatch evaluation stops at the first failing rule and vetoes the call.
//! Post-dispatch evaluation runs every rule so all violations are reported;
//! whether they are fatal depends on the [`GovernanceMode`].

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::agent::AgentDescriptor;
use crate::protocol::Protocol;
use crate::settings::GovernanceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreDispatch,
    PostDispatch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::PreDispatch => "pre_dispatch",
            Stage::PostDispatch => "post_dispatch",
        })
    }
}

/// `Advisory` flags post-dispatch failures, `Strict` turns them into a veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GovernanceMode {
    #[default]
    Advisory,
    Strict,
}

/// Everything a rule may inspect about one agent call.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub request_id: &'a str,
    pub protocol: Protocol,
    pub requested_domain: Option<&'a str>,
    pub agent: &'a AgentDescriptor,
    pub query: &'a str,
    /// Agent output; only present post-dispatch.
    pub result: Option<&'a Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl RuleResult {
    pub fn pass(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            passed: true,
            remediation: None,
        }
    }

    pub fn fail(rule: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            passed: false,
            remediation: Some(remediation.into()),
        }
    }
}

pub trait GovernanceRule: Send + Sync {
    fn name(&self) -> &str;

    fn stages(&self) -> &'static [Stage] {
        &[Stage::PreDispatch, Stage::PostDispatch]
    }

    fn evaluate(&self, stage: Stage, ctx: &DispatchContext<'_>) -> RuleResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Compliant,
    /// Post-dispatch failures under advisory mode; the result is kept.
    NonCompliant(Vec<RuleResult>),
    /// The call must not proceed, or its result must be discarded.
    Veto(Vec<RuleResult>),
}

impl Verdict {
    pub fn is_compliant(&self) -> bool {
        matches!(self, Verdict::Compliant)
    }
}

/// Ordered list of rules shared by every request.
#[derive(Clone, Default)]
pub struct GovernanceEngine {
    rules: Vec<Arc<dyn GovernanceRule>>,
}

impl GovernanceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain boundary, safety and compliance, in that order.
    pub fn with_default_rules(config: &GovernanceConfig) -> Result<Self, regex::Error> {
        Ok(Self::new()
            .with_rule(Arc::new(DomainBoundaryRule::new(config.domain_aliases.clone())))
            .with_rule(Arc::new(SafetyRule::new(config)?))
            .with_rule(Arc::new(ComplianceRule::new(config.require_knowledge_contract))))
    }

    pub fn with_rule(mut self, rule: Arc<dyn GovernanceRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, stage: Stage, ctx: &DispatchContext<'_>, mode: GovernanceMode) -> Verdict {
        let applicable = self.rules.iter().filter(|r| r.stages().contains(&stage));
        let mut failures = Vec::new();

        for rule in applicable {
            let result = rule.evaluate(stage, ctx);
            if result.passed {
                continue;
            }
            warn!(
                request_id = ctx.request_id,
                agent_id = %ctx.agent.id,
                rule = %result.rule,
                %stage,
                "Governance rule failed"
            );
            failures.push(result);
            if stage == Stage::PreDispatch {
                break;
            }
        }

        if failures.is_empty() {
            debug!(request_id = ctx.request_id, %stage, "Governance check passed");
            return Verdict::Compliant;
        }
        match (stage, mode) {
            (Stage::PostDispatch, GovernanceMode::Advisory) => Verdict::NonCompliant(failures),
            _ => Verdict::Veto(failures),
        }
    }
}

// --- Built-in Rules ---

/// The agent must serve the requested domain directly or by alias.
pub struct DomainBoundaryRule {
    aliases: BTreeMap<String, Vec<String>>,
}

impl DomainBoundaryRule {
    pub fn new(aliases: BTreeMap<String, Vec<String>>) -> Self {
        Self { aliases }
    }

    fn configured_alias(&self, domain: &str, alias: &str) -> bool {
        self.aliases
            .get(domain)
            .is_some_and(|list| list.iter().any(|a| a == alias))
    }
}

impl GovernanceRule for DomainBoundaryRule {
    fn name(&self) -> &str {
        "domain_boundary"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::PreDispatch]
    }

    fn evaluate(&self, _stage: Stage, ctx: &DispatchContext<'_>) -> RuleResult {
        let Some(requested) = ctx.requested_domain else {
            return RuleResult::pass(self.name());
        };
        let agent_domain = ctx.agent.domain.as_str();
        if ctx.agent.serves_domain(requested)
            || self.configured_alias(agent_domain, requested)
            || self.configured_alias(requested, agent_domain)
        {
            RuleResult::pass(self.name())
        } else {
            RuleResult::fail(
                self.name(),
                format!(
                    "agent '{}' serves '{}', not '{}'; route to a '{}' agent or declare an alias",
                    ctx.agent.id, agent_domain, requested, requested
                ),
            )
        }
    }
}

/// Size limits and disallowed content markers on queries and results.
pub struct SafetyRule {
    max_query_bytes: usize,
    max_result_bytes: usize,
    markers: RegexSet,
}

impl SafetyRule {
    pub fn new(config: &GovernanceConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            max_query_bytes: config.max_query_bytes,
            max_result_bytes: config.max_result_bytes,
            markers: RegexSet::new(&config.disallowed_markers)?,
        })
    }

    fn check(&self, text: &str, limit: usize, what: &str) -> Option<String> {
        if text.len() > limit {
            return Some(format!("{} is {} bytes, limit is {}", what, text.len(), limit));
        }
        let hits = self.markers.matches(text);
        if hits.matched_any() {
            let patterns: Vec<&str> = hits
                .iter()
                .map(|i| self.markers.patterns()[i].as_str())
                .collect();
            return Some(format!(
                "{} contains disallowed content matching {}",
                what,
                patterns.join(", ")
            ));
        }
        None
    }
}

impl GovernanceRule for SafetyRule {
    fn name(&self) -> &str {
        "safety"
    }

    fn evaluate(&self, stage: Stage, ctx: &DispatchContext<'_>) -> RuleResult {
        let problem = match (stage, ctx.result) {
            (Stage::PostDispatch, Some(result)) => {
                let rendered = Value::Object(result.clone()).to_string();
                self.check(&rendered, self.max_result_bytes, "result")
            }
            _ => self.check(ctx.query, self.max_query_bytes, "query"),
        };
        match problem {
            Some(remediation) => RuleResult::fail(self.name(), remediation),
            None => RuleResult::pass(self.name()),
        }
    }
}

/// The agent's knowledge contract must be well-formed.
pub struct ComplianceRule {
    require_contract: bool,
}

impl ComplianceRule {
    pub fn new(require_contract: bool) -> Self {
        Self { require_contract }
    }
}

impl GovernanceRule for ComplianceRule {
    fn name(&self) -> &str {
        "compliance"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::PreDispatch]
    }

    fn evaluate(&self, _stage: Stage, ctx: &DispatchContext<'_>) -> RuleResult {
        match &ctx.agent.knowledge {
            None if self.require_contract => RuleResult::fail(
                self.name(),
                format!("agent '{}' has no knowledge contract attached", ctx.agent.id),
            ),
            None => RuleResult::pass(self.name()),
            Some(contract) => {
                let report = contract.validate();
                if report.is_valid() {
                    RuleResult::pass(self.name())
                } else {
                    RuleResult::fail(
                        self.name(),
                        format!(
                            "knowledge contract '{}' is malformed: {}",
                            contract.knowledge_id,
                            report.errors.join("; ")
                        ),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Version;
    use crate::knowledge::KnowledgeContract;
    use serde_json::json;

    fn config() -> GovernanceConfig {
        GovernanceConfig {
            max_query_bytes: 32,
            max_result_bytes: 64,
            disallowed_markers: vec![r"(?i)\bssn:\s*\d".to_string()],
            domain_aliases: BTreeMap::from([(
                "finance".to_string(),
                vec!["accounting".to_string()],
            )]),
            require_knowledge_contract: false,
        }
    }

    fn finance_agent() -> AgentDescriptor {
        AgentDescriptor::new("Acme", "finance", Version::new(1, 0), ["budgeting"]).aliases(["money"])
    }

    fn ctx<'a>(
        agent: &'a AgentDescriptor,
        domain: Option<&'a str>,
        query: &'a str,
        result: Option<&'a Map<String, Value>>,
    ) -> DispatchContext<'a> {
        DispatchContext {
            request_id: "req-1",
            protocol: Protocol::Direct,
            requested_domain: domain,
            agent,
            query,
            result,
        }
    }

    #[test]
    fn test_domain_boundary() {
        let rule = DomainBoundaryRule::new(config().domain_aliases);
        let agent = finance_agent();

        for domain in [None, Some("finance"), Some("money"), Some("accounting")] {
            assert!(rule.evaluate(Stage::PreDispatch, &ctx(&agent, domain, "q", None)).passed);
        }
        let failed = rule.evaluate(Stage::PreDispatch, &ctx(&agent, Some("legal"), "q", None));
        assert!(!failed.passed);
        assert!(failed.remediation.unwrap().contains("legal"));
    }

    #[test]
    fn test_safety_limits_and_markers() {
        let rule = SafetyRule::new(&config()).unwrap();
        let agent = finance_agent();

        assert!(rule.evaluate(Stage::PreDispatch, &ctx(&agent, None, "short", None)).passed);
        let long = "x".repeat(40);
        assert!(!rule.evaluate(Stage::PreDispatch, &ctx(&agent, None, &long, None)).passed);
        assert!(!rule.evaluate(Stage::PreDispatch, &ctx(&agent, None, "SSN: 123", None)).passed);

        let leaky = json!({"note": "ssn: 9"}).as_object().cloned().unwrap();
        let verdict = rule.evaluate(Stage::PostDispatch, &ctx(&agent, None, "ok", Some(&leaky)));
        assert!(!verdict.passed);
        assert!(verdict.remediation.unwrap().starts_with("result"));
    }

    #[test]
    fn test_compliance_checks_contract() {
        let malformed = KnowledgeContract::from_value(json!({
            "knowledge_id": "Acme-FINANCE-KNOWLEDGE-V1.0",
            "domain": "finance",
            "version": 1.0,
        }))
        .unwrap();
        let bare = finance_agent();
        let good = finance_agent().knowledge(Arc::new(KnowledgeContract::new(
            "Acme",
            "finance",
            Version::new(1, 0),
        )));
        let bad = finance_agent().knowledge(Arc::new(malformed));

        let lenient = ComplianceRule::new(false);
        assert!(lenient.evaluate(Stage::PreDispatch, &ctx(&bare, None, "q", None)).passed);
        assert!(lenient.evaluate(Stage::PreDispatch, &ctx(&good, None, "q", None)).passed);
        assert!(!lenient.evaluate(Stage::PreDispatch, &ctx(&bad, None, "q", None)).passed);

        let strict = ComplianceRule::new(true);
        assert!(!strict.evaluate(Stage::PreDispatch, &ctx(&bare, None, "q", None)).passed);
    }

    struct AlwaysFail(&'static str);

    impl GovernanceRule for AlwaysFail {
        fn name(&self) -> &str {
            self.0
        }

        fn evaluate(&self, _stage: Stage, _ctx: &DispatchContext<'_>) -> RuleResult {
            RuleResult::fail(self.0, "never passes")
        }
    }

    #[test]
    fn test_pre_dispatch_short_circuits() {
        let engine = GovernanceEngine::new()
            .with_rule(Arc::new(AlwaysFail("first")))
            .with_rule(Arc::new(AlwaysFail("second")));
        let agent = finance_agent();
        let c = ctx(&agent, None, "q", None);

        match engine.evaluate(Stage::PreDispatch, &c, GovernanceMode::Advisory) {
            Verdict::Veto(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].rule, "first");
            }
            other => panic!("expected veto, got {:?}", other),
        }
    }

    #[test]
    fn test_post_dispatch_collects_all_and_respects_mode() {
        let engine = GovernanceEngine::new()
            .with_rule(Arc::new(AlwaysFail("first")))
            .with_rule(Arc::new(AlwaysFail("second")));
        let agent = finance_agent();
        let result = Map::new();
        let c = ctx(&agent, None, "q", Some(&result));

        let advisory = engine.evaluate(Stage::PostDispatch, &c, GovernanceMode::Advisory);
        assert!(matches!(advisory, Verdict::NonCompliant(ref v) if v.len() == 2));

        let strict = engine.evaluate(Stage::PostDispatch, &c, GovernanceMode::Strict);
        assert!(matches!(strict, Verdict::Veto(ref v) if v.len() == 2));
    }

    #[test]
    fn test_default_rules_order() {
        let engine = GovernanceEngine::with_default_rules(&config()).unwrap();
        assert_eq!(engine.rule_names(), vec!["domain_boundary", "safety", "compliance"]);

        let agent = finance_agent();
        let ok = engine.evaluate(
            Stage::PreDispatch,
            &ctx(&agent, Some("finance"), "budget help", None),
            GovernanceMode::Strict,
        );
        assert!(ok.is_compliant());
    }
}
