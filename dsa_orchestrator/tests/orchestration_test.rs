//! Integration tests for the orchestration facade.
//!
//! These drive registration, routing, governance, every dispatch protocol and
//! the metrics surface through the public API only.

use dsa_orchestrator::{
    agent::{Agent, AgentDescriptor, AgentReply, Context, EchoAgent, FnAgent, KnowledgeAgent},
    error::ErrorKind,
    identity::Version,
    knowledge::KnowledgeContract,
    monitoring::{MetricsScope, RecordKind},
    orchestrator::{CollaborationRequest, Orchestrator, QueryRequest, ResponseStatus},
    protocol::Protocol,
    settings::Settings,
    OrchestrationError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing_test::traced_test;

const ALPHA: &str = "Acme-ALPHA-AGENT-V1.0";
const BETA: &str = "Acme-BETA-AGENT-V1.0";
const GAMMA: &str = "Acme-GAMMA-AGENT-V1.0";

fn create_test_orchestrator() -> Orchestrator {
    Orchestrator::new(&Settings::default()).unwrap()
}

/// Agent that always answers with `value`.
fn returning(value: Value) -> Arc<dyn Agent> {
    Arc::new(FnAgent::new(move |_: &str, _: &Context| {
        AgentReply::from_value(value.clone())
    }))
}

fn finance(version: Version) -> AgentDescriptor {
    AgentDescriptor::new("Acme", "finance", version, ["budgeting", "forecasting"])
}

#[tokio::test]
#[traced_test]
async fn test_register_and_deregister_round_trip() {
    let orchestrator = create_test_orchestrator();
    let summary = orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();
    assert_eq!(summary.id, "Acme-FINANCE-AGENT-V1.0");

    let duplicate = orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap_err();
    assert_eq!(duplicate.kind(), ErrorKind::DuplicateIdentity);
    assert_eq!(orchestrator.get_available_agents().len(), 1);

    orchestrator.deregister_agent(&summary.id).unwrap();
    assert!(orchestrator.get_available_agents().is_empty());
    assert!(matches!(
        orchestrator.deregister_agent(&summary.id),
        Err(OrchestrationError::UnknownAgent(_))
    ));
}

#[tokio::test]
#[traced_test]
async fn test_dependency_blocks_deregistration() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();
    let reporting = AgentDescriptor::new("Acme", "reporting", Version::new(1, 0), ["reports"])
        .depends_on(["forecasting"]);
    orchestrator
        .register_agent(reporting, Arc::new(EchoAgent::new()))
        .unwrap();

    let err = orchestrator
        .deregister_agent("Acme-FINANCE-AGENT-V1.0")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyInUse);

    let orphan = AgentDescriptor::new("Acme", "audit", Version::new(1, 0), ["audit"])
        .depends_on(["Nope-X-AGENT-V1.0"]);
    let err = orchestrator
        .register_agent(orphan, Arc::new(EchoAgent::new()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnmetDependency);
}

#[tokio::test]
#[traced_test]
async fn test_domain_lookup_prefers_newest_version() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), returning(json!({"v": 1})))
        .unwrap();
    orchestrator
        .register_agent(finance(Version::new(2, 0)), returning(json!({"v": 2})))
        .unwrap();

    let versions: Vec<Version> = orchestrator
        .registry()
        .lookup_by_domain("finance")
        .iter()
        .map(|d| d.version)
        .collect();
    assert_eq!(versions, vec![Version::new(2, 0), Version::new(1, 0)]);

    let response = orchestrator.process_query("monthly budget", Some("finance")).await;
    assert!(response.is_success());
    assert_eq!(response.protocol, Some(Protocol::Mediated));
    assert_eq!(response.agent_id.as_deref(), Some("Acme-FINANCE-AGENT-V2.0"));
    assert_eq!(response.response, Some(json!({"v": 2})));
}

#[tokio::test]
#[traced_test]
async fn test_unknown_domain_fails_without_dispatch() {
    let orchestrator = create_test_orchestrator();
    let echo = Arc::new(EchoAgent::new());
    orchestrator
        .register_agent(finance(Version::new(1, 0)), echo.clone())
        .unwrap();

    let response = orchestrator.process_query("read my horoscope", Some("astrology")).await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.unwrap().kind, ErrorKind::NoAgentForDomain);
    assert_eq!(echo.request_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_classifier_routes_without_explicit_domain() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "legal", Version::new(1, 0), ["contracts", "litigation"]),
            Arc::new(EchoAgent::new()),
        )
        .unwrap();

    let response = orchestrator.process_query("review these contracts", None).await;
    assert!(response.is_success());
    assert_eq!(response.domain.as_deref(), Some("legal"));

    let response = orchestrator.process_query("hello there", None).await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::AmbiguousDomain);
}

#[tokio::test]
#[traced_test]
async fn test_incompatible_knowledge_is_not_routed() {
    let orchestrator = create_test_orchestrator();
    // No compatibility entry for this pair: fail closed.
    let undeclared = Arc::new(KnowledgeContract::new("Acme", "finance", Version::new(1, 0)));
    orchestrator
        .register_agent(
            finance(Version::new(1, 0)).knowledge(undeclared.clone()),
            Arc::new(KnowledgeAgent::new(undeclared)),
        )
        .unwrap();

    let response = orchestrator.process_query("budget", Some("finance")).await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::NoAgentForDomain);

    let declared = Arc::new(
        KnowledgeContract::new("Acme", "finance", Version::new(1, 0))
            .declare_compatible(Version::new(1, 0), [Version::new(2, 0)]),
    );
    orchestrator
        .register_agent(
            finance(Version::new(2, 0)).knowledge(declared.clone()),
            Arc::new(KnowledgeAgent::new(declared)),
        )
        .unwrap();

    let response = orchestrator.process_query("budget", Some("finance")).await;
    assert!(response.is_success());
    assert_eq!(response.agent_id.as_deref(), Some("Acme-FINANCE-AGENT-V2.0"));
}

#[tokio::test]
#[traced_test]
async fn test_collaboration_merges_supporting_results_in_order() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "alpha", Version::new(1, 0), ["alpha"]),
            returning(json!({"a": 1})),
        )
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "beta", Version::new(1, 0), ["beta"]),
            returning(json!({"b": 2})),
        )
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "gamma", Version::new(1, 0), ["gamma"]),
            returning(json!({"c": 3})),
        )
        .unwrap();

    let response = orchestrator
        .collaborate("q", ALPHA, &[BETA.to_string(), GAMMA.to_string()])
        .await;
    assert!(response.is_success());
    assert_eq!(response.protocol, Some(Protocol::Collaborative));
    assert_eq!(
        response.response,
        Some(json!({"a": 1, "supporting": [{"b": 2}, {"c": 3}]}))
    );
    assert_eq!(response.supporting_agents, vec![BETA, GAMMA]);
}

#[tokio::test]
#[traced_test]
async fn test_collaboration_with_failing_support_returns_partial() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "alpha", Version::new(1, 0), ["alpha"]),
            returning(json!({"a": 1})),
        )
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "beta", Version::new(1, 0), ["beta"]),
            Arc::new(FnAgent::new(|_: &str, _: &Context| {
                AgentReply::error("upstream unavailable")
            })),
        )
        .unwrap();

    let response = orchestrator
        .collaborate_with(CollaborationRequest {
            query: "q".into(),
            primary_id: ALPHA.into(),
            support_ids: vec![BETA.into()],
            ..CollaborationRequest::default()
        })
        .await;
    assert!(response.is_success());
    assert_eq!(response.response, Some(json!({"a": 1})));
    assert_eq!(response.failed_participants.len(), 1);
    assert_eq!(response.failed_participants[0].agent_id, BETA);
    assert_eq!(response.failed_participants[0].error.kind, ErrorKind::AgentFailure);
}

#[tokio::test]
#[traced_test]
async fn test_supervised_turns_post_check_failures_into_errors() {
    let mut settings = Settings::default();
    settings.governance.disallowed_markers = vec!["(?i)account number".to_string()];
    let orchestrator = Orchestrator::new(&settings).unwrap();
    orchestrator
        .register_agent(
            finance(Version::new(1, 0)),
            returning(json!({"answer": "your account number is 1234"})),
        )
        .unwrap();

    let direct = orchestrator
        .dispatch(QueryRequest {
            agent_id: Some("Acme-FINANCE-AGENT-V1.0".into()),
            ..QueryRequest::new("what is my balance")
        })
        .await;
    assert_eq!(direct.status, ResponseStatus::NonCompliant);
    assert!(direct.response.is_some());
    assert_eq!(direct.violations[0].rule, "safety");

    let supervised = orchestrator
        .dispatch(QueryRequest {
            agent_id: Some("Acme-FINANCE-AGENT-V1.0".into()),
            supervised: true,
            ..QueryRequest::new("what is my balance")
        })
        .await;
    assert_eq!(supervised.status, ResponseStatus::Blocked);
    assert_eq!(supervised.protocol, Some(Protocol::Supervised));
    assert!(supervised.response.is_none());
    assert_eq!(supervised.error.unwrap().kind, ErrorKind::GovernanceViolation);
}

#[tokio::test]
#[traced_test]
async fn test_pre_dispatch_veto_never_reaches_agent() {
    let mut settings = Settings::default();
    settings.governance.disallowed_markers = vec!["(?i)drop table".to_string()];
    let orchestrator = Orchestrator::new(&settings).unwrap();
    let echo = Arc::new(EchoAgent::new());
    orchestrator
        .register_agent(finance(Version::new(1, 0)), echo.clone())
        .unwrap();

    let response = orchestrator
        .process_query("please DROP TABLE budgets", Some("finance"))
        .await;
    assert_eq!(response.status, ResponseStatus::Blocked);
    assert_eq!(echo.request_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_success_rate_is_exact() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();

    for _ in 0..3 {
        assert!(orchestrator.process_query("budget", Some("finance")).await.is_success());
    }
    let failed = orchestrator.process_query("budget", Some("astrology")).await;
    assert_eq!(failed.status, ResponseStatus::Error);

    let overall = orchestrator.get_performance_metrics(None);
    assert_eq!(overall.count, 4);
    assert_eq!(overall.successes, 3);
    assert_eq!(overall.failures, 1);
    assert_eq!(overall.success_rate, 0.75);

    let agent = orchestrator
        .get_performance_metrics(Some(&MetricsScope::Agent("Acme-FINANCE-AGENT-V1.0".into())));
    assert_eq!(agent.count, 3);
    assert_eq!(agent.success_rate, 1.0);
}

#[tokio::test]
#[traced_test]
async fn test_each_request_writes_one_request_record() {
    let orchestrator = create_test_orchestrator();
    orchestrator.register_builtin_agents().unwrap();

    let responses = vec![
        orchestrator.process_query("ping", Some("diagnostics")).await,
        orchestrator.process_query("ping", Some("nowhere")).await,
        orchestrator
            .collaborate("ping", "Builtin-DIAGNOSTICS-AGENT-V1.0", &[])
            .await,
    ];
    for response in &responses {
        let request_records = orchestrator
            .monitor()
            .records_for(&response.request_id)
            .into_iter()
            .filter(|r| r.kind == RecordKind::Request)
            .count();
        assert_eq!(request_records, 1, "request {}", response.request_id);
    }
}

#[tokio::test]
#[traced_test]
async fn test_available_agents_is_stable() {
    let orchestrator = create_test_orchestrator();
    orchestrator.register_builtin_agents().unwrap();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();

    let first = orchestrator.get_available_agents();
    let second = orchestrator.get_available_agents();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].id, "Builtin-DIAGNOSTICS-AGENT-V1.0");
}

#[tokio::test]
#[traced_test]
async fn test_feedback_feeds_agent_accuracy() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(finance(Version::new(1, 0)), Arc::new(EchoAgent::new()))
        .unwrap();

    let score = orchestrator
        .submit_feedback(
            "Acme-FINANCE-AGENT-V1.0",
            &json!({"total": 10, "currency": "EUR"}),
            Some(&json!({"total": 10, "period": "monthly"})),
        )
        .unwrap();
    assert_eq!(score, 0.5);

    let metrics = orchestrator
        .get_performance_metrics(Some(&MetricsScope::Agent("Acme-FINANCE-AGENT-V1.0".into())));
    assert_eq!(metrics.mean_accuracy, Some(0.5));
}

#[tokio::test]
#[traced_test]
async fn test_routing_falls_through_when_best_domain_is_incompatible() {
    let orchestrator = create_test_orchestrator();
    let undeclared = Arc::new(KnowledgeContract::new("Acme", "finance", Version::new(1, 0)));
    orchestrator
        .register_agent(
            finance(Version::new(1, 0)).knowledge(undeclared.clone()),
            Arc::new(KnowledgeAgent::new(undeclared)),
        )
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "legal", Version::new(1, 0), ["contract"]),
            returning(json!({"answer": "legal"})),
        )
        .unwrap();

    for supervised in [false, true] {
        let response = orchestrator
            .dispatch(QueryRequest {
                supervised,
                ..QueryRequest::new("budgeting forecasting contract")
            })
            .await;
        assert_eq!(response.status, ResponseStatus::Success, "supervised={}", supervised);
        assert_eq!(response.agent_id.as_deref(), Some("Acme-LEGAL-AGENT-V1.0"));
        assert_eq!(response.domain.as_deref(), Some("legal"));
        assert!(response.violations.is_empty());
    }
}

#[tokio::test]
#[traced_test]
async fn test_collaboration_primary_timeout_reports_timeout() {
    let orchestrator = create_test_orchestrator();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "alpha", Version::new(1, 0), ["alpha"]),
            Arc::new(SlowAgent),
        )
        .unwrap();
    orchestrator
        .register_agent(
            AgentDescriptor::new("Acme", "beta", Version::new(1, 0), ["beta"]),
            returning(json!({"b": 2})),
        )
        .unwrap();

    let response = orchestrator
        .collaborate_with(CollaborationRequest {
            query: "q".into(),
            primary_id: ALPHA.into(),
            support_ids: vec![BETA.into()],
            timeout_ms: Some(20),
            ..CollaborationRequest::default()
        })
        .await;
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error.unwrap().kind, ErrorKind::Timeout);
}

struct SlowAgent;

#[async_trait::async_trait]
impl Agent for SlowAgent {
    async fn handle(&self, _query: &str, _context: &Context) -> AgentReply {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        AgentReply::from_value(json!({"late": true}))
    }
}
