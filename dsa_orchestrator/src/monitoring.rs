//! Dispatch records, aggregation and accuracy feedback.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::ErrorKind;
use crate::governance::RuleResult;
use crate::protocol::Protocol;
use crate::settings::MonitoringConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// One agent call.
    Participant,
    /// One facade request, whatever its outcome.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    NonCompliant,
    Error,
}

/// Immutable record of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub request_id: String,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Primary first.
    pub agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub latency_ms: f64,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl DispatchRecord {
    pub fn agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn domain(mut self, domain: Option<&str>) -> Self {
        self.domain = domain.map(str::to_string);
        self
    }

    pub fn non_compliant(mut self, violations: &[RuleResult]) -> Self {
        if !violations.is_empty() {
            self.status = OutcomeStatus::NonCompliant;
            self.violations = violations.iter().map(|v| v.rule.clone()).collect();
        }
        self
    }

    pub fn failed(mut self, kind: ErrorKind, violations: &[RuleResult]) -> Self {
        self.status = OutcomeStatus::Error;
        self.error_kind = Some(kind);
        self.violations = violations.iter().map(|v| v.rule.clone()).collect();
        self
    }
}

/// Wall-clock start time plus a monotonic timer for latency.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// A successful record ending now; refine it with the builder methods.
    pub fn finish(&self, request_id: &str, kind: RecordKind, protocol: Option<Protocol>) -> DispatchRecord {
        DispatchRecord {
            request_id: request_id.to_string(),
            kind,
            protocol,
            agents: Vec::new(),
            domain: None,
            started_at: self.started_at,
            finished_at: Utc::now(),
            latency_ms: self.elapsed_ms(),
            status: OutcomeStatus::Ok,
            error_kind: None,
            violations: Vec::new(),
        }
    }
}

/// What to aggregate over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum MetricsScope {
    /// Participant records of one agent.
    Agent(String),
    /// Request records resolved to one domain.
    Domain(String),
    /// Every request record.
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub scope: MetricsScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    pub non_compliant: usize,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_accuracy: Option<f64>,
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// 1.0 for an exact match, otherwise the share of expected top-level keys
/// present in the response. Without an expectation the score is 0.8.
pub fn accuracy_score(response: &Value, expected: Option<&Value>) -> f64 {
    let Some(expected) = expected else {
        return 0.8;
    };
    if response == expected {
        return 1.0;
    }
    match (response.as_object(), expected.as_object()) {
        (Some(response), Some(expected)) if !expected.is_empty() => {
            let shared = expected.keys().filter(|k| response.contains_key(*k)).count();
            shared as f64 / expected.len() as f64
        }
        _ => 0.0,
    }
}

/// Bounded record store shared by every request.
///
/// Records are immutable once written. When a limit is reached the oldest
/// record (or feedback score) is evicted to make room.
pub struct MonitoringCollector {
    records: RwLock<VecDeque<DispatchRecord>>,
    accuracy: DashMap<String, VecDeque<f64>>,
    max_records: usize,
    max_feedback: usize,
}

impl MonitoringCollector {
    pub fn new(config: &MonitoringConfig) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            accuracy: DashMap::new(),
            max_records: config.max_records,
            max_feedback: config.max_feedback_per_agent,
        }
    }

    pub fn record(&self, record: DispatchRecord) {
        debug!(
            request_id = %record.request_id,
            kind = ?record.kind,
            status = ?record.status,
            latency_ms = record.latency_ms,
            "Recorded dispatch"
        );
        let mut records = self.records.write();
        if self.max_records > 0 && records.len() >= self.max_records {
            if let Some(evicted) = records.pop_front() {
                debug!(request_id = %evicted.request_id, "Evicted oldest dispatch record");
            }
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.read().iter().cloned().collect()
    }

    pub fn records_for(&self, request_id: &str) -> Vec<DispatchRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Score `response` against `expected` and keep the score for `agent_id`.
    pub fn record_feedback(&self, agent_id: &str, response: &Value, expected: Option<&Value>) -> f64 {
        let score = accuracy_score(response, expected);
        let mut scores = self.accuracy.entry(agent_id.to_string()).or_default();
        if self.max_feedback > 0 && scores.len() >= self.max_feedback {
            scores.pop_front();
        }
        scores.push_back(score);
        score
    }

    pub fn aggregate(&self, scope: &MetricsScope, window: Option<Duration>) -> AggregateMetrics {
        let cutoff = window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .map(|w| Utc::now() - w);

        let selected: Vec<DispatchRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.finished_at >= c))
            .filter(|r| match scope {
                MetricsScope::Agent(id) => {
                    r.kind == RecordKind::Participant && r.agents.iter().any(|a| a == id)
                }
                MetricsScope::Domain(domain) => {
                    r.kind == RecordKind::Request && r.domain.as_deref() == Some(domain.as_str())
                }
                MetricsScope::All => r.kind == RecordKind::Request,
            })
            .cloned()
            .collect();

        let count = selected.len();
        let failures = selected
            .iter()
            .filter(|r| r.status == OutcomeStatus::Error)
            .count();
        let non_compliant = selected
            .iter()
            .filter(|r| r.status == OutcomeStatus::NonCompliant)
            .count();
        let successes = count - failures;

        let mut latencies: Vec<f64> = selected.iter().map(|r| r.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let mean_latency_ms = if count == 0 {
            0.0
        } else {
            latencies.iter().sum::<f64>() / count as f64
        };

        let agents: BTreeSet<&str> = match scope {
            MetricsScope::Agent(id) => BTreeSet::from([id.as_str()]),
            _ => selected
                .iter()
                .flat_map(|r| r.agents.iter().map(String::as_str))
                .collect(),
        };
        let scores: Vec<f64> = agents
            .iter()
            .filter_map(|id| self.accuracy.get(*id).map(|s| s.value().clone()))
            .flatten()
            .collect();
        let mean_accuracy =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        AggregateMetrics {
            scope: scope.clone(),
            window_secs: window.map(|w| w.as_secs()),
            count,
            successes,
            failures,
            non_compliant,
            success_rate: if count == 0 {
                0.0
            } else {
                successes as f64 / count as f64
            },
            mean_latency_ms,
            p50_latency_ms: percentile(&latencies, 50.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            mean_accuracy,
        }
    }

    /// Aggregates for every agent seen in a participant record.
    pub fn per_agent(&self, window: Option<Duration>) -> Vec<AggregateMetrics> {
        let agents: BTreeSet<String> = self
            .records
            .read()
            .iter()
            .filter(|r| r.kind == RecordKind::Participant)
            .flat_map(|r| r.agents.iter().cloned())
            .collect();
        agents
            .into_iter()
            .map(|id| self.aggregate(&MetricsScope::Agent(id), window))
            .collect()
    }
}
