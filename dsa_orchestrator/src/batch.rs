//! Batch query runner.
//!
//! Runs a TOML or JSON file of single or collaborative queries against one
//! orchestrator with bounded concurrency, prints a summary and optionally
//! writes every response to a JSON file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::agent::Context as QueryContext;
use crate::orchestrator::{
    CollaborationRequest, OrchestrationResponse, Orchestrator, QueryRequest, ResponseStatus,
};
use crate::settings::Settings;

/// Batch job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,

    #[serde(default)]
    pub settings: BatchSettings,

    pub queries: Vec<BatchQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
}

/// One query; `primary_id` makes it collaborative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchQuery {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub supervised: bool,
    #[serde(default)]
    pub primary_id: Option<String>,
    #[serde(default)]
    pub support_ids: Vec<String>,
    #[serde(default)]
    pub context: QueryContext,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_queries: usize,

    pub output_file: Option<PathBuf>,

    /// Skip queries not yet started once one fails.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent(),
            output_file: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    NonCompliant,
    Failed,
    Skipped,
}

impl From<ResponseStatus> for QueryStatus {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Success => QueryStatus::Success,
            ResponseStatus::NonCompliant => QueryStatus::NonCompliant,
            ResponseStatus::Blocked | ResponseStatus::Error => QueryStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub status: QueryStatus,
    pub response: Option<OrchestrationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_queries: usize,
    pub successful_queries: usize,
    pub non_compliant_queries: usize,
    pub failed_queries: usize,
    pub skipped_queries: usize,
    pub total_duration_ms: u64,
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Execute a batch file with a freshly built orchestrator.
#[instrument(skip(settings))]
pub async fn run(config_path: PathBuf, output: Option<PathBuf>, settings: Settings) -> Result<()> {
    info!("Starting batch execution from {:?}", config_path);

    let mut config = load_batch_config(&config_path).context("Failed to load batch configuration")?;
    if output.is_some() {
        config.settings.output_file = output;
    }
    let output_file = config.settings.output_file.clone();

    let orchestrator = Orchestrator::new(&settings).context("Failed to initialize orchestrator")?;
    orchestrator.register_builtin_agents()?;

    let result = execute_batch(Arc::new(orchestrator), config).await?;
    print_batch_summary(&result);

    if let Some(path) = output_file {
        save_batch_results(&result, &path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!("Batch execution failed: no query succeeded"))
        }
    }
}

/// Parse a batch file; `.json` files are JSON, everything else TOML.
pub fn load_batch_config(path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {:?}", path))?;

    let config: BatchConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON batch file: {:?}", path))?,
        _ => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML batch file: {:?}", path))?,
    };

    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.queries.is_empty() {
        return Err(anyhow!("Batch file must contain at least one query"));
    }
    if config.settings.max_concurrent_queries == 0 {
        return Err(anyhow!("max_concurrent_queries must be at least 1"));
    }

    let mut ids = HashSet::new();
    for query in &config.queries {
        if !ids.insert(&query.id) {
            return Err(anyhow!("Duplicate query ID: {}", query.id));
        }
        if query.primary_id.is_none() && !query.support_ids.is_empty() {
            return Err(anyhow!("Query {} lists support agents without a primary_id", query.id));
        }
    }
    Ok(())
}

/// Run every query, at most `max_concurrent_queries` at a time. Results keep file order.
pub async fn execute_batch(orchestrator: Arc<Orchestrator>, config: BatchConfig) -> Result<BatchResult> {
    let start_time = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.settings.max_concurrent_queries));
    let stop = Arc::new(AtomicBool::new(false));
    let fail_fast = config.settings.fail_fast;

    let handles: Vec<_> = config
        .queries
        .into_iter()
        .map(|query| {
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                if stop.load(Ordering::SeqCst) {
                    return Ok::<_, anyhow::Error>(QueryResult {
                        query_id: query.id,
                        status: QueryStatus::Skipped,
                        response: None,
                    });
                }
                let result = execute_query(&orchestrator, query).await;
                if fail_fast && result.status == QueryStatus::Failed {
                    stop.store(true, Ordering::SeqCst);
                }
                Ok(result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await??);
    }

    let count = |status: QueryStatus| results.iter().filter(|r| r.status == status).count();
    let successful_queries = count(QueryStatus::Success);
    let non_compliant_queries = count(QueryStatus::NonCompliant);
    let failed_queries = count(QueryStatus::Failed);
    let skipped_queries = count(QueryStatus::Skipped);

    let status = if failed_queries == 0 && skipped_queries == 0 {
        BatchStatus::Success
    } else if successful_queries + non_compliant_queries > 0 {
        BatchStatus::PartialSuccess
    } else {
        BatchStatus::Failed
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total_queries: results.len(),
        successful_queries,
        non_compliant_queries,
        failed_queries,
        skipped_queries,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        results,
    })
}

async fn execute_query(orchestrator: &Orchestrator, query: BatchQuery) -> QueryResult {
    info!("Executing query: {}", query.id);

    let response = match query.primary_id {
        Some(primary_id) => {
            orchestrator
                .collaborate_with(CollaborationRequest {
                    query: query.query,
                    primary_id,
                    support_ids: query.support_ids,
                    context: query.context,
                    timeout_ms: query.timeout_ms,
                })
                .await
        }
        None => {
            orchestrator
                .dispatch(QueryRequest {
                    query: query.query,
                    agent_id: query.agent_id,
                    domain: query.domain,
                    supervised: query.supervised,
                    context: query.context,
                    timeout_ms: query.timeout_ms,
                })
                .await
        }
    };

    QueryResult {
        query_id: query.id,
        status: response.status.into(),
        response: Some(response),
    }
}

fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Queries: {}", result.total_queries);
    println!("Successful: {}", result.successful_queries);
    println!("Non-compliant: {}", result.non_compliant_queries);
    println!("Failed: {}", result.failed_queries);
    println!("Skipped: {}", result.skipped_queries);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed_queries > 0 {
        println!("\nFailed Queries:");
        for query in result.results.iter().filter(|r| r.status == QueryStatus::Failed) {
            let reason = query
                .response
                .as_ref()
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.as_str())
                .unwrap_or("Unknown error");
            println!("  - {}: {}", query.query_id, reason);
        }
    }
    println!("===============================\n");
}

fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;

    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;

    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_max_concurrent() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn query(id: &str, text: &str) -> BatchQuery {
        BatchQuery {
            id: id.to_string(),
            query: text.to_string(),
            ..BatchQuery::default()
        }
    }

    fn config(queries: Vec<BatchQuery>) -> BatchConfig {
        BatchConfig {
            job: JobMetadata {
                name: "test_job".to_string(),
                description: None,
            },
            settings: BatchSettings::default(),
            queries,
        }
    }

    #[test]
    fn test_batch_config_validation() {
        let valid = config(vec![query("q1", "hello")]);
        assert!(validate_batch_config(&valid).is_ok());

        let mut duplicate = valid.clone();
        duplicate.queries.push(query("q1", "again"));
        assert!(validate_batch_config(&duplicate).is_err());

        let mut orphan_support = valid.clone();
        orphan_support.queries[0].support_ids = vec!["x".to_string()];
        assert!(validate_batch_config(&orphan_support).is_err());

        assert!(validate_batch_config(&config(vec![])).is_err());
    }

    #[test]
    fn test_batch_config_loading_toml_and_json() {
        let temp_dir = tempdir().unwrap();
        let toml_path = temp_dir.path().join("batch.toml");
        fs::write(
            &toml_path,
            r#"
[job]
name = "test_batch"
description = "Test batch job"

[settings]
max_concurrent_queries = 2

[[queries]]
id = "ping"
query = "ping"
agent_id = "Builtin-DIAGNOSTICS-AGENT-V1.0"

[[queries]]
id = "team"
query = "plan a budget"
primary_id = "Builtin-DIAGNOSTICS-AGENT-V1.0"
support_ids = []
"#,
        )
        .unwrap();

        let config = load_batch_config(&toml_path).unwrap();
        assert_eq!(config.job.name, "test_batch");
        assert_eq!(config.settings.max_concurrent_queries, 2);
        assert_eq!(config.queries.len(), 2);
        assert!(config.queries[1].primary_id.is_some());

        let json_path = temp_dir.path().join("batch.json");
        fs::write(
            &json_path,
            r#"{"job": {"name": "json_batch"}, "queries": [{"id": "a", "query": "hi"}]}"#,
        )
        .unwrap();
        let config = load_batch_config(&json_path).unwrap();
        assert_eq!(config.job.name, "json_batch");
        assert_eq!(config.settings.max_concurrent_queries, 4);
    }

    #[tokio::test]
    async fn test_execute_batch_keeps_order_and_counts() {
        let orchestrator = Orchestrator::new(&Settings::default()).unwrap();
        orchestrator.register_builtin_agents().unwrap();

        let mut direct = query("direct", "ping");
        direct.agent_id = Some("Builtin-DIAGNOSTICS-AGENT-V1.0".to_string());
        let mut missing = query("missing", "ping");
        missing.agent_id = Some("Nope-X-AGENT-V1.0".to_string());
        let routed = query("routed", "run diagnostics please");

        let result = execute_batch(Arc::new(orchestrator), config(vec![direct, missing, routed]))
            .await
            .unwrap();

        let ids: Vec<&str> = result.results.iter().map(|r| r.query_id.as_str()).collect();
        assert_eq!(ids, vec!["direct", "missing", "routed"]);
        assert_eq!(result.successful_queries, 2);
        assert_eq!(result.failed_queries, 1);
        assert_eq!(result.status, BatchStatus::PartialSuccess);
    }
}
