//! Command-line interface definitions using clap derive API.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::agent::Context as QueryContext;
use crate::knowledge::KnowledgeValidator;
use crate::monitoring::MetricsScope;
use crate::orchestrator::{CollaborationRequest, Orchestrator, QueryRequest};
use crate::settings::Settings;

/// Domain-specialized agent orchestrator
#[derive(Debug, Parser)]
#[command(name = "dsa-cli")]
#[command(about = "Route queries to domain-specialized agents under governance")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Answer one query, routed by domain or sent to a named agent
    Query {
        query: String,
        #[arg(short, long)]
        domain: Option<String>,
        /// Skip routing and ask this agent directly
        #[arg(short, long)]
        agent: Option<String>,
        /// Treat post-dispatch governance failures as errors
        #[arg(long)]
        supervised: bool,
        /// JSON object passed to the agent as context
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run a primary agent and merge in supporting agents
    Collaborate {
        query: String,
        #[arg(short, long)]
        primary: String,
        /// Supporting agent ids, in contribution order
        #[arg(short, long = "support")]
        support: Vec<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List registered agents
    Agents,
    /// Route each query, then print aggregate metrics
    Metrics {
        queries: Vec<String>,
        #[arg(long, conflicts_with = "domain")]
        agent: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        window_secs: Option<u64>,
    },
    /// Check a knowledge document's structure
    Validate { path: PathBuf },
    /// Run a batch job from a TOML or JSON file
    Batch {
        #[arg(short, long)]
        file: PathBuf,
        /// Write every response to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Start the HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_context(raw: Option<&str>) -> Result<QueryContext> {
    match raw {
        None => Ok(QueryContext::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
            Value::Object(map) => Ok(map),
            _ => bail!("--context must be a JSON object"),
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::new(settings)?;
    orchestrator.register_builtin_agents()?;
    Ok(orchestrator)
}

/// Execute one subcommand. Request failures are printed, not returned.
pub async fn execute(command: Commands, mut settings: Settings) -> Result<()> {
    match command {
        Commands::Query {
            query,
            domain,
            agent,
            supervised,
            context,
            timeout_ms,
        } => {
            let request = QueryRequest {
                query,
                agent_id: agent,
                domain,
                supervised,
                context: parse_context(context.as_deref())?,
                timeout_ms,
            };
            let response = orchestrator(&settings)?.dispatch(request).await;
            print_json(&response)
        }
        Commands::Collaborate {
            query,
            primary,
            support,
            context,
            timeout_ms,
        } => {
            let request = CollaborationRequest {
                query,
                primary_id: primary,
                support_ids: support,
                context: parse_context(context.as_deref())?,
                timeout_ms,
            };
            let response = orchestrator(&settings)?.collaborate_with(request).await;
            print_json(&response)
        }
        Commands::Agents => print_json(&orchestrator(&settings)?.get_available_agents()),
        Commands::Metrics {
            queries,
            agent,
            domain,
            window_secs,
        } => {
            let orchestrator = orchestrator(&settings)?;
            for query in &queries {
                orchestrator.process_query(query, domain.as_deref()).await;
            }
            let window = window_secs.map(Duration::from_secs);
            match (agent, domain) {
                (Some(agent), _) => print_json(&orchestrator.metrics_over(&MetricsScope::Agent(agent), window)),
                (None, Some(domain)) => {
                    print_json(&orchestrator.metrics_over(&MetricsScope::Domain(domain), window))
                }
                (None, None) => print_json(&orchestrator.performance_report()),
            }
        }
        Commands::Validate { path } => validate_knowledge(&path),
        Commands::Batch { file, output } => crate::batch::run(file, output, settings).await,
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            settings.validate()?;
            crate::server::serve(&settings).await
        }
    }
}

/// Print every structural problem and fail when there is at least one.
pub fn validate_knowledge(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read knowledge file: {:?}", path))?;
    let document: Value =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {:?}", path))?;

    let report = KnowledgeValidator::validate(&document);
    if report.is_valid() {
        info!(?path, "Knowledge document is well-formed");
        println!("✅ {} is well-formed", path.display());
        return Ok(());
    }
    println!("❌ {} has {} problem(s):", path.display(), report.errors.len());
    for error in &report.errors {
        println!("  - {}", error);
    }
    bail!("knowledge document failed validation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Version;
    use crate::knowledge::KnowledgeContract;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::try_parse_from([
            "dsa-cli",
            "--config",
            "dsa.toml",
            "query",
            "what is a budget",
            "--domain",
            "finance",
            "--supervised",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("dsa.toml")));
        match cli.command {
            Commands::Query {
                query,
                domain,
                supervised,
                agent,
                ..
            } => {
                assert_eq!(query, "what is a budget");
                assert_eq!(domain.as_deref(), Some("finance"));
                assert!(supervised);
                assert!(agent.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_collaborate_keeps_support_order() {
        let cli = Cli::try_parse_from([
            "dsa-cli", "collaborate", "plan", "--primary", "A", "-s", "B", "-s", "C",
        ])
        .unwrap();
        match cli.command {
            Commands::Collaborate { primary, support, .. } => {
                assert_eq!(primary, "A");
                assert_eq!(support, vec!["B", "C"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_metrics_scope_flags_conflict() {
        assert!(Cli::try_parse_from(["dsa-cli", "metrics", "--agent", "A", "--domain", "d"]).is_err());
    }

    #[test]
    fn test_parse_context() {
        assert!(parse_context(None).unwrap().is_empty());
        assert_eq!(parse_context(Some(r#"{"user":"ana"}"#)).unwrap()["user"], "ana");
        assert!(parse_context(Some("[1,2]")).is_err());
        assert!(parse_context(Some("{oops")).is_err());
    }

    #[test]
    fn test_validate_knowledge_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        KnowledgeContract::new("Acme", "finance", Version::new(1, 0))
            .save_to_path(&good)
            .unwrap();
        assert!(validate_knowledge(&good).is_ok());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"knowledge_id": "Acme-FINANCE-KNOWLEDGE-V1.0"}"#).unwrap();
        assert!(validate_knowledge(&bad).is_err());
    }
}
