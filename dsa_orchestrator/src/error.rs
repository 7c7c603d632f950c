//! Error types shared by the registry, router, governance engine and dispatcher.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::governance::{RuleResult, Stage};

/// Errors raised while registering agents or serving a request.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("agent identity already registered: {0}")]
    DuplicateIdentity(String),

    #[error("agent '{agent}' depends on '{dependency}', which is not registered")]
    UnmetDependency { agent: String, dependency: String },

    #[error("agent '{agent}' is still required by: {}", .dependents.join(", "))]
    DependencyInUse {
        agent: String,
        dependents: Vec<String>,
    },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid agent descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("no agent registered for domain '{0}'")]
    NoAgentForDomain(String),

    #[error("could not determine a single domain for the query: {reason}")]
    AmbiguousDomain {
        candidates: Vec<String>,
        reason: String,
    },

    #[error("governance violation during {stage}: {}", rule_names(.violations))]
    GovernanceViolation {
        stage: Stage,
        violations: Vec<RuleResult>,
    },

    #[error("collaboration aborted: {reason}")]
    CollaborationAborted {
        failed: Vec<String>,
        reason: String,
    },

    #[error("agent '{agent}' did not answer within {after:?}")]
    Timeout { agent: String, after: Duration },

    #[error("agent '{agent}' failed: {message}")]
    AgentFailure { agent: String, message: String },
}

fn rule_names(violations: &[RuleResult]) -> String {
    violations
        .iter()
        .map(|v| v.rule.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Serialisable discriminant of [`OrchestrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DuplicateIdentity,
    UnmetDependency,
    DependencyInUse,
    UnknownAgent,
    InvalidDescriptor,
    NoAgentForDomain,
    AmbiguousDomain,
    GovernanceViolation,
    CollaborationAborted,
    Timeout,
    AgentFailure,
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateIdentity(_) => ErrorKind::DuplicateIdentity,
            Self::UnmetDependency { .. } => ErrorKind::UnmetDependency,
            Self::DependencyInUse { .. } => ErrorKind::DependencyInUse,
            Self::UnknownAgent(_) => ErrorKind::UnknownAgent,
            Self::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Self::NoAgentForDomain(_) => ErrorKind::NoAgentForDomain,
            Self::AmbiguousDomain { .. } => ErrorKind::AmbiguousDomain,
            Self::GovernanceViolation { .. } => ErrorKind::GovernanceViolation,
            Self::CollaborationAborted { .. } => ErrorKind::CollaborationAborted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AgentFailure { .. } => ErrorKind::AgentFailure,
        }
    }

    /// Governance rule results attached to a veto, empty for every other kind.
    pub fn violations(&self) -> &[RuleResult] {
        match self {
            Self::GovernanceViolation { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Structured error carried in facade responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestrationError> for ErrorBody {
    fn from(err: &OrchestrationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
