//! Query → candidate agent resolution.
//!
//! The router never calls agents. Domain guessing is delegated to a
//! replaceable [`DomainClassifier`]; the default one scores keyword overlap
//! between the query and each domain's name, aliases and capabilities.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::agent::AgentDescriptor;
use crate::error::{OrchestrationError, Result};
use crate::registry::{AgentRegistry, DomainProfile};

#[derive(Debug, Clone, PartialEq)]
pub struct DomainGuess {
    pub domain: String,
    pub score: f64,
}

/// Text classification strategy producing ranked domain guesses.
pub trait DomainClassifier: Send + Sync {
    /// Guesses ordered best first.
    fn classify(&self, query: &str, catalog: &[DomainProfile]) -> Vec<DomainGuess>;
}

/// Scores one point per query token that matches a domain keyword.
///
/// Keywords are the domain name, its aliases and its capability names, each
/// split on `_` and `-`. Tokens match exactly or by a shared prefix of at
/// least [`Self::STEM_LEN`] characters ("budgets" ~ "budgeting").
#[derive(Debug, Default, Clone)]
pub struct CapabilityKeywordClassifier;

impl CapabilityKeywordClassifier {
    pub const STEM_LEN: usize = 5;

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_lowercase)
    }

    fn keywords(profile: &DomainProfile) -> BTreeSet<String> {
        std::iter::once(&profile.domain)
            .chain(profile.aliases.iter())
            .chain(profile.capabilities.iter())
            .flat_map(|s| Self::tokens(s).collect::<Vec<_>>())
            .collect()
    }

    fn matches(token: &str, keyword: &str) -> bool {
        if token == keyword {
            return true;
        }
        let common = token
            .chars()
            .zip(keyword.chars())
            .take_while(|(a, b)| a == b)
            .count();
        common >= Self::STEM_LEN
    }
}

impl DomainClassifier for CapabilityKeywordClassifier {
    fn classify(&self, query: &str, catalog: &[DomainProfile]) -> Vec<DomainGuess> {
        let tokens: Vec<String> = Self::tokens(query).collect();
        let mut guesses: Vec<DomainGuess> = catalog
            .iter()
            .filter_map(|profile| {
                let keywords = Self::keywords(profile);
                let hits = tokens
                    .iter()
                    .filter(|t| keywords.iter().any(|k| Self::matches(t, k)))
                    .count();
                (hits > 0).then(|| DomainGuess {
                    domain: profile.domain.clone(),
                    score: hits as f64,
                })
            })
            .collect();

        guesses.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        guesses
    }
}

/// Candidates for one request plus the domain they were resolved for.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub domain: String,
    /// Explicit requests keep the caller's domain; classified ones do not.
    pub explicit: bool,
    pub candidates: Vec<Arc<AgentDescriptor>>,
}

impl Resolution {
    pub fn primary(&self) -> Option<&Arc<AgentDescriptor>> {
        self.candidates.first()
    }
}

pub struct Router {
    registry: Arc<AgentRegistry>,
    classifier: Arc<dyn DomainClassifier>,
    min_score: f64,
}

impl Router {
    pub fn new(registry: Arc<AgentRegistry>, classifier: Arc<dyn DomainClassifier>, min_score: f64) -> Self {
        Self {
            registry,
            classifier,
            min_score,
        }
    }

    /// Ranked candidates for `query`.
    ///
    /// Agents whose knowledge contract does not declare compatibility with
    /// their own version are never proposed.
    #[instrument(skip(self, query), fields(explicit_domain = ?explicit_domain))]
    pub fn resolve(&self, query: &str, explicit_domain: Option<&str>) -> Result<Resolution> {
        if let Some(domain) = explicit_domain {
            let candidates = self.compatible(self.registry.lookup_by_domain(domain));
            if candidates.is_empty() {
                return Err(OrchestrationError::NoAgentForDomain(domain.to_string()));
            }
            return Ok(Resolution {
                domain: domain.to_string(),
                explicit: true,
                candidates,
            });
        }

        let catalog = self.registry.domain_catalog();
        let guesses: Vec<DomainGuess> = self
            .classifier
            .classify(query, &catalog)
            .into_iter()
            .filter(|g| g.score >= self.min_score)
            .collect();
        debug!(?guesses, "Classified query");

        let Some(best) = guesses.first() else {
            return Err(OrchestrationError::AmbiguousDomain {
                candidates: catalog.into_iter().map(|p| p.domain).collect(),
                reason: "no registered domain matches the query".to_string(),
            });
        };
        if let Some(runner_up) = guesses.get(1) {
            if runner_up.score == best.score && runner_up.domain != best.domain {
                return Err(OrchestrationError::AmbiguousDomain {
                    candidates: guesses
                        .iter()
                        .filter(|g| g.score == best.score)
                        .map(|g| g.domain.clone())
                        .collect(),
                    reason: format!(
                        "'{}' and '{}' match equally well; pass an explicit domain",
                        best.domain, runner_up.domain
                    ),
                });
            }
        }

        // The resolved domain is the one the first candidate serves, so a best
        // guess with no compatible agent falls through to the next guess.
        let candidates: Vec<_> = guesses
            .iter()
            .flat_map(|g| self.compatible(self.registry.lookup_by_domain(&g.domain)))
            .collect();
        let Some(primary) = candidates.first() else {
            return Err(OrchestrationError::NoAgentForDomain(best.domain.clone()));
        };
        let domain = primary.domain.clone();
        if domain != best.domain {
            debug!(best = %best.domain, routed = %domain, "No compatible agent in best domain");
        }
        Ok(Resolution {
            domain,
            explicit: false,
            candidates,
        })
    }

    fn compatible(&self, agents: Vec<Arc<AgentDescriptor>>) -> Vec<Arc<AgentDescriptor>> {
        agents
            .into_iter()
            .filter(|agent| match &agent.knowledge {
                Some(contract) => {
                    let ok = contract.is_compatible(&contract.version, &agent.version);
                    if !ok {
                        debug!(agent_id = %agent.id, knowledge_id = %contract.knowledge_id, "Skipping agent with incompatible knowledge");
                    }
                    ok
                }
                None => true,
            })
            .collect()
    }
}
