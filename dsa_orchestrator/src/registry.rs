//! Process-scoped agent registry.
//!
//! All state sits behind one `RwLock`: registrations and deregistrations take
//! the write lock so they are mutually exclusive and every lookup observes a
//! complete before- or after-state. The lock is never held while an agent is
//! running; callers clone the `Arc`ed handler out and release it first.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, AgentDescriptor, AgentSummary};
use crate::error::{OrchestrationError, Result};

struct Entry {
    descriptor: Arc<AgentDescriptor>,
    handler: Arc<dyn Agent>,
}

#[derive(Default)]
struct RegistryState {
    next_seq: u64,
    /// Registration order → entry.
    entries: BTreeMap<u64, Entry>,
    /// Identity → registration sequence number.
    index: HashMap<String, u64>,
}

impl RegistryState {
    fn is_satisfied(&self, dependency: &str, excluding: Option<u64>) -> bool {
        let live = |seq: &u64| Some(*seq) != excluding;
        self.index.get(dependency).is_some_and(live)
            || self
                .entries
                .iter()
                .filter(|(seq, _)| live(seq))
                .any(|(_, e)| e.descriptor.capabilities.contains(dependency))
    }
}

/// Everything the router needs to know about one domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainProfile {
    pub domain: String,
    pub aliases: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
}

#[derive(Default)]
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Dependencies are resolved eagerly against the
    /// agents registered at call time, which rules out dependency cycles.
    #[instrument(skip(self, descriptor, handler), fields(agent_id = %descriptor.id))]
    pub fn register(
        &self,
        descriptor: AgentDescriptor,
        handler: Arc<dyn Agent>,
    ) -> Result<Arc<AgentDescriptor>> {
        descriptor
            .validate()
            .map_err(OrchestrationError::InvalidDescriptor)?;

        let mut state = self.state.write();
        if state.index.contains_key(&descriptor.id) {
            warn!("Rejected duplicate agent identity");
            return Err(OrchestrationError::DuplicateIdentity(descriptor.id));
        }
        if let Some(missing) = descriptor
            .dependencies
            .iter()
            .find(|dep| !state.is_satisfied(dep, None))
        {
            return Err(OrchestrationError::UnmetDependency {
                agent: descriptor.id.clone(),
                dependency: missing.clone(),
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let descriptor = Arc::new(descriptor);
        state.index.insert(descriptor.id.clone(), seq);
        state.entries.insert(
            seq,
            Entry {
                descriptor: descriptor.clone(),
                handler,
            },
        );

        info!(
            domain = %descriptor.domain,
            version = %descriptor.version,
            "Registered agent"
        );
        Ok(descriptor)
    }

    /// Remove an agent unless a remaining agent still depends on it, either by
    /// identity or on a capability no other agent provides.
    #[instrument(skip(self))]
    pub fn deregister(&self, id: &str) -> Result<Arc<AgentDescriptor>> {
        let mut state = self.state.write();
        let seq = *state
            .index
            .get(id)
            .ok_or_else(|| OrchestrationError::UnknownAgent(id.to_string()))?;

        let dependents: Vec<String> = state
            .entries
            .iter()
            .filter(|(other, _)| **other != seq)
            .filter(|(_, e)| {
                e.descriptor
                    .dependencies
                    .iter()
                    .any(|dep| !state.is_satisfied(dep, Some(seq)))
            })
            .map(|(_, e)| e.descriptor.id.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(OrchestrationError::DependencyInUse {
                agent: id.to_string(),
                dependents,
            });
        }

        state.index.remove(id);
        let entry = state
            .entries
            .remove(&seq)
            .ok_or_else(|| OrchestrationError::UnknownAgent(id.to_string()))?;
        info!("Deregistered agent");
        Ok(entry.descriptor)
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentDescriptor>> {
        let state = self.state.read();
        state
            .index
            .get(id)
            .and_then(|seq| state.entries.get(seq))
            .map(|e| e.descriptor.clone())
    }

    /// Capability handler for `id`, cloned out so no lock outlives this call.
    pub fn handler(&self, id: &str) -> Result<Arc<dyn Agent>> {
        let state = self.state.read();
        state
            .index
            .get(id)
            .and_then(|seq| state.entries.get(seq))
            .map(|e| e.handler.clone())
            .ok_or_else(|| OrchestrationError::UnknownAgent(id.to_string()))
    }

    /// Agents of `domain`, highest version first, ties in registration order.
    pub fn lookup_by_domain(&self, domain: &str) -> Vec<Arc<AgentDescriptor>> {
        let mut matches: Vec<_> = {
            let state = self.state.read();
            state
                .entries
                .values()
                .filter(|e| e.descriptor.domain == domain)
                .map(|e| e.descriptor.clone())
                .collect()
        };
        matches.sort_by(|a, b| b.version.cmp(&a.version));
        debug!(domain, count = matches.len(), "Domain lookup");
        matches
    }

    /// Agents declaring `capability`, in registration order.
    pub fn lookup_by_capability(&self, capability: &str) -> Vec<Arc<AgentDescriptor>> {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| e.descriptor.capabilities.contains(capability))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> Vec<Arc<AgentDescriptor>> {
        self.state
            .read()
            .entries
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.descriptors().iter().map(|d| d.summary()).collect()
    }

    /// Per-domain union of aliases and capabilities, sorted by domain.
    pub fn domain_catalog(&self) -> Vec<DomainProfile> {
        let mut catalog: BTreeMap<String, DomainProfile> = BTreeMap::new();
        for descriptor in self.descriptors() {
            let profile = catalog
                .entry(descriptor.domain.clone())
                .or_insert_with(|| DomainProfile {
                    domain: descriptor.domain.clone(),
                    ..DomainProfile::default()
                });
            profile.aliases.extend(descriptor.aliases.iter().cloned());
            profile
                .capabilities
                .extend(descriptor.capabilities.iter().cloned());
        }
        catalog.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
